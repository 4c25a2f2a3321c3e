// src/api/ws.rs
// Message channel (§6.1): the WebSocket upgrade handler, the
// `OutboundChannel` implementation backing it, and the inbound frame
// loop that drives `ConversationManager::process_message`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::OutboundChannel;
use crate::model::{Message, MessageKind, Participant, Sender};
use crate::state::AppState;
use crate::wire::{ClientFrame, ParticipantSnapshot, ServerFrame};

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    conversation_id: String,
    #[serde(default)]
    token: Option<String>,
}

pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

/// Wraps the send half of the split socket as the `OutboundChannel` the
/// Connection Manager broadcasts through. A failed send never closes the
/// channel (§5); only an explicit `close()` call does.
struct WsChannel {
    sink: Arc<AsyncMutex<SplitSink<WebSocket, WsMessage>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl OutboundChannel for WsChannel {
    async fn send(&self, payload: String) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("channel already closed");
        }
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(payload.into())).await?;
        sink.flush().await?;
        Ok(())
    }

    /// Fire-and-forget since `close` itself is sync (§4.G's `OutboundChannel`
    /// port); the socket also tears down on task exit if this never lands.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let _ = sink.lock().await.send(WsMessage::Close(None)).await;
        });
    }
}

async fn resolve_identity(state: &AppState, token: Option<&str>) -> (String, String) {
    if let Some(token) = token {
        match state.identity_verifier.verify(token) {
            Ok(identity) => return (identity.participant_id, identity.display_name),
            Err(err) => debug!(error = %err, "bearer token rejected, degrading to anonymous identity"),
        }
    }
    let anon = format!("anon-{}", Uuid::new_v4());
    (anon.clone(), anon)
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    let (sink, mut stream) = socket.split();
    let channel = Arc::new(WsChannel { sink: Arc::new(AsyncMutex::new(sink)), closed: Arc::new(AtomicBool::new(false)) });
    let conversation_id = params.conversation_id;
    let (participant_id, display_name) = resolve_identity(&state, params.token.as_deref()).await;

    let Some(_record) = state.lifecycle.get_conversation(&conversation_id).await.ok().flatten() else {
        let _ = channel.send(ServerFrame::unknown_conversation(format!("no such conversation {conversation_id}")).to_json()).await;
        channel.close();
        return;
    };

    let members = state.conversations.participant_snapshot(&conversation_id).await;
    if !members.iter().any(|p| p.participant_id == participant_id) {
        let _ = channel.send(ServerFrame::not_member(format!("{participant_id} is not a member of {conversation_id}")).to_json()).await;
        channel.close();
        return;
    }

    crate::metrics::connection_opened();
    state.connections.add_connection(&conversation_id, &participant_id, channel.clone());

    let mode = state.conversations.mode(&conversation_id).await.unwrap_or(crate::model::ConversationMode::Single);
    let input_timeout = state.conversations.input_timeout_ms(&conversation_id).await.unwrap_or(100);

    let snapshot = ParticipantSnapshot {
        participant: Participant { participant_id: participant_id.clone(), display_name: display_name.clone(), kind: crate::model::ParticipantKind::Human, joined_at: chrono::Utc::now() },
        is_online: true,
    };
    let participant_list = ServerFrame::ParticipantList {
        participants: members
            .iter()
            .map(|p| ParticipantSnapshot { participant: p.clone(), is_online: state.connections.connection_count(&conversation_id) > 0 })
            .chain(std::iter::once(snapshot))
            .collect(),
    };
    let _ = channel.send(participant_list.to_json()).await;
    let _ = channel
        .send(ServerFrame::Connected { conversation_id: conversation_id.clone(), participant_id: participant_id.clone(), mode, input_timeout }.to_json())
        .await;

    info!(conversation_id = %conversation_id, participant_id = %participant_id, "channel connected");

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(error = %err, "websocket read error");
                break;
            }
        };

        let client_frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(err) => {
                let _ = channel.send(ServerFrame::invalid_json(err.to_string()).to_json()).await;
                continue;
            }
        };

        match client_frame {
            ClientFrame::Ping => {
                let _ = channel.send(ServerFrame::Pong.to_json()).await;
            }
            ClientFrame::Message { content, metadata, .. } => {
                let sender = Sender { id: participant_id.clone(), display_name: display_name.clone(), kind: crate::model::ParticipantKind::Human };
                let draft = Message::draft(Uuid::new_v4().to_string(), conversation_id.clone(), sender, content, MessageKind::Text);
                let draft = match draft {
                    Ok(mut m) => {
                        if let Some(serde_json::Value::Object(map)) = metadata {
                            m.metadata = map.into_iter().collect();
                        }
                        m
                    }
                    Err(err) => {
                        let _ = channel.send(ServerFrame::processing_error(err.to_string()).to_json()).await;
                        continue;
                    }
                };

                match state.conversations.process_message(draft).await {
                    Ok(stored) => {
                        let _ = channel.send(ServerFrame::MessageAck { message_id: stored.message_id, sequence_id: stored.sequence_id }.to_json()).await;
                    }
                    Err(crate::error::ChatError::QueueFull { conversation_id, depth, limit }) => {
                        let _ = channel
                            .send(ServerFrame::queue_full(format!("conversation {conversation_id} queue is full ({depth}/{limit})")).to_json())
                            .await;
                    }
                    Err(err) => {
                        let _ = channel.send(ServerFrame::processing_error(err.to_string()).to_json()).await;
                    }
                }
            }
        }
    }

    crate::metrics::connection_closed();
    state.connections.remove_connection(&conversation_id, &participant_id);
    info!(conversation_id = %conversation_id, participant_id = %participant_id, "channel disconnected");
}
