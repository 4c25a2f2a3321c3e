// src/api/http/lifecycle.rs
// Request/response lifecycle surface (§6.2): create/join/leave/list over
// the `LifecycleService`, identity resolved the same way the WS upgrade
// resolves it (§6.6) — a bearer token handed to the `IdentityVerifier`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::ai::AiAdapter;
use crate::auth::VerifiedIdentity;
use crate::error::ChatError;
use crate::model::Participant;
use crate::participant::{ChatParticipant, HumanParticipant};
use crate::state::AppState;
use crate::storage::ConversationRecord;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/conversations", post(create).get(my_conversations))
        .route("/conversations/{id}", get(get_conversation))
        .route("/conversations/{id}/join", post(join))
        .route("/conversations/{id}/leave", delete(leave))
}

/// A bearer token is required on every lifecycle call — unlike the WS
/// upgrade (§6.6), which tolerates a missing token by degrading to an
/// anonymous identity, lifecycle operations must know who is asking.
fn identity(headers: &HeaderMap, state: &AppState) -> Result<VerifiedIdentity, LifecycleError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(LifecycleError::Unauthorized)?;
    state.identity_verifier.verify(token).map_err(|_| LifecycleError::Unauthorized)
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    title: Option<String>,
    /// Set only when this deployment has an AI engine configured
    /// (`state.ai_engine`); ignored with a 400 otherwise.
    #[serde(default)]
    include_ai: bool,
    #[serde(default = "default_ai_display_name")]
    ai_display_name: String,
}

fn default_ai_display_name() -> String {
    "assistant".to_string()
}

#[derive(Debug, Serialize)]
struct CreateResponse {
    conversation_id: String,
    title: Option<String>,
    participants: Vec<Participant>,
    channel_url: String,
}

async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRequest>,
) -> Result<(StatusCode, Json<CreateResponse>), LifecycleError> {
    let _timer = crate::metrics::RequestTimer::new("create_conversation");
    let who = identity(&headers, &state)?;
    if req.include_ai && state.ai_engine.is_none() {
        return Err(LifecycleError::Invalid("no AI engine configured for this deployment".into()));
    }

    let conversation_id = uuid::Uuid::new_v4().to_string();
    state.lifecycle.create_conversation(&conversation_id).await?;

    let human = HumanParticipant::new(Participant::human(&who.participant_id, &who.display_name));
    state.lifecycle.join(&conversation_id, Arc::new(human)).await?;

    if req.include_ai {
        if let Some(engine) = state.ai_engine.clone() {
            let ai_info = Participant::ai("assistant", &req.ai_display_name);
            let adapter = AiAdapter::new(ai_info, engine, state.config.ai.clone(), state.conversations.clone(), None);
            state.lifecycle.join(&conversation_id, Arc::new(adapter) as Arc<dyn ChatParticipant>).await?;
        }
    }

    let participants = state.lifecycle.list_participants(&conversation_id).await;
    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            channel_url: format!("/ws?conversation_id={conversation_id}"),
            conversation_id,
            title: req.title,
            participants,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn my_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(page): Query<PageParams>,
) -> Result<Json<Vec<ConversationRecord>>, LifecycleError> {
    let _timer = crate::metrics::RequestTimer::new("my_conversations");
    let who = identity(&headers, &state)?;
    let records = state
        .lifecycle
        .conversations_for_participant(&who.participant_id, page.limit.unwrap_or(20), page.offset.unwrap_or(0))
        .await?;
    Ok(Json(records))
}

#[derive(Debug, Serialize)]
struct ConversationResponse {
    #[serde(flatten)]
    record: ConversationRecord,
    participants: Vec<Participant>,
    messages: Vec<crate::model::Message>,
}

/// 404s rather than 403s for a non-member, per §6.2 ("do not disclose
/// existence to non-members").
async fn get_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, LifecycleError> {
    let _timer = crate::metrics::RequestTimer::new("get_conversation");
    let who = identity(&headers, &state)?;
    let record = state.lifecycle.get_conversation(&id).await?.ok_or_else(|| LifecycleError::NotFound)?;
    let participants = state.lifecycle.list_participants(&id).await;
    if !participants.iter().any(|p| p.participant_id == who.participant_id) {
        return Err(LifecycleError::NotFound);
    }
    let messages = state.lifecycle.history(&id, Some(100), None).await?;
    Ok(Json(ConversationResponse { record, participants, messages }))
}

#[derive(Debug, Serialize)]
struct JoinResponse {
    record: ConversationRecord,
    participants: Vec<Participant>,
}

async fn join(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JoinResponse>, LifecycleError> {
    let _timer = crate::metrics::RequestTimer::new("join_conversation");
    let who = identity(&headers, &state)?;
    let human = HumanParticipant::new(Participant::human(&who.participant_id, &who.display_name));
    state.lifecycle.join(&id, Arc::new(human)).await?;
    let record = state.lifecycle.get_conversation(&id).await?.ok_or(LifecycleError::NotFound)?;
    let participants = state.lifecycle.list_participants(&id).await;
    Ok(Json(JoinResponse { record, participants }))
}

async fn leave(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, LifecycleError> {
    let _timer = crate::metrics::RequestTimer::new("leave_conversation");
    let who = identity(&headers, &state)?;
    state.lifecycle.leave(&id, &who.participant_id).await?;
    Ok(StatusCode::OK)
}

/// Translates `ChatError` plus the boundary-only `Unauthorized`/`Invalid`
/// cases into the status codes named throughout §6.2.
#[derive(Debug)]
enum LifecycleError {
    Unauthorized,
    Invalid(String),
    NotFound,
    Chat(ChatError),
}

impl From<ChatError> for LifecycleError {
    fn from(err: ChatError) -> Self {
        LifecycleError::Chat(err)
    }
}

impl IntoResponse for LifecycleError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            LifecycleError::Unauthorized => (StatusCode::UNAUTHORIZED, "missing or invalid bearer token".to_string()),
            LifecycleError::Invalid(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            LifecycleError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            LifecycleError::Chat(ChatError::UnknownConversation(_)) => (StatusCode::NOT_FOUND, self_to_string(&self)),
            LifecycleError::Chat(ChatError::AlreadyMember(_, _)) => (StatusCode::CONFLICT, self_to_string(&self)),
            LifecycleError::Chat(ChatError::LimitExceeded(_, _, _)) => (StatusCode::TOO_MANY_REQUESTS, self_to_string(&self)),
            LifecycleError::Chat(ChatError::NotMember(_, _)) => (StatusCode::NOT_FOUND, self_to_string(&self)),
            LifecycleError::Chat(err) => {
                error!(error = %err, "lifecycle request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn self_to_string(err: &LifecycleError) -> String {
    match err {
        LifecycleError::Chat(e) => e.to_string(),
        _ => "error".to_string(),
    }
}
