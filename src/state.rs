// src/state.rs
// Application wiring object (§9 — replaces the source's global
// module-level singletons with one explicit struct built once at startup
// and handed to every handler via axum's `State` extractor).

use std::sync::Arc;

use tracing::info;

use crate::ai::AiEngine;
use crate::auth::IdentityVerifier;
use crate::cache::ConversationCache;
use crate::config::ChatConfig;
use crate::connection::ConnectionManager;
use crate::conversation::ConversationManager;
use crate::lifecycle::LifecycleService;
use crate::storage::{build_backend, StorageBackend};

/// Everything an HTTP/WS handler needs, cloned cheaply per-request. The
/// core components (Storage, Cache, Connection/Conversation managers,
/// Lifecycle) hold no global state of their own; this is the only place
/// they are assembled.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ChatConfig>,
    pub storage: Arc<dyn StorageBackend>,
    pub connections: Arc<ConnectionManager>,
    pub conversations: Arc<ConversationManager>,
    pub lifecycle: Arc<LifecycleService>,
    pub identity_verifier: Arc<dyn IdentityVerifier>,
    /// The pluggable AI query engine (§6.4). `None` means this deployment
    /// runs human-only conversations; joining or creating with an AI
    /// participant then fails with a clear error instead of panicking.
    pub ai_engine: Option<Arc<dyn AiEngine>>,
}

impl AppState {
    pub async fn new(config: ChatConfig, ai_engine: Option<Arc<dyn AiEngine>>) -> anyhow::Result<Self> {
        let storage = build_backend(&config.storage.backend, &config.storage.sqlite_path).await?;
        info!(backend = %config.storage.backend, "storage backend ready");

        let cache = Arc::new(ConversationCache::new(config.cache.max_conversations, config.cache.max_messages_per_conversation));
        info!("conversation cache ready");

        let connections = Arc::new(ConnectionManager::new(config.connection.clone()));
        info!("connection manager ready");

        let context_builder = crate::ai::context::ContextBuilder::new(&config.ai);
        let conversations = Arc::new(ConversationManager::new(
            config.conversation.clone(),
            storage.clone(),
            cache,
            connections.clone(),
            context_builder,
        ));
        info!("conversation manager ready");

        let lifecycle = Arc::new(LifecycleService::new(storage.clone(), conversations.clone(), connections.clone()));
        info!("lifecycle surface ready");

        let identity_verifier: Arc<dyn IdentityVerifier> = Arc::new(crate::auth::JwtIdentityVerifier::new(config.auth.jwt_secret.clone()));

        Ok(Self {
            config: Arc::new(config),
            storage,
            connections,
            conversations,
            lifecycle,
            identity_verifier,
            ai_engine,
        })
    }
}
