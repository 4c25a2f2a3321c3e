// src/config/mod.rs
// Central, env-driven configuration (§6.5). One sub-config struct per
// component, loaded once behind a lazy_static global the way the rest of
// the ambient stack expects a single `CONFIG` to exist for the process.

use lazy_static::lazy_static;
use serde::Serialize;

lazy_static! {
    pub static ref CONFIG: ChatConfig = ChatConfig::from_env();
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationConfig {
    pub single_mode_timeout_ms: u64,
    pub multi_mode_timeout_ms: u64,
    pub queue_size_limit: usize,
    pub max_participants: usize,
}

impl ConversationConfig {
    fn from_env() -> Self {
        Self {
            single_mode_timeout_ms: env_or("SINGLE_MODE_TIMEOUT", 100),
            multi_mode_timeout_ms: env_or("MULTI_MODE_TIMEOUT", 2000),
            queue_size_limit: env_or("QUEUE_SIZE_LIMIT", 1000),
            max_participants: env_or("MAX_PARTICIPANTS", 100),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AiConfig {
    pub timeout_seconds: u64,
    pub human_messages_context: usize,
    pub nlweb_messages_context: usize,
}

impl AiConfig {
    fn from_env() -> Self {
        Self {
            timeout_seconds: env_or("AI_TIMEOUT_SECONDS", 20),
            human_messages_context: env_or("AI_HUMAN_MESSAGES_CONTEXT", 5),
            nlweb_messages_context: env_or("AI_NLWEB_MESSAGES_CONTEXT", 1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheConfig {
    pub max_conversations: usize,
    pub max_messages_per_conversation: usize,
}

impl CacheConfig {
    fn from_env() -> Self {
        Self {
            max_conversations: env_or("CACHE_MAX_CONVERSATIONS", 10),
            max_messages_per_conversation: env_or("CACHE_MAX_MESSAGES_PER_CONVERSATION", 100),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageConfig {
    pub backend: String,
    pub sqlite_path: String,
}

impl StorageConfig {
    fn from_env() -> Self {
        Self {
            backend: env_string_or("CHAT_STORAGE_BACKEND", "memory"),
            sqlite_path: env_string_or("CHAT_STORAGE_SQLITE_PATH", "sqlite://chat.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionConfig {
    pub channel_send_timeout_ms: u64,
    pub channel_send_buffer: usize,
}

impl ConnectionConfig {
    fn from_env() -> Self {
        Self {
            channel_send_timeout_ms: env_or("SERVER_CHANNEL_SEND_TIMEOUT_MS", 5000),
            channel_send_buffer: env_or("SERVER_CHANNEL_SEND_BUFFER", 64),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            host: env_string_or("SERVER_HOST", "127.0.0.1"),
            port: env_or("SERVER_PORT", 8090),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig").field("jwt_secret", &"<redacted>").finish()
    }
}

impl AuthConfig {
    fn from_env() -> Self {
        let jwt_secret = std::env::var("AUTH_JWT_SECRET").unwrap_or_else(|_| {
            tracing::warn!("AUTH_JWT_SECRET not set, using an insecure development default");
            "dev-only-insecure-secret".to_string()
        });
        Self { jwt_secret }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl LoggingConfig {
    fn from_env() -> Self {
        Self { level: env_string_or("LOGGING_LEVEL", "info") }
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub conversation: ConversationConfig,
    pub ai: AiConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub connection: ConnectionConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

impl ChatConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self {
            conversation: ConversationConfig::from_env(),
            ai: AiConfig::from_env(),
            cache: CacheConfig::from_env(),
            storage: StorageConfig::from_env(),
            connection: ConnectionConfig::from_env(),
            server: ServerConfig::from_env(),
            auth: AuthConfig::from_env(),
            logging: LoggingConfig::from_env(),
        }
    }

    /// Fails fast on an unrecognized storage backend name (§6.3) instead
    /// of discovering it lazily on first use.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.storage.backend.as_str() {
            "memory" | "sqlite" => Ok(()),
            other => Err(anyhow::anyhow!("unknown chat.storage.backend: {other:?}")),
        }
    }
}
