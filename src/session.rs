use crate::protocol::{self, UserSession};

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{error, warn};

// Port for the external session store. The production impl reads through
// redis; tests substitute an in-memory map.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the raw value stored under `key`, or `None` on a miss.
    async fn fetch(&self, key: &str) -> Result<Option<String>, String>;
}

// Thin redis-backed session store.
pub struct RedisSessionStore {
    manager: ConnectionManager,
}

impl RedisSessionStore {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn fetch(&self, key: &str) -> Result<Option<String>, String> {
        // The manager multiplexes; a clone per call is the intended usage.
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await.map_err(|e| e.to_string())?;
        Ok(value)
    }
}

/// Resolves a session id to its user descriptor.
///
/// Store misses, fetch failures, and unparseable payloads all come back as
/// `None`; binding simply fails and the caller closes the socket.
pub async fn lookup(store: &dyn SessionStore, session_id: &str) -> Option<UserSession> {
    let key = protocol::session_key(session_id);
    let raw = match store.fetch(&key).await {
        Ok(Some(raw)) if !raw.is_empty() => raw,
        Ok(_) => return None,
        Err(e) => {
            warn!(session_id, error = %e, "session fetch failed");
            return None;
        }
    };
    match serde_json::from_str::<UserSession>(&raw) {
        Ok(session) => Some(session),
        Err(e) => {
            error!(session_id, error = %e, "failed to parse user session");
            None
        }
    }
}
