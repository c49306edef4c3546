use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::ConversationStore;

/// Key/value conversation memory with per-key expiry.
///
/// Expired entries are dropped when read and swept on every write. An entry
/// whose expiry does not fit in an `Instant` never expires.
#[derive(Default)]
pub struct MemoryConversationStore {
    entries: Mutex<HashMap<String, (serde_json::Value, Option<Instant>)>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

fn is_expired(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.is_some_and(|at| at <= now)
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> WaypointError {
    WaypointError::ConversationStore(e.to_string())
}

impl ConversationStore for MemoryConversationStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut entries = self.entries.lock().map_err(lock_err)?;
            let expired = matches!(entries.get(&key), Some((_, at)) if is_expired(*at, Instant::now()));
            if expired {
                entries.remove(&key);
                return Ok(None);
            }
            Ok(entries.get(&key).map(|(value, _)| value.clone()))
        })
    }

    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut entries = self.entries.lock().map_err(lock_err)?;
            let now = Instant::now();
            entries.retain(|_, (_, at)| !is_expired(*at, now));
            entries.insert(key, (value, now.checked_add(ttl)));
            Ok(())
        })
    }

    fn expire(&self, key: &str) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.entries.lock().map_err(lock_err)?.remove(&key);
            Ok(())
        })
    }
}
