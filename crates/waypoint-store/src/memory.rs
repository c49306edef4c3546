use std::collections::BTreeMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::state::{Checkpoint, RunState};
use waypoint_core::traits::CheckpointStore;
use waypoint_core::types::SessionId;

/// In-process checkpoint store with the same append-only semantics as the
/// SQLite store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<BTreeMap<(SessionId, u64), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> WaypointError {
    WaypointError::Database(e.to_string())
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let cp = checkpoint.clone();
        Box::pin(async move {
            let mut map = self.checkpoints.lock().map_err(lock_err)?;
            let key = (cp.session_id.clone(), cp.step_index);
            if map.contains_key(&key) {
                return Err(WaypointError::Database(format!(
                    "Checkpoint {}@{} already exists",
                    cp.session_id, cp.step_index
                )));
            }
            map.insert(key, cp);
            Ok(())
        })
    }

    fn load(&self, session: &SessionId, step: Option<u64>) -> BoxFuture<'_, Result<RunState>> {
        let session = session.clone();
        Box::pin(async move {
            let blob = {
                let map = self.checkpoints.lock().map_err(lock_err)?;
                let found = match step {
                    Some(step) => map.get(&(session.clone(), step)),
                    None => map
                        .range((session.clone(), 0)..=(session.clone(), u64::MAX))
                        .next_back()
                        .map(|(_, cp)| cp),
                };
                found.map(|cp| cp.state_blob.clone())
            };
            let blob = blob.ok_or_else(|| WaypointError::CheckpointNotFound {
                session: session.clone(),
                step,
            })?;
            Ok(serde_json::from_slice(&blob)?)
        })
    }

    fn history(&self, session: &SessionId) -> BoxFuture<'_, Result<Vec<Checkpoint>>> {
        let session = session.clone();
        Box::pin(async move {
            let map = self.checkpoints.lock().map_err(lock_err)?;
            Ok(map
                .range((session.clone(), 0)..=(session, u64::MAX))
                .map(|(_, cp)| cp.clone())
                .collect())
        })
    }

    fn sessions(&self) -> BoxFuture<'_, Result<Vec<SessionId>>> {
        Box::pin(async move {
            let map = self.checkpoints.lock().map_err(lock_err)?;
            let mut sessions: Vec<SessionId> = map.keys().map(|(s, _)| s.clone()).collect();
            sessions.dedup();
            Ok(sessions)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::types::{Request, WorkflowType};

    fn state(session: &str, steps: u64) -> RunState {
        let request = Request::new("user-1", "collect the weekly signup numbers");
        let mut state = RunState::new(
            SessionId::from_string(session),
            &request,
            WorkflowType::DataCollection,
            vec!["data-collector".into()],
            9,
        );
        for _ in 0..steps {
            state.advance("collect");
        }
        state
    }

    #[tokio::test]
    async fn latest_ignores_other_sessions() {
        let store = MemoryCheckpointStore::new();
        for (sid, steps) in [("a", 1), ("a", 2), ("b", 5)] {
            store.save(&Checkpoint::capture(&state(sid, steps)).unwrap()).await.unwrap();
        }

        let a = SessionId::from_string("a");
        assert_eq!(store.load(&a, None).await.unwrap().step, 2);
        assert_eq!(store.history(&a).await.unwrap().len(), 2);
        assert_eq!(store.sessions().await.unwrap().len(), 2);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn append_only() {
        let store = MemoryCheckpointStore::new();
        let cp = Checkpoint::capture(&state("a", 1)).unwrap();
        store.save(&cp).await.unwrap();
        assert!(store.save(&cp).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unknown_step_is_not_found() {
        let store = MemoryCheckpointStore::new();
        store.save(&Checkpoint::capture(&state("a", 1)).unwrap()).await.unwrap();
        let err = store.load(&SessionId::from_string("a"), Some(7)).await.unwrap_err();
        assert!(matches!(err, WaypointError::CheckpointNotFound { step: Some(7), .. }));
    }
}
