use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::state::{Checkpoint, RunState};
use waypoint_core::traits::CheckpointStore;
use waypoint_core::types::{SessionId, WorkflowType};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        step_index INTEGER NOT NULL,
        workflow_type TEXT NOT NULL,
        state_blob BLOB NOT NULL,
        written_at TEXT NOT NULL,
        UNIQUE(session_id, step_index)
    );

    CREATE INDEX IF NOT EXISTS idx_cp_session_step
        ON checkpoints(session_id, step_index DESC);";

/// Append-only checkpoint store backed by SQLite.
///
/// Rows are never updated or deleted. `synchronous=FULL` makes a returned
/// `save` durable.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WaypointError::Database(format!("Failed to create checkpoint directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Checkpoint store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of checkpoints stored for a session.
    pub fn count(&self, session: &SessionId) -> Result<u64> {
        let conn = self.conn.lock().map_err(|e| WaypointError::Database(e.to_string()))?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE session_id = ?1",
                params![session.0],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(n as u64)
    }
}

fn db_err(e: rusqlite::Error) -> WaypointError {
    WaypointError::Database(e.to_string())
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String, Vec<u8>, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_checkpoint(raw: (String, i64, String, Vec<u8>, String)) -> Result<Checkpoint> {
    let (session_id, step_index, workflow, state_blob, written_at) = raw;
    let workflow_type: WorkflowType = workflow.parse().map_err(WaypointError::Database)?;
    let written_at = DateTime::parse_from_rfc3339(&written_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WaypointError::Database(format!("Bad checkpoint timestamp: {}", e)))?;
    Ok(Checkpoint {
        session_id: SessionId(session_id),
        step_index: step_index as u64,
        workflow_type,
        state_blob,
        written_at,
    })
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let cp = checkpoint.clone();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| WaypointError::Database(e.to_string()))?;

            conn.execute(
                "INSERT INTO checkpoints (session_id, step_index, workflow_type, state_blob, written_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    cp.session_id.0,
                    cp.step_index as i64,
                    cp.workflow_type.as_str(),
                    cp.state_blob,
                    cp.written_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    WaypointError::Database(format!(
                        "Checkpoint {}@{} already exists",
                        cp.session_id, cp.step_index
                    ))
                }
                other => db_err(other),
            })?;

            debug!(session_id = %cp.session_id, step = cp.step_index, "Checkpoint written");
            Ok(())
        })
    }

    fn load(&self, session: &SessionId, step: Option<u64>) -> BoxFuture<'_, Result<RunState>> {
        let session = session.clone();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| WaypointError::Database(e.to_string()))?;

            let blob: Option<Vec<u8>> = match step {
                Some(step) => conn
                    .query_row(
                        "SELECT state_blob FROM checkpoints
                         WHERE session_id = ?1 AND step_index = ?2",
                        params![session.0, step as i64],
                        |row| row.get(0),
                    )
                    .optional(),
                None => conn
                    .query_row(
                        "SELECT state_blob FROM checkpoints
                         WHERE session_id = ?1
                         ORDER BY step_index DESC
                         LIMIT 1",
                        params![session.0],
                        |row| row.get(0),
                    )
                    .optional(),
            }
            .map_err(db_err)?;

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
            let conn = self
                .conn
                .lock()
                .map_err(|e| WaypointError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT session_id, step_index, workflow_type, state_blob, written_at
                     FROM checkpoints
                     WHERE session_id = ?1
                     ORDER BY step_index ASC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![session.0], row_to_checkpoint)
                .map_err(db_err)?;

            let mut checkpoints = Vec::new();
            for row in rows {
                checkpoints.push(decode_checkpoint(row.map_err(db_err)?)?);
            }
            Ok(checkpoints)
        })
    }

    fn sessions(&self) -> BoxFuture<'_, Result<Vec<SessionId>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| WaypointError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare("SELECT DISTINCT session_id FROM checkpoints ORDER BY session_id")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(SessionId(row.map_err(db_err)?));
            }
            Ok(sessions)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::types::{AgentResult, AgentRole, Request};

    fn temp_store() -> (tempfile::TempDir, SqliteCheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::open(&dir.path().join("checkpoints.db")).unwrap();
        (dir, store)
    }

    fn state_at(session: &str, steps: u64) -> RunState {
        let request = Request::new("user-1", "What changed in the billing export?");
        let mut state = RunState::new(
            SessionId::from_string(session),
            &request,
            WorkflowType::UserQuery,
            vec![AgentRole::from("knowledge")],
            18,
        );
        for i in 0..steps {
            state.advance(&format!("node-{}", i));
        }
        state
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (_dir, store) = temp_store();
        let mut state = state_at("sess-1", 1);
        state.record_result(
            AgentRole::from("knowledge"),
            AgentResult::Success {
                payload: serde_json::json!({"text": "The export now includes VAT.", "score": 0.1}),
            },
        );

        store.save(&Checkpoint::capture(&state).unwrap()).await.unwrap();
        let loaded = store.load(&state.session_id, None).await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn blob_is_byte_identical() {
        let (_dir, store) = temp_store();
        let state = state_at("sess-1", 2);
        let cp = Checkpoint::capture(&state).unwrap();
        store.save(&cp).await.unwrap();

        let history = store.history(&state.session_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0], cp);
    }

    #[tokio::test]
    async fn latest_and_specific_step() {
        let (_dir, store) = temp_store();
        let sid = SessionId::from_string("sess-1");
        for steps in 1..=3 {
            let cp = Checkpoint::capture(&state_at("sess-1", steps)).unwrap();
            store.save(&cp).await.unwrap();
        }

        assert_eq!(store.load(&sid, None).await.unwrap().step, 3);
        assert_eq!(store.load(&sid, Some(2)).await.unwrap().step, 2);

        let steps: Vec<u64> = store
            .history(&sid)
            .await
            .unwrap()
            .iter()
            .map(|c| c.step_index)
            .collect();
        assert_eq!(steps, vec![1, 2, 3]);
        assert_eq!(store.count(&sid).unwrap(), 3);
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let (_dir, store) = temp_store();
        let cp = Checkpoint::capture(&state_at("sess-1", 1)).unwrap();
        store.save(&cp).await.unwrap();

        let err = store.save(&cp).await.unwrap_err();
        assert!(matches!(err, WaypointError::Database(_)));
        assert_eq!(store.count(&cp.session_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let sid = SessionId::from_string("nope");
        assert!(matches!(
            store.load(&sid, None).await,
            Err(WaypointError::CheckpointNotFound { step: None, .. })
        ));
        assert!(matches!(
            store.load(&sid, Some(4)).await,
            Err(WaypointError::CheckpointNotFound { step: Some(4), .. })
        ));
        assert!(store.history(&sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sessions_are_listed() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        for sid in ["b", "a"] {
            let cp = Checkpoint::capture(&state_at(sid, 1)).unwrap();
            store.save(&cp).await.unwrap();
        }
        let sessions = store.sessions().await.unwrap();
        assert_eq!(sessions, vec![SessionId::from_string("a"), SessionId::from_string("b")]);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("checkpoints.db");
        let state = state_at("sess-1", 1);
        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store.save(&Checkpoint::capture(&state).unwrap()).await.unwrap();
        }
        let store = SqliteCheckpointStore::open(&path).unwrap();
        assert_eq!(store.load(&state.session_id, None).await.unwrap(), state);
    }
}
