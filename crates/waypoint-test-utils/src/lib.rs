//! Mocks and fixtures shared by the Waypoint test suites.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tempfile::TempDir;

use waypoint_core::config::AppConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::state::{AuditRecord, Checkpoint, RunState};
use waypoint_core::traits::{Agent, AuditSink, CheckpointStore};
use waypoint_core::types::{AgentReply, AgentRequest, SessionId};

/// One scripted behavior for a [`MockAgent`] call.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Successful reply with `{"text": ...}`.
    Text(String),
    /// Successful reply with an arbitrary JSON result.
    Json(serde_json::Value),
    /// Agent-reported failure with the given `error_kind`.
    Error(String),
    /// Transport-level connection failure.
    Unavailable,
    /// Never answers; relies on the caller's timeout.
    Hang,
}

struct MockInner {
    role: String,
    script: Mutex<VecDeque<MockReply>>,
    fallback: MockReply,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<AgentRequest>>,
}

/// Scripted agent. Replies are consumed from the script in order; once the
/// script is empty every call gets the fallback reply. Clones share state.
#[derive(Clone)]
pub struct MockAgent {
    inner: Arc<MockInner>,
}

impl MockAgent {
    pub fn new(role: &str, fallback: MockReply) -> Self {
        Self {
            inner: Arc::new(MockInner {
                role: role.to_string(),
                script: Mutex::new(VecDeque::new()),
                fallback,
                delay: Mutex::new(Duration::ZERO),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Agent that always answers with `text`.
    pub fn text(role: &str, text: &str) -> Self {
        Self::new(role, MockReply::Text(text.to_string()))
    }

    /// Agent that never answers.
    pub fn hanging(role: &str) -> Self {
        Self::new(role, MockReply::Hang)
    }

    /// Agent whose connection is always refused.
    pub fn unavailable(role: &str) -> Self {
        Self::new(role, MockReply::Unavailable)
    }

    /// Queue replies to be used before the fallback.
    pub fn with_script(self, replies: Vec<MockReply>) -> Self {
        self.inner.script.lock().unwrap().extend(replies);
        self
    }

    /// Delay every reply by `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock().unwrap() = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    fn next_reply(&self) -> MockReply {
        self.inner
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.inner.fallback.clone())
    }
}

impl Agent for MockAgent {
    fn role(&self) -> &str {
        &self.inner.role
    }

    fn invoke(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentReply>> {
        Box::pin(async move {
            self.inner.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.requests.lock().unwrap().push(request);
            let reply = self.next_reply();
            let delay = *self.inner.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match reply {
                MockReply::Text(text) => Ok(AgentReply::ok(serde_json::json!({ "text": text }))),
                MockReply::Json(value) => Ok(AgentReply::ok(value)),
                MockReply::Error(kind) => Ok(AgentReply::error(kind)),
                MockReply::Unavailable => Err(WaypointError::AgentUnavailable {
                    role: self.inner.role.clone(),
                    reason: "connection refused".into(),
                }),
                MockReply::Hang => futures::future::pending().await,
            }
        })
    }
}

/// Checkpoint store wrapper that fails saves on demand.
///
/// The first `ok_saves` saves go through to the inner store; every save after
/// that fails (or hangs, with [`FailingCheckpointStore::hanging`]).
pub struct FailingCheckpointStore {
    inner: Arc<dyn CheckpointStore>,
    ok_saves: usize,
    hang: bool,
    attempts: AtomicUsize,
}

impl FailingCheckpointStore {
    pub fn new(inner: Arc<dyn CheckpointStore>, ok_saves: usize) -> Self {
        Self {
            inner,
            ok_saves,
            hang: false,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Failing saves never complete instead of returning an error.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Total save attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl CheckpointStore for FailingCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let checkpoint = checkpoint.clone();
        Box::pin(async move {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.ok_saves {
                return self.inner.save(&checkpoint).await;
            }
            if self.hang {
                futures::future::pending::<()>().await;
            }
            Err(WaypointError::Database("disk I/O error".into()))
        })
    }

    fn load(&self, session: &SessionId, step: Option<u64>) -> BoxFuture<'_, Result<RunState>> {
        let session = session.clone();
        Box::pin(async move { self.inner.load(&session, step).await })
    }

    fn history(&self, session: &SessionId) -> BoxFuture<'_, Result<Vec<Checkpoint>>> {
        let session = session.clone();
        Box::pin(async move { self.inner.history(&session).await })
    }

    fn sessions(&self) -> BoxFuture<'_, Result<Vec<SessionId>>> {
        self.inner.sessions()
    }
}

/// Audit sink that keeps records in memory.
#[derive(Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, record: &AuditRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            self.records.lock().unwrap().push(record);
            Ok(())
        })
    }
}

/// Config tuned for tests: short timeouts, tiny backoff, runtime log off.
pub fn test_config(workspace: &Path) -> AppConfig {
    let toml_str = format!(
        r#"
[engine]
workspace = "{}"

[gateway]
call_timeout_secs = 2
initial_backoff_ms = 1
max_backoff_ms = 5

[checkpoint]
write_timeout_secs = 1

[log]
enabled = false
"#,
        workspace.display()
    );
    toml::from_str(&toml_str).unwrap()
}

/// Temporary workspace plus a config pointing at it.
pub fn temp_workspace() -> (TempDir, AppConfig) {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    (dir, config)
}
