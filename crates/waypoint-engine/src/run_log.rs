use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use waypoint_core::event::EventBus;
use waypoint_core::types::{EngineEvent, SessionId};

/// JSONL runtime logger for one session.
///
/// Subscribes to the EventBus and writes one JSON object per line to
/// `{log_dir}/{session_id}/{timestamp}.jsonl`, flushing after every entry so
/// a crash never loses committed lines. Events of other sessions are ignored.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    session_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=run summary, 2=per step, 3=per agent call.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write in a background task.
    ///
    /// Subscribing before the task is spawned means no event published after
    /// this call returns can be missed.
    pub fn start(
        self,
        event_bus: &EventBus,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, session_id, cancel))
    }

    /// Write entries until the session's run ends or `cancel` fires.
    pub async fn run(
        self,
        mut rx: Receiver<EngineEvent>,
        session_id: SessionId,
        cancel: CancellationToken,
    ) {
        let session_dir = self.log_dir.join(&session_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&session_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = session_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(session_id = %session_id, path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.session_id() != &session_id {
                                continue;
                            }

                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }

                            if matches!(
                                event,
                                EngineEvent::RunFinished { .. }
                                    | EngineEvent::RunCancelled { .. }
                                    | EngineEvent::RunError { .. }
                            ) {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry, or `None` if the level filters it out.
    fn event_to_entry(&self, event: &EngineEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, step: Option<u64>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id: event.session_id().0.clone(),
            event_type: event_type.to_string(),
            step,
            detail,
        };

        match event {
            // L1: run summary
            EngineEvent::RunStarted { workflow, turn, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "workflow": workflow, "turn": turn })),
            )),
            EngineEvent::RunFinished { status, steps, .. } => Some(entry(
                "run_finished",
                Some(*steps),
                Some(serde_json::json!({ "status": status })),
            )),
            EngineEvent::RunCancelled { step, .. } => Some(entry("run_cancelled", Some(*step), None)),
            EngineEvent::RunError { error, .. } => Some(entry(
                "run_error",
                None,
                Some(serde_json::json!({ "error": error })),
            )),

            // L2: per step
            EngineEvent::StepCompleted { node, step, .. } if self.level >= 2 => Some(entry(
                "step_completed",
                Some(*step),
                Some(serde_json::json!({ "node": node })),
            )),
            EngineEvent::ViolationRecorded { step, violation, .. } if self.level >= 2 => {
                Some(entry(
                    "violation_recorded",
                    Some(*step),
                    Some(serde_json::json!({
                        "rule_id": violation.rule_id,
                        "severity": violation.severity,
                        "span": truncate_str(&violation.span, 200),
                    })),
                ))
            }
            EngineEvent::HumanReviewFlagged { step, .. } if self.level >= 2 => {
                Some(entry("human_review_flagged", Some(*step), None))
            }

            // L3: per agent call
            EngineEvent::AgentCalled {
                role,
                succeeded,
                elapsed_ms,
                ..
            } if self.level >= 3 => Some(entry(
                "agent_called",
                None,
                Some(serde_json::json!({
                    "role": role,
                    "succeeded": succeeded,
                    "elapsed_ms": elapsed_ms,
                })),
            )),

            _ => None,
        }
    }
}

fn truncate_str(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
