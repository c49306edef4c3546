use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use waypoint_core::error::Result;
use waypoint_core::state::AuditRecord;
use waypoint_core::traits::AuditSink;

/// Append-only JSONL audit log: one line per compliance violation.
///
/// Each line is flushed before `record` returns, so a crash never loses an
/// acknowledged record.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlAuditSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(tokio::fs::File::from_std(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) -> BoxFuture<'_, Result<()>> {
        let line = serde_json::to_string(record).map(|mut s| {
            s.push('\n');
            s
        });
        Box::pin(async move {
            let line = line?;
            let mut file = self.file.lock().await;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
    }
}
