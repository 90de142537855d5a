//! JSON-lines audit sink.
//!
//! Appends each [`AuditEntry`] as one JSON object per line. The file is only
//! ever opened for append, so log shippers can tail it safely.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audit::{AuditEntry, AuditSink};
use crate::error::AuditError;

/// Audit sink that writes JSON lines to a file.
pub struct FileAuditSink {
    path: PathBuf,
    /// Opened lazily on first write; the mutex serializes appends.
    writer: Mutex<Option<tokio::fs::File>>,
}

impl FileAuditSink {
    /// Create a sink writing to `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    fn failure(&self, reason: String) -> AuditError {
        AuditError::SinkFailure {
            name: self.name().to_owned(),
            reason,
        }
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "file"
    }

    async fn log(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(entry).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.failure(format!("failed to open '{}': {e}", self.path.display())))?;
            *guard = Some(file);
        }
        let file = guard
            .as_mut()
            .ok_or_else(|| self.failure("file handle missing after open".to_owned()))?;

        file.write_all(&line)
            .await
            .map_err(|e| self.failure(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| self.failure(format!("flush failed: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let sink = FileAuditSink::new(&path);

        sink.log(&AuditEntry::new("dek.rotate", "DEK").entity("data")).await.unwrap();
        sink.log(&AuditEntry::new("lease.create", "Lease")).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.action, "dek.rotate");
        assert_eq!(first.entity_id.as_deref(), Some("data"));
    }

    #[tokio::test]
    async fn unwritable_path_reports_sink_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(dir.path().join("missing").join("audit.log"));
        let err = sink.log(&AuditEntry::new("x", "y")).await.unwrap_err();
        assert!(matches!(err, AuditError::SinkFailure { .. }));
    }
}
