//! Append-only audit trail of runs
//!
//! One JSON object per line in `{data_dir}/audit/executions.jsonl`. Writes
//! are serialized through an async mutex; a failed write is logged and the
//! run result is returned regardless.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::conversation::ConversationKey;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode audit record: {0}")]
    Encode(serde_json::Error),
    #[error("malformed audit record on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: String,
    pub conversation_key: ConversationKey,
    pub sandbox_id: Option<String>,
    pub program: String,
    pub output: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("audit").join("executions.jsonl"),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record).map_err(AuditError::Encode)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Append, logging instead of failing
    pub async fn record(&self, record: &AuditRecord) {
        if let Err(e) = self.append(record).await {
            warn!(run_id = %record.run_id, path = %self.path.display(), error = %e, "failed to write audit record");
        }
    }

    /// Every record written so far, oldest first
    pub async fn read_all(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, l)| serde_json::from_str(l).map_err(|e| AuditError::Parse { line: i + 1, source: e }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(run_id: &str, success: bool) -> AuditRecord {
        AuditRecord {
            run_id: run_id.to_string(),
            conversation_key: ConversationKey::new("c1"),
            sandbox_id: Some("sbx-1".into()),
            program: "print(1)".into(),
            output: "1\n".into(),
            success,
            exit_code: Some(if success { 0 } else { 1 }),
            timed_out: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        assert!(log.read_all().await.unwrap().is_empty());

        log.append(&record("run-1", true)).await.unwrap();
        log.append(&record("run-2", false)).await.unwrap();

        let records = log.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].run_id, "run-1");
        assert!(!records[1].success);
    }

    #[tokio::test]
    async fn test_record_never_fails() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the audit directory should be
        std::fs::write(dir.path().join("audit"), b"").unwrap();
        let log = AuditLog::new(dir.path());
        log.record(&record("run-1", true)).await;
        assert!(log.append(&record("run-1", true)).await.is_err());
    }
}
