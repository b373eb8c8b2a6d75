use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit append failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Allow,
    Deny,
    Update,
}

/// One JSON object per line in the append-only audit log.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size: Option<usize>,
}

impl AuditEntry {
    pub fn now(action: AuditAction, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            command: command.into(),
            args,
            reason: None,
            duration: None,
            output_size: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_are_json_lines_with_required_fields() {
        let dir = std::env::temp_dir().join(format!("audit-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let log = AuditLog::new(dir.join("audit.log"));

        log.append(&AuditEntry::now(
            AuditAction::Allow,
            "ls",
            vec!["-l".to_string()],
        ))
        .await
        .unwrap();
        log.append(
            &AuditEntry::now(AuditAction::Deny, "rm", vec!["-rf".to_string()])
                .with_reason("FLAG_DENIED"),
        )
        .await
        .unwrap();

        let contents = tokio::fs::read_to_string(dir.join("audit.log")).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "allow");
        assert_eq!(first["command"], "ls");
        assert!(first["timestamp"].is_string());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["reason"], "FLAG_DENIED");
    }
}
