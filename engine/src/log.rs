//! Log sink contract.
//!
//! The engine emits one `LogEntry` per notable event. Where entries end up
//! (daily JSON files, a database, a socket) is up to the embedding
//! application; `TracingLogSink` forwards them to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::{BackupMode, Job};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogAction {
    BackupStarted,
    BackupCompleted,
    BackupFailed,
    BackupCancelled,
    BackupStopped,
    BackupPaused,
    BackupResumed,
    FileCopyComplete,
    FileCopyError,
    FileSkipped,
    EncryptionComplete,
    EncryptionError,
    BusinessSoftwareDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub job_name: String,
    pub backup_type: BackupMode,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub message: String,
    pub severity: Severity,
    pub action: LogAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_time_ms: Option<u64>,
    /// Aggregated per-file errors, attached to the final entry of a run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl LogEntry {
    /// An entry about `job` as a whole, stamped now.
    pub fn new(job: &Job, action: LogAction, severity: Severity, message: impl Into<String>) -> Self {
        LogEntry {
            timestamp: Utc::now(),
            job_name: job.name.clone(),
            backup_type: job.mode,
            source_path: job.source_path.clone(),
            target_path: job.target_path.clone(),
            message: message.into(),
            severity,
            action,
            file_size: None,
            transfer_time_ms: None,
            encryption_time_ms: None,
            errors: Vec::new(),
        }
    }

    pub fn with_paths(mut self, source: &Path, target: &Path) -> Self {
        self.source_path = source.to_path_buf();
        self.target_path = target.to_path_buf();
        self
    }

    pub fn with_file_size(mut self, size: u64) -> Self {
        self.file_size = Some(size);
        self
    }

    pub fn with_transfer_time(mut self, elapsed: Duration) -> Self {
        self.transfer_time_ms = Some(elapsed.as_millis() as u64);
        self
    }

    pub fn with_encryption_time(mut self, elapsed: Duration) -> Self {
        self.encryption_time_ms = Some(elapsed.as_millis() as u64);
        self
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }
}

/// Receives log entries. Called from worker tasks; must not block for long.
pub trait LogSink: Send + Sync {
    fn write(&self, entry: LogEntry);
}

/// Forwards entries to `tracing` at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write(&self, entry: LogEntry) {
        let action = serde_json::to_string(&entry.action).unwrap_or_default();
        let action = action.trim_matches('"');
        match entry.severity {
            Severity::Info => tracing::info!(
                job = %entry.job_name,
                action,
                source = %entry.source_path.display(),
                target = %entry.target_path.display(),
                "{}",
                entry.message
            ),
            Severity::Warning => tracing::warn!(
                job = %entry.job_name,
                action,
                source = %entry.source_path.display(),
                target = %entry.target_path.display(),
                "{}",
                entry.message
            ),
            Severity::Error => tracing::error!(
                job = %entry.job_name,
                action,
                source = %entry.source_path.display(),
                target = %entry.target_path.display(),
                errors = ?entry.errors,
                "{}",
                entry.message
            ),
        }
    }
}
