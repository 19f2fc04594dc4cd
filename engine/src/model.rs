//! Core data model for backup jobs.
//!
//! This module defines the main data structures:
//! - Job: a named backup configuration, persisted in the job store
//! - JobState: the persisted progress/status record of a job
//! - FileWorkItem: a single file within one run
//! - RunOutcome: the summary returned when a run settles
//! - BackupMode, JobStatus, FileState: enums controlling behavior

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::EngineError;
use crate::fs_ops::StagingFile;

/// A named backup configuration.
///
/// Serialized as `{name, sourcePath, targetPath, type, encrypt}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique key
    pub name: String,

    /// Root source directory
    pub source_path: PathBuf,

    /// Root target directory
    pub target_path: PathBuf,

    /// Full or differential
    #[serde(rename = "type")]
    pub mode: BackupMode,

    /// Whether files with an encryption extension go through the encryption tool
    #[serde(default)]
    pub encrypt: bool,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        source_path: impl Into<PathBuf>,
        target_path: impl Into<PathBuf>,
        mode: BackupMode,
        encrypt: bool,
    ) -> Self {
        Job {
            name: name.into(),
            source_path: source_path.into(),
            target_path: target_path.into(),
            mode,
            encrypt,
        }
    }

    /// Check the definition without touching the disk.
    ///
    /// The name must be non-empty after trimming, both paths must be set, and
    /// the target may neither equal the source nor live inside it.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidJob {
                reason: "Job name is empty".to_string(),
            });
        }
        if self.name.trim() != self.name {
            return Err(EngineError::InvalidJob {
                reason: format!("Job name '{}' has leading or trailing whitespace", self.name),
            });
        }
        if self.source_path.as_os_str().is_empty() {
            return Err(EngineError::InvalidPath {
                path: self.source_path.clone(),
                reason: "Source path is empty".to_string(),
            });
        }
        if self.target_path.as_os_str().is_empty() {
            return Err(EngineError::InvalidPath {
                path: self.target_path.clone(),
                reason: "Target path is empty".to_string(),
            });
        }

        let source = normalize(&self.source_path);
        let target = normalize(&self.target_path);
        if source == target {
            return Err(EngineError::InvalidPath {
                path: self.target_path.clone(),
                reason: "Target must differ from source".to_string(),
            });
        }
        if target.starts_with(&source) {
            return Err(EngineError::InvalidPath {
                path: self.target_path.clone(),
                reason: "Target must not be inside the source directory".to_string(),
            });
        }
        Ok(())
    }
}

/// Lexical normalization; the target may not exist yet, so no canonicalize.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// The backup mode of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupMode {
    /// Copy every source file
    Full,
    /// Copy only files newer than their target counterpart
    Differential,
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupMode::Full => write!(f, "Full"),
            BackupMode::Differential => write!(f, "Differential"),
        }
    }
}

/// The status of a job as persisted in the state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JobStatus {
    /// Never run, or reset
    #[default]
    Ready,
    /// Currently executing
    Active,
    /// Registered as running but suspended
    Paused,
    /// All files processed without error
    Completed,
    /// All files processed, at least one failed; or a fatal error
    Error,
    /// Cancellation observed without a stop request
    Cancelled,
    /// Stopped by the user
    Stopped,
}

impl JobStatus {
    /// Returns true if the run has settled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled | JobStatus::Stopped
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, JobStatus::Active | JobStatus::Paused)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Persisted progress/status record of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub name: String,
    pub status: JobStatus,
    #[serde(rename = "totalFilesCount")]
    pub total_files: u64,
    #[serde(rename = "totalFilesSize")]
    pub total_bytes: u64,
    pub files_remaining: u64,
    pub bytes_remaining: u64,
    pub current_source_file: Option<PathBuf>,
    pub current_target_file: Option<PathBuf>,
    pub progress_percentage: u8,
    pub last_action_time: DateTime<Utc>,
}

impl JobState {
    /// A fresh Ready record.
    pub fn new(name: impl Into<String>) -> Self {
        JobState {
            name: name.into(),
            status: JobStatus::Ready,
            total_files: 0,
            total_bytes: 0,
            files_remaining: 0,
            bytes_remaining: 0,
            current_source_file: None,
            current_target_file: None,
            progress_percentage: 0,
            last_action_time: Utc::now(),
        }
    }
}

/// The state of an individual file within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Not yet processed
    Pending,
    /// Encrypted into a staging file, waiting for the copy phase
    Staged,
    /// Copied to the target
    Done,
    /// Left untouched by the differential rule
    Skipped,
    /// Error occurred; file not copied
    Failed,
    /// Run was cancelled before the file finished
    Interrupted,
}

impl FileState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FileState::Pending | FileState::Staged)
    }
}

/// One file of one run.
#[derive(Debug)]
pub struct FileWorkItem {
    /// Full source path
    pub source_path: PathBuf,

    /// Path relative to the job's source root
    pub relative_path: PathBuf,

    /// Full target path
    pub target_path: PathBuf,

    /// Source size in bytes
    pub file_size: u64,

    /// Source modification time
    pub modified: Option<SystemTime>,

    /// Extension is in the priority set
    pub priority: bool,

    /// Job encrypts and extension is in the encryption set
    pub encrypt: bool,

    /// Encrypted staging copy; removed when dropped
    pub staging: Option<StagingFile>,

    pub state: FileState,

    /// Bytes written to the target
    pub bytes_copied: u64,

    /// Human-readable error message
    pub error_message: Option<String>,
}

impl FileWorkItem {
    /// The file the copy phase reads: the staging copy if encrypted, else the source.
    pub fn copy_source(&self) -> &Path {
        match &self.staging {
            Some(staging) => staging.path(),
            None => &self.source_path,
        }
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.state = FileState::Failed;
        self.error_message = Some(message);
    }
}

/// Summary of a settled run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub name: String,
    pub status: JobStatus,
    pub files_copied: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub bytes_copied: u64,
    /// One message per failed file
    pub errors: Vec<String>,
    pub elapsed: Duration,
}
