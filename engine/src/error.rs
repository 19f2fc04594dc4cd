//! Error types for the backup engine.
//!
//! The primary error type is `EngineError`, which represents job-level errors
//! that prevent a backup from being started or finished. File-level errors are
//! recorded on the work item and aggregated into the run outcome, not returned
//! as EngineError.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur at the job level.
///
/// Precondition variants (`AlreadyRunning`, `BusinessSoftwareRunning`,
/// `EncryptionToolRunning`, `JobNotFound`, `InvalidPath`, ...) are returned
/// before any file is touched and leave the persisted job state unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No job with this name exists in the job store
    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    /// A job with this name already exists
    #[error("A job named '{name}' already exists")]
    JobNameTaken { name: String },

    /// The job store already holds the maximum number of jobs
    #[error("Job limit reached ({max} jobs)")]
    JobLimitReached { max: usize },

    /// The job is registered as running
    #[error("Job is already running: {name}")]
    AlreadyRunning { name: String },

    /// The job must be running for this operation
    #[error("Job is not running: {name}")]
    NotRunning { name: String },

    /// The job cannot be edited or deleted while it runs
    #[error("Job '{name}' cannot be modified while it is running")]
    JobRunning { name: String },

    /// A protected application is running
    #[error("Business software is running: {process}")]
    BusinessSoftwareRunning { process: String },

    /// Another instance of the encryption tool is already running
    #[error("Encryption tool is already running: {}", tool.display())]
    EncryptionToolRunning { tool: PathBuf },

    /// The job definition is invalid (empty name, bad mode, ...)
    #[error("Invalid job: {reason}")]
    InvalidJob { reason: String },

    /// Source directory does not exist
    #[error("Source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Path is unusable for this job
    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Target directory cannot be created or written
    #[error("Target directory is not writable: {}", path.display())]
    TargetNotWritable { path: PathBuf, source: io::Error },

    /// Failed to enumerate source directory
    #[error("Failed to enumerate directory: {}", path.display())]
    EnumerationFailed { path: PathBuf, source: io::Error },

    /// Failed to read from source file
    #[error("Failed to read file: {}", path.display())]
    ReadError { path: PathBuf, source: io::Error },

    /// Failed to write to target file
    #[error("Failed to write file: {}", path.display())]
    WriteError { path: PathBuf, source: io::Error },

    /// Failed to create a directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed { path: PathBuf, source: io::Error },

    /// The encryption tool could not process a file
    #[error("Encryption failed for {}: {reason}", path.display())]
    EncryptionFailed { path: PathBuf, reason: String },

    /// Reading or writing a persisted JSON file failed
    #[error("Failed to persist {}: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },

    /// Settings file is malformed or inconsistent
    #[error("Invalid settings: {reason}")]
    InvalidSettings { reason: String },

    /// A worker task panicked or was aborted
    #[error("Worker task failed: {message}")]
    TaskFailed { message: String },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::TargetNotWritable { source, .. }
            | Self::EnumerationFailed { source, .. }
            | Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::DirectoryCreationFailed { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// True for errors reported before a run touches the disk.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound { .. }
                | Self::AlreadyRunning { .. }
                | Self::BusinessSoftwareRunning { .. }
                | Self::EncryptionToolRunning { .. }
                | Self::SourceNotFound { .. }
                | Self::InvalidPath { .. }
                | Self::TargetNotWritable { .. }
        )
    }

    pub(crate) fn persistence(path: &std::path::Path, reason: impl ToString) -> Self {
        Self::Persistence {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Why a single step of the file pipeline did not finish.
///
/// Cancellation is not a failure: it unwinds the step without recording an
/// error on the file.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] EngineError),
}

impl StepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }
}
