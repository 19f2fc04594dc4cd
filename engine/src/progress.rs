//! Progress reporting.
//!
//! This module defines the ProgressSink trait, which decouples the engine
//! from whatever presents progress (GUI, socket server, tests). Events are
//! plain data; sinks are called from worker tasks and must not block.

use crossbeam_channel::{Sender, TrySendError};
use std::path::PathBuf;
use std::time::Duration;

/// Emitted after every copied chunk and when a file's copy phase ends.
#[derive(Debug, Clone, PartialEq)]
pub struct FileProgress {
    pub job: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub file_size: u64,
    /// Job-level progress percentage
    pub percent: u8,
    /// Job-level bytes accounted so far
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub files_processed: u64,
    pub total_files: u64,
    pub elapsed: Duration,
    pub success: bool,
}

/// Emitted when an encryption starts and when it ends.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionProgress {
    pub job: String,
    pub file: PathBuf,
    /// Encryption-phase progress percentage
    pub percent: u8,
    pub is_complete: bool,
    pub has_error: bool,
    pub error_message: Option<String>,
}

/// Receives progress events from running jobs.
///
/// All methods are called synchronously from worker tasks.
pub trait ProgressSink: Send + Sync {
    fn on_file_progress(&self, event: &FileProgress);

    fn on_encryption_progress(&self, event: &EncryptionProgress);

    /// A protected process was seen while `job` was running.
    fn on_business_software_detected(&self, job: &str, process: &str);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_file_progress(&self, _event: &FileProgress) {}

    fn on_encryption_progress(&self, _event: &EncryptionProgress) {}

    fn on_business_software_detected(&self, _job: &str, _process: &str) {}
}

/// Events as a single enum, for channel consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    File(FileProgress),
    Encryption(EncryptionProgress),
    BusinessSoftwareDetected { job: String, process: String },
}

/// A ProgressSink that forwards events over a bounded channel.
///
/// Events are dropped when the channel is full so a slow consumer never
/// stalls a worker task.
pub struct ChannelProgressSink {
    sender: Sender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        ChannelProgressSink { sender }
    }

    /// Create a sink and the receiving end of its channel.
    pub fn bounded(capacity: usize) -> (Self, crossbeam_channel::Receiver<ProgressEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (ChannelProgressSink::new(tx), rx)
    }
}

impl ChannelProgressSink {
    fn forward(&self, event: ProgressEvent) {
        match self.sender.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!("progress channel full, dropping event");
            }
        }
    }
}

impl ProgressSink for ChannelProgressSink {
    fn on_file_progress(&self, event: &FileProgress) {
        self.forward(ProgressEvent::File(event.clone()));
    }

    fn on_encryption_progress(&self, event: &EncryptionProgress) {
        self.forward(ProgressEvent::Encryption(event.clone()));
    }

    fn on_business_software_detected(&self, job: &str, process: &str) {
        self.forward(ProgressEvent::BusinessSoftwareDetected {
            job: job.to_string(),
            process: process.to_string(),
        });
    }
}
