//! # BackUP Engine - Backup Orchestration Library
//!
//! A headless backup engine in Rust that mirrors directory trees into target
//! directories, optionally routing selected files through an external
//! encryption tool. Designed as the foundation for multiple front ends
//! (GUI, remote console, automation).
//!
//! ## Overview
//!
//! The engine manages named backup jobs and runs them concurrently.
//! It features:
//! - Full and differential backups with a persisted per-job state
//! - Two-phase runs: encryption first, then a chunked streaming copy
//! - Priority extensions copied before every other file of a job
//! - Bounded worker pools, a large-file throttle and a single encryption slot
//! - Pause, resume, stop and cancel of running jobs
//! - A business-software gate that refuses to start while protected
//!   applications run
//! - Progress and log reporting through sink traits (decoupled from UI technology)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use backup_engine::{BackupMode, EngineBuilder, Job, Settings};
//! use std::path::Path;
//!
//! # async fn run() -> Result<(), backup_engine::EngineError> {
//! let settings = Settings::load(Path::new("settings.json"))?;
//! let engine = EngineBuilder::in_dir(settings, Path::new("data"))?.build()?;
//!
//! engine.create_job(Job::new(
//!     "Documents",
//!     "/home/me/Documents",
//!     "/mnt/backup/Documents",
//!     BackupMode::Differential,
//!     false,
//! ))?;
//!
//! let outcome = engine.execute("Documents").await?;
//! println!("{}: {} copied, {} skipped", outcome.status, outcome.files_copied, outcome.files_skipped);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (Job, JobState, FileWorkItem, enums)
//! - **error**: Error types and handling
//! - **settings**: Read-only engine settings
//! - **job**: The engine (job management, run lifecycle, control)
//! - **pipeline**: Encryption and copy phases of a run
//! - **scheduler**: Worker pools, throttles and the priority gate
//! - **control**: Per-run pause/cancel signals and the active-runs registry
//! - **crypto**: External encryption tool
//! - **gate**: Business-software detection
//! - **fs_ops**: Low-level filesystem operations
//! - **job_store** / **state_store**: JSON persistence
//! - **progress** / **log**: Progress and log sinks
//! - **command**: Remote command surface

pub mod command;
pub mod control;
pub mod crypto;
pub mod error;
pub mod fs_ops;
pub mod gate;
pub mod job;
pub mod job_store;
pub mod log;
pub mod model;
mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod settings;
pub mod state_store;

// Re-export main types
pub use command::{Command, Response};
pub use crypto::{Encryptor, ExternalTool};
pub use error::{EngineError, StepError};
pub use gate::{BusinessGate, ProcessProbe, SysinfoProbe};
pub use job::{Engine, EngineBuilder};
pub use job_store::JobStore;
pub use log::{LogAction, LogEntry, LogSink, Severity, TracingLogSink};
pub use model::{BackupMode, FileState, Job, JobState, JobStatus, RunOutcome};
pub use progress::{
    ChannelProgressSink, EncryptionProgress, FileProgress, NullProgressSink, ProgressEvent,
    ProgressSink,
};
pub use scheduler::Scheduler;
pub use settings::Settings;
pub use state_store::StateStore;
