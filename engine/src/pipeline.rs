//! Per-run file pipeline.
//!
//! A run moves its work items through two phases:
//! - the encryption phase, over files that need the external tool, priority
//!   batch first and then the normal batch
//! - the copy phase, over every file still pending or staged, where normal
//!   files wait until every priority file of the run has been copied
//!
//! Each file is its own task. A task never fails the run: errors are recorded
//! on the work item and cancellation marks it interrupted. The counters of
//! the run live in [`RunProgress`] and are mirrored into the job state.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::control::RunControl;
use crate::crypto::Encryptor;
use crate::error::{EngineError, StepError};
use crate::fs_ops::{self, StagingFile};
use crate::gate::BusinessGate;
use crate::log::{LogAction, LogEntry, LogSink, Severity};
use crate::model::{BackupMode, FileState, FileWorkItem, Job};
use crate::progress::{EncryptionProgress, FileProgress, ProgressSink};
use crate::scheduler::{PriorityGate, PriorityTicket, Scheduler};
use crate::settings::Settings;
use crate::state_store::StateStore;

/// Counters of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RunProgress {
    pub total_files: u64,
    pub total_bytes: u64,
    /// Files entering the encryption phase
    pub to_encrypt: u64,
    /// Files that left the encryption phase, encrypted or failed
    pub encrypted: u64,
    /// Files settled for good: copied, skipped or failed
    pub processed: u64,
    pub bytes_remaining: u64,
}

impl RunProgress {
    pub fn files_remaining(&self) -> u64 {
        self.total_files.saturating_sub(self.processed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.total_bytes.saturating_sub(self.bytes_remaining)
    }

    /// Half encryption phase, half copy phase, by file count, rounded down.
    /// Without anything to encrypt the copy phase is the whole job.
    pub fn percentage(&self) -> u8 {
        let copy = fraction(self.processed, self.total_files);
        let percent = if self.to_encrypt == 0 {
            100.0 * copy
        } else {
            50.0 * fraction(self.encrypted, self.to_encrypt) + 50.0 * copy
        };
        (percent.floor() as u8).min(100)
    }

    pub fn encryption_percentage(&self) -> u8 {
        ((100.0 * fraction(self.encrypted, self.to_encrypt)).floor() as u8).min(100)
    }

    fn credit(&mut self, bytes: u64) {
        self.bytes_remaining = self.bytes_remaining.saturating_sub(bytes);
    }

    /// Settle one file, crediting the bytes not yet reported by chunks.
    fn settle(&mut self, uncredited: u64) {
        self.processed = (self.processed + 1).min(self.total_files);
        self.credit(uncredited);
    }
}

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        done.min(total) as f64 / total as f64
    }
}

/// Everything the tasks of one run share.
pub(crate) struct RunContext {
    pub job: Job,
    pub settings: Arc<Settings>,
    pub control: Arc<RunControl>,
    pub scheduler: Scheduler,
    pub gate: BusinessGate,
    pub encryptor: Arc<dyn Encryptor>,
    pub states: Arc<StateStore>,
    pub progress_sink: Arc<dyn ProgressSink>,
    pub log_sink: Arc<dyn LogSink>,
    pub priority_gate: Arc<PriorityGate>,
    pub progress: Mutex<RunProgress>,
}

impl RunContext {
    fn lock_progress(&self) -> MutexGuard<'_, RunProgress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> RunProgress {
        *self.lock_progress()
    }

    /// Apply `mutate` to the counters and mirror them into the job state.
    ///
    /// The progress lock is held while the state is saved, so saves of one
    /// run land in the order their counters changed.
    fn record<F>(&self, current: Option<(&Path, &Path)>, mutate: F) -> RunProgress
    where
        F: FnOnce(&mut RunProgress),
    {
        let mut progress = self.lock_progress();
        mutate(&mut progress);
        let snapshot = *progress;
        let saved = self.states.update(&self.job.name, |state| {
            state.files_remaining = snapshot.files_remaining();
            state.bytes_remaining = snapshot.bytes_remaining;
            state.progress_percentage = snapshot.percentage();
            if let Some((source, target)) = current {
                state.current_source_file = Some(source.to_path_buf());
                state.current_target_file = Some(target.to_path_buf());
            }
        });
        if let Err(e) = saved {
            tracing::warn!(job = %self.job.name, error = %e, "could not save job state");
        }
        snapshot
    }

    /// Chunk accounting stays in memory; the state is saved when the file settles.
    fn credit_chunk(&self, bytes: u64) -> RunProgress {
        let mut progress = self.lock_progress();
        progress.credit(bytes);
        *progress
    }

    fn log(&self, entry: LogEntry) {
        self.log_sink.write(entry);
    }

    fn emit_file_progress(&self, item: &FileWorkItem, snapshot: &RunProgress, success: bool) {
        self.progress_sink.on_file_progress(&FileProgress {
            job: self.job.name.clone(),
            source: item.source_path.clone(),
            target: item.target_path.clone(),
            file_size: item.file_size,
            percent: snapshot.percentage(),
            bytes_transferred: snapshot.bytes_transferred(),
            total_bytes: snapshot.total_bytes,
            files_processed: snapshot.processed,
            total_files: snapshot.total_files,
            elapsed: self.control.elapsed(),
            success,
        });
    }

    fn emit_encryption(&self, item: &FileWorkItem, snapshot: &RunProgress, error: Option<String>) {
        let is_complete = item.state != FileState::Pending;
        self.progress_sink.on_encryption_progress(&EncryptionProgress {
            job: self.job.name.clone(),
            file: item.source_path.clone(),
            percent: snapshot.encryption_percentage(),
            is_complete,
            has_error: error.is_some(),
            error_message: error,
        });
    }

    /// Set the totals of the run and settle the files that are already final:
    /// skipped by planning or unreadable at enumeration.
    fn begin(&self, items: &[FileWorkItem]) {
        let total_bytes: u64 = items.iter().map(|i| i.file_size).sum();
        let mut progress = self.lock_progress();
        *progress = RunProgress {
            total_files: items.len() as u64,
            total_bytes,
            to_encrypt: items
                .iter()
                .filter(|i| i.encrypt && i.state == FileState::Pending)
                .count() as u64,
            encrypted: 0,
            processed: 0,
            bytes_remaining: total_bytes,
        };
        for item in items
            .iter()
            .filter(|i| matches!(i.state, FileState::Skipped | FileState::Failed))
        {
            progress.settle(item.file_size);
        }
        let snapshot = *progress;
        let saved = self.states.update(&self.job.name, |state| {
            state.total_files = snapshot.total_files;
            state.total_bytes = snapshot.total_bytes;
            state.files_remaining = snapshot.files_remaining();
            state.bytes_remaining = snapshot.bytes_remaining;
            state.progress_percentage = if snapshot.total_files == 0 {
                0
            } else {
                snapshot.percentage()
            };
        });
        drop(progress);
        if let Err(e) = saved {
            tracing::warn!(job = %self.job.name, error = %e, "could not save job state");
        }

        for item in items {
            let entry = match item.state {
                FileState::Skipped => LogEntry::new(
                    &self.job,
                    LogAction::FileSkipped,
                    Severity::Info,
                    format!("{} is up to date", item.relative_path.display()),
                ),
                FileState::Failed => LogEntry::new(
                    &self.job,
                    LogAction::FileCopyError,
                    Severity::Error,
                    item.error_message.clone().unwrap_or_default(),
                ),
                _ => continue,
            };
            self.log(
                entry
                    .with_paths(&item.source_path, &item.target_path)
                    .with_file_size(item.file_size),
            );
        }
    }
}

/// Differential planning: mark files whose target is up to date as skipped.
///
/// Runs before the encryption phase, so skipped files are neither encrypted
/// nor copied.
pub(crate) fn plan(job: &Job, items: &mut [FileWorkItem]) {
    if job.mode != BackupMode::Differential {
        return;
    }
    for item in items.iter_mut().filter(|i| i.state == FileState::Pending) {
        if fs_ops::is_unchanged(item.modified, &item.target_path) {
            item.state = FileState::Skipped;
        }
    }
}

/// Drive `items` through both phases and return them settled.
///
/// # Errors
/// Returns EngineError only when a file task panics; file-level errors are
/// recorded on the returned items.
pub(crate) async fn run(
    ctx: Arc<RunContext>,
    items: Vec<FileWorkItem>,
) -> Result<Vec<FileWorkItem>, EngineError> {
    ctx.begin(&items);

    let (to_encrypt, mut settled): (Vec<_>, Vec<_>) = items
        .into_iter()
        .partition(|i| i.encrypt && i.state == FileState::Pending);
    let (priority, normal): (Vec<_>, Vec<_>) = to_encrypt.into_iter().partition(|i| i.priority);
    let had_encryption = !priority.is_empty() || !normal.is_empty();

    for batch in [priority, normal] {
        if batch.is_empty() {
            continue;
        }
        let mut tasks = JoinSet::new();
        for item in batch {
            tasks.spawn(encrypt_file(Arc::clone(&ctx), item));
        }
        settled.extend(join_all(tasks).await?);
    }

    if had_encryption {
        check_business_software(&ctx).await;
    }

    let (to_copy, mut done): (Vec<_>, Vec<_>) = settled
        .into_iter()
        .partition(|i| matches!(i.state, FileState::Pending | FileState::Staged));

    // Every priority ticket exists before the first normal task can look at the gate.
    let tickets: Vec<Option<PriorityTicket>> = to_copy
        .iter()
        .map(|i| i.priority.then(|| ctx.priority_gate.ticket()))
        .collect();
    let mut tasks = JoinSet::new();
    for (item, ticket) in to_copy.into_iter().zip(tickets) {
        tasks.spawn(copy_file(Arc::clone(&ctx), item, ticket));
    }
    done.extend(join_all(tasks).await?);

    done.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(done)
}

async fn join_all(mut tasks: JoinSet<FileWorkItem>) -> Result<Vec<FileWorkItem>, EngineError> {
    let mut items = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(item) => items.push(item),
            Err(e) => {
                return Err(EngineError::TaskFailed {
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(items)
}

/// Between phases: report protected software without pre-empting the run.
async fn check_business_software(ctx: &RunContext) {
    if ctx.control.is_cancelled() || ctx.settings.business_software.is_empty() {
        return;
    }
    let gate = ctx.gate.clone();
    let watched = ctx.settings.business_software.clone();
    let detected = tokio::task::spawn_blocking(move || gate.detect(&watched))
        .await
        .ok()
        .flatten();
    if let Some(process) = detected {
        ctx.progress_sink
            .on_business_software_detected(&ctx.job.name, &process);
        ctx.log(LogEntry::new(
            &ctx.job,
            LogAction::BusinessSoftwareDetected,
            Severity::Warning,
            format!("Business software '{}' is running", process),
        ));
    }
}

async fn encrypt_file(ctx: Arc<RunContext>, mut item: FileWorkItem) -> FileWorkItem {
    match encrypt_step(&ctx, &mut item).await {
        Ok(elapsed) => {
            item.state = FileState::Staged;
            let snapshot = ctx.record(None, |p| p.encrypted += 1);
            ctx.emit_encryption(&item, &snapshot, None);
            ctx.log(
                LogEntry::new(
                    &ctx.job,
                    LogAction::EncryptionComplete,
                    Severity::Info,
                    format!("Encrypted {}", item.relative_path.display()),
                )
                .with_paths(&item.source_path, &item.target_path)
                .with_file_size(item.file_size)
                .with_encryption_time(elapsed),
            );
        }
        Err(StepError::Cancelled) => item.state = FileState::Interrupted,
        Err(StepError::Failed(e)) => {
            let message = format!("{}: {}", item.relative_path.display(), e);
            item.fail(message.clone());
            let size = item.file_size;
            let snapshot = ctx.record(None, |p| {
                p.encrypted += 1;
                p.settle(size);
            });
            ctx.emit_encryption(&item, &snapshot, Some(e.to_string()));
            ctx.log(
                LogEntry::new(&ctx.job, LogAction::EncryptionError, Severity::Error, message)
                    .with_paths(&item.source_path, &item.target_path)
                    .with_file_size(item.file_size),
            );
        }
    }
    item
}

async fn encrypt_step(ctx: &RunContext, item: &mut FileWorkItem) -> Result<Duration, StepError> {
    ctx.control.checkpoint().await?;
    let _slot = ctx.scheduler.acquire_pool(item.priority, &ctx.control).await?;
    let _tool = ctx.scheduler.acquire_encryption(&ctx.control).await?;
    ctx.control.checkpoint().await?;

    let staging = StagingFile::reserve(&ctx.settings.staging_dir(), &item.source_path)?;
    ctx.emit_encryption(item, &ctx.snapshot(), None);
    let elapsed = ctx
        .encryptor
        .encrypt(&item.source_path, staging.path(), ctx.control.cancel_token())
        .await?;
    item.staging = Some(staging);
    Ok(elapsed)
}

async fn copy_file(
    ctx: Arc<RunContext>,
    mut item: FileWorkItem,
    ticket: Option<PriorityTicket>,
) -> FileWorkItem {
    let started = Instant::now();
    let mut credited = 0u64;
    let result = copy_step(&ctx, &item, &mut credited).await;

    item.staging = None;

    let uncredited = item.file_size.saturating_sub(credited);
    match result {
        Ok(copied) => {
            item.state = FileState::Done;
            item.bytes_copied = copied;
            let snapshot = ctx.record(None, |p| p.settle(uncredited));
            ctx.emit_file_progress(&item, &snapshot, true);
            tracing::debug!(job = %ctx.job.name, file = %item.relative_path.display(), bytes = copied, "file copied");
            ctx.log(
                LogEntry::new(
                    &ctx.job,
                    LogAction::FileCopyComplete,
                    Severity::Info,
                    format!("Copied {}", item.relative_path.display()),
                )
                .with_paths(&item.source_path, &item.target_path)
                .with_file_size(item.file_size)
                .with_transfer_time(started.elapsed()),
            );
        }
        Err(StepError::Cancelled) => {
            // The partial copy is gone, so its chunks no longer count as transferred.
            item.state = FileState::Interrupted;
            item.bytes_copied = 0;
            if credited > 0 {
                ctx.record(None, |p| {
                    p.bytes_remaining = (p.bytes_remaining + credited).min(p.total_bytes);
                });
            }
        }
        Err(StepError::Failed(e)) => {
            let message = format!("{}: {}", item.relative_path.display(), e);
            item.fail(message.clone());
            let snapshot = ctx.record(None, |p| p.settle(uncredited));
            ctx.emit_file_progress(&item, &snapshot, false);
            ctx.log(
                LogEntry::new(&ctx.job, LogAction::FileCopyError, Severity::Error, message)
                    .with_paths(&item.source_path, &item.target_path)
                    .with_file_size(item.file_size)
                    .with_transfer_time(started.elapsed()),
            );
        }
    }
    // Normal files of the run may start once the last ticket is gone.
    drop(ticket);
    item
}

async fn copy_step(
    ctx: &RunContext,
    item: &FileWorkItem,
    credited: &mut u64,
) -> Result<u64, StepError> {
    if !item.priority {
        ctx.priority_gate.wait_drained(&ctx.control).await?;
    }
    ctx.control.checkpoint().await?;
    let _slot = ctx.scheduler.acquire_pool(item.priority, &ctx.control).await?;
    let _large = if ctx.settings.is_large(item.file_size) {
        Some(ctx.scheduler.acquire_large_file(&ctx.control).await?)
    } else {
        None
    };
    ctx.control.checkpoint().await?;

    ctx.record(Some((&item.source_path, &item.target_path)), |_| {});
    let size = item.file_size;
    let copied = fs_ops::stream_copy(
        item.copy_source(),
        &item.target_path,
        ctx.settings.chunk_size,
        &ctx.control,
        |total| {
            let capped = total.min(size);
            let snapshot = ctx.credit_chunk(capped.saturating_sub(*credited));
            *credited = capped;
            ctx.emit_file_progress(item, &snapshot, true);
        },
    )
    .await?;
    fs_ops::preserve_mtime(&item.target_path, item.modified);
    Ok(copied)
}
