//! Job orchestration module.
//!
//! This module provides the [`Engine`], which owns the job definitions and
//! their states and drives runs through their lifecycle:
//! - Checking start preconditions before anything touches the disk
//! - Planning a run (enumerating the source tree, applying the differential rule)
//! - Running it through the file pipeline
//! - Settling the job state and writing the final log entry
//!
//! Control operations (pause, resume, stop, cancel) act on registered runs.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::control::{ActiveRuns, RunControl, RunRegistration};
use crate::crypto::{Encryptor, ExternalTool};
use crate::error::EngineError;
use crate::fs_ops;
use crate::gate::{BusinessGate, ProcessProbe, SysinfoProbe};
use crate::job_store::JobStore;
use crate::log::{LogAction, LogEntry, LogSink, Severity, TracingLogSink};
use crate::model::{FileState, FileWorkItem, Job, JobState, JobStatus, RunOutcome};
use crate::pipeline::{self, RunContext};
use crate::progress::{NullProgressSink, ProgressSink};
use crate::scheduler::{PriorityGate, Scheduler};
use crate::settings::Settings;
use crate::state_store::StateStore;

const JOBS_FILE: &str = "jobs.json";
const STATE_FILE: &str = "state.json";

/// Assembles an [`Engine`] from its collaborators.
///
/// Anything not supplied falls back to the production default: processes
/// from `sysinfo`, the external encryption tool named in the settings,
/// pools sized from the host, no progress sink and a `tracing` log sink.
pub struct EngineBuilder {
    settings: Settings,
    jobs: JobStore,
    states: StateStore,
    progress_sink: Option<Arc<dyn ProgressSink>>,
    log_sink: Option<Arc<dyn LogSink>>,
    encryptor: Option<Arc<dyn Encryptor>>,
    probe: Option<Arc<dyn ProcessProbe>>,
    scheduler: Option<Scheduler>,
}

impl EngineBuilder {
    pub fn new(settings: Settings, jobs: JobStore, states: StateStore) -> Self {
        EngineBuilder {
            settings,
            jobs,
            states,
            progress_sink: None,
            log_sink: None,
            encryptor: None,
            probe: None,
            scheduler: None,
        }
    }

    /// Open `jobs.json` and `state.json` under `dir`.
    pub fn in_dir(settings: Settings, dir: &Path) -> Result<Self, EngineError> {
        let jobs = JobStore::open(dir.join(JOBS_FILE), settings.max_jobs)?;
        let states = StateStore::open(dir.join(STATE_FILE))?;
        Ok(EngineBuilder::new(settings, jobs, states))
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress_sink = Some(sink);
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn with_process_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// # Errors
    /// Returns EngineError if the settings are invalid.
    pub fn build(self) -> Result<Engine, EngineError> {
        self.settings.validate()?;
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SysinfoProbe::new()) as Arc<dyn ProcessProbe>);
        let encryptor = self.encryptor.unwrap_or_else(|| {
            Arc::new(ExternalTool::new(
                self.settings.encryption_tool_path.clone(),
                Arc::clone(&probe),
            ))
        });
        let scheduler = self.scheduler.unwrap_or_else(Scheduler::from_host);
        tracing::debug!(
            priority_slots = scheduler.priority_capacity(),
            normal_slots = scheduler.normal_capacity(),
            "engine pools sized"
        );

        Ok(Engine {
            inner: Arc::new(Inner {
                settings: Arc::new(self.settings),
                jobs: self.jobs,
                states: Arc::new(self.states),
                runs: ActiveRuns::new(),
                scheduler,
                gate: BusinessGate::new(probe),
                encryptor,
                progress_sink: self
                    .progress_sink
                    .unwrap_or_else(|| Arc::new(NullProgressSink)),
                log_sink: self.log_sink.unwrap_or_else(|| Arc::new(TracingLogSink)),
            }),
        })
    }
}

struct Inner {
    settings: Arc<Settings>,
    jobs: JobStore,
    states: Arc<StateStore>,
    runs: Arc<ActiveRuns>,
    scheduler: Scheduler,
    gate: BusinessGate,
    encryptor: Arc<dyn Encryptor>,
    progress_sink: Arc<dyn ProgressSink>,
    log_sink: Arc<dyn LogSink>,
}

/// The backup engine. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn builder(settings: Settings, jobs: JobStore, states: StateStore) -> EngineBuilder {
        EngineBuilder::new(settings, jobs, states)
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.inner.jobs.list()
    }

    pub fn job(&self, name: &str) -> Option<Job> {
        self.inner.jobs.get(name)
    }

    pub fn state(&self, name: &str) -> Option<JobState> {
        self.inner.states.peek(name)
    }

    pub fn states(&self) -> Vec<JobState> {
        self.inner.states.snapshot()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.inner.runs.is_running(name)
    }

    /// Names of the running jobs, sorted.
    pub fn running(&self) -> Vec<String> {
        self.inner.runs.names()
    }

    /// Add a job definition and give it a Ready state.
    ///
    /// # Errors
    /// Returns EngineError if the job is invalid, the name is taken or the
    /// job limit is reached.
    pub fn create_job(&self, job: Job) -> Result<(), EngineError> {
        let name = job.name.clone();
        self.inner.jobs.add(job)?;
        self.inner.states.get(&name)?;
        tracing::info!(job = %name, "job created");
        Ok(())
    }

    /// Replace the definition of `name`; a new name carries the state along.
    pub fn update_job(&self, name: &str, job: Job) -> Result<(), EngineError> {
        self.ensure_idle(name)?;
        let new_name = job.name.clone();
        self.inner.jobs.replace(name, job)?;
        self.inner.states.rename(name, &new_name)?;
        tracing::info!(job = %name, new_name = %new_name, "job updated");
        Ok(())
    }

    /// Remove the definition of `name` and its state.
    pub fn delete_job(&self, name: &str) -> Result<Job, EngineError> {
        self.ensure_idle(name)?;
        let job = self.inner.jobs.remove(name)?;
        self.inner.states.remove(name)?;
        tracing::info!(job = %name, "job deleted");
        Ok(job)
    }

    fn ensure_idle(&self, name: &str) -> Result<(), EngineError> {
        if self.inner.runs.is_running(name) {
            return Err(EngineError::JobRunning {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Run the job named `name` to completion.
    ///
    /// Cancellation is not an error: a stopped or cancelled run returns its
    /// outcome with the matching status.
    ///
    /// # Errors
    /// Returns EngineError when a start precondition fails (the state is left
    /// untouched), or when the run fails as a whole (the state settles to Error).
    pub async fn execute(&self, name: &str) -> Result<RunOutcome, EngineError> {
        let (job, registration) = self.prepare(name).await?;
        self.run(job, registration).await
    }

    /// Check the preconditions of `name` now and run it in the background.
    pub async fn start(
        &self,
        name: &str,
    ) -> Result<JoinHandle<Result<RunOutcome, EngineError>>, EngineError> {
        let (job, registration) = self.prepare(name).await?;
        let engine = self.clone();
        Ok(tokio::spawn(async move { engine.run(job, registration).await }))
    }

    /// Run several jobs concurrently. Results follow the order of `names`.
    pub async fn execute_many<I, S>(&self, names: I) -> Vec<(String, Result<RunOutcome, EngineError>)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut tasks = JoinSet::new();
        for (index, name) in names.iter().enumerate() {
            let engine = self.clone();
            let name = name.clone();
            tasks.spawn(async move { (index, engine.execute(&name).await) });
        }

        let mut results: Vec<Option<Result<RunOutcome, EngineError>>> =
            names.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "job task failed"),
            }
        }

        names
            .into_iter()
            .zip(results)
            .map(|(name, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(EngineError::TaskFailed {
                        message: format!("run of '{}' did not finish", name),
                    })
                });
                (name, result)
            })
            .collect()
    }

    pub fn pause(&self, name: &str) -> Result<(), EngineError> {
        let control = self.control(name)?;
        if control.pause() {
            self.transition(name, JobStatus::Active, JobStatus::Paused);
            self.log_control(name, LogAction::BackupPaused, "Backup paused");
        }
        Ok(())
    }

    pub fn resume(&self, name: &str) -> Result<(), EngineError> {
        let control = self.control(name)?;
        if control.resume() {
            self.transition(name, JobStatus::Paused, JobStatus::Active);
            self.log_control(name, LogAction::BackupResumed, "Backup resumed");
        }
        Ok(())
    }

    /// Stop the run; it settles as Stopped.
    pub fn stop(&self, name: &str) -> Result<(), EngineError> {
        self.control(name)?.stop();
        tracing::info!(job = %name, "stop requested");
        Ok(())
    }

    /// Cancel the run; it settles as Cancelled unless a stop came first.
    pub fn cancel(&self, name: &str) -> Result<(), EngineError> {
        self.control(name)?.cancel();
        tracing::info!(job = %name, "cancel requested");
        Ok(())
    }

    /// Cancel every running job. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let controls = self.inner.runs.controls();
        for control in &controls {
            control.cancel();
        }
        controls.len()
    }

    fn control(&self, name: &str) -> Result<Arc<RunControl>, EngineError> {
        self.inner
            .runs
            .get(name)
            .ok_or_else(|| EngineError::NotRunning {
                name: name.to_string(),
            })
    }

    fn transition(&self, name: &str, from: JobStatus, to: JobStatus) {
        let saved = self.inner.states.update(name, |state| {
            if state.status == from {
                state.status = to;
            }
        });
        if let Err(e) = saved {
            tracing::warn!(job = %name, error = %e, "could not save job state");
        }
    }

    fn log_control(&self, name: &str, action: LogAction, message: &str) {
        tracing::info!(job = %name, "{}", message);
        if let Some(job) = self.inner.jobs.get(name) {
            self.inner
                .log_sink
                .write(LogEntry::new(&job, action, Severity::Info, message));
        }
    }

    /// Look the job up, register the run and check the start preconditions.
    ///
    /// The registration is the already-running check, so two concurrent
    /// starts of one job cannot both pass. The checks scan the process table
    /// and touch the disk, so they run on the blocking pool.
    async fn prepare(&self, name: &str) -> Result<(Job, RunRegistration), EngineError> {
        let job = self
            .inner
            .jobs
            .get(name)
            .ok_or_else(|| EngineError::JobNotFound {
                name: name.to_string(),
            })?;
        let control = Arc::new(RunControl::new(self.inner.settings.pause_poll_interval()));
        let registration = self.inner.runs.register(name, control)?;

        let checked = {
            let job = job.clone();
            let gate = self.inner.gate.clone();
            let encryptor = Arc::clone(&self.inner.encryptor);
            let settings = Arc::clone(&self.inner.settings);
            tokio::task::spawn_blocking(move || check_preconditions(&job, &gate, &*encryptor, &settings))
                .await
                .unwrap_or_else(|e| {
                    Err(EngineError::TaskFailed {
                        message: e.to_string(),
                    })
                })
        };
        if let Err(e) = checked {
            tracing::warn!(job = %name, error = %e, "backup not started");
            return Err(e);
        }
        Ok((job, registration))
    }

    async fn run(&self, job: Job, registration: RunRegistration) -> Result<RunOutcome, EngineError> {
        let control = Arc::clone(registration.control());
        // Read under the state lock: a pause either lands before this write or
        // finds Active and moves it to Paused.
        self.inner.states.update(&job.name, |state| {
            let status = if control.is_paused() {
                JobStatus::Paused
            } else {
                JobStatus::Active
            };
            *state = JobState {
                status,
                ..JobState::new(job.name.clone())
            };
        })?;
        tracing::info!(job = %job.name, mode = %job.mode, encrypt = job.encrypt, "backup started");
        self.inner.log_sink.write(LogEntry::new(
            &job,
            LogAction::BackupStarted,
            Severity::Info,
            format!("{} backup started", job.mode),
        ));

        let planned = {
            let job = job.clone();
            let settings = Arc::clone(&self.inner.settings);
            tokio::task::spawn_blocking(move || {
                let mut items = fs_ops::enumerate_tree(&job, &settings)?;
                pipeline::plan(&job, &mut items);
                Ok::<_, EngineError>(items)
            })
            .await
        };
        let items = match planned {
            Ok(Ok(items)) => items,
            Ok(Err(e)) => return Err(self.fail_run(&job, e)),
            Err(e) => {
                return Err(self.fail_run(
                    &job,
                    EngineError::TaskFailed {
                        message: e.to_string(),
                    },
                ))
            }
        };

        let ctx = Arc::new(RunContext {
            job: job.clone(),
            settings: Arc::clone(&self.inner.settings),
            control,
            scheduler: self.inner.scheduler.clone(),
            gate: self.inner.gate.clone(),
            encryptor: Arc::clone(&self.inner.encryptor),
            states: Arc::clone(&self.inner.states),
            progress_sink: Arc::clone(&self.inner.progress_sink),
            log_sink: Arc::clone(&self.inner.log_sink),
            priority_gate: PriorityGate::new(),
            progress: Mutex::default(),
        });
        let items = match pipeline::run(Arc::clone(&ctx), items).await {
            Ok(items) => items,
            Err(e) => return Err(self.fail_run(&job, e)),
        };

        let outcome = self.settle(&ctx, items);
        drop(registration);
        Ok(outcome)
    }

    /// Settle a run that failed as a whole, and hand the error back.
    fn fail_run(&self, job: &Job, error: EngineError) -> EngineError {
        tracing::error!(job = %job.name, error = %error, "backup failed");
        let saved = self.inner.states.update(&job.name, |state| {
            state.status = JobStatus::Error;
            state.current_source_file = None;
            state.current_target_file = None;
        });
        if let Err(e) = saved {
            tracing::warn!(job = %job.name, error = %e, "could not save job state");
        }
        self.inner.log_sink.write(
            LogEntry::new(
                job,
                LogAction::BackupFailed,
                Severity::Error,
                format!("Backup failed: {}", error),
            )
            .with_errors(vec![error.to_string()]),
        );
        error
    }

    fn settle(&self, ctx: &RunContext, items: Vec<FileWorkItem>) -> RunOutcome {
        let mut outcome = RunOutcome {
            name: ctx.job.name.clone(),
            status: JobStatus::Completed,
            files_copied: 0,
            files_skipped: 0,
            files_failed: 0,
            bytes_copied: 0,
            errors: Vec::new(),
            elapsed: ctx.control.elapsed(),
        };
        for item in items {
            match item.state {
                FileState::Done => {
                    outcome.files_copied += 1;
                    outcome.bytes_copied += item.bytes_copied;
                }
                FileState::Skipped => outcome.files_skipped += 1,
                FileState::Failed => {
                    outcome.files_failed += 1;
                    outcome.errors.extend(item.error_message);
                }
                FileState::Pending | FileState::Staged | FileState::Interrupted => {}
            }
        }

        outcome.status = if ctx.control.is_stop_requested() {
            JobStatus::Stopped
        } else if ctx.control.is_cancelled() {
            JobStatus::Cancelled
        } else if outcome.files_failed > 0 {
            JobStatus::Error
        } else {
            JobStatus::Completed
        };

        let snapshot = ctx.snapshot();
        let status = outcome.status;
        let saved = self.inner.states.update(&ctx.job.name, |state| {
            state.status = status;
            state.files_remaining = snapshot.files_remaining();
            state.bytes_remaining = snapshot.bytes_remaining;
            state.progress_percentage = snapshot.percentage();
            state.current_source_file = None;
            state.current_target_file = None;
        });
        if let Err(e) = saved {
            tracing::warn!(job = %ctx.job.name, error = %e, "could not save job state");
        }

        let (action, severity) = match status {
            JobStatus::Completed => (LogAction::BackupCompleted, Severity::Info),
            JobStatus::Stopped => (LogAction::BackupStopped, Severity::Warning),
            JobStatus::Cancelled => (LogAction::BackupCancelled, Severity::Warning),
            _ => (LogAction::BackupFailed, Severity::Error),
        };
        let message = format!(
            "Backup {}: {} copied, {} skipped, {} failed",
            status.to_string().to_lowercase(),
            outcome.files_copied,
            outcome.files_skipped,
            outcome.files_failed
        );
        tracing::info!(
            job = %ctx.job.name,
            status = %status,
            copied = outcome.files_copied,
            skipped = outcome.files_skipped,
            failed = outcome.files_failed,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "backup settled"
        );
        self.inner.log_sink.write(
            LogEntry::new(&ctx.job, action, severity, message)
                .with_transfer_time(outcome.elapsed)
                .with_errors(outcome.errors.clone()),
        );
        outcome
    }
}

/// Start preconditions, in order: business software, a foreign instance of
/// the encryption tool (encrypting jobs only), then the job's own paths.
fn check_preconditions(
    job: &Job,
    gate: &BusinessGate,
    encryptor: &dyn Encryptor,
    settings: &Settings,
) -> Result<(), EngineError> {
    if let Some(process) = gate.detect(&settings.business_software) {
        return Err(EngineError::BusinessSoftwareRunning { process });
    }
    if job.encrypt && encryptor.is_running_elsewhere() {
        return Err(EngineError::EncryptionToolRunning {
            tool: encryptor.tool_path().to_path_buf(),
        });
    }

    job.validate()?;
    match fs::metadata(&job.source_path) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(EngineError::InvalidPath {
                path: job.source_path.clone(),
                reason: "Source must be a directory".to_string(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(EngineError::SourceNotFound {
                path: job.source_path.clone(),
            })
        }
        Err(e) => {
            return Err(EngineError::InvalidPath {
                path: job.source_path.clone(),
                reason: e.to_string(),
            })
        }
    }
    fs_ops::ensure_writable_dir(&job.target_path)
}
