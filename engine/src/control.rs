//! Per-run control: cancellation, pause, and the active-runs registry.
//!
//! A `RunControl` is created for every run and handed to every task of that
//! run. Workers call [`RunControl::checkpoint`] before each unit of work;
//! it returns immediately while the run is active, waits while it is paused
//! and fails with `StepError::Cancelled` once the run is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, StepError};

#[derive(Debug)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    stop_requested: AtomicBool,
    started: Instant,
    poll_interval: Duration,
}

impl RunControl {
    /// `poll_interval` bounds how long a paused worker sleeps between re-checks.
    pub fn new(poll_interval: Duration) -> Self {
        let (paused, _) = watch::channel(false);
        RunControl {
            cancel: CancellationToken::new(),
            paused,
            stop_requested: AtomicBool::new(false),
            started: Instant::now(),
            poll_interval,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a stop request, then cancel. The run settles as Stopped.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Returns false if the run was already paused.
    pub fn pause(&self) -> bool {
        self.paused.send_if_modified(|paused| !std::mem::replace(paused, true))
    }

    /// Returns false if the run was not paused.
    pub fn resume(&self) -> bool {
        self.paused.send_if_modified(|paused| std::mem::replace(paused, false))
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wait out a pause and observe cancellation.
    pub async fn checkpoint(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        if !self.is_paused() {
            return Ok(());
        }

        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            let paused = *rx.borrow_and_update();
            if !paused {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::timeout(self.poll_interval, rx.changed()) => {}
            }
        }

        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        Ok(())
    }
}

/// Registry of running jobs, keyed by job name.
///
/// Presence in the registry is what "running" means.
#[derive(Debug, Default)]
pub struct ActiveRuns {
    runs: Mutex<HashMap<String, Arc<RunControl>>>,
}

impl ActiveRuns {
    pub fn new() -> Arc<Self> {
        Arc::new(ActiveRuns::default())
    }

    /// Insert `control` for `name` unless a run is already registered.
    ///
    /// The entry is removed when the returned registration is dropped.
    pub fn register(
        self: &Arc<Self>,
        name: &str,
        control: Arc<RunControl>,
    ) -> Result<RunRegistration, EngineError> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if runs.contains_key(name) {
            return Err(EngineError::AlreadyRunning {
                name: name.to_string(),
            });
        }
        runs.insert(name.to_string(), Arc::clone(&control));
        Ok(RunRegistration {
            runs: Arc::clone(self),
            name: name.to_string(),
            control,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<RunControl>> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn controls(&self) -> Vec<Arc<RunControl>> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// Membership of one run in the registry.
#[derive(Debug)]
pub struct RunRegistration {
    runs: Arc<ActiveRuns>,
    name: String,
    control: Arc<RunControl>,
}

impl RunRegistration {
    pub fn control(&self) -> &Arc<RunControl> {
        &self.control
    }
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        let mut runs = self.runs.runs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = runs.get(&self.name) {
            if Arc::ptr_eq(current, &self.control) {
                runs.remove(&self.name);
            }
        }
    }
}
