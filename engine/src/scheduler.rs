//! Concurrency scheduler.
//!
//! Process-wide limits shared by every run:
//! - a priority pool and a normal pool, sized once from host parallelism
//! - a single-slot throttle for files above the large-file threshold
//! - a single-slot guard around the external encryption tool
//!
//! Plus the per-run [`PriorityGate`] that holds normal files back until every
//! priority file of the same run has finished its copy phase.

use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::control::RunControl;
use crate::error::{EngineError, StepError};

#[derive(Debug, Clone)]
pub struct Scheduler {
    priority: Arc<Semaphore>,
    normal: Arc<Semaphore>,
    large_files: Arc<Semaphore>,
    encryption: Arc<Semaphore>,
    priority_capacity: usize,
    normal_capacity: usize,
}

impl Scheduler {
    /// Pools for a host with `cores` logical CPUs:
    /// `max(1, cores / 2)` priority slots and `2 * cores - priority` normal slots.
    pub fn new(cores: usize) -> Self {
        let cores = cores.max(1);
        let priority_capacity = (cores / 2).max(1);
        let normal_capacity = (2 * cores - priority_capacity).max(1);
        Scheduler {
            priority: Arc::new(Semaphore::new(priority_capacity)),
            normal: Arc::new(Semaphore::new(normal_capacity)),
            large_files: Arc::new(Semaphore::new(1)),
            encryption: Arc::new(Semaphore::new(1)),
            priority_capacity,
            normal_capacity,
        }
    }

    pub fn from_host() -> Self {
        Scheduler::new(num_cpus::get())
    }

    pub fn priority_capacity(&self) -> usize {
        self.priority_capacity
    }

    pub fn normal_capacity(&self) -> usize {
        self.normal_capacity
    }

    /// A slot in the pool matching the file's priority flag.
    pub async fn acquire_pool(
        &self,
        priority: bool,
        control: &RunControl,
    ) -> Result<OwnedSemaphorePermit, StepError> {
        let pool = if priority { &self.priority } else { &self.normal };
        acquire(pool, control).await
    }

    pub async fn acquire_large_file(
        &self,
        control: &RunControl,
    ) -> Result<OwnedSemaphorePermit, StepError> {
        acquire(&self.large_files, control).await
    }

    /// Exclusive use of the encryption tool within this process.
    pub async fn acquire_encryption(
        &self,
        control: &RunControl,
    ) -> Result<OwnedSemaphorePermit, StepError> {
        acquire(&self.encryption, control).await
    }
}

async fn acquire(
    semaphore: &Arc<Semaphore>,
    control: &RunControl,
) -> Result<OwnedSemaphorePermit, StepError> {
    tokio::select! {
        biased;
        _ = control.cancel_token().cancelled() => Err(StepError::Cancelled),
        permit = Arc::clone(semaphore).acquire_owned() => permit.map_err(|_| {
            StepError::Failed(EngineError::TaskFailed {
                message: "scheduler pool closed".to_string(),
            })
        }),
    }
}

/// Counts the priority files of one run that have not finished copying.
#[derive(Debug)]
pub struct PriorityGate {
    outstanding: watch::Sender<usize>,
}

impl PriorityGate {
    pub fn new() -> Arc<Self> {
        let (outstanding, _) = watch::channel(0);
        Arc::new(PriorityGate { outstanding })
    }

    /// Count one more outstanding priority file until the ticket is dropped.
    pub fn ticket(self: &Arc<Self>) -> PriorityTicket {
        self.outstanding.send_modify(|n| *n += 1);
        PriorityTicket {
            gate: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Block until no priority file is outstanding, or the run is cancelled.
    pub async fn wait_drained(&self, control: &RunControl) -> Result<(), StepError> {
        let mut rx = self.outstanding.subscribe();
        loop {
            let drained = *rx.borrow_and_update() == 0;
            if drained {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = control.cancel_token().cancelled() => return Err(StepError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(StepError::Cancelled);
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct PriorityTicket {
    gate: Arc<PriorityGate>,
}

impl Drop for PriorityTicket {
    fn drop(&mut self) {
        self.gate
            .outstanding
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}
