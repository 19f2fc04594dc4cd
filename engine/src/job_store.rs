//! Persisted list of job definitions.
//!
//! The whole list is rewritten to disk after every change. Names are unique
//! and the number of jobs is capped by the settings.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::EngineError;
use crate::fs_ops;
use crate::model::Job;

#[derive(Debug)]
pub struct JobStore {
    path: PathBuf,
    max_jobs: usize,
    jobs: RwLock<Vec<Job>>,
}

impl JobStore {
    /// Load the store from `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>, max_jobs: usize) -> Result<Self, EngineError> {
        let path = path.into();
        let jobs = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str::<Vec<Job>>(&content)
                .map_err(|e| EngineError::persistence(&path, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(EngineError::persistence(&path, e)),
        };
        tracing::debug!(path = %path.display(), count = jobs.len(), "job store loaded");
        Ok(JobStore {
            path,
            max_jobs,
            jobs: RwLock::new(jobs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Vec<Job> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, name: &str) -> Option<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|j| j.name == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a new job.
    ///
    /// # Errors
    /// Fails if the job is invalid, its name is taken, or the store is full.
    pub fn add(&self, job: Job) -> Result<(), EngineError> {
        job.validate()?;
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if jobs.iter().any(|j| j.name == job.name) {
            return Err(EngineError::JobNameTaken { name: job.name });
        }
        if jobs.len() >= self.max_jobs {
            return Err(EngineError::JobLimitReached { max: self.max_jobs });
        }
        jobs.push(job);
        fs_ops::write_json_atomic(&self.path, &*jobs)
    }

    /// Replace the job named `name` with `job`, keeping its position.
    pub fn replace(&self, name: &str, job: Job) -> Result<(), EngineError> {
        job.validate()?;
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let index = jobs
            .iter()
            .position(|j| j.name == name)
            .ok_or_else(|| EngineError::JobNotFound {
                name: name.to_string(),
            })?;
        if job.name != name && jobs.iter().any(|j| j.name == job.name) {
            return Err(EngineError::JobNameTaken { name: job.name });
        }
        jobs[index] = job;
        fs_ops::write_json_atomic(&self.path, &*jobs)
    }

    pub fn remove(&self, name: &str) -> Result<Job, EngineError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let index = jobs
            .iter()
            .position(|j| j.name == name)
            .ok_or_else(|| EngineError::JobNotFound {
                name: name.to_string(),
            })?;
        let removed = jobs.remove(index);
        fs_ops::write_json_atomic(&self.path, &*jobs)?;
        Ok(removed)
    }
}
