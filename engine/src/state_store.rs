//! Persisted job states.
//!
//! One mutex guards the map and the state file: every mutation applies the
//! change and rewrites the file while holding it, so readers always see a
//! record that matches the last completed save.

use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::EngineError;
use crate::fs_ops;
use crate::model::JobState;

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    states: Mutex<BTreeMap<String, JobState>>,
}

impl StateStore {
    /// Load the store from `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str::<Vec<JobState>>(&content)
                .map_err(|e| EngineError::persistence(&path, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(EngineError::persistence(&path, e)),
        };
        let states = records
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect::<BTreeMap<_, _>>();
        Ok(StateStore {
            path,
            states: Mutex::new(states),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, JobState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, states: &BTreeMap<String, JobState>) -> Result<(), EngineError> {
        let records: Vec<&JobState> = states.values().collect();
        fs_ops::write_json_atomic(&self.path, &records)
    }

    /// The state of `name`, if it has ever been referenced.
    pub fn peek(&self, name: &str) -> Option<JobState> {
        self.lock().get(name).cloned()
    }

    /// The state of `name`, created as Ready on first reference.
    pub fn get(&self, name: &str) -> Result<JobState, EngineError> {
        let mut states = self.lock();
        if let Some(state) = states.get(name) {
            return Ok(state.clone());
        }
        let state = JobState::new(name);
        states.insert(name.to_string(), state.clone());
        self.persist(&states)?;
        Ok(state)
    }

    pub fn snapshot(&self) -> Vec<JobState> {
        self.lock().values().cloned().collect()
    }

    /// Apply `mutate` to the state of `name`, stamp the action time and persist.
    ///
    /// Returns the record as saved.
    pub fn update<F>(&self, name: &str, mutate: F) -> Result<JobState, EngineError>
    where
        F: FnOnce(&mut JobState),
    {
        let mut states = self.lock();
        let state = states
            .entry(name.to_string())
            .or_insert_with(|| JobState::new(name));
        mutate(state);
        state.last_action_time = Utc::now();
        let saved = state.clone();
        self.persist(&states)?;
        Ok(saved)
    }

    /// Move the state of `old` under `new`. A missing record is not an error.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), EngineError> {
        if old == new {
            return Ok(());
        }
        let mut states = self.lock();
        if let Some(mut state) = states.remove(old) {
            state.name = new.to_string();
            states.insert(new.to_string(), state);
            self.persist(&states)?;
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<Option<JobState>, EngineError> {
        let mut states = self.lock();
        let removed = states.remove(name);
        if removed.is_some() {
            self.persist(&states)?;
        }
        Ok(removed)
    }
}
