//! Business-activity gate.
//!
//! Answers "is one of these processes running?" over a pluggable process
//! enumeration. Names are compared case-insensitively and a trailing `.exe`
//! is ignored on both sides, so settings written on Windows work elsewhere.

use std::sync::{Arc, Mutex};
use sysinfo::{ProcessesToUpdate, System};

/// Source of running process names.
pub trait ProcessProbe: Send + Sync {
    fn running_processes(&self) -> Vec<String>;
}

/// Enumerates processes of the host through `sysinfo`.
#[derive(Default)]
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        SysinfoProbe {
            system: Mutex::new(System::new()),
        }
    }
}

impl ProcessProbe for SysinfoProbe {
    fn running_processes(&self) -> Vec<String> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
            .processes()
            .values()
            .map(|p| p.name().to_string_lossy().into_owned())
            .collect()
    }
}

pub(crate) fn normalize_process_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    match name.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => name,
    }
}

#[derive(Clone)]
pub struct BusinessGate {
    probe: Arc<dyn ProcessProbe>,
}

impl BusinessGate {
    pub fn new(probe: Arc<dyn ProcessProbe>) -> Self {
        BusinessGate { probe }
    }

    /// The first name of `watched` that is currently running, if any.
    pub fn detect(&self, watched: &[String]) -> Option<String> {
        let watched: Vec<(String, &String)> = watched
            .iter()
            .filter(|w| !w.trim().is_empty())
            .map(|w| (normalize_process_name(w), w))
            .collect();
        if watched.is_empty() {
            return None;
        }

        let running: Vec<String> = self
            .probe
            .running_processes()
            .iter()
            .map(|p| normalize_process_name(p))
            .collect();
        watched
            .into_iter()
            .find(|(normalized, _)| running.iter().any(|r| r == normalized))
            .map(|(_, as_written)| as_written.clone())
    }

    pub fn is_blocked(&self, watched: &[String]) -> bool {
        self.detect(watched).is_some()
    }

    /// Number of running processes called `name`.
    pub fn count(&self, name: &str) -> usize {
        let name = normalize_process_name(name);
        self.probe
            .running_processes()
            .iter()
            .filter(|p| normalize_process_name(p) == name)
            .count()
    }
}
