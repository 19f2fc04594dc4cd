//! Read-only settings consumed by the engine.
//!
//! Settings are owned by an external component; the engine only reads them.
//! The on-disk form is a camelCase JSON object in which every field is
//! optional.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EngineError;

const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;
const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
const DEFAULT_MAX_JOBS: usize = 5;
const DEFAULT_PAUSE_POLL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Process names whose presence blocks a job from starting
    pub business_software: Vec<String>,

    /// Extensions routed through the encryption tool when a job encrypts
    pub encrypted_extensions: Vec<String>,

    /// Extensions copied before every other file of a job
    pub priority_extensions: Vec<String>,

    /// Files strictly larger than this are throttled to one at a time
    pub large_file_threshold: u64,

    /// Executable of the external encryption tool
    pub encryption_tool_path: PathBuf,

    pub max_jobs: usize,

    /// Streaming copy chunk, in bytes
    pub chunk_size: usize,

    pub pause_poll_interval_ms: u64,

    /// Where encrypted staging files are written; system temp dir when unset
    pub staging_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            business_software: Vec::new(),
            encrypted_extensions: Vec::new(),
            priority_extensions: Vec::new(),
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            encryption_tool_path: PathBuf::from("encryption-tool"),
            max_jobs: DEFAULT_MAX_JOBS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            pause_poll_interval_ms: DEFAULT_PAUSE_POLL_MS,
            staging_dir: None,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let settings = match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<Settings>(&content)
                .map_err(|e| EngineError::persistence(path, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "settings file not found, using defaults");
                Settings::default()
            }
            Err(e) => return Err(EngineError::persistence(path, e)),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.chunk_size == 0 {
            return Err(EngineError::InvalidSettings {
                reason: "chunkSize must be greater than zero".to_string(),
            });
        }
        if self.max_jobs == 0 {
            return Err(EngineError::InvalidSettings {
                reason: "maxJobs must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Extension of `path` is in the priority set.
    pub fn is_priority(&self, path: &Path) -> bool {
        extension_in(path, &self.priority_extensions)
    }

    /// Extension of `path` is in the encryption set.
    pub fn is_encrypted_extension(&self, path: &Path) -> bool {
        extension_in(path, &self.encrypted_extensions)
    }

    pub fn is_large(&self, size: u64) -> bool {
        size > self.large_file_threshold
    }

    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms.max(1))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("backup-engine-staging"))
    }
}

/// Case-insensitive match; entries may be written with or without the dot.
fn extension_in(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.'))
        .any(|e| !e.is_empty() && e.eq_ignore_ascii_case(ext))
}
