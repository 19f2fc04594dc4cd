//! Encryption through an external tool.
//!
//! The tool is invoked as `<tool> encrypt <source> <target>` (or `decrypt`).
//! An invocation succeeds when the exit code is non-negative, nothing was
//! written to stderr, and the target file exists afterwards. The tool runs
//! as a single instance system-wide, so the engine refuses to start an
//! encrypting job while an instance it did not launch is alive.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, StepError};
use crate::gate::{BusinessGate, ProcessProbe};

/// The encrypt phase contract.
#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Encrypt `source` into `target`, returning the time spent.
    async fn encrypt(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Duration, StepError>;

    /// Reverse of [`Encryptor::encrypt`].
    async fn decrypt(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Duration, StepError>;

    /// An instance not started by this engine is running.
    fn is_running_elsewhere(&self) -> bool;

    /// Identifies the tool in errors and logs.
    fn tool_path(&self) -> &Path;
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    Encrypt,
    Decrypt,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Verb::Encrypt => "encrypt",
            Verb::Decrypt => "decrypt",
        }
    }
}

/// Runs the external encryption executable as a subprocess.
pub struct ExternalTool {
    path: PathBuf,
    processes: BusinessGate,
    in_flight: Arc<AtomicUsize>,
}

impl ExternalTool {
    pub fn new(path: impl Into<PathBuf>, probe: Arc<dyn ProcessProbe>) -> Self {
        ExternalTool {
            path: path.into(),
            processes: BusinessGate::new(probe),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Process name the tool shows up as.
    fn process_name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    async fn invoke(
        &self,
        verb: Verb,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Duration, StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        let failed = |reason: String| EngineError::EncryptionFailed {
            path: source.to_path_buf(),
            reason,
        };

        let start = Instant::now();
        let mut command = Command::new(&self.path);
        command
            .arg(verb.as_str())
            .arg(source)
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| failed(format!("cannot start {}: {}", self.path.display(), e)))?;
        let _in_flight = InFlight::enter(&self.in_flight);
        tracing::debug!(tool = %self.path.display(), verb = verb.as_str(), source = %source.display(), "encryption tool started");

        // Dropping the child on cancellation kills it.
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            output = child.wait_with_output() => output
                .map_err(|e| failed(format!("tool did not finish: {}", e)))?,
        };

        check_output(&output, target).map_err(failed)?;
        Ok(start.elapsed())
    }
}

fn check_output(output: &Output, target: &Path) -> Result<(), String> {
    match output.status.code() {
        Some(code) if code >= 0 => {}
        Some(code) => return Err(format!("tool exited with code {}", code)),
        None => return Err("tool was terminated by a signal".to_string()),
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        return Err(stderr.trim().to_string());
    }
    if !target.is_file() {
        return Err(format!("tool produced no output at {}", target.display()));
    }
    Ok(())
}

/// Counts invocations launched by this engine while they run.
struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlight {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Encryptor for ExternalTool {
    async fn encrypt(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Duration, StepError> {
        self.invoke(Verb::Encrypt, source, target, cancel).await
    }

    async fn decrypt(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Duration, StepError> {
        self.invoke(Verb::Decrypt, source, target, cancel).await
    }

    fn is_running_elsewhere(&self) -> bool {
        let name = self.process_name();
        if name.is_empty() {
            return false;
        }
        self.processes.count(&name) > self.in_flight.load(Ordering::SeqCst)
    }

    fn tool_path(&self) -> &Path {
        &self.path
    }
}
