//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating the source tree of a job into work items
//! - Streaming a file in bounded chunks with pause/cancel checkpoints
//! - Staging files for encrypted copies
//! - Rewriting persisted JSON files

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::control::RunControl;
use crate::error::{EngineError, StepError};
use crate::model::{FileState, FileWorkItem, Job};
use crate::settings::Settings;

/// Enumerate the source tree of `job` and return one work item per file.
///
/// Files are classified against the settings: priority by extension, and
/// encrypt when the job encrypts and the extension is in the encryption set.
/// Entries are visited in name order so runs are reproducible.
///
/// Entries that cannot be stat'ed come back as failed items. Linked files are
/// followed, linked directories are skipped.
///
/// # Errors
/// Returns EngineError if any directory of the tree cannot be read.
pub fn enumerate_tree(job: &Job, settings: &Settings) -> Result<Vec<FileWorkItem>, EngineError> {
    let mut items = Vec::new();

    fn recurse(
        path: &Path,
        rel_path: &Path,
        job: &Job,
        settings: &Settings,
        items: &mut Vec<FileWorkItem>,
    ) -> Result<(), EngineError> {
        let read_dir = fs::read_dir(path).map_err(|e| EngineError::EnumerationFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut entries = read_dir
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::EnumerationFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let entry_path = entry.path();
            let rel_full_path = rel_path.join(entry.file_name());

            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.file_type().is_symlink() => {
                    match fs::metadata(&entry_path) {
                        // Linked directories are not followed, so a link up the tree cannot loop
                        Ok(target) if target.is_dir() => {
                            tracing::warn!(path = %entry_path.display(), "skipping linked directory");
                            continue;
                        }
                        Ok(target) => target,
                        Err(e) => {
                            items.push(unreadable(job, entry_path, rel_full_path, e));
                            continue;
                        }
                    }
                }
                Ok(metadata) => metadata,
                Err(e) => {
                    items.push(unreadable(job, entry_path, rel_full_path, e));
                    continue;
                }
            };

            if metadata.is_dir() {
                recurse(&entry_path, &rel_full_path, job, settings, items)?;
            } else if metadata.is_file() {
                items.push(FileWorkItem {
                    target_path: job.target_path.join(&rel_full_path),
                    priority: settings.is_priority(&entry_path),
                    encrypt: job.encrypt && settings.is_encrypted_extension(&entry_path),
                    source_path: entry_path,
                    relative_path: rel_full_path,
                    file_size: metadata.len(),
                    modified: metadata.modified().ok(),
                    staging: None,
                    state: FileState::Pending,
                    bytes_copied: 0,
                    error_message: None,
                });
            }
        }
        Ok(())
    }

    recurse(&job.source_path, Path::new(""), job, settings, &mut items)?;
    Ok(items)
}

/// Work item for an entry that could not be stat'ed, such as a dangling link.
/// It fails on its own and the rest of the tree is still backed up.
fn unreadable(job: &Job, source_path: PathBuf, relative_path: PathBuf, error: io::Error) -> FileWorkItem {
    tracing::warn!(path = %source_path.display(), error = %error, "unreadable source entry");
    FileWorkItem {
        target_path: job.target_path.join(&relative_path),
        error_message: Some(format!("{}: {}", relative_path.display(), error)),
        source_path,
        relative_path,
        file_size: 0,
        modified: None,
        priority: false,
        encrypt: false,
        staging: None,
        state: FileState::Failed,
        bytes_copied: 0,
    }
}

/// Differential rule: the target exists and the source is not newer.
///
/// Any metadata error on either side means "copy".
pub fn is_unchanged(source_modified: Option<SystemTime>, target: &Path) -> bool {
    let Some(source_modified) = source_modified else {
        return false;
    };
    match fs::metadata(target).and_then(|m| m.modified()) {
        Ok(target_modified) => source_modified <= target_modified,
        Err(_) => false,
    }
}

/// Make sure `target` exists as a directory and accepts new files.
pub fn ensure_writable_dir(target: &Path) -> Result<(), EngineError> {
    fs::create_dir_all(target).map_err(|e| EngineError::TargetNotWritable {
        path: target.to_path_buf(),
        source: e,
    })?;
    let probe = target.join(format!(".write-probe-{}", Uuid::new_v4()));
    fs::File::create(&probe).map_err(|e| EngineError::TargetNotWritable {
        path: target.to_path_buf(),
        source: e,
    })?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns EngineError if directory creation fails or the parent is a file.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

/// Unique sibling path the copy writes into before the final rename.
pub fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{}.{}.partial", name, Uuid::new_v4().simple()))
}

/// Copy `src` to `dst` in chunks of `chunk_size` bytes.
///
/// `on_chunk` receives the cumulative byte count after every chunk. The run's
/// checkpoint is awaited before each chunk, so a pause suspends the copy
/// mid-file and a cancellation abandons it. Data lands in a `.partial`
/// sibling that is renamed over `dst` only once complete, and removed
/// otherwise.
pub async fn stream_copy<F>(
    src: &Path,
    dst: &Path,
    chunk_size: usize,
    control: &RunControl,
    mut on_chunk: F,
) -> Result<u64, StepError>
where
    F: FnMut(u64),
{
    ensure_parent_dir_exists(dst)?;
    let partial = partial_path(dst);

    let copied = match copy_chunks(src, &partial, chunk_size, control, &mut on_chunk).await {
        Ok(copied) => copied,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
    };

    if let Err(e) = tokio::fs::rename(&partial, dst).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(EngineError::WriteError {
            path: dst.to_path_buf(),
            source: e,
        }
        .into());
    }
    Ok(copied)
}

async fn copy_chunks<F>(
    src: &Path,
    partial: &Path,
    chunk_size: usize,
    control: &RunControl,
    on_chunk: &mut F,
) -> Result<u64, StepError>
where
    F: FnMut(u64),
{
    let read_error = |e: io::Error| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    };
    let write_error = |e: io::Error| EngineError::WriteError {
        path: partial.to_path_buf(),
        source: e,
    };

    let mut reader = tokio::fs::File::open(src).await.map_err(read_error)?;
    let mut writer = tokio::fs::File::create(partial).await.map_err(write_error)?;
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut copied = 0u64;

    loop {
        control.checkpoint().await?;
        let n = reader.read(&mut buffer).await.map_err(read_error)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await.map_err(write_error)?;
        copied += n as u64;
        on_chunk(copied);
    }
    writer.flush().await.map_err(write_error)?;
    Ok(copied)
}

/// Give `dst` the modification time of the source it was copied from.
pub fn preserve_mtime(dst: &Path, modified: Option<SystemTime>) {
    if let Some(mtime) = modified {
        if let Err(e) = filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime)) {
            tracing::warn!(path = %dst.display(), error = %e, "could not preserve modification time");
        }
    }
}

/// Temporary encrypted copy of a source file, deleted when dropped.
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
}

impl StagingFile {
    /// Reserve a unique staging path under `dir`, creating the directory.
    pub fn reserve(dir: &Path, source: &Path) -> Result<Self, EngineError> {
        fs::create_dir_all(dir).map_err(|e| EngineError::DirectoryCreationFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(StagingFile {
            path: dir.join(format!("{}-{}.staged", Uuid::new_v4(), name)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "could not remove staging file");
            }
        }
    }
}

/// Serialize `value` as pretty JSON and replace `path` with it.
///
/// The content goes to a sibling temp file first, so a crash mid-write never
/// leaves a truncated file behind.
pub fn write_json_atomic<T>(path: &Path, value: &T) -> Result<(), EngineError>
where
    T: Serialize + ?Sized,
{
    let json = serde_json::to_string_pretty(value).map_err(|e| EngineError::persistence(path, e))?;
    ensure_parent_dir_exists(path)?;
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    fs::write(&tmp, json).map_err(|e| EngineError::persistence(path, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        EngineError::persistence(path, e)
    })
}
