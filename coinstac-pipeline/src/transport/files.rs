//! Files shipped alongside results
//!
//! After each iteration the sender drains its transfer directory into the
//! outgoing message. The receiver writes the files back out under one of its
//! own directories.

use coinstac_core::dto::transport::TransferredFile;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{PipelineError, Result};

fn io_error(action: &str, path: &Path, e: std::io::Error) -> PipelineError {
    PipelineError::Transport(format!("Failed to {} {}: {}", action, path.display(), e))
}

/// Reads every file under `dir`, then empties it
///
/// A missing directory holds nothing. Files come back sorted by path.
pub async fn drain(dir: &Path) -> Result<Vec<TransferredFile>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        let current = dir.join(&relative);
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && relative.as_os_str().is_empty() => {
                return Ok(files);
            }
            Err(e) => return Err(io_error("list", &current, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", &current, e))?
        {
            let path = relative.join(entry.file_name());
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| io_error("inspect", &entry.path(), e))?;

            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let contents = tokio::fs::read(entry.path())
                    .await
                    .map_err(|e| io_error("read", &entry.path(), e))?;
                files.push(TransferredFile {
                    path: wire_path(&path),
                    contents,
                });
            }
        }
    }

    if files.is_empty() {
        return Ok(files);
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| io_error("list", dir, e))?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error("list", dir, e))? {
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .await
            .map_err(|e| io_error("inspect", &path, e))?
            .is_dir();
        let removed = if is_dir {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|e| io_error("remove", &path, e))?;
    }

    debug!("Collected {} file(s) from {}", files.len(), dir.display());
    Ok(files)
}

/// Writes `files` under `dir`, creating directories as needed
pub async fn unpack(files: &[TransferredFile], dir: &Path) -> Result<()> {
    for file in files {
        let target = dir.join(safe_relative(&file.path)?);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create", parent, e))?;
        }
        tokio::fs::write(&target, &file.contents)
            .await
            .map_err(|e| io_error("write", &target, e))?;
    }

    if !files.is_empty() {
        debug!("Unpacked {} file(s) into {}", files.len(), dir.display());
    }
    Ok(())
}

/// Where the aggregator keeps one participant's files
pub fn contributor_dir(input: &Path, username: &str) -> Result<PathBuf> {
    Ok(input.join(safe_relative(username)?))
}

fn wire_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Rejects anything that would land outside the receiving directory
fn safe_relative(path: &str) -> Result<PathBuf> {
    let relative = PathBuf::from(path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if path.is_empty() || escapes {
        return Err(PipelineError::Transport(format!(
            "Refusing to write transferred file '{}'",
            path
        )));
    }
    Ok(relative)
}
