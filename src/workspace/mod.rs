//! Read-only access to session workspaces.
//!
//! Thin wrappers over `tokio::fs`; every path goes through
//! [`path_safety::validate_path`] first.

pub mod path_safety;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncReadExt;

use crate::{AppError, Result};

pub use path_safety::validate_path;

/// Largest file body returned by [`read_file`].
pub const MAX_READ_BYTES: u64 = 1_048_576;

/// Kind of a workspace entry.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// Text content of a workspace file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    /// Path relative to the workspace.
    pub path: PathBuf,
    /// File text, lossily decoded as UTF-8.
    pub content: String,
    /// Full file size in bytes.
    pub size: u64,
    /// Whether `content` stops at [`MAX_READ_BYTES`].
    pub truncated: bool,
}

/// One directory listing entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Entry name.
    pub name: String,
    /// Entry kind.
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

/// Metadata of one workspace path.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    /// Path relative to the workspace.
    pub path: PathBuf,
    /// Entry kind.
    pub kind: EntryKind,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, when the platform reports one.
    pub modified: Option<DateTime<Utc>>,
}

/// Read a text file inside `workspace`.
///
/// # Errors
///
/// `AppError::PathViolation` for paths outside the workspace,
/// `AppError::NotFound` for missing files, `AppError::Io` otherwise.
pub async fn read_file(workspace: &Path, path: &str) -> Result<FileContent> {
    let resolved = validate_path(workspace, path)?;
    let file = tokio::fs::File::open(&resolved)
        .await
        .map_err(|err| not_found_or_io(err, path))?;
    let size = file.metadata().await?.len();

    let mut bytes = Vec::new();
    file.take(MAX_READ_BYTES).read_to_end(&mut bytes).await?;

    Ok(FileContent {
        path: PathBuf::from(path),
        content: String::from_utf8_lossy(&bytes).into_owned(),
        size,
        truncated: size > MAX_READ_BYTES,
    })
}

/// List the entries of a directory inside `workspace`, sorted by name.
///
/// # Errors
///
/// Same as [`read_file`].
pub async fn list_files(workspace: &Path, path: &str) -> Result<Vec<FileEntry>> {
    let resolved = validate_path(workspace, path)?;
    let mut dir = tokio::fs::read_dir(&resolved)
        .await
        .map_err(|err| not_found_or_io(err, path))?;

    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let metadata = tokio::fs::symlink_metadata(entry.path()).await?;
        let kind = entry_kind(&metadata);
        entries.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind,
            size: if kind == EntryKind::Directory {
                0
            } else {
                metadata.len()
            },
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Stat one path inside `workspace`.
///
/// # Errors
///
/// Same as [`read_file`].
pub async fn stat_file(workspace: &Path, path: &str) -> Result<FileStat> {
    let resolved = validate_path(workspace, path)?;
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|err| not_found_or_io(err, path))?;

    Ok(FileStat {
        path: PathBuf::from(path),
        kind: entry_kind(&metadata),
        size: metadata.len(),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
    })
}

fn entry_kind(metadata: &std::fs::Metadata) -> EntryKind {
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

fn not_found_or_io(err: std::io::Error, path: &str) -> AppError {
    if err.kind() == std::io::ErrorKind::NotFound {
        AppError::NotFound(format!("no such file in workspace: {path}"))
    } else {
        AppError::from(err)
    }
}
