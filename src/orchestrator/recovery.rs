//! Crash-recovery lock file and orphan cleanup.
//!
//! The lock record at `<workspace_root>/.agent-relay.lock` names the owning
//! process and its live sessions. On startup a record left by a dead process
//! marks its workspaces as orphans; they are deleted before a fresh record
//! is written for the current process.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::models::lock::{LockRecord, LOCK_FILE_NAME};
use crate::{AppError, Result};

/// What startup recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Process id found in the previous lock record, if any.
    pub previous_pid: Option<u32>,
    /// Whether cleanup was skipped because that process is still alive.
    pub owner_alive: bool,
    /// Workspace directories removed.
    pub removed: Vec<PathBuf>,
}

/// Path of the lock record under `root`.
#[must_use]
pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE_NAME)
}

/// Read the lock record; `None` when absent or unreadable.
#[must_use]
pub fn read_lock(root: &Path) -> Option<LockRecord> {
    let path = lock_path(root);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(path = %path.display(), %err, "no readable lock record");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring corrupt lock record");
            None
        }
    }
}

/// Atomically replace the lock record (write temp file, then rename).
///
/// # Errors
///
/// Returns `AppError::Io` if the temp file cannot be written or renamed.
pub fn write_lock(root: &Path, record: &LockRecord) -> Result<()> {
    let body = serde_json::to_vec_pretty(record)?;

    let mut tmp = NamedTempFile::new_in(root)
        .map_err(|err| AppError::Io(format!("failed to create temporary lock file: {err}")))?;
    tmp.write_all(&body)
        .map_err(|err| AppError::Io(format!("failed to write temporary lock file: {err}")))?;

    let path = lock_path(root);
    tmp.persist(&path).map_err(|err| {
        AppError::Io(format!("failed to persist lock file to {}: {err}", path.display()))
    })?;
    Ok(())
}

/// Delete the lock record; a missing file is not an error.
///
/// # Errors
///
/// Returns `AppError::Io` for any other removal failure.
pub fn remove_lock(root: &Path) -> Result<()> {
    match std::fs::remove_file(lock_path(root)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 only checks existence; EPERM means it exists under another user.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether a process with `pid` exists.
///
/// Without a portable liveness check a recorded owner is assumed alive so
/// its state is never deleted by mistake.
#[cfg(not(unix))]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0
}

/// Reconcile state left by a previous orchestrator, then claim the root.
///
/// - No readable record: nothing to clean.
/// - Owner alive: cleanup skipped.
/// - Owner dead: every listed session workspace is deleted, then every
///   remaining directory under `root`. Plain files, including the lock
///   record and stray lock temp files, are left alone.
///
/// A fresh record for the current process is written in every case.
///
/// # Errors
///
/// Returns `AppError::Io` if the root cannot be scanned or the new record
/// cannot be written. Individual directory removals are logged and skipped.
pub fn recover_orphans(root: &Path) -> Result<RecoveryReport> {
    let span = info_span!("recover_orphans", root = %root.display());
    let _guard = span.enter();

    let mut report = RecoveryReport::default();

    if let Some(record) = read_lock(root) {
        report.previous_pid = Some(record.pid);
        if record.pid != std::process::id() && is_process_alive(record.pid) {
            report.owner_alive = true;
            info!(pid = record.pid, "previous orchestrator still running, skipping cleanup");
        } else {
            info!(
                pid = record.pid,
                sessions = record.session_ids.len(),
                "previous orchestrator gone, removing orphaned workspaces"
            );
            for session_id in &record.session_ids {
                if Uuid::parse_str(session_id).is_err() {
                    warn!(session_id, "lock record names an invalid session id, skipping");
                    continue;
                }
                remove_workspace(&root.join(session_id), &mut report);
            }
            for dir in leftover_dirs(root)? {
                remove_workspace(&dir, &mut report);
            }
        }
    }

    write_lock(root, &LockRecord::for_current_process())?;
    Ok(report)
}

/// Every directory directly under `root`. Symlinks are not followed.
fn leftover_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn remove_workspace(dir: &Path, report: &mut RecoveryReport) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            info!(path = %dir.display(), "removed orphaned workspace");
            report.removed.push(dir.to_path_buf());
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %dir.display(), %err, "failed to remove orphaned workspace"),
    }
}
