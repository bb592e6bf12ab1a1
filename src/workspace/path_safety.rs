//! Workspace boundary enforcement.
//!
//! Every file path a command names is resolved against a session workspace
//! and must stay inside it: `..` segments may not climb above the root, and
//! symlinks may not point outside it.

use std::path::{Component, Path, PathBuf};

use crate::{AppError, Result};

/// Resolve `candidate` inside `root` and return the absolute path.
///
/// Relative candidates are joined to `root`; absolute candidates must already
/// lie under it. The deepest existing ancestor of the result is canonicalised
/// so a symlinked directory cannot smuggle a not-yet-existing path outside.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if:
/// - `root` cannot be canonicalised.
/// - `..` segments climb above `root`.
/// - The resolved path, or the target of any symlink on it, is outside `root`.
pub fn validate_path(root: &Path, candidate: impl AsRef<Path>) -> Result<PathBuf> {
    let root = root
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("workspace root invalid: {err}")))?;

    let candidate = candidate.as_ref();
    let relative = if candidate.is_absolute() {
        candidate
            .strip_prefix(&root)
            .map_err(|_| AppError::PathViolation("path outside workspace".into()))?
    } else {
        candidate
    };

    let mut resolved = root.clone();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if resolved == root || !resolved.pop() {
                    return Err(AppError::PathViolation(
                        "path attempts to escape workspace".into(),
                    ));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::PathViolation("path outside workspace".into()));
            }
        }
    }

    let (existing, rest) = split_existing(&resolved);
    let canonical = existing
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("cannot resolve path: {err}")))?;
    if !canonical.starts_with(&root) {
        return Err(AppError::PathViolation(
            "symlink target escapes workspace".into(),
        ));
    }

    Ok(canonical.join(rest))
}

/// Split `path` into its deepest existing ancestor and the remainder.
fn split_existing(path: &Path) -> (&Path, PathBuf) {
    let mut existing = path;
    let mut rest = Vec::new();
    while !existing.exists() {
        let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
            break;
        };
        rest.push(name);
        existing = parent;
    }
    (existing, rest.iter().rev().collect())
}
