// crates/epi-core/src/container/paths.rs
// ============================================================================
// Module: EPI Path Resolution
// Description: Output path resolution and archive entry path validation.
// Purpose: Map caller paths to exactly one archive location without nesting.
// Dependencies: crate::core::{identifiers, time}
// ============================================================================

//! ## Overview
//! Recording output paths follow a convention: bare file names land in the
//! default recordings directory and gain the `.epi` extension. Resolution is
//! idempotent, so resolving an already-resolved path returns it unchanged and
//! never doubles the default directory.
//!
//! Archive entry paths are untrusted when read back; they must be relative,
//! `/`-separated and free of `.`/`..` segments.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::identifiers::WorkflowId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default directory for recordings, relative to the working directory.
pub const DEFAULT_RECORDINGS_DIR: &str = "epi-recordings";
/// Archive file extension (without the dot).
pub const ARCHIVE_EXTENSION: &str = "epi";
/// Maximum length for a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Path resolution and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathResolutionError {
    /// Path is empty.
    #[error("path is empty")]
    Empty,
    /// Path has no usable file name.
    #[error("path has no file name: {0}")]
    MissingFileName(String),
    /// Path or one of its components exceeds the length limits.
    #[error("path exceeds length limits: {0}")]
    TooLong(String),
    /// Archive entry path is absolute or escapes the archive root.
    #[error("invalid archive entry path: {0}")]
    InvalidEntry(String),
}

// ============================================================================
// SECTION: Output Paths
// ============================================================================

/// Resolves the archive output path for a recording.
///
/// - `None` generates `recording_<YYYYMMDD_HHMMSS>_<8 hex>.epi` in `default_dir`.
/// - A missing extension becomes `.epi`.
/// - Absolute paths, paths under `default_dir`, and paths with a parent directory are kept.
/// - A bare file name is placed in `default_dir`.
///
/// # Errors
///
/// Returns [`PathResolutionError`] for empty, name-less, or over-long paths.
pub fn resolve_output_path(
    requested: Option<&Path>,
    default_dir: &Path,
) -> Result<PathBuf, PathResolutionError> {
    let Some(requested) = requested else {
        let name = format!(
            "recording_{}_{}.{ARCHIVE_EXTENSION}",
            Timestamp::now().file_stamp(),
            WorkflowId::generate().short()
        );
        let resolved = default_dir.join(name);
        validate_path(&resolved)?;
        return Ok(resolved);
    };
    if requested.as_os_str().is_empty() {
        return Err(PathResolutionError::Empty);
    }
    let display = requested.display().to_string();
    let Some(file_name) = requested.file_name() else {
        return Err(PathResolutionError::MissingFileName(display));
    };

    let mut path = requested.to_path_buf();
    if Path::new(file_name).extension().is_none() {
        path.set_extension(ARCHIVE_EXTENSION);
    }

    let has_parent = requested.parent().is_some_and(|parent| !parent.as_os_str().is_empty());
    let resolved = if path.is_absolute() || has_parent || is_under(&path, default_dir) {
        path
    } else {
        default_dir.join(path)
    };
    validate_path(&resolved)?;
    Ok(resolved)
}

/// Returns true when `path` already lies inside `dir`, ignoring `.` components.
fn is_under(path: &Path, dir: &Path) -> bool {
    let path: PathBuf = path.components().filter(|c| *c != Component::CurDir).collect();
    let dir: PathBuf = dir.components().filter(|c| *c != Component::CurDir).collect();
    !dir.as_os_str().is_empty() && path.starts_with(&dir)
}

/// Enforces total and per-component length limits.
fn validate_path(path: &Path) -> Result<(), PathResolutionError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(PathResolutionError::TooLong(text.into_owned()));
    }
    for component in path.components() {
        if component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(PathResolutionError::TooLong(text.into_owned()));
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Archive Entry Paths
// ============================================================================

/// Validates an archive entry path.
///
/// # Errors
///
/// Returns [`PathResolutionError::InvalidEntry`] for absolute paths, backslashes,
/// and empty, `.` or `..` segments.
pub fn ensure_relative_entry_path(entry: &str) -> Result<(), PathResolutionError> {
    let invalid = || PathResolutionError::InvalidEntry(entry.to_string());
    if entry.is_empty() || entry.starts_with('/') || entry.contains('\\') {
        return Err(invalid());
    }
    if entry.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(PathResolutionError::TooLong(entry.to_string()));
    }
    for segment in entry.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains(':') {
            return Err(invalid());
        }
        if segment.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(PathResolutionError::TooLong(entry.to_string()));
        }
    }
    Ok(())
}

/// Converts a staging-relative filesystem path into a `/`-separated entry path.
///
/// # Errors
///
/// Returns [`PathResolutionError::InvalidEntry`] when the path is not plain relative UTF-8.
pub fn entry_path_from_relative(relative: &Path) -> Result<String, PathResolutionError> {
    let invalid = || PathResolutionError::InvalidEntry(relative.display().to_string());
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_str().ok_or_else(invalid)?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(invalid()),
        }
    }
    let entry = segments.join("/");
    ensure_relative_entry_path(&entry)?;
    Ok(entry)
}
