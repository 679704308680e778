// crates/epi-recorder/src/session.rs
// ============================================================================
// Module: EPI Recording Session
// Description: Session state machine and append-only step log.
// Purpose: Buffer step records and artifacts for one in-flight capture.
// Dependencies: epi-core, serde_json
// ============================================================================

//! ## Overview
//! A session owns a staging directory holding `steps.jsonl` and any captured
//! artifacts. It moves through `Open -> Finalizing -> Closed`, or ends in
//! `Abandoned` when finalize fails. Producers may append steps only while the
//! session is `Open`; finalize appends its implicit steps during `Finalizing`.
//!
//! [`Session`] is a cheap, cloneable handle. All clones observe the same state,
//! and appends are serialized by an internal lock so step order is total.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use epi_core::DEFAULT_HASH_ALGORITHM;
use epi_core::IdentifierError;
use epi_core::PathResolutionError;
use epi_core::StepKind;
use epi_core::StepRecord;
use epi_core::Timestamp;
use epi_core::WorkflowId;
use epi_core::container::MANIFEST_PATH;
use epi_core::container::MIMETYPE_PATH;
use epi_core::container::STEPS_PATH;
use epi_core::container::ensure_relative_entry_path;
use epi_core::core::step::KIND_ARTIFACT_CAPTURED;
use epi_core::hash_bytes;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Session operation errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session no longer accepts steps.
    #[error("session is closed (state: {0})")]
    SessionClosed(SessionState),
    /// Step kind failed validation.
    #[error(transparent)]
    InvalidKind(#[from] IdentifierError),
    /// Artifact archive path failed validation.
    #[error(transparent)]
    InvalidPath(#[from] PathResolutionError),
    /// Artifact archive path collides with a reserved entry.
    #[error("archive path is reserved: {0}")]
    ReservedPath(String),
    /// Staging I/O failed.
    #[error("session io error: {0}")]
    Io(String),
    /// Step content could not be serialized.
    #[error("step serialization failed: {0}")]
    Serialization(String),
}

// ============================================================================
// SECTION: State
// ============================================================================

/// Lifecycle state of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting step records.
    Open,
    /// Finalize in progress; only implicit steps are appended.
    Finalizing,
    /// Archive persisted and staging removed.
    Closed,
    /// Finalize failed; staging preserved for inspection.
    Abandoned,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Open => "open",
            Self::Finalizing => "finalizing",
            Self::Closed => "closed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(label)
    }
}

// ============================================================================
// SECTION: Session
// ============================================================================

/// Handle to one recording session.
#[derive(Clone)]
pub struct Session {
    /// Shared session data.
    inner: Arc<SessionInner>,
}

/// Immutable session identity plus the locked mutable cell.
struct SessionInner {
    /// Workflow identifier written to the manifest.
    workflow_id: WorkflowId,
    /// Session creation time.
    created_at: Timestamp,
    /// Staging directory owned by the session.
    staging: PathBuf,
    /// Mutable state.
    cell: Mutex<SessionCell>,
}

/// Mutable session state guarded by the session lock.
struct SessionCell {
    /// Lifecycle state.
    state: SessionState,
    /// Number of step records appended.
    step_count: usize,
    /// Open handle to `steps.jsonl`; released when finalize completes.
    steps: Option<File>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("workflow_id", &self.inner.workflow_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens a session whose step log lives in `staging`.
    pub(crate) fn open(
        workflow_id: WorkflowId,
        created_at: Timestamp,
        staging: &Path,
    ) -> Result<Self, SessionError> {
        let steps = OpenOptions::new()
            .create(true)
            .append(true)
            .open(staging.join(STEPS_PATH))
            .map_err(|err| SessionError::Io(err.to_string()))?;
        Ok(Self {
            inner: Arc::new(SessionInner {
                workflow_id,
                created_at,
                staging: staging.to_path_buf(),
                cell: Mutex::new(SessionCell {
                    state: SessionState::Open,
                    step_count: 0,
                    steps: Some(steps),
                }),
            }),
        })
    }

    /// Returns the workflow identifier.
    #[must_use]
    pub fn workflow_id(&self) -> WorkflowId {
        self.inner.workflow_id
    }

    /// Returns the session creation time.
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.inner.created_at
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Returns the number of steps appended so far.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.lock().step_count
    }

    /// Returns the staging directory.
    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.inner.staging
    }

    /// Returns true when both handles refer to the same session.
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Appends a step record stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionClosed`] outside the `Open` state,
    /// [`SessionError::InvalidKind`] for a malformed kind, or
    /// [`SessionError::Io`] when the step log cannot be written.
    pub fn log_step(&self, kind: &str, content: Value) -> Result<(), SessionError> {
        let kind = StepKind::new(kind)?;
        self.append(kind, content, false)
    }

    /// Copies a file into the session as an artifact.
    ///
    /// `archive_path` defaults to `artifacts/<file name>`. An
    /// `artifact.captured` step records the path, size, and hash.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the session is not open, the path is
    /// invalid or reserved, or the copy fails.
    pub fn log_artifact(&self, source: &Path, archive_path: Option<&str>) -> Result<String, SessionError> {
        let entry = match archive_path {
            Some(path) => path.to_string(),
            None => {
                let name = source
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| SessionError::Io(format!("artifact has no file name: {}", source.display())))?;
                format!("artifacts/{name}")
            }
        };
        let bytes = fs::read(source).map_err(|err| SessionError::Io(err.to_string()))?;
        self.log_artifact_bytes(&entry, &bytes)?;
        Ok(entry)
    }

    /// Writes `bytes` into the session as an artifact at `archive_path`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the session is not open, the path is
    /// invalid or reserved, or the write fails.
    pub fn log_artifact_bytes(&self, archive_path: &str, bytes: &[u8]) -> Result<(), SessionError> {
        ensure_relative_entry_path(archive_path)?;
        if [STEPS_PATH, MANIFEST_PATH, MIMETYPE_PATH].contains(&archive_path) {
            return Err(SessionError::ReservedPath(archive_path.to_string()));
        }
        let mut cell = self.lock();
        if cell.state != SessionState::Open {
            return Err(SessionError::SessionClosed(cell.state));
        }
        let target = self.inner.staging.join(archive_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| SessionError::Io(err.to_string()))?;
        }
        fs::write(&target, bytes).map_err(|err| SessionError::Io(err.to_string()))?;
        let content = json!({
            "path": archive_path,
            "bytes": bytes.len(),
            "sha256": hash_bytes(DEFAULT_HASH_ALGORITHM, bytes).value,
        });
        let kind = StepKind::new(KIND_ARTIFACT_CAPTURED)?;
        write_step(&mut cell, kind, content)
    }

    /// Appends an implicit step; permitted while `Open` or `Finalizing`.
    pub(crate) fn append_implicit(&self, kind: &str, content: Value) -> Result<(), SessionError> {
        let kind = StepKind::new(kind)?;
        self.append(kind, content, true)
    }

    /// Moves `Open -> Finalizing`; returns false when the session was not open.
    pub(crate) fn begin_finalize(&self) -> bool {
        let mut cell = self.lock();
        if cell.state != SessionState::Open {
            return false;
        }
        cell.state = SessionState::Finalizing;
        true
    }

    /// Flushes and releases the step log handle.
    pub(crate) fn seal_log(&self) -> Result<(), SessionError> {
        let mut cell = self.lock();
        if let Some(file) = cell.steps.take() {
            file.sync_all().map_err(|err| SessionError::Io(err.to_string()))?;
        }
        Ok(())
    }

    /// Records the terminal state.
    pub(crate) fn settle(&self, state: SessionState) {
        let mut cell = self.lock();
        cell.steps = None;
        cell.state = state;
    }

    /// Appends a step under the session lock.
    fn append(&self, kind: StepKind, content: Value, implicit: bool) -> Result<(), SessionError> {
        let mut cell = self.lock();
        let accepting = match cell.state {
            SessionState::Open => true,
            SessionState::Finalizing => implicit,
            SessionState::Closed | SessionState::Abandoned => false,
        };
        if !accepting {
            return Err(SessionError::SessionClosed(cell.state));
        }
        write_step(&mut cell, kind, content)
    }

    /// Locks the session cell, recovering from poisoning.
    fn lock(&self) -> MutexGuard<'_, SessionCell> {
        self.inner.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serializes one step and appends it to the open log.
fn write_step(cell: &mut SessionCell, kind: StepKind, content: Value) -> Result<(), SessionError> {
    let line = StepRecord::now(kind, content)
        .to_json_line()
        .map_err(|err| SessionError::Serialization(err.to_string()))?;
    let file = cell
        .steps
        .as_mut()
        .ok_or_else(|| SessionError::Io("step log is not open".to_string()))?;
    file.write_all(&line).map_err(|err| SessionError::Io(err.to_string()))?;
    file.flush().map_err(|err| SessionError::Io(err.to_string()))?;
    cell.step_count += 1;
    Ok(())
}
