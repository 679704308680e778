// crates/epi-recorder/src/recorder.rs
// ============================================================================
// Module: EPI Recorder
// Description: Session lifecycle driver from scope entry to sealed archive.
// Purpose: Guarantee every opened session is finalized exactly once.
// Dependencies: epi-config, epi-core, tempfile, tokio
// ============================================================================

//! ## Overview
//! [`Recorder`] opens sessions and drives finalize. Each session gets a
//! private staging directory; finalize appends the implicit environment and
//! end steps, seals the step log, optionally signs, and packs the archive.
//!
//! Finalize is unconditional. A closure that returns an error, panics, or a
//! future that is dropped mid-flight still produces an archive; only a
//! failure inside finalize itself leaves the session `Abandoned`, with the
//! staging directory preserved for inspection and no archive written.
//!
//! Security posture: step content is caller data and is stored as given.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use epi_config::ConfigError;
use epi_config::EpiConfig;
use epi_core::AuditEvent;
use epi_core::AuditEventParams;
use epi_core::AuditSink;
use epi_core::ContainerError;
use epi_core::KeyError;
use epi_core::KeyManager;
use epi_core::KeyName;
use epi_core::Manifest;
use epi_core::NoopAuditSink;
use epi_core::PackOptions;
use epi_core::PathResolutionError;
use epi_core::Timestamp;
use epi_core::WorkflowId;
use epi_core::audit::EVENT_ARCHIVE_PACKED;
use epi_core::audit::EVENT_MANIFEST_SIGNED;
use epi_core::audit::EVENT_SESSION_ABANDONED;
use epi_core::audit::EVENT_SESSION_CLOSED;
use epi_core::audit::EVENT_SESSION_OPENED;
use epi_core::container::DEFAULT_RECORDINGS_DIR;
use epi_core::core::step::KIND_ENVIRONMENT_CAPTURED;
use epi_core::core::step::KIND_SESSION_END;
use epi_core::core::step::KIND_SESSION_START;
use epi_core::pack;
use epi_core::resolve_output_path;
use serde_json::json;
use tempfile::TempDir;
use thiserror::Error;

use crate::context;
use crate::context::ContextGuard;
use crate::environment::capture_environment;
use crate::session::Session;
use crate::session::SessionError;
use crate::session::SessionState;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Prefix of per-session staging directories.
pub const STAGING_PREFIX: &str = "epi-session-";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while opening a recording.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Output path could not be resolved.
    #[error(transparent)]
    Path(#[from] PathResolutionError),
    /// Staging directory could not be created.
    #[error("recorder io error: {0}")]
    Io(String),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Session could not be opened.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// A detached recording was requested on an async runtime thread.
    #[error("Recorder::start inside a tokio runtime needs an async scope; use record_async")]
    AsyncContext,
}

/// Finalize failure for one session.
///
/// The session is `Abandoned` and no archive exists at the output path.
#[derive(Debug, Error)]
#[error("finalize failed for workflow {workflow_id}: {reason}")]
pub struct FinalizeError {
    /// Workflow whose finalize failed.
    pub workflow_id: WorkflowId,
    /// Preserved staging directory, when one was kept.
    pub staging: Option<PathBuf>,
    /// Underlying failure.
    pub reason: FinalizeFailure,
}

/// Cause of a finalize failure.
#[derive(Debug, Error)]
pub enum FinalizeFailure {
    /// Signing key could not be loaded or generated.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// Packing or signing failed.
    #[error(transparent)]
    Container(#[from] ContainerError),
    /// Implicit steps could not be written.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Finalize did not run to completion.
    #[error("finalize interrupted: {0}")]
    Interrupted(String),
}

// ============================================================================
// SECTION: Options
// ============================================================================

/// Per-session recording options.
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    /// Archive path; generated under the output directory when absent.
    pub output: Option<PathBuf>,
    /// Free-text goal written to the manifest.
    pub goal: Option<String>,
    /// Human-readable session name.
    pub name: Option<String>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Signing override; the recorder default applies when absent.
    pub sign: Option<bool>,
    /// Signing key override.
    pub key: Option<KeyName>,
    /// Overwrite override.
    pub overwrite: Option<bool>,
}

impl RecordOptions {
    /// Creates options with every field defaulted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the archive path.
    #[must_use]
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Sets the goal.
    #[must_use]
    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    /// Sets the name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Enables or disables signing for this session.
    #[must_use]
    pub fn sign(mut self, sign: bool) -> Self {
        self.sign = Some(sign);
        self
    }

    /// Selects the signing key.
    #[must_use]
    pub fn key(mut self, key: KeyName) -> Self {
        self.key = Some(key);
        self
    }

    /// Allows or forbids replacing an existing archive.
    #[must_use]
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = Some(overwrite);
        self
    }
}

// ============================================================================
// SECTION: Outcome
// ============================================================================

/// How the recorded scope ended, written into the `session.end` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Scope returned normally.
    Completed,
    /// Scope returned an error.
    Failed {
        /// Error text.
        error: String,
    },
    /// Scope unwound from a panic.
    Panicked,
    /// Recording dropped without an explicit finish.
    Dropped,
}

impl Outcome {
    /// Returns the outcome label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Panicked => "panicked",
            Self::Dropped => "dropped",
        }
    }

    /// Outcome for a recording ended by `Drop`.
    fn on_drop() -> Self {
        if thread::panicking() { Self::Panicked } else { Self::Dropped }
    }
}

/// Caller value plus the finalize result.
#[derive(Debug)]
pub struct Recorded<T> {
    /// Value produced by the recorded scope.
    pub value: T,
    /// Archive path, or the finalize failure.
    pub archive: Result<PathBuf, FinalizeError>,
}

// ============================================================================
// SECTION: Recorder
// ============================================================================

/// Opens recording sessions and seals them into archives.
#[derive(Clone)]
pub struct Recorder {
    /// Directory for generated and bare-name archive paths.
    output_dir: PathBuf,
    /// Default signing flag.
    auto_sign: bool,
    /// Default signing key.
    default_key: KeyName,
    /// Append `environment.captured` at finalize.
    capture_environment: bool,
    /// Default overwrite flag.
    overwrite: bool,
    /// Key store.
    keys: KeyManager,
    /// Audit sink for lifecycle events.
    audit: Arc<dyn AuditSink>,
    /// Parent of staging directories; the system temp dir when absent.
    staging_root: Option<PathBuf>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("output_dir", &self.output_dir)
            .field("auto_sign", &self.auto_sign)
            .field("default_key", &self.default_key)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Creates a recorder with default settings around `keys`.
    #[must_use]
    pub fn new(keys: KeyManager) -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_RECORDINGS_DIR),
            auto_sign: true,
            default_key: KeyName::default_key(),
            capture_environment: true,
            overwrite: true,
            keys,
            audit: Arc::new(NoopAuditSink),
            staging_root: None,
        }
    }

    /// Builds a recorder from a loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Config`] when the audit sink cannot be built.
    pub fn from_config(config: &EpiConfig) -> Result<Self, RecordError> {
        let audit = config.build_audit_sink()?;
        let keys = config.key_manager(Arc::clone(&audit));
        Ok(Self {
            output_dir: config.recorder.output_dir.clone(),
            auto_sign: config.recorder.auto_sign,
            default_key: config.recorder.default_key.clone(),
            capture_environment: config.recorder.capture_environment,
            overwrite: config.recorder.overwrite,
            keys,
            audit,
            staging_root: None,
        })
    }

    /// Builds a recorder from `epi.toml`, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Config`] when a configuration file exists but
    /// is invalid.
    pub fn from_environment() -> Result<Self, RecordError> {
        let config = EpiConfig::load_or_default(None)?;
        Self::from_config(&config)
    }

    /// Sets the output directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Sets the default signing flag.
    #[must_use]
    pub fn with_auto_sign(mut self, auto_sign: bool) -> Self {
        self.auto_sign = auto_sign;
        self
    }

    /// Sets the default signing key.
    #[must_use]
    pub fn with_default_key(mut self, key: KeyName) -> Self {
        self.default_key = key;
        self
    }

    /// Enables or disables environment capture.
    #[must_use]
    pub fn with_capture_environment(mut self, capture: bool) -> Self {
        self.capture_environment = capture;
        self
    }

    /// Sets the default overwrite flag.
    #[must_use]
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Sets the audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Places staging directories under `root`.
    #[must_use]
    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    /// Returns the output directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Returns the key store.
    #[must_use]
    pub const fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Opens a session and makes it current for the calling thread.
    ///
    /// Inside a tokio runtime the returned [`Recording`] could be held across
    /// an `.await` while other futures run on the same thread, so it is only
    /// handed out within an async scope opened by [`Recorder::record_async`].
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::AsyncContext`] when called on a runtime thread
    /// outside an async scope, or [`RecordError`] when the output path is
    /// invalid or staging cannot be created.
    pub fn start(&self, options: RecordOptions) -> Result<Recording, RecordError> {
        if tokio::runtime::Handle::try_current().is_ok() && !context::in_async_scope() {
            return Err(RecordError::AsyncContext);
        }
        self.begin(options)
    }

    /// Opens a session and enters it on the calling thread.
    fn begin(&self, options: RecordOptions) -> Result<Recording, RecordError> {
        let (session, finalizer) = self.open(options)?;
        let context = context::enter(&session);
        Ok(Recording {
            session,
            finalizer: Some(finalizer),
            context: Some(context),
        })
    }

    /// Runs `body` inside a recording and always finalizes.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] when the session cannot be opened; `body` does
    /// not run in that case.
    pub fn record<T>(
        &self,
        options: RecordOptions,
        body: impl FnOnce(&Session) -> T,
    ) -> Result<Recorded<T>, RecordError> {
        let recording = self.begin(options)?;
        let value = body(recording.session());
        let archive = recording.finish();
        Ok(Recorded { value, archive })
    }

    /// Runs a fallible `body`; an `Err` is recorded as outcome `failed`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] when the session cannot be opened.
    pub fn try_record<T, E: fmt::Display>(
        &self,
        options: RecordOptions,
        body: impl FnOnce(&Session) -> Result<T, E>,
    ) -> Result<Recorded<Result<T, E>>, RecordError> {
        let recording = self.begin(options)?;
        let value = body(recording.session());
        let archive = match &value {
            Ok(_) => recording.finish(),
            Err(err) => recording.fail(err),
        };
        Ok(Recorded { value, archive })
    }

    /// Runs the future built by `body` with its session current.
    ///
    /// The session is visible only while this future is polled. Finalize runs
    /// on the blocking pool when a runtime is available. Dropping the returned
    /// future early still finalizes, with outcome `dropped` or `panicked`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] when the session cannot be opened.
    pub async fn record_async<F, Fut, T>(
        &self,
        options: RecordOptions,
        body: F,
    ) -> Result<Recorded<T>, RecordError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = T>,
    {
        let (session, finalizer) = self.open(options)?;
        let guard = FinalizeOnDrop {
            workflow_id: session.workflow_id(),
            finalizer: Some(finalizer),
        };
        let value = context::scope(session.clone(), body(session)).await;
        let archive = guard.finish(Outcome::Completed).await;
        Ok(Recorded { value, archive })
    }

    /// Creates the session, its staging area, and its finalizer.
    fn open(&self, options: RecordOptions) -> Result<(Session, Finalizer), RecordError> {
        let output = resolve_output_path(options.output.as_deref(), &self.output_dir)?;
        let staging = self.create_staging()?;
        let workflow_id = WorkflowId::generate();
        let created_at = Timestamp::now();
        let session = Session::open(workflow_id, created_at, staging.path())?;

        let mut manifest = Manifest::new(workflow_id, created_at).with_tags(options.tags.clone());
        if let Some(goal) = &options.goal {
            manifest = manifest.with_goal(goal.clone());
        }
        if let Some(name) = &options.name {
            manifest = manifest.with_name(name.clone());
        }
        session.append_implicit(
            KIND_SESSION_START,
            json!({
                "workflow_id": workflow_id,
                "goal": options.goal,
                "name": options.name,
                "tags": options.tags,
            }),
        )?;

        let sign = options.sign.unwrap_or(self.auto_sign);
        let key = sign.then(|| options.key.unwrap_or_else(|| self.default_key.clone()));
        self.audit.record(&AuditEvent::new(
            EVENT_SESSION_OPENED,
            AuditEventParams {
                workflow_id: Some(workflow_id.to_string()),
                archive: Some(output.display().to_string()),
                ..AuditEventParams::default()
            },
        ));

        let finalizer = Finalizer {
            session: session.clone(),
            staging,
            output,
            manifest,
            key,
            keys: self.keys.clone(),
            audit: Arc::clone(&self.audit),
            capture_environment: self.capture_environment,
            overwrite: options.overwrite.unwrap_or(self.overwrite),
        };
        Ok((session, finalizer))
    }

    /// Creates a fresh staging directory.
    fn create_staging(&self) -> Result<TempDir, RecordError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGING_PREFIX);
        let staging = match &self.staging_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|err| RecordError::Io(err.to_string()))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        };
        staging.map_err(|err| RecordError::Io(err.to_string()))
    }
}

// ============================================================================
// SECTION: Recording
// ============================================================================

/// An open recording bound to the thread that started it.
///
/// Dropping an unfinished recording finalizes it.
#[must_use = "dropping a recording finalizes it immediately"]
pub struct Recording {
    /// Session handle.
    session: Session,
    /// Pending finalize work; taken exactly once.
    finalizer: Option<Finalizer>,
    /// Current-session registration.
    context: Option<ContextGuard>,
}

impl fmt::Debug for Recording {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recording").field("session", &self.session).finish_non_exhaustive()
    }
}

impl Recording {
    /// Returns the session handle.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Finalizes with outcome `completed`.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizeError`] when finalize fails; the session is then
    /// `Abandoned`.
    pub fn finish(mut self) -> Result<PathBuf, FinalizeError> {
        self.conclude(Outcome::Completed)
    }

    /// Finalizes with outcome `failed`, recording `error`.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizeError`] when finalize fails.
    pub fn fail(mut self, error: impl fmt::Display) -> Result<PathBuf, FinalizeError> {
        self.conclude(Outcome::Failed { error: error.to_string() })
    }

    /// Leaves the current-session stack and runs finalize once.
    fn conclude(&mut self, outcome: Outcome) -> Result<PathBuf, FinalizeError> {
        drop(self.context.take());
        match self.finalizer.take() {
            Some(finalizer) => finalizer.run(outcome),
            None => Err(FinalizeError {
                workflow_id: self.session.workflow_id(),
                staging: None,
                reason: FinalizeFailure::Interrupted("recording already finalized".to_string()),
            }),
        }
    }
}

impl Drop for Recording {
    fn drop(&mut self) {
        if self.finalizer.is_some() {
            // Failures are reported through the audit sink.
            let _ = self.conclude(Outcome::on_drop());
        }
    }
}

// ============================================================================
// SECTION: Async Finalize Guard
// ============================================================================

/// Finalizes an async recording when its future is dropped early.
struct FinalizeOnDrop {
    /// Workflow of the guarded session.
    workflow_id: WorkflowId,
    /// Pending finalize work.
    finalizer: Option<Finalizer>,
}

impl FinalizeOnDrop {
    /// Runs finalize off the async worker when a runtime is present.
    async fn finish(mut self, outcome: Outcome) -> Result<PathBuf, FinalizeError> {
        let workflow_id = self.workflow_id;
        let Some(finalizer) = self.finalizer.take() else {
            return Err(FinalizeError {
                workflow_id,
                staging: None,
                reason: FinalizeFailure::Interrupted("recording already finalized".to_string()),
            });
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle
                .spawn_blocking(move || finalizer.run(outcome))
                .await
                .unwrap_or_else(|err| {
                    Err(FinalizeError {
                        workflow_id,
                        staging: None,
                        reason: FinalizeFailure::Interrupted(err.to_string()),
                    })
                }),
            Err(_) => finalizer.run(outcome),
        }
    }
}

impl Drop for FinalizeOnDrop {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            let _ = finalizer.run(Outcome::on_drop());
        }
    }
}

// ============================================================================
// SECTION: Finalizer
// ============================================================================

/// Everything finalize needs, detached from the calling context.
struct Finalizer {
    /// Session being finalized.
    session: Session,
    /// Staging directory owned by the session.
    staging: TempDir,
    /// Resolved archive path.
    output: PathBuf,
    /// Manifest fields fixed at session open.
    manifest: Manifest,
    /// Signing key, when signing is enabled.
    key: Option<KeyName>,
    /// Key store.
    keys: KeyManager,
    /// Audit sink.
    audit: Arc<dyn AuditSink>,
    /// Append `environment.captured`.
    capture_environment: bool,
    /// Replace an existing archive.
    overwrite: bool,
}

impl Finalizer {
    /// Drives `Finalizing` to `Closed`, or to `Abandoned` on failure.
    fn run(self, outcome: Outcome) -> Result<PathBuf, FinalizeError> {
        let workflow_id = self.session.workflow_id();
        if !self.session.begin_finalize() {
            let state = self.session.state();
            return Err(FinalizeError {
                workflow_id,
                staging: None,
                reason: FinalizeFailure::Session(SessionError::SessionClosed(state)),
            });
        }
        match self.seal(&outcome) {
            Ok(path) => {
                self.session.settle(SessionState::Closed);
                // Archive is already durable; a leftover staging dir is harmless.
                let _ = self.staging.close();
                Ok(path)
            }
            Err(reason) => {
                self.session.settle(SessionState::Abandoned);
                let staging = self.staging.keep();
                self.audit.record(&AuditEvent::new(
                    EVENT_SESSION_ABANDONED,
                    AuditEventParams {
                        workflow_id: Some(workflow_id.to_string()),
                        archive: Some(self.output.display().to_string()),
                        message: Some(reason.to_string()),
                        ..AuditEventParams::default()
                    },
                ));
                Err(FinalizeError {
                    workflow_id,
                    staging: Some(staging),
                    reason,
                })
            }
        }
    }

    /// Writes the implicit steps, then signs and packs.
    fn seal(&self, outcome: &Outcome) -> Result<PathBuf, FinalizeFailure> {
        let workflow_id = self.session.workflow_id().to_string();
        if self.capture_environment {
            self.session.append_implicit(KIND_ENVIRONMENT_CAPTURED, capture_environment())?;
        }
        let mut end = json!({
            "outcome": outcome.as_str(),
            "step_count": self.session.step_count(),
        });
        if let Outcome::Failed { error } = outcome {
            end["error"] = json!(error);
        }
        self.session.append_implicit(KIND_SESSION_END, end)?;
        self.session.seal_log()?;

        let signer = match &self.key {
            Some(name) => Some(self.keys.signer(name, true)?),
            None => None,
        };
        let packed = pack(
            self.staging.path(),
            &self.manifest,
            &PackOptions {
                output: self.output.clone(),
                signer: signer.as_ref(),
                overwrite: self.overwrite,
            },
        )?;

        let archive = packed.path.display().to_string();
        if packed.manifest.is_signed() {
            self.audit.record(&AuditEvent::new(
                EVENT_MANIFEST_SIGNED,
                AuditEventParams {
                    workflow_id: Some(workflow_id.clone()),
                    key_name: self.key.as_ref().map(ToString::to_string),
                    archive: Some(archive.clone()),
                    ..AuditEventParams::default()
                },
            ));
        }
        self.audit.record(&AuditEvent::new(
            EVENT_ARCHIVE_PACKED,
            AuditEventParams {
                workflow_id: Some(workflow_id.clone()),
                archive: Some(archive.clone()),
                ..AuditEventParams::default()
            },
        ));
        self.audit.record(&AuditEvent::new(
            EVENT_SESSION_CLOSED,
            AuditEventParams {
                workflow_id: Some(workflow_id),
                archive: Some(archive),
                ..AuditEventParams::default()
            },
        ));
        Ok(packed.path)
    }
}
