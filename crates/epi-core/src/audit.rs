// crates/epi-core/src/audit.rs
// ============================================================================
// Module: EPI Audit Logging
// Description: Structured audit events for key, signing, and session activity.
// Purpose: Emit JSON-line audit records without hard logging dependencies.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Audit events are small JSON objects written one per line. Sinks are
//! intentionally lightweight so deployments can route events to their
//! preferred pipeline. Sink failures are swallowed: audit output never changes
//! the outcome of the operation being audited.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;

// ============================================================================
// SECTION: Event Names
// ============================================================================

/// A key pair was generated.
pub const EVENT_KEY_GENERATED: &str = "key_generated";
/// A manifest was signed.
pub const EVENT_MANIFEST_SIGNED: &str = "manifest_signed";
/// An archive was written.
pub const EVENT_ARCHIVE_PACKED: &str = "archive_packed";
/// A recording session was opened.
pub const EVENT_SESSION_OPENED: &str = "session_opened";
/// A recording session closed with a persisted archive.
pub const EVENT_SESSION_CLOSED: &str = "session_closed";
/// A recording session failed to finalize.
pub const EVENT_SESSION_ABANDONED: &str = "session_abandoned";

// ============================================================================
// SECTION: Types
// ============================================================================

/// Audit event payload.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event: &'static str,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// Workflow identifier when the event concerns a session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Key name when the event concerns a key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    /// Archive path when one is involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    /// Free-form detail, typically an error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Inputs required to construct an audit event.
#[derive(Debug, Default)]
pub struct AuditEventParams {
    /// Workflow identifier when the event concerns a session.
    pub workflow_id: Option<String>,
    /// Key name when the event concerns a key.
    pub key_name: Option<String>,
    /// Archive path when one is involved.
    pub archive: Option<String>,
    /// Free-form detail.
    pub message: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event with a consistent timestamp.
    #[must_use]
    pub fn new(event: &'static str, params: AuditEventParams) -> Self {
        let timestamp_ms =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        Self {
            event,
            timestamp_ms,
            workflow_id: params.workflow_id,
            key_name: params.key_name,
            archive: params.archive,
            message: params.message,
        }
    }
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Audit sink for EPI events.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: &AuditEvent);
}

/// Audit sink that logs JSON lines to stderr.
pub struct StderrAuditSink;

impl AuditSink for StderrAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{payload}");
        }
    }
}

/// Audit sink that logs JSON lines to a file.
pub struct FileAuditSink {
    /// File handle used for append-only logging.
    file: Mutex<std::fs::File>,
}

impl FileAuditSink {
    /// Opens the audit log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(payload) = serde_json::to_string(event)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
            let _ = file.flush();
        }
    }
}

/// No-op audit sink.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: &AuditEvent) {}
}

/// In-memory sink that keeps every event, for callers that inspect activity.
#[derive(Default)]
pub struct MemoryAuditSink {
    /// Captured events in emission order.
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the names of captured events in order.
    #[must_use]
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().map(|events| events.iter().map(|event| event.event).collect()).unwrap_or_default()
    }

    /// Returns a copy of captured events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
