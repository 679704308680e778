// crates/epi-recorder/src/lib.rs
// ============================================================================
// Module: EPI Recorder Library
// Description: Recording sessions and step producers for EPI archives.
// Purpose: Capture AI workflow traces into signed evidence archives.
// Dependencies: epi-config, epi-core, tokio
// ============================================================================

//! ## Overview
//! `epi-recorder` turns a scope of caller code into one evidence archive.
//! [`Recorder`] opens a [`Session`], makes it the current session for the
//! calling context, and seals it on scope exit whether the scope succeeded,
//! failed, or unwound.
//!
//! Producers holding no session reference (such as [`Traced`]) resolve the
//! innermost open session with [`get_current_session`]. Without one, logging
//! is a silent no-op.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod context;
pub mod environment;
pub mod instrument;
pub mod recorder;
pub mod session;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use context::ContextGuard;
pub use context::get_current_session;
pub use environment::EnvironmentSnapshot;
pub use environment::capture_environment;
pub use instrument::ChatClient;
pub use instrument::ChatMessage;
pub use instrument::ChatRequest;
pub use instrument::ProviderResponse;
pub use instrument::ResponseShape;
pub use instrument::StreamingChatClient;
pub use instrument::TokenUsage;
pub use instrument::Traced;
pub use instrument::TracedStream;
pub use instrument::log_chat;
pub use instrument::log_llm_call;
pub use instrument::log_llm_error;
pub use instrument::log_llm_request;
pub use instrument::log_llm_response;
pub use recorder::FinalizeError;
pub use recorder::FinalizeFailure;
pub use recorder::Outcome;
pub use recorder::RecordError;
pub use recorder::RecordOptions;
pub use recorder::Recorded;
pub use recorder::Recorder;
pub use recorder::Recording;
pub use session::Session;
pub use session::SessionError;
pub use session::SessionState;

// ============================================================================
// SECTION: Convenience
// ============================================================================

/// Appends a step to the current session, if any.
///
/// # Errors
///
/// Returns [`SessionError`] when a current session exists and rejects the
/// step. Returns `Ok(())` when no session is current.
pub fn log_step(kind: &str, content: serde_json::Value) -> Result<(), SessionError> {
    match get_current_session() {
        Some(session) => session.log_step(kind, content),
        None => Ok(()),
    }
}

/// Records `body` with a recorder built from `epi.toml` or defaults.
///
/// # Errors
///
/// Returns [`RecordError`] when configuration is invalid or the session
/// cannot be opened.
pub fn record<T>(
    options: RecordOptions,
    body: impl FnOnce(&Session) -> T,
) -> Result<Recorded<T>, RecordError> {
    Recorder::from_environment()?.record(options, body)
}
