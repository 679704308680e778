// crates/epi-core/src/core/step.rs
// ============================================================================
// Module: EPI Step Records
// Description: Timestamped workflow events stored in `steps.jsonl`.
// Purpose: Define the step record schema and its JSON-lines encoding.
// Dependencies: crate::core::{identifiers, time}, serde, serde_json
// ============================================================================

//! ## Overview
//! A step record is one captured event. Records are written one JSON object
//! per line in append order; that order is part of the hashed content, so
//! reordering lines is detected by integrity checks.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::identifiers::StepKind;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Well-Known Kinds
// ============================================================================

/// Implicit first step of every session.
pub const KIND_SESSION_START: &str = "session.start";
/// Implicit last step of every session.
pub const KIND_SESSION_END: &str = "session.end";
/// Implicit environment snapshot written at finalize.
pub const KIND_ENVIRONMENT_CAPTURED: &str = "environment.captured";
/// Model request issued by a step producer.
pub const KIND_LLM_REQUEST: &str = "llm.request";
/// Model response observed by a step producer.
pub const KIND_LLM_RESPONSE: &str = "llm.response";
/// Model call failure observed by a step producer.
pub const KIND_LLM_ERROR: &str = "llm.error";
/// Artifact file added to the session.
pub const KIND_ARTIFACT_CAPTURED: &str = "artifact.captured";

// ============================================================================
// SECTION: Step Record
// ============================================================================

/// One captured workflow event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Dot-namespaced event category.
    pub kind: StepKind,
    /// Time the step was appended.
    pub timestamp: Timestamp,
    /// Structured payload.
    pub content: Value,
}

impl StepRecord {
    /// Creates a step stamped with the current time.
    #[must_use]
    pub fn now(kind: StepKind, content: Value) -> Self {
        Self {
            kind,
            timestamp: Timestamp::now(),
            content,
        }
    }

    /// Encodes the record as one JSON line including the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] when the content cannot be serialized.
    pub fn to_json_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

// ============================================================================
// SECTION: JSON Lines
// ============================================================================

/// Step log decoding failure.
#[derive(Debug, Error)]
#[error("invalid step record on line {line}: {message}")]
pub struct StepParseError {
    /// One-based line number.
    pub line: usize,
    /// Decoder message.
    pub message: String,
}

/// Decodes a `steps.jsonl` payload. Blank lines are skipped.
///
/// # Errors
///
/// Returns [`StepParseError`] for the first line that is not UTF-8 or not a step record.
pub fn parse_steps_jsonl(bytes: &[u8]) -> Result<Vec<StepRecord>, StepParseError> {
    let mut steps = Vec::new();
    for (index, raw) in bytes.split(|byte| *byte == b'\n').enumerate() {
        let line = std::str::from_utf8(raw).map_err(|err| StepParseError {
            line: index + 1,
            message: err.to_string(),
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let step = serde_json::from_str(line).map_err(|err| StepParseError {
            line: index + 1,
            message: err.to_string(),
        })?;
        steps.push(step);
    }
    Ok(steps)
}
