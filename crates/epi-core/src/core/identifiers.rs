// crates/epi-core/src/core/identifiers.rs
// ============================================================================
// Module: EPI Identifiers
// Description: Strongly typed identifiers for workflows, keys, and step kinds.
// Purpose: Validate identifier text once at construction boundaries.
// Dependencies: serde, thiserror, uuid
// ============================================================================

//! ## Overview
//! Identifiers are validated when constructed and serialize transparently as
//! strings. Workflow identifiers are random UUIDs; key names double as file
//! stems inside the key store, so their alphabet is deliberately narrow.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum key name length in bytes.
pub const MAX_KEY_NAME_LENGTH: usize = 64;
/// Maximum step kind length in bytes.
pub const MAX_STEP_KIND_LENGTH: usize = 128;
/// Name of the key used when no key is specified.
pub const DEFAULT_KEY_NAME: &str = "default";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Identifier validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// Key name is empty, too long, or uses characters outside `[A-Za-z0-9_.-]`.
    #[error("invalid key name: {0:?}")]
    InvalidKeyName(String),
    /// Step kind is empty, too long, or contains whitespace/control characters.
    #[error("invalid step kind: {0:?}")]
    InvalidStepKind(String),
    /// Workflow identifier is not a UUID.
    #[error("invalid workflow id: {0:?}")]
    InvalidWorkflowId(String),
}

// ============================================================================
// SECTION: Workflow Identifier
// ============================================================================

/// Unique identifier of one recorded workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Generates a new random workflow identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns the first eight hex characters, used for generated file names.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string().chars().take(8).collect()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for WorkflowId {
    type Err = IdentifierError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(text)
            .map(Self)
            .map_err(|_| IdentifierError::InvalidWorkflowId(text.to_string()))
    }
}

// ============================================================================
// SECTION: Key Name
// ============================================================================

/// Name of a key pair inside the key store.
///
/// # Invariants
/// - 1..=64 bytes of `[A-Za-z0-9_.-]`, not starting with `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct KeyName(String);

impl KeyName {
    /// Validates and wraps a key name.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError::InvalidKeyName`] when the name is not allowed.
    pub fn new(name: impl Into<String>) -> Result<Self, IdentifierError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_KEY_NAME_LENGTH
            && !name.starts_with('.')
            && name.bytes().all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.'));
        if valid { Ok(Self(name)) } else { Err(IdentifierError::InvalidKeyName(name)) }
    }

    /// Returns the name of the auto-generated default key.
    #[must_use]
    pub fn default_key() -> Self {
        Self(DEFAULT_KEY_NAME.to_string())
    }

    /// Returns the key name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for KeyName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::new(text).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// SECTION: Step Kind
// ============================================================================

/// Dot-namespaced category of a step record (for example `llm.request`).
///
/// # Invariants
/// - 1..=128 bytes, no whitespace or control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StepKind(String);

impl StepKind {
    /// Validates and wraps a step kind.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError::InvalidStepKind`] when the kind is not allowed.
    pub fn new(kind: impl Into<String>) -> Result<Self, IdentifierError> {
        let kind = kind.into();
        let valid = !kind.is_empty()
            && kind.len() <= MAX_STEP_KIND_LENGTH
            && !kind.chars().any(|ch| ch.is_whitespace() || ch.is_control());
        if valid { Ok(Self(kind)) } else { Err(IdentifierError::InvalidStepKind(kind)) }
    }

    /// Returns the kind as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the namespace portion before the first dot.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StepKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::new(text).map_err(serde::de::Error::custom)
    }
}
