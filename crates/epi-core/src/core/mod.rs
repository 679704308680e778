// crates/epi-core/src/core/mod.rs
// ============================================================================
// Module: EPI Core Types
// Description: Canonical archive data model shared by every EPI component.
// Purpose: Provide stable, serializable types for manifests and step records.
// Dependencies: serde, serde_jcs, sha2, time, uuid
// ============================================================================

//! ## Overview
//! Core types define the archive manifest, step records, identifiers,
//! timestamps, and hashing helpers. These types are the source of truth for
//! the on-disk JSON written into every archive.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod hashing;
pub mod identifiers;
pub mod manifest;
pub mod step;
pub mod time;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use hashing::DEFAULT_HASH_ALGORITHM;
pub use hashing::HashAlgorithm;
pub use hashing::HashDigest;
pub use hashing::HashError;
pub use hashing::canonical_json_bytes;
pub use hashing::hash_bytes;
pub use hashing::hash_canonical_json;
pub use hashing::hash_reader;
pub use hashing::hex_decode;
pub use hashing::hex_encode;
pub use identifiers::DEFAULT_KEY_NAME;
pub use identifiers::IdentifierError;
pub use identifiers::KeyName;
pub use identifiers::StepKind;
pub use identifiers::WorkflowId;
pub use manifest::FileManifest;
pub use manifest::Manifest;
pub use manifest::SPEC_VERSION;
pub use step::StepParseError;
pub use step::StepRecord;
pub use step::parse_steps_jsonl;
pub use time::Timestamp;
