// crates/epi-core/src/trust/canonical.rs
// ============================================================================
// Module: EPI Canonical Payload
// Description: Deterministic byte encoding of the signed manifest fields.
// Purpose: Give signers and verifiers one byte-exact message to agree on.
// Dependencies: crate::core::{hashing, manifest}, serde
// ============================================================================

//! ## Overview
//! The canonical payload is RFC 8785 JSON over every manifest field except
//! `signature` and `public_key`. JCS fixes key order and number rendering;
//! [`Timestamp`] fixes timestamp precision. The payload is therefore a pure
//! function of the manifest's logical content.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;

use crate::core::hashing::HashError;
use crate::core::hashing::canonical_json_bytes;
use crate::core::identifiers::WorkflowId;
use crate::core::manifest::FileManifest;
use crate::core::manifest::Manifest;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Payload View
// ============================================================================

/// Borrowed view of the signed manifest fields.
#[derive(Serialize)]
struct CanonicalView<'a> {
    /// Manifest format version.
    spec_version: &'a str,
    /// Workflow identifier.
    workflow_id: &'a WorkflowId,
    /// Creation time.
    created_at: &'a Timestamp,
    /// Optional goal.
    #[serde(skip_serializing_if = "Option::is_none")]
    goal: Option<&'a str>,
    /// Optional name.
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    /// Tags, omitted when empty.
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    tags: &'a [String],
    /// File hash index.
    file_manifest: &'a FileManifest,
}

// ============================================================================
// SECTION: Canonical Payload
// ============================================================================

/// Returns the canonical payload bytes signed for `manifest`.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when JCS serialization fails.
pub fn canonical_payload(manifest: &Manifest) -> Result<Vec<u8>, HashError> {
    let view = CanonicalView {
        spec_version: &manifest.spec_version,
        workflow_id: &manifest.workflow_id,
        created_at: &manifest.created_at,
        goal: manifest.goal.as_deref(),
        name: manifest.name.as_deref(),
        tags: &manifest.tags,
        file_manifest: &manifest.file_manifest,
    };
    canonical_json_bytes(&view)
}
