// crates/epi-core/src/core/manifest.rs
// ============================================================================
// Module: EPI Archive Manifest
// Description: Manifest schema describing archive contents and provenance.
// Purpose: Provide the signed index used for offline integrity verification.
// Dependencies: crate::core::{hashing, identifiers, time}, serde
// ============================================================================

//! ## Overview
//! The manifest is the single metadata document inside an EPI archive. It
//! records who/when/why for a recording and a `file_manifest` index mapping
//! every archive-relative path to the SHA-256 of its bytes. When signed, the
//! Ed25519 signature and the signer's public key travel inside the manifest so
//! verification needs nothing but the archive.
//!
//! Security posture: manifests read from archives are untrusted inputs.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::MapAccess;
use serde::de::Visitor;
use serde::ser::SerializeMap;

use crate::core::identifiers::WorkflowId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Manifest format version written by this implementation.
pub const SPEC_VERSION: &str = "2.4.0";

// ============================================================================
// SECTION: Manifest
// ============================================================================

/// Archive manifest.
///
/// # Invariants
/// - `signature` present implies `public_key` present and matching the signer.
/// - Any field change after signing invalidates `signature`.
/// - `file_manifest` keys are archive-relative paths with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest format version.
    pub spec_version: String,
    /// Workflow identifier.
    pub workflow_id: WorkflowId,
    /// Creation time of the recording.
    pub created_at: Timestamp,
    /// Optional statement of what the recorded workflow set out to do.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    /// Optional human-readable workflow name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Content hashes keyed by archive-relative path.
    #[serde(default)]
    pub file_manifest: FileManifest,
    /// Hex-encoded Ed25519 signature over the canonical payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Hex-encoded Ed25519 public key of the signer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Manifest {
    /// Creates an unsigned manifest with an empty file index.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, created_at: Timestamp) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            workflow_id,
            created_at,
            goal: None,
            name: None,
            tags: Vec::new(),
            file_manifest: FileManifest::new(),
            signature: None,
            public_key: None,
        }
    }

    /// Sets the goal.
    #[must_use]
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    /// Sets the workflow name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Returns true when a signature is embedded.
    #[must_use]
    pub const fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Returns a copy with signature and public key removed.
    #[must_use]
    pub fn unsigned(&self) -> Self {
        let mut copy = self.clone();
        copy.signature = None;
        copy.public_key = None;
        copy
    }
}

// ============================================================================
// SECTION: File Manifest
// ============================================================================

/// Insertion-ordered mapping of archive path to lowercase hex SHA-256.
///
/// # Invariants
/// - Paths are unique.
/// - Serialized as a JSON object in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileManifest {
    /// Ordered `(path, hash)` entries.
    entries: Vec<(String, String)>,
}

impl FileManifest {
    /// Creates an empty file manifest.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts or replaces the hash for `path`; replacements keep their position.
    pub fn insert(&mut self, path: impl Into<String>, hash: impl Into<String>) {
        let path = path.into();
        let hash = hash.into();
        if let Some(entry) = self.entries.iter_mut().find(|(existing, _)| *existing == path) {
            entry.1 = hash;
        } else {
            self.entries.push((path, hash));
        }
    }

    /// Returns the hash recorded for `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.iter().find(|(existing, _)| existing == path).map(|(_, hash)| hash.as_str())
    }

    /// Returns true when `path` is declared.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(path, hash)| (path.as_str(), hash.as_str()))
    }

    /// Returns the declared paths in insertion order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(path, _)| path.as_str())
    }

    /// Returns the number of entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no entries are declared.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<P: Into<String>, H: Into<String>> FromIterator<(P, H)> for FileManifest {
    fn from_iter<I: IntoIterator<Item = (P, H)>>(iter: I) -> Self {
        let mut manifest = Self::new();
        for (path, hash) in iter {
            manifest.insert(path, hash);
        }
        manifest
    }
}

impl Serialize for FileManifest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (path, hash) in &self.entries {
            map.serialize_entry(path, hash)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FileManifest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(FileManifestVisitor)
    }
}

/// Visitor that keeps wire order and rejects duplicate paths.
struct FileManifestVisitor;

impl<'de> Visitor<'de> for FileManifestVisitor {
    type Value = FileManifest;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("an object mapping archive paths to hex digests")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries: Vec<(String, String)> = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((path, hash)) = access.next_entry::<String, String>()? {
            if entries.iter().any(|(existing, _)| *existing == path) {
                return Err(serde::de::Error::custom(format!("duplicate file_manifest path: {path}")));
            }
            entries.push((path, hash));
        }
        Ok(FileManifest {
            entries,
        })
    }
}
