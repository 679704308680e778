// crates/epi-core/src/container/integrity.rs
// ============================================================================
// Module: EPI Integrity Verification
// Description: Recomputes archive entry hashes against the manifest index.
// Purpose: Detect content changes made after `manifest.json` was written.
// Dependencies: crate::{core, container::archive}, serde
// ============================================================================

//! ## Overview
//! Integrity verification answers "has content changed since the manifest was
//! written". It is independent of the signature check. A negative result is
//! data, not an error: the report lists every declared path that is missing,
//! unreadable or whose hash differs. Entries present in the package but absent
//! from `file_manifest` are listed as `undeclared` and never fail the check.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::container::archive::ContainerError;
use crate::container::archive::MANIFEST_PATH;
use crate::container::archive::MIMETYPE_PATH;
use crate::container::archive::open_archive;
use crate::container::archive::read_manifest_from;
use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::hash_reader;

// ============================================================================
// SECTION: Report Types
// ============================================================================

/// Integrity verification status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    /// Every declared file is present with a matching hash.
    Pass,
    /// At least one declared file is missing, unreadable, or altered.
    Fail,
}

/// One failed integrity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityMismatch {
    /// Entry bytes hash to a different value than declared.
    HashMismatch {
        /// Archive path.
        path: String,
        /// Declared hash.
        expected: String,
        /// Recomputed hash.
        actual: String,
    },
    /// Declared entry is absent from the package.
    Missing {
        /// Archive path.
        path: String,
    },
    /// Declared entry exists but could not be read.
    Unreadable {
        /// Archive path.
        path: String,
        /// Reader failure detail.
        message: String,
    },
}

impl IntegrityMismatch {
    /// Returns the archive path the mismatch concerns.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::HashMismatch {
                path, ..
            }
            | Self::Missing {
                path,
            }
            | Self::Unreadable {
                path, ..
            } => path,
        }
    }
}

/// Integrity verification report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Verification status.
    pub status: IntegrityStatus,
    /// Count of declared files that were present and hashed.
    pub checked_files: usize,
    /// Fatal mismatches in manifest order.
    pub mismatches: Vec<IntegrityMismatch>,
    /// Package entries not declared in the manifest (informational).
    pub undeclared: Vec<String>,
}

impl IntegrityReport {
    /// Returns true when no mismatches were found.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

// ============================================================================
// SECTION: Verification
// ============================================================================

/// Recomputes and compares the hash of every declared archive entry.
///
/// # Errors
///
/// Returns [`ContainerError`] only when the package or its manifest cannot be
/// read at all; content problems are reported in the [`IntegrityReport`].
pub fn verify_integrity(archive: &Path) -> Result<IntegrityReport, ContainerError> {
    let mut zip = open_archive(archive)?;
    let manifest = read_manifest_from(&mut zip, archive)?;
    let present: BTreeSet<String> = zip
        .file_names()
        .filter(|name| !name.ends_with('/'))
        .map(ToString::to_string)
        .collect();

    let mut checked_files = 0;
    let mut mismatches = Vec::new();
    for (path, expected) in manifest.file_manifest.iter() {
        if !present.contains(path) {
            mismatches.push(IntegrityMismatch::Missing {
                path: path.to_string(),
            });
            continue;
        }
        let digest = match zip.by_name(path) {
            Ok(mut entry) => hash_reader(DEFAULT_HASH_ALGORITHM, &mut entry),
            Err(err) => {
                mismatches.push(IntegrityMismatch::Unreadable {
                    path: path.to_string(),
                    message: err.to_string(),
                });
                continue;
            }
        };
        match digest {
            Ok(digest) => {
                checked_files += 1;
                if !digest.value.eq_ignore_ascii_case(expected) {
                    mismatches.push(IntegrityMismatch::HashMismatch {
                        path: path.to_string(),
                        expected: expected.to_string(),
                        actual: digest.value,
                    });
                }
            }
            Err(err) => mismatches.push(IntegrityMismatch::Unreadable {
                path: path.to_string(),
                message: err.to_string(),
            }),
        }
    }

    let undeclared = present
        .into_iter()
        .filter(|name| {
            name != MANIFEST_PATH && name != MIMETYPE_PATH && !manifest.file_manifest.contains(name)
        })
        .collect();
    let status = if mismatches.is_empty() { IntegrityStatus::Pass } else { IntegrityStatus::Fail };
    Ok(IntegrityReport {
        status,
        checked_files,
        mismatches,
        undeclared,
    })
}
