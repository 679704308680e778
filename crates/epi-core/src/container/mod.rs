// crates/epi-core/src/container/mod.rs
// ============================================================================
// Module: EPI Evidence Container
// Description: Archive packing, reading, integrity checks, and path resolution.
// Purpose: Own the on-disk archive contract.
// Dependencies: tempfile, zip
// ============================================================================

//! ## Overview
//! The evidence container turns a staging directory plus a manifest into one
//! random-access ZIP package and answers integrity questions about existing
//! packages.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod archive;
pub mod integrity;
pub mod paths;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use archive::ContainerError;
pub use archive::MANIFEST_PATH;
pub use archive::MIMETYPE;
pub use archive::MIMETYPE_PATH;
pub use archive::PackOptions;
pub use archive::PackedArchive;
pub use archive::STEPS_PATH;
pub use archive::pack;
pub use archive::read_entry;
pub use archive::read_manifest;
pub use archive::read_steps;
pub use archive::resign;
pub use archive::unpack;
pub use integrity::IntegrityMismatch;
pub use integrity::IntegrityReport;
pub use integrity::IntegrityStatus;
pub use integrity::verify_integrity;
pub use paths::ARCHIVE_EXTENSION;
pub use paths::DEFAULT_RECORDINGS_DIR;
pub use paths::PathResolutionError;
pub use paths::ensure_relative_entry_path;
pub use paths::resolve_output_path;
