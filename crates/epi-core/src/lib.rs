// crates/epi-core/src/lib.rs
// ============================================================================
// Module: EPI Core Library
// Description: Public API surface for EPI evidence archives.
// Purpose: Expose the data model, trust engine, and evidence container.
// Dependencies: crate::{audit, container, core, trust}
// ============================================================================

//! ## Overview
//! EPI core produces and checks tamper-evident evidence archives of AI
//! interaction traces. A verifier can confirm offline, with nothing but the
//! archive, that its contents are unchanged since packing (integrity) and that
//! its manifest was endorsed by a specific Ed25519 key (signature).
//!
//! Recording sessions live in `epi-recorder`; this crate has no notion of a
//! current session.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod audit;
pub mod container;
pub mod core;
pub mod trust;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use core::*;

pub use audit::AuditEvent;
pub use audit::AuditEventParams;
pub use audit::AuditSink;
pub use audit::FileAuditSink;
pub use audit::MemoryAuditSink;
pub use audit::NoopAuditSink;
pub use audit::StderrAuditSink;
pub use container::ContainerError;
pub use container::IntegrityMismatch;
pub use container::IntegrityReport;
pub use container::IntegrityStatus;
pub use container::PackOptions;
pub use container::PackedArchive;
pub use container::PathResolutionError;
pub use container::pack;
pub use container::read_manifest;
pub use container::read_steps;
pub use container::resolve_output_path;
pub use container::verify_integrity;
pub use trust::KeyError;
pub use trust::KeyManager;
pub use trust::SignatureFailure;
pub use trust::SignatureVerdict;
pub use trust::Signer;
pub use trust::TrustError;
pub use trust::sign_manifest;
pub use trust::verify_embedded_signature;
pub use trust::verify_signature;
