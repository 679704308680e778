// crates/epi-config/src/lib.rs
// ============================================================================
// Module: EPI Config Library
// Description: Canonical config model and validation for EPI recorders.
// Purpose: Single source of truth for epi.toml semantics.
// Dependencies: epi-core, serde, toml
// ============================================================================

//! ## Overview
//! `epi-config` defines the `epi.toml` configuration model: recording
//! defaults, the key store location, and the audit sink. Validation is strict
//! and fail-closed.
//!
//! Security posture: config inputs are untrusted.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
