// crates/epi-core/src/trust/mod.rs
// ============================================================================
// Module: EPI Trust Engine
// Description: Canonical payloads, Ed25519 signing, and the local key store.
// Purpose: Establish who endorsed an archive manifest.
// Dependencies: base64, ed25519-dalek, rand, serde_jcs, tempfile
// ============================================================================

//! ## Overview
//! The trust engine answers one question: was this manifest endorsed by this
//! key. It is independent of archive integrity, which answers whether content
//! changed after the manifest was written.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod canonical;
pub mod keys;
pub mod signing;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use canonical::canonical_payload;
pub use keys::EPI_HOME_ENV;
pub use keys::KeyError;
pub use keys::KeyManager;
pub use signing::SignatureFailure;
pub use signing::SignatureVerdict;
pub use signing::Signer;
pub use signing::TrustError;
pub use signing::sign_manifest;
pub use signing::verify_embedded_signature;
pub use signing::verify_signature;
