// crates/epi-core/src/trust/signing.rs
// ============================================================================
// Module: EPI Manifest Signing
// Description: Ed25519 signing and verification of archive manifests.
// Purpose: Bind a manifest's content to a key for offline provenance checks.
// Dependencies: crate::{core, trust::canonical}, ed25519-dalek
// ============================================================================

//! ## Overview
//! Signing computes the canonical payload of a manifest with any previous
//! signature removed, signs it with Ed25519, and returns a new manifest
//! carrying the hex signature and hex public key. Verification recomputes the
//! same payload and checks it with `verify_strict`.
//!
//! Verification never fails with an error: a negative verdict is ordinary data
//! described by [`SignatureVerdict`]. The verdict depends only on the manifest
//! and the public key bytes, so the embedded key and an externally supplied
//! copy of the same key always agree.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use ed25519_dalek::Signature;
use ed25519_dalek::Signer as _;
use ed25519_dalek::SigningKey;
use ed25519_dalek::VerifyingKey;
use serde::Serialize;
use thiserror::Error;

use crate::core::hashing::hex_decode;
use crate::core::hashing::hex_encode;
use crate::core::identifiers::KeyName;
use crate::core::manifest::Manifest;
use crate::trust::canonical::canonical_payload;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while signing.
#[derive(Debug, Error)]
pub enum TrustError {
    /// Canonical payload could not be produced.
    #[error("failed to canonicalize manifest: {0}")]
    Canonicalization(String),
}

// ============================================================================
// SECTION: Signer
// ============================================================================

/// Named Ed25519 signing key.
pub struct Signer {
    /// Key store name of the key.
    name: KeyName,
    /// Private key material.
    key: SigningKey,
}

impl Signer {
    /// Pairs a signing key with its key store name.
    #[must_use]
    pub const fn new(name: KeyName, key: SigningKey) -> Self {
        Self {
            name,
            key,
        }
    }

    /// Returns the key name.
    #[must_use]
    pub const fn name(&self) -> &KeyName {
        &self.name
    }

    /// Returns the public half of the key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Signs `manifest` and returns the signed copy; the input is not modified.
///
/// Any signature already present is discarded before the payload is computed.
///
/// # Errors
///
/// Returns [`TrustError::Canonicalization`] when the payload cannot be built.
pub fn sign_manifest(manifest: &Manifest, signer: &Signer) -> Result<Manifest, TrustError> {
    let mut signed = manifest.unsigned();
    let payload =
        canonical_payload(&signed).map_err(|err| TrustError::Canonicalization(err.to_string()))?;
    let signature = signer.key.sign(&payload);
    signed.signature = Some(hex_encode(&signature.to_bytes()));
    signed.public_key = Some(hex_encode(signer.verifying_key().as_bytes()));
    Ok(signed)
}

// ============================================================================
// SECTION: Verification
// ============================================================================

/// Failure class of a negative signature verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureFailure {
    /// Manifest carries no signature.
    MissingSignature,
    /// Signature is not 64 bytes of hex.
    MalformedSignature,
    /// Public key is absent, not hex, or not a valid Ed25519 point.
    MalformedPublicKey,
    /// Canonical payload could not be produced.
    Canonicalization,
    /// Signature does not verify for this payload and key.
    Mismatch,
}

/// Outcome of a signature check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureVerdict {
    /// True when the signature verifies.
    pub valid: bool,
    /// Failure class when invalid.
    pub failure: Option<SignatureFailure>,
    /// Human-readable explanation.
    pub message: String,
}

impl SignatureVerdict {
    /// Builds a positive verdict.
    fn valid() -> Self {
        Self {
            valid: true,
            failure: None,
            message: "signature valid".to_string(),
        }
    }

    /// Builds a negative verdict.
    fn invalid(failure: SignatureFailure, message: impl Into<String>) -> Self {
        Self {
            valid: false,
            failure: Some(failure),
            message: message.into(),
        }
    }
}

/// Verifies the embedded signature of `manifest` against `public_key` bytes.
#[must_use]
pub fn verify_signature(manifest: &Manifest, public_key: &[u8]) -> SignatureVerdict {
    let Some(signature_hex) = manifest.signature.as_deref() else {
        return SignatureVerdict::invalid(SignatureFailure::MissingSignature, "manifest is not signed");
    };
    let Some(signature) = hex_decode(signature_hex)
        .and_then(|bytes| Signature::try_from(bytes.as_slice()).ok())
    else {
        return SignatureVerdict::invalid(
            SignatureFailure::MalformedSignature,
            "signature is not a 64-byte hex value",
        );
    };
    let Some(key) = <[u8; 32]>::try_from(public_key)
        .ok()
        .and_then(|bytes| VerifyingKey::from_bytes(&bytes).ok())
    else {
        return SignatureVerdict::invalid(
            SignatureFailure::MalformedPublicKey,
            "public key is not a valid 32-byte ed25519 key",
        );
    };
    let payload = match canonical_payload(manifest) {
        Ok(payload) => payload,
        Err(err) => {
            return SignatureVerdict::invalid(SignatureFailure::Canonicalization, err.to_string());
        }
    };
    match key.verify_strict(&payload, &signature) {
        Ok(()) => SignatureVerdict::valid(),
        Err(_) => SignatureVerdict::invalid(
            SignatureFailure::Mismatch,
            "signature does not match manifest content",
        ),
    }
}

/// Verifies `manifest` using the public key embedded in it.
#[must_use]
pub fn verify_embedded_signature(manifest: &Manifest) -> SignatureVerdict {
    if manifest.signature.is_none() {
        return SignatureVerdict::invalid(SignatureFailure::MissingSignature, "manifest is not signed");
    }
    let Some(key_hex) = manifest.public_key.as_deref() else {
        return SignatureVerdict::invalid(
            SignatureFailure::MalformedPublicKey,
            "manifest carries no public key",
        );
    };
    let Some(key_bytes) = hex_decode(key_hex) else {
        return SignatureVerdict::invalid(
            SignatureFailure::MalformedPublicKey,
            "embedded public key is not hex",
        );
    };
    verify_signature(manifest, &key_bytes)
}
