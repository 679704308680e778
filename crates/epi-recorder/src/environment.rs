// crates/epi-recorder/src/environment.rs
// ============================================================================
// Module: EPI Environment Capture
// Description: Snapshot of the host recorded as an implicit step.
// Purpose: Tie an archive to the platform and process that produced it.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Environment capture records static facts about the recording process.
//! Apart from the host name lookup, environment variables are not recorded.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;

use serde::Serialize;
use serde_json::Value;

// ============================================================================
// SECTION: Snapshot
// ============================================================================

/// Host facts recorded at finalize.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentSnapshot {
    /// Operating system name.
    pub os: &'static str,
    /// CPU architecture.
    pub arch: &'static str,
    /// OS family.
    pub family: &'static str,
    /// Version of this recorder.
    pub recorder_version: &'static str,
    /// Recording process identifier.
    pub process_id: u32,
    /// Working directory, when readable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Host name, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl EnvironmentSnapshot {
    /// Captures the current process environment.
    #[must_use]
    pub fn capture() -> Self {
        Self {
            os: env::consts::OS,
            arch: env::consts::ARCH,
            family: env::consts::FAMILY,
            recorder_version: env!("CARGO_PKG_VERSION"),
            process_id: std::process::id(),
            working_directory: env::current_dir().ok().map(|dir| dir.display().to_string()),
            hostname: hostname(),
        }
    }
}

/// Returns the environment snapshot as step content.
#[must_use]
pub fn capture_environment() -> Value {
    serde_json::to_value(EnvironmentSnapshot::capture()).unwrap_or(Value::Null)
}

/// Best-effort host name lookup.
fn hostname() -> Option<String> {
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(value) = env::var(var)
            && !value.trim().is_empty()
        {
            return Some(value.trim().to_string());
        }
    }
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}
