// crates/epi-config/tests/config_defaults.rs
// ============================================================================
// Module: Config Defaults Tests
// Description: Tests for epi.toml defaults, parsing, and fail-closed loading.
// ============================================================================
//! ## Overview
//! Validates configuration defaults and error handling for `epi.toml`.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::fs;
use std::path::PathBuf;

use epi_config::AuditSinkKind;
use epi_config::ConfigError;
use epi_config::EpiConfig;
use tempfile::TempDir;

// ============================================================================
// SECTION: Defaults
// ============================================================================

#[test]
fn empty_file_yields_documented_defaults() {
    let config = EpiConfig::from_toml_str("").unwrap();
    assert_eq!(config, EpiConfig::default());
    assert_eq!(config.recorder.output_dir, PathBuf::from("epi-recordings"));
    assert!(config.recorder.auto_sign);
    assert_eq!(config.recorder.default_key.as_str(), "default");
    assert!(config.recorder.capture_environment);
    assert!(config.recorder.overwrite);
    assert_eq!(config.audit.sink, AuditSinkKind::None);
    assert!(config.keys.dir.is_none());
}

#[test]
fn sections_override_defaults() {
    let config = EpiConfig::from_toml_str(
        r#"
[recorder]
output_dir = "traces"
auto_sign = false
default_key = "ci-signer"

[keys]
dir = "/tmp/epi-keys"

[audit]
sink = "stderr"
"#,
    )
    .unwrap();
    assert_eq!(config.recorder.output_dir, PathBuf::from("traces"));
    assert!(!config.recorder.auto_sign);
    assert_eq!(config.recorder.default_key.as_str(), "ci-signer");
    assert!(config.recorder.overwrite);
    assert_eq!(config.keys.dir, Some(PathBuf::from("/tmp/epi-keys")));
    assert_eq!(config.audit.sink, AuditSinkKind::Stderr);
}

// ============================================================================
// SECTION: Validation
// ============================================================================

#[test]
fn invalid_key_name_is_a_parse_error() {
    let result = EpiConfig::from_toml_str("[recorder]\ndefault_key = \"../evil\"\n");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn file_sink_requires_path() {
    let result = EpiConfig::from_toml_str("[audit]\nsink = \"file\"\n");
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn empty_output_dir_is_rejected() {
    let result = EpiConfig::from_toml_str("[recorder]\noutput_dir = \"\"\n");
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

// ============================================================================
// SECTION: Loading
// ============================================================================

#[test]
fn explicit_missing_file_fails_closed() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.toml");
    assert!(matches!(EpiConfig::load(Some(&missing)), Err(ConfigError::Io(_))));
    assert!(matches!(EpiConfig::load_or_default(Some(&missing)), Err(ConfigError::Io(_))));
}

#[test]
fn non_utf8_and_oversized_files_are_rejected() {
    let dir = TempDir::new().unwrap();
    let binary = dir.path().join("binary.toml");
    fs::write(&binary, [0xff, 0xfe, 0x00]).unwrap();
    assert!(matches!(EpiConfig::load(Some(&binary)), Err(ConfigError::Invalid(_))));

    let huge = dir.path().join("huge.toml");
    fs::write(&huge, format!("# {}\n", "x".repeat(1024 * 1024))).unwrap();
    assert!(matches!(EpiConfig::load(Some(&huge)), Err(ConfigError::Invalid(_))));
}

#[test]
fn file_sink_is_built_from_config() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("epi.toml");
    let audit_path = dir.path().join("audit.jsonl");
    fs::write(
        &config_path,
        format!("[audit]\nsink = \"file\"\npath = {:?}\n", audit_path.display().to_string()),
    )
    .unwrap();
    let config = EpiConfig::load(Some(&config_path)).unwrap();
    let sink = config.build_audit_sink().unwrap();
    sink.record(&epi_core::AuditEvent::new("session_opened", epi_core::AuditEventParams::default()));
    let written = fs::read_to_string(&audit_path).unwrap();
    assert!(written.contains("\"event\":\"session_opened\""));
}

#[test]
fn key_manager_uses_configured_directory() {
    let config = EpiConfig::from_toml_str("[keys]\ndir = \"custom-keys\"\n").unwrap();
    let keys = config.key_manager(config.build_audit_sink().unwrap());
    assert_eq!(keys.dir(), std::path::Path::new("custom-keys"));
}
