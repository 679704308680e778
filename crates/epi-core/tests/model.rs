// crates/epi-core/tests/model.rs
// ============================================================================
// Module: Data Model Tests
// Description: Tests for timestamps, identifiers, manifests, and step logs.
// ============================================================================
//! ## Overview
//! Validates wire formats of the archive data model.

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

use epi_core::FileManifest;
use epi_core::KeyName;
use epi_core::Manifest;
use epi_core::SPEC_VERSION;
use epi_core::StepKind;
use epi_core::StepRecord;
use epi_core::Timestamp;
use epi_core::WorkflowId;
use epi_core::parse_steps_jsonl;
use serde_json::json;

// ============================================================================
// SECTION: Timestamps
// ============================================================================

#[test]
fn timestamp_renders_six_fractional_digits() {
    let ts = Timestamp::parse("2026-01-02T03:04:05.1Z").unwrap();
    assert_eq!(ts.to_string(), "2026-01-02T03:04:05.100000Z");
}

#[test]
fn timestamp_truncates_to_microseconds_and_normalizes_offset() {
    let ts = Timestamp::parse("2026-01-02T05:04:05.123456789+02:00").unwrap();
    assert_eq!(ts.to_string(), "2026-01-02T03:04:05.123456Z");
}

#[test]
fn timestamp_accepts_naive_iso_as_utc() {
    let ts = Timestamp::parse("2026-01-02T03:04:05.250000").unwrap();
    assert_eq!(ts.to_string(), "2026-01-02T03:04:05.250000Z");
}

#[test]
fn timestamp_reserializes_to_identical_text() {
    let now = Timestamp::now();
    let text = serde_json::to_string(&now).unwrap();
    let parsed: Timestamp = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, now);
    assert_eq!(serde_json::to_string(&parsed).unwrap(), text);
}

#[test]
fn timestamp_rejects_garbage() {
    assert!(Timestamp::parse("yesterday").is_none());
    assert!(serde_json::from_str::<Timestamp>("\"2026-13-01T00:00:00Z\"").is_err());
}

// ============================================================================
// SECTION: Identifiers
// ============================================================================

#[test]
fn key_names_are_validated() {
    assert!(KeyName::new("default").is_ok());
    assert!(KeyName::new("team_a.prod-2").is_ok());
    assert!(KeyName::new("").is_err());
    assert!(KeyName::new(".hidden").is_err());
    assert!(KeyName::new("../escape").is_err());
    assert!(KeyName::new("a/b").is_err());
    assert!(KeyName::new("x".repeat(65)).is_err());
}

#[test]
fn step_kinds_reject_whitespace_and_control_characters() {
    assert!(StepKind::new("llm.request").is_ok());
    assert!(StepKind::new("").is_err());
    assert!(StepKind::new("has space").is_err());
    assert!(StepKind::new("tab\there").is_err());
    assert!(StepKind::new("k".repeat(129)).is_err());
    assert_eq!(StepKind::new("llm.request").unwrap().namespace(), "llm");
}

#[test]
fn workflow_id_round_trips_as_hyphenated_uuid() {
    let id = WorkflowId::generate();
    let text = id.to_string();
    assert_eq!(text.len(), 36);
    assert_eq!(text.parse::<WorkflowId>().unwrap(), id);
    assert_eq!(id.short().len(), 8);
}

// ============================================================================
// SECTION: Manifest
// ============================================================================

#[test]
fn file_manifest_preserves_insertion_order_on_the_wire() {
    let mut files = FileManifest::new();
    files.insert("steps.jsonl", "bb");
    files.insert("artifacts/a.txt", "aa");
    files.insert("steps.jsonl", "cc");
    let text = serde_json::to_string(&files).unwrap();
    assert_eq!(text, r#"{"steps.jsonl":"cc","artifacts/a.txt":"aa"}"#);
}

#[test]
fn file_manifest_rejects_duplicate_paths() {
    let result = serde_json::from_str::<FileManifest>(r#"{"a":"1","a":"2"}"#);
    assert!(result.is_err());
}

#[test]
fn manifest_omits_absent_optionals_and_ignores_unknown_fields() {
    let manifest = Manifest::new(WorkflowId::generate(), Timestamp::now());
    let value = serde_json::to_value(&manifest).unwrap();
    let object = value.as_object().unwrap();
    assert_eq!(object["spec_version"], json!(SPEC_VERSION));
    for absent in ["goal", "name", "tags", "signature", "public_key"] {
        assert!(!object.contains_key(absent), "{absent} should be omitted");
    }

    let mut extended = value;
    extended["cli_command"] = json!("epi run");
    let parsed: Manifest = serde_json::from_value(extended).unwrap();
    assert_eq!(parsed, manifest);
}

// ============================================================================
// SECTION: Step Log
// ============================================================================

#[test]
fn steps_jsonl_preserves_line_order() {
    let first = StepRecord::now(StepKind::new("a").unwrap(), json!({"n": 1}));
    let second = StepRecord::now(StepKind::new("b").unwrap(), json!({"n": 2}));
    let mut bytes = first.to_json_line().unwrap();
    bytes.extend(second.to_json_line().unwrap());
    bytes.extend(b"\n");

    let steps = parse_steps_jsonl(&bytes).unwrap();
    assert_eq!(steps, vec![first, second]);
}

#[test]
fn steps_jsonl_reports_bad_line_number() {
    let bytes = b"{\"kind\":\"a\",\"timestamp\":\"2026-01-01T00:00:00.000000Z\",\"content\":1}\nnot json\n";
    let err = parse_steps_jsonl(bytes).unwrap_err();
    assert_eq!(err.line, 2);
}
