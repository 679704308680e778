// crates/epi-core/tests/paths.rs
// ============================================================================
// Module: Path Resolution Tests
// Description: Tests for output path resolution and entry path validation.
// Purpose: Check the recordings-directory convention and idempotence.
// ============================================================================

//! Output path resolution properties.

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
    reason = "Test-only assertions and helpers are permitted."
)]

use std::path::Path;
use std::path::PathBuf;

use epi_core::PathResolutionError;
use epi_core::container::DEFAULT_RECORDINGS_DIR;
use epi_core::container::ensure_relative_entry_path;
use epi_core::resolve_output_path;
use proptest::prelude::*;

fn resolve(input: &str) -> PathBuf {
    resolve_output_path(Some(Path::new(input)), Path::new(DEFAULT_RECORDINGS_DIR)).unwrap()
}

// ============================================================================
// SECTION: Convention Cases
// ============================================================================

#[test]
fn bare_file_name_lands_in_default_directory() {
    assert_eq!(resolve("test.epi"), Path::new("epi-recordings/test.epi"));
}

#[test]
fn path_already_in_default_directory_is_not_nested() {
    assert_eq!(resolve("epi-recordings/test.epi"), Path::new("epi-recordings/test.epi"));
    assert_eq!(resolve("./epi-recordings/test.epi"), Path::new("./epi-recordings/test.epi"));
}

#[test]
fn explicit_subdirectory_is_kept() {
    assert_eq!(resolve("subdir/test.epi"), Path::new("subdir/test.epi"));
}

#[cfg(unix)]
#[test]
fn absolute_path_is_kept() {
    assert_eq!(resolve("/absolute/path/test.epi"), Path::new("/absolute/path/test.epi"));
}

#[test]
fn missing_extension_is_added() {
    assert_eq!(resolve("recording"), Path::new("epi-recordings/recording.epi"));
    assert_eq!(resolve("notes/run"), Path::new("notes/run.epi"));
}

#[test]
fn no_path_generates_a_name_in_default_directory() {
    let path = resolve_output_path(None, Path::new(DEFAULT_RECORDINGS_DIR)).unwrap();
    assert_eq!(path.parent().unwrap(), Path::new(DEFAULT_RECORDINGS_DIR));
    let name = path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("recording_"));
    assert!(name.ends_with(".epi"));
    // recording_ + YYYYMMDD_HHMMSS + _ + 8 hex + .epi
    assert_eq!(name.len(), "recording_".len() + 15 + 1 + 8 + 4);
}

#[test]
fn unusable_paths_are_rejected() {
    let default_dir = Path::new(DEFAULT_RECORDINGS_DIR);
    assert_eq!(resolve_output_path(Some(Path::new("")), default_dir), Err(PathResolutionError::Empty));
    assert!(matches!(
        resolve_output_path(Some(Path::new("..")), default_dir),
        Err(PathResolutionError::MissingFileName(_))
    ));
    let long = "a".repeat(300);
    assert!(matches!(
        resolve_output_path(Some(Path::new(&long)), default_dir),
        Err(PathResolutionError::TooLong(_))
    ));
}

// ============================================================================
// SECTION: Entry Paths
// ============================================================================

#[test]
fn entry_paths_must_stay_inside_the_archive() {
    assert!(ensure_relative_entry_path("artifacts/out.json").is_ok());
    for bad in ["", "/etc/passwd", "../up", "a/../b", "a//b", "./a", "a\\b", "C:evil"] {
        assert!(ensure_relative_entry_path(bad).is_err(), "{bad} should be rejected");
    }
}

// ============================================================================
// SECTION: Idempotence
// ============================================================================

proptest! {
    #[test]
    fn resolution_is_idempotent(
        dirs in prop::collection::vec("[a-z]{1,8}", 0 .. 3),
        stem in "[a-z][a-z0-9_]{0,11}",
        with_ext in any::<bool>(),
        under_default in any::<bool>(),
    ) {
        let mut input = PathBuf::new();
        if under_default {
            input.push(DEFAULT_RECORDINGS_DIR);
        }
        for dir in &dirs {
            input.push(dir);
        }
        input.push(if with_ext { format!("{stem}.epi") } else { stem.clone() });

        let default_dir = Path::new(DEFAULT_RECORDINGS_DIR);
        let once = resolve_output_path(Some(input.as_path()), default_dir).unwrap();
        let twice = resolve_output_path(Some(once.as_path()), default_dir).unwrap();
        prop_assert_eq!(&once, &twice);

        let doubled = once.components().filter(|c| c.as_os_str() == DEFAULT_RECORDINGS_DIR).count();
        prop_assert!(doubled <= 1);
    }
}
