// crates/epi-core/tests/container.rs
// ============================================================================
// Module: Evidence Container Tests
// Description: Tests for packing, reading, integrity checks, and re-signing.
// ============================================================================
//! ## Overview
//! Packs real staging directories into temporary archives and checks the
//! round-trip, tamper detection, and failure modes.

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
use std::io::Read;
use std::io::Write;
use std::path::Path;

use ed25519_dalek::SigningKey;
use epi_core::ContainerError;
use epi_core::DEFAULT_HASH_ALGORITHM;
use epi_core::IntegrityMismatch;
use epi_core::IntegrityStatus;
use epi_core::KeyName;
use epi_core::Manifest;
use epi_core::PackOptions;
use epi_core::Signer;
use epi_core::Timestamp;
use epi_core::WorkflowId;
use epi_core::container::read_entry;
use epi_core::container::resign;
use epi_core::container::unpack;
use epi_core::hash_bytes;
use epi_core::pack;
use epi_core::read_manifest;
use epi_core::read_steps;
use epi_core::verify_embedded_signature;
use epi_core::verify_integrity;
use tempfile::TempDir;
use zip::ZipArchive;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

// ============================================================================
// SECTION: Helpers
// ============================================================================

const STEP_LINE: &str =
    "{\"kind\":\"x\",\"timestamp\":\"2026-01-01T00:00:00.000000Z\",\"content\":{\"k\":1}}\n";

fn stage(dir: &Path) {
    fs::write(dir.join("steps.jsonl"), STEP_LINE).unwrap();
    fs::create_dir_all(dir.join("artifacts")).unwrap();
    fs::write(dir.join("artifacts/report.txt"), b"quarterly numbers").unwrap();
    fs::write(dir.join("artifacts/a.bin"), [0u8, 1, 2, 3]).unwrap();
}

fn manifest() -> Manifest {
    Manifest::new(WorkflowId::generate(), Timestamp::now())
        .with_goal("G")
        .with_name("nightly")
        .with_tags(vec!["audit".to_string()])
}

fn signer() -> Signer {
    Signer::new(KeyName::new("test").unwrap(), SigningKey::from_bytes(&[5u8; 32]))
}

fn pack_fixture(root: &Path, signer: Option<&Signer>) -> (std::path::PathBuf, Manifest) {
    let staging = root.join("staging");
    fs::create_dir_all(&staging).unwrap();
    stage(&staging);
    let output = root.join("out/run.epi");
    let packed = pack(&staging, &manifest(), &PackOptions {
        output: output.clone(),
        signer,
        overwrite: false,
    })
    .unwrap();
    (output, packed.manifest)
}

/// Rewrites `archive` applying `edit` to each entry; `None` drops the entry.
fn rewrite(archive: &Path, edit: impl Fn(&str, Vec<u8>) -> Option<Vec<u8>>, extra: Option<(&str, &[u8])>) {
    let mut source = ZipArchive::new(fs::File::open(archive).unwrap()).unwrap();
    let mut entries = Vec::new();
    for index in 0 .. source.len() {
        let mut file = source.by_index(index).unwrap();
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).unwrap();
        entries.push((file.name().to_string(), bytes));
    }
    drop(source);
    let mut writer = ZipWriter::new(fs::File::create(archive).unwrap());
    for (name, bytes) in entries {
        if let Some(bytes) = edit(&name, bytes) {
            writer.start_file(name, SimpleFileOptions::default()).unwrap();
            writer.write_all(&bytes).unwrap();
        }
    }
    if let Some((name, bytes)) = extra {
        writer.start_file(name, SimpleFileOptions::default()).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
}

// ============================================================================
// SECTION: Pack and Read
// ============================================================================

#[test]
fn pack_round_trips_manifest_and_orders_entries() {
    let root = TempDir::new().unwrap();
    let (archive, packed) = pack_fixture(root.path(), None);

    let read = read_manifest(&archive).unwrap();
    assert_eq!(read, packed);
    let paths: Vec<&str> = read.file_manifest.paths().collect();
    assert_eq!(paths, vec!["steps.jsonl", "artifacts/a.bin", "artifacts/report.txt"]);
    assert_eq!(
        read.file_manifest.get("artifacts/report.txt").unwrap(),
        hash_bytes(DEFAULT_HASH_ALGORITHM, b"quarterly numbers").value
    );

    let zip = ZipArchive::new(fs::File::open(&archive).unwrap()).unwrap();
    let names: Vec<&str> = zip.file_names().collect();
    assert_eq!(names[0], "mimetype");
    assert_eq!(names[1], "manifest.json");
    assert_eq!(names[2], "steps.jsonl");
    assert_eq!(read_entry(&archive, "mimetype").unwrap(), b"application/vnd.epi+zip");
}

#[test]
fn pack_signs_when_signer_given() {
    let root = TempDir::new().unwrap();
    let signer = signer();
    let (archive, packed) = pack_fixture(root.path(), Some(&signer));
    assert!(packed.signature.is_some());
    let read = read_manifest(&archive).unwrap();
    assert!(verify_embedded_signature(&read).valid);
}

#[test]
fn read_steps_returns_records_in_order() {
    let root = TempDir::new().unwrap();
    let (archive, _) = pack_fixture(root.path(), None);
    let steps = read_steps(&archive).unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].kind.as_str(), "x");
    assert_eq!(steps[0].content["k"], 1);
}

#[test]
fn empty_staging_packs_an_empty_step_log() {
    let root = TempDir::new().unwrap();
    let staging = root.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    let output = root.path().join("empty.epi");
    let packed = pack(&staging, &manifest(), &PackOptions {
        output: output.clone(),
        signer: None,
        overwrite: false,
    })
    .unwrap();
    assert_eq!(packed.manifest.file_manifest.len(), 1);
    assert!(read_steps(&output).unwrap().is_empty());
    assert!(verify_integrity(&output).unwrap().ok());
}

#[test]
fn identical_inputs_produce_identical_bytes() {
    let root = TempDir::new().unwrap();
    let staging = root.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    stage(&staging);
    let manifest = manifest();
    for name in ["a.epi", "b.epi"] {
        pack(&staging, &manifest, &PackOptions {
            output: root.path().join(name),
            signer: None,
            overwrite: false,
        })
        .unwrap();
    }
    assert_eq!(
        fs::read(root.path().join("a.epi")).unwrap(),
        fs::read(root.path().join("b.epi")).unwrap()
    );
}

#[test]
fn existing_destination_requires_overwrite() {
    let root = TempDir::new().unwrap();
    let (archive, _) = pack_fixture(root.path(), None);
    let before = fs::read(&archive).unwrap();
    let result = pack(&root.path().join("staging"), &manifest(), &PackOptions {
        output: archive.clone(),
        signer: None,
        overwrite: false,
    });
    assert!(matches!(result, Err(ContainerError::Exists(_))));
    assert_eq!(fs::read(&archive).unwrap(), before);

    pack(&root.path().join("staging"), &manifest(), &PackOptions {
        output: archive.clone(),
        signer: None,
        overwrite: true,
    })
    .unwrap();
    assert_ne!(fs::read(&archive).unwrap(), before);
}

#[cfg(unix)]
#[test]
fn symlinks_in_staging_are_rejected_without_leaving_an_archive() {
    let root = TempDir::new().unwrap();
    let staging = root.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    stage(&staging);
    std::os::unix::fs::symlink("/etc/hostname", staging.join("link")).unwrap();
    let output = root.path().join("linked.epi");
    let result = pack(&staging, &manifest(), &PackOptions {
        output: output.clone(),
        signer: None,
        overwrite: false,
    });
    assert!(matches!(result, Err(ContainerError::Invalid(_))));
    assert!(!output.exists());
}

#[test]
fn garbage_file_is_corrupt() {
    let root = TempDir::new().unwrap();
    let path = root.path().join("garbage.epi");
    fs::write(&path, b"definitely not a zip").unwrap();
    assert!(matches!(read_manifest(&path), Err(ContainerError::Corrupt { .. })));
    assert!(matches!(verify_integrity(&path), Err(ContainerError::Corrupt { .. })));
}

#[test]
fn unopenable_archive_is_corrupt_and_missing_archive_is_io() {
    let root = TempDir::new().unwrap();
    let blocker = root.path().join("blocker.epi");
    fs::write(&blocker, b"plain file").unwrap();
    let beneath_file = blocker.join("nested.epi");
    assert!(matches!(read_manifest(&beneath_file), Err(ContainerError::Corrupt { .. })));

    let missing = root.path().join("missing.epi");
    assert!(matches!(read_manifest(&missing), Err(ContainerError::Io(_))));
}

#[test]
fn unparsable_manifest_is_corrupt() {
    let root = TempDir::new().unwrap();
    let (archive, _) = pack_fixture(root.path(), None);
    rewrite(
        &archive,
        |name, bytes| if name == "manifest.json" { Some(b"{not json".to_vec()) } else { Some(bytes) },
        None,
    );
    assert!(matches!(read_manifest(&archive), Err(ContainerError::Corrupt { .. })));
}

// ============================================================================
// SECTION: Integrity
// ============================================================================

#[test]
fn untouched_archive_passes_integrity() {
    let root = TempDir::new().unwrap();
    let (archive, _) = pack_fixture(root.path(), Some(&signer()));
    let report = verify_integrity(&archive).unwrap();
    assert!(report.ok());
    assert_eq!(report.status, IntegrityStatus::Pass);
    assert_eq!(report.checked_files, 3);
    assert!(report.undeclared.is_empty());
}

#[test]
fn flipping_one_byte_yields_exactly_one_mismatch() {
    let root = TempDir::new().unwrap();
    let (archive, _) = pack_fixture(root.path(), None);
    rewrite(
        &archive,
        |name, mut bytes| {
            if name == "artifacts/report.txt" {
                bytes[0] ^= 0x01;
            }
            Some(bytes)
        },
        None,
    );
    let report = verify_integrity(&archive).unwrap();
    assert!(!report.ok());
    assert_eq!(report.status, IntegrityStatus::Fail);
    assert_eq!(report.mismatches.len(), 1);
    assert!(matches!(&report.mismatches[0], IntegrityMismatch::HashMismatch { path, .. } if path == "artifacts/report.txt"));
}

#[test]
fn reordered_steps_are_detected() {
    let root = TempDir::new().unwrap();
    let staging = root.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    let second = STEP_LINE.replace("\"x\"", "\"y\"");
    fs::write(staging.join("steps.jsonl"), format!("{STEP_LINE}{second}")).unwrap();
    let archive = root.path().join("ordered.epi");
    pack(&staging, &manifest(), &PackOptions {
        output: archive.clone(),
        signer: None,
        overwrite: false,
    })
    .unwrap();
    let swapped = format!("{second}{STEP_LINE}").into_bytes();
    rewrite(&archive, |name, bytes| if name == "steps.jsonl" { Some(swapped.clone()) } else { Some(bytes) }, None);

    let report = verify_integrity(&archive).unwrap();
    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(report.mismatches[0].path(), "steps.jsonl");
}

#[test]
fn missing_declared_file_is_fatal_and_extra_file_is_informational() {
    let root = TempDir::new().unwrap();
    let (archive, _) = pack_fixture(root.path(), None);
    rewrite(
        &archive,
        |name, bytes| if name == "artifacts/a.bin" { None } else { Some(bytes) },
        Some(("notes/extra.txt", b"sneaky")),
    );
    let report = verify_integrity(&archive).unwrap();
    assert_eq!(report.mismatches, vec![IntegrityMismatch::Missing {
        path: "artifacts/a.bin".to_string()
    }]);
    assert_eq!(report.undeclared, vec!["notes/extra.txt".to_string()]);
}

#[test]
fn extra_file_alone_does_not_fail_integrity() {
    let root = TempDir::new().unwrap();
    let (archive, _) = pack_fixture(root.path(), None);
    rewrite(&archive, |_, bytes| Some(bytes), Some(("extra.txt", b"hello")));
    let report = verify_integrity(&archive).unwrap();
    assert!(report.ok());
    assert_eq!(report.undeclared, vec!["extra.txt".to_string()]);
}

// ============================================================================
// SECTION: Unpack and Re-sign
// ============================================================================

#[test]
fn unpack_extracts_every_entry() {
    let root = TempDir::new().unwrap();
    let (archive, _) = pack_fixture(root.path(), None);
    let dest = root.path().join("unpacked");
    let extracted = unpack(&archive, &dest).unwrap();
    assert!(extracted.contains(&"manifest.json".to_string()));
    assert_eq!(fs::read(dest.join("artifacts/report.txt")).unwrap(), b"quarterly numbers");
    assert_eq!(fs::read_to_string(dest.join("steps.jsonl")).unwrap(), STEP_LINE);
}

#[test]
fn unpack_rejects_escaping_entries() {
    let root = TempDir::new().unwrap();
    let archive = root.path().join("evil.epi");
    let mut writer = ZipWriter::new(fs::File::create(&archive).unwrap());
    writer.start_file("../escape.txt", SimpleFileOptions::default()).unwrap();
    writer.write_all(b"nope").unwrap();
    writer.finish().unwrap();

    let dest = root.path().join("dest");
    assert!(matches!(unpack(&archive, &dest), Err(ContainerError::Path(_))));
    assert!(!root.path().join("escape.txt").exists());
}

#[test]
fn resign_writes_a_new_archive_and_keeps_source() {
    let root = TempDir::new().unwrap();
    let (archive, original) = pack_fixture(root.path(), None);
    let before = fs::read(&archive).unwrap();

    let signer = signer();
    let target = root.path().join("signed.epi");
    let resigned = resign(&archive, &target, &signer, false).unwrap();
    assert!(verify_embedded_signature(&resigned.manifest).valid);
    assert_eq!(resigned.manifest.unsigned(), original);
    assert_eq!(fs::read(&archive).unwrap(), before);
    assert!(verify_integrity(&target).unwrap().ok());
    assert!(verify_embedded_signature(&read_manifest(&target).unwrap()).valid);

    assert!(matches!(resign(&archive, &archive, &signer, true), Err(ContainerError::Invalid(_))));
}
