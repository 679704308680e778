// crates/epi-core/src/container/archive.rs
// ============================================================================
// Module: EPI Archive Packing
// Description: Packs staging directories into ZIP evidence archives and reads them back.
// Purpose: Produce archives that are either fully written or absent.
// Dependencies: crate::{core, trust, container::paths}, serde_json, tempfile, zip
// ============================================================================

//! ## Overview
//! An archive is a ZIP package with a stored `mimetype` entry first, then
//! `manifest.json`, then `steps.jsonl`, then artifacts in lexicographic
//! order. Packing hashes every staged file into the manifest's
//! `file_manifest`, optionally signs the manifest, and writes the package to a
//! temporary file beside the destination before renaming it into place.
//!
//! Entry timestamps are pinned so identical staging content and manifest
//! produce identical archive bytes.
//!
//! Security posture: archives read from disk are untrusted; entry paths are
//! validated before extraction and the manifest is size-capped.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use thiserror::Error;
use zip::CompressionMethod;
use zip::DateTime;
use zip::ZipArchive;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::hash_reader;
use crate::core::manifest::FileManifest;
use crate::core::manifest::Manifest;
use crate::core::step::StepRecord;
use crate::core::step::parse_steps_jsonl;
use crate::container::paths::PathResolutionError;
use crate::container::paths::ensure_relative_entry_path;
use crate::container::paths::entry_path_from_relative;
use crate::trust::keys::KeyError;
use crate::trust::signing::Signer;
use crate::trust::signing::TrustError;
use crate::trust::signing::sign_manifest;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Manifest entry name.
pub const MANIFEST_PATH: &str = "manifest.json";
/// Step log entry name.
pub const STEPS_PATH: &str = "steps.jsonl";
/// Media type marker entry name.
pub const MIMETYPE_PATH: &str = "mimetype";
/// Media type stored in the marker entry.
pub const MIMETYPE: &str = "application/vnd.epi+zip";
/// Maximum accepted size of `manifest.json`.
pub const MAX_MANIFEST_BYTES: u64 = 16 * 1024 * 1024;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Evidence container errors.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// Package or manifest is unreadable or unparsable.
    #[error("corrupt archive {path}: {message}")]
    Corrupt {
        /// Archive path.
        path: String,
        /// Failure detail.
        message: String,
    },
    /// Requested entry does not exist in the archive.
    #[error("archive entry not found: {0}")]
    EntryNotFound(String),
    /// Destination archive already exists and overwrite was not requested.
    #[error("archive already exists: {0}")]
    Exists(String),
    /// Filesystem I/O failed.
    #[error("archive io error: {0}")]
    Io(String),
    /// Staging content or arguments are invalid.
    #[error("invalid archive input: {0}")]
    Invalid(String),
    /// Path failed validation.
    #[error(transparent)]
    Path(#[from] PathResolutionError),
    /// Signing failed.
    #[error(transparent)]
    Trust(#[from] TrustError),
    /// Key store failed.
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl ContainerError {
    /// Builds a corrupt-archive error for `path`.
    fn corrupt(path: &Path, message: impl ToString) -> Self {
        Self::Corrupt {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }
}

/// Maps an I/O error into a container error.
fn io_error(err: &io::Error) -> ContainerError {
    ContainerError::Io(err.to_string())
}

// ============================================================================
// SECTION: Pack
// ============================================================================

/// Options controlling [`pack`].
#[derive(Debug)]
pub struct PackOptions<'a> {
    /// Final archive path.
    pub output: PathBuf,
    /// Signer applied to the manifest after hashing, when present.
    pub signer: Option<&'a Signer>,
    /// Replace an existing archive at `output`.
    pub overwrite: bool,
}

/// Result of a successful pack.
#[derive(Debug, Clone)]
pub struct PackedArchive {
    /// Archive path on disk.
    pub path: PathBuf,
    /// Manifest exactly as written into the archive.
    pub manifest: Manifest,
}

/// Packs `staging` into a new archive described by `manifest`.
///
/// `manifest.file_manifest` is rebuilt from the staged files: `steps.jsonl`
/// first (empty when not staged), then every other regular file in
/// lexicographic order. Root-level `manifest.json` and `mimetype` are reserved
/// and skipped.
///
/// # Errors
///
/// Returns [`ContainerError`] when staging is invalid (symlinks, special
/// files, bad names), the destination exists without `overwrite`, signing
/// fails, or writing fails. No archive is left at `output` on error.
pub fn pack(
    staging: &Path,
    manifest: &Manifest,
    options: &PackOptions<'_>,
) -> Result<PackedArchive, ContainerError> {
    let staged = collect_staged_files(staging)?;

    let mut file_manifest = FileManifest::new();
    for (entry, source) in &staged {
        let digest = match source {
            Some(path) => {
                let mut file = fs::File::open(path).map_err(|err| io_error(&err))?;
                hash_reader(DEFAULT_HASH_ALGORITHM, &mut file)
                    .map_err(|err| ContainerError::Io(err.to_string()))?
            }
            None => hash_reader(DEFAULT_HASH_ALGORITHM, &mut io::empty())
                .map_err(|err| ContainerError::Io(err.to_string()))?,
        };
        file_manifest.insert(entry.clone(), digest.value);
    }

    let mut manifest = manifest.unsigned();
    manifest.file_manifest = file_manifest;
    if let Some(signer) = options.signer {
        manifest = sign_manifest(&manifest, signer)?;
    }

    let mut writer = ArchiveWriter::create(&options.output, options.overwrite)?;
    writer.write_manifest(&manifest)?;
    for (entry, source) in &staged {
        match source {
            Some(path) => {
                let mut file = fs::File::open(path).map_err(|err| io_error(&err))?;
                writer.write_entry(entry, CompressionMethod::Deflated, &mut file)?;
            }
            None => writer.write_entry(entry, CompressionMethod::Deflated, &mut io::empty())?,
        }
    }
    writer.persist()?;

    Ok(PackedArchive {
        path: options.output.clone(),
        manifest,
    })
}

/// Lists staged files in packing order. `None` marks a synthesized empty step log.
fn collect_staged_files(staging: &Path) -> Result<Vec<(String, Option<PathBuf>)>, ContainerError> {
    let metadata = fs::symlink_metadata(staging).map_err(|err| io_error(&err))?;
    if !metadata.is_dir() {
        return Err(ContainerError::Invalid(format!(
            "staging path is not a directory: {}",
            staging.display()
        )));
    }
    let mut files = Vec::new();
    collect_dir_recursive(staging, staging, &mut files)?;
    files.sort_by(|left, right| left.0.cmp(&right.0));

    let mut ordered = Vec::with_capacity(files.len() + 1);
    let steps = files.iter().position(|(entry, _)| entry == STEPS_PATH);
    match steps {
        Some(index) => {
            let (entry, path) = files.remove(index);
            ordered.push((entry, Some(path)));
        }
        None => ordered.push((STEPS_PATH.to_string(), None)),
    }
    ordered.extend(files.into_iter().map(|(entry, path)| (entry, Some(path))));
    Ok(ordered)
}

/// Walks a staging directory, rejecting symlinks and special files.
fn collect_dir_recursive(
    root: &Path,
    dir: &Path,
    files: &mut Vec<(String, PathBuf)>,
) -> Result<(), ContainerError> {
    for entry in fs::read_dir(dir).map_err(|err| io_error(&err))? {
        let entry = entry.map_err(|err| io_error(&err))?;
        let file_type = entry.file_type().map_err(|err| io_error(&err))?;
        let entry_path = entry.path();
        if file_type.is_symlink() {
            return Err(ContainerError::Invalid(format!(
                "staging must not contain symlinks: {}",
                entry_path.display()
            )));
        }
        let relative = entry_path
            .strip_prefix(root)
            .map_err(|_| ContainerError::Invalid("staging path invalid".to_string()))?;
        if file_type.is_dir() {
            collect_dir_recursive(root, &entry_path, files)?;
        } else if file_type.is_file() {
            let name = entry_path_from_relative(relative)?;
            if name == MANIFEST_PATH || name == MIMETYPE_PATH {
                continue;
            }
            files.push((name, entry_path));
        } else {
            return Err(ContainerError::Invalid(format!(
                "staging must contain only files and directories: {}",
                entry_path.display()
            )));
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Archive Writer
// ============================================================================

/// ZIP writer backed by a temporary file beside the destination.
struct ArchiveWriter {
    /// Final destination.
    output: PathBuf,
    /// Replace an existing destination.
    overwrite: bool,
    /// Package under construction.
    zip: ZipWriter<NamedTempFile>,
}

impl ArchiveWriter {
    /// Opens a temporary package next to `output` and writes the `mimetype` marker.
    fn create(output: &Path, overwrite: bool) -> Result<Self, ContainerError> {
        if !overwrite && output.exists() {
            return Err(ContainerError::Exists(output.display().to_string()));
        }
        let parent = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|err| io_error(&err))?;
        let temp = tempfile::Builder::new()
            .prefix(".epi-pack-")
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|err| io_error(&err))?;
        let mut writer = Self {
            output: output.to_path_buf(),
            overwrite,
            zip: ZipWriter::new(temp),
        };
        writer.write_entry(MIMETYPE_PATH, CompressionMethod::Stored, &mut MIMETYPE.as_bytes())?;
        Ok(writer)
    }

    /// Writes `manifest.json` as pretty JSON.
    fn write_manifest(&mut self, manifest: &Manifest) -> Result<(), ContainerError> {
        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|err| ContainerError::Invalid(err.to_string()))?;
        self.write_entry(MANIFEST_PATH, CompressionMethod::Deflated, &mut bytes.as_slice())
    }

    /// Streams one entry into the package.
    fn write_entry<R: Read>(
        &mut self,
        name: &str,
        method: CompressionMethod,
        reader: &mut R,
    ) -> Result<(), ContainerError> {
        let options = SimpleFileOptions::default()
            .compression_method(method)
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644);
        self.zip
            .start_file(name, options)
            .map_err(|err| ContainerError::Io(err.to_string()))?;
        io::copy(reader, &mut self.zip).map_err(|err| io_error(&err))?;
        Ok(())
    }

    /// Finishes the package and moves it into place.
    fn persist(self) -> Result<(), ContainerError> {
        let temp = self.zip.finish().map_err(|err| ContainerError::Io(err.to_string()))?;
        temp.as_file().sync_all().map_err(|err| io_error(&err))?;
        let display = self.output.display().to_string();
        if self.overwrite {
            temp.persist(&self.output).map_err(|err| io_error(&err.error))?;
        } else {
            temp.persist_noclobber(&self.output).map_err(|err| {
                if err.error.kind() == io::ErrorKind::AlreadyExists {
                    ContainerError::Exists(display)
                } else {
                    io_error(&err.error)
                }
            })?;
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Read
// ============================================================================

/// Opens an archive for random access.
///
/// # Errors
///
/// Returns [`ContainerError::Io`] when the file does not exist or
/// [`ContainerError::Corrupt`] when it cannot be opened or is not a readable
/// ZIP package.
pub fn open_archive(archive: &Path) -> Result<ZipArchive<fs::File>, ContainerError> {
    let file = fs::File::open(archive).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            io_error(&err)
        } else {
            ContainerError::corrupt(archive, err)
        }
    })?;
    ZipArchive::new(file).map_err(|err| ContainerError::corrupt(archive, err))
}

/// Reads `manifest.json` from an opened archive.
pub(crate) fn read_manifest_from(
    zip: &mut ZipArchive<fs::File>,
    archive: &Path,
) -> Result<Manifest, ContainerError> {
    let entry = zip
        .by_name(MANIFEST_PATH)
        .map_err(|_| ContainerError::corrupt(archive, "manifest.json missing"))?;
    if entry.size() > MAX_MANIFEST_BYTES {
        return Err(ContainerError::corrupt(archive, "manifest.json exceeds size limit"));
    }
    let mut bytes = Vec::new();
    entry
        .take(MAX_MANIFEST_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| ContainerError::corrupt(archive, err))?;
    if bytes.len() as u64 > MAX_MANIFEST_BYTES {
        return Err(ContainerError::corrupt(archive, "manifest.json exceeds size limit"));
    }
    serde_json::from_slice(&bytes).map_err(|err| ContainerError::corrupt(archive, err))
}

/// Reads and parses the manifest of `archive`.
///
/// # Errors
///
/// Returns [`ContainerError::Corrupt`] when the package or manifest is
/// unreadable, or [`ContainerError::Io`] when no file exists at `archive`.
pub fn read_manifest(archive: &Path) -> Result<Manifest, ContainerError> {
    let mut zip = open_archive(archive)?;
    read_manifest_from(&mut zip, archive)
}

/// Reads the raw bytes of one entry.
///
/// # Errors
///
/// Returns [`ContainerError::EntryNotFound`] when absent or
/// [`ContainerError::Corrupt`] when the entry cannot be decompressed.
pub fn read_entry(archive: &Path, entry: &str) -> Result<Vec<u8>, ContainerError> {
    ensure_relative_entry_path(entry)?;
    let mut zip = open_archive(archive)?;
    let mut file = zip
        .by_name(entry)
        .map_err(|_| ContainerError::EntryNotFound(entry.to_string()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|err| ContainerError::corrupt(archive, err))?;
    Ok(bytes)
}

/// Reads the ordered step records of `archive`.
///
/// # Errors
///
/// Returns [`ContainerError::Corrupt`] when the step log is missing or malformed.
pub fn read_steps(archive: &Path) -> Result<Vec<StepRecord>, ContainerError> {
    let bytes = match read_entry(archive, STEPS_PATH) {
        Ok(bytes) => bytes,
        Err(ContainerError::EntryNotFound(_)) => {
            return Err(ContainerError::corrupt(archive, "steps.jsonl missing"));
        }
        Err(err) => return Err(err),
    };
    parse_steps_jsonl(&bytes).map_err(|err| ContainerError::corrupt(archive, err))
}

/// Extracts every entry of `archive` under `destination`.
///
/// # Errors
///
/// Returns [`ContainerError::Path`] for entry paths that are absolute or
/// escape `destination`, and [`ContainerError::Io`] on write failures.
pub fn unpack(archive: &Path, destination: &Path) -> Result<Vec<String>, ContainerError> {
    let mut zip = open_archive(archive)?;
    fs::create_dir_all(destination).map_err(|err| io_error(&err))?;
    let mut extracted = Vec::new();
    for index in 0 .. zip.len() {
        let mut file = zip.by_index(index).map_err(|err| ContainerError::corrupt(archive, err))?;
        let name = file.name().to_string();
        if file.is_dir() {
            let trimmed = name.trim_end_matches('/');
            ensure_relative_entry_path(trimmed)?;
            fs::create_dir_all(destination.join(trimmed)).map_err(|err| io_error(&err))?;
            continue;
        }
        ensure_relative_entry_path(&name)?;
        let target = destination.join(&name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(&err))?;
        }
        let mut out = fs::File::create(&target).map_err(|err| io_error(&err))?;
        io::copy(&mut file, &mut out).map_err(|err| ContainerError::corrupt(archive, err))?;
        out.flush().map_err(|err| io_error(&err))?;
        extracted.push(name);
    }
    Ok(extracted)
}

// ============================================================================
// SECTION: Re-sign
// ============================================================================

/// Writes a new archive at `destination` whose manifest is signed by `signer`.
///
/// Entries other than `manifest.json` are copied unchanged and in order.
/// Closed archives are immutable, so `destination` must differ from `source`.
///
/// # Errors
///
/// Returns [`ContainerError::Invalid`] when `destination` is `source`, plus the
/// errors of [`read_manifest`] and [`pack`].
pub fn resign(
    source: &Path,
    destination: &Path,
    signer: &Signer,
    overwrite: bool,
) -> Result<PackedArchive, ContainerError> {
    if same_file(source, destination) {
        return Err(ContainerError::Invalid(
            "re-signing must write a new archive, not the source".to_string(),
        ));
    }
    let mut zip = open_archive(source)?;
    let manifest = sign_manifest(&read_manifest_from(&mut zip, source)?, signer)?;

    let mut writer = ArchiveWriter::create(destination, overwrite)?;
    writer.write_manifest(&manifest)?;
    for index in 0 .. zip.len() {
        let mut file = zip.by_index(index).map_err(|err| ContainerError::corrupt(source, err))?;
        let name = file.name().to_string();
        if file.is_dir() || name == MANIFEST_PATH || name == MIMETYPE_PATH {
            continue;
        }
        ensure_relative_entry_path(&name)?;
        let method = file.compression();
        writer.write_entry(&name, method, &mut file)?;
    }
    writer.persist()?;

    Ok(PackedArchive {
        path: destination.to_path_buf(),
        manifest,
    })
}

/// Returns true when both paths name the same file.
fn same_file(left: &Path, right: &Path) -> bool {
    if left == right {
        return true;
    }
    match (fs::canonicalize(left), fs::canonicalize(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}
