//! Safe archive I/O: validation against hostile zips, extraction into a
//! scratch tree, and the attribute-preserving repackager.
//!
//! Repackaging is deliberately conservative: entries we did not touch are
//! copied verbatim (raw compressed bytes, extra fields, `__MACOSX/`
//! metadata and all), because LMS players are sensitive to entry attributes
//! that a naive rewrite would discard.

use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path};

use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::{Result, TranslateError, UnsafeArchiveKind};
use crate::filename::clean_entry_name;

/// Hard limits applied before any entry is decompressed.
pub const MAX_ENTRIES: usize = 10_000;
pub const MAX_TOTAL_UNCOMPRESSED: u64 = 1024 * 1024 * 1024; // 1 GiB
pub const MAX_COMPRESSION_RATIO: u64 = 100;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Outcome of the pre-extraction scan of the central directory.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub entry_count: usize,
    pub total_uncompressed: u64,
    /// Cleaned name of the manifest entry, if one was found.
    pub manifest_entry: Option<String>,
    /// Directory prefix of the manifest entry ("" or "courseName/").
    pub root_prefix: String,
}

fn unsafe_archive(subkind: UnsafeArchiveKind, detail: String) -> TranslateError {
    TranslateError::UnsafeArchive { subkind, detail }
}

/// True when a cleaned entry name would resolve outside the extraction root.
fn escapes_root(name: &str) -> bool {
    let path = Path::new(name);
    path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
}

/// Scan the central directory and reject bombs, traversal and symlinks
/// before reading a single entry body. Also locates the manifest entry.
pub fn validate_archive(zip_path: &Path) -> Result<ValidationReport> {
    let file = fs::File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;

    if archive.len() > MAX_ENTRIES {
        return Err(unsafe_archive(
            UnsafeArchiveKind::TooManyEntries,
            format!("{} entries (limit {})", archive.len(), MAX_ENTRIES),
        ));
    }

    let mut total_uncompressed: u64 = 0;
    let mut manifest_entry: Option<String> = None;

    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        let name = clean_entry_name(&String::from_utf8_lossy(entry.name_raw()));

        if escapes_root(&name) {
            return Err(unsafe_archive(
                UnsafeArchiveKind::PathTraversal,
                format!("entry '{}'", name),
            ));
        }

        if let Some(mode) = entry.unix_mode() {
            if mode & S_IFMT == S_IFLNK {
                return Err(unsafe_archive(
                    UnsafeArchiveKind::SymlinkEntry,
                    format!("entry '{}'", name),
                ));
            }
        }

        let size = entry.size();
        let compressed = entry.compressed_size();
        total_uncompressed = total_uncompressed.saturating_add(size);

        if total_uncompressed > MAX_TOTAL_UNCOMPRESSED {
            return Err(unsafe_archive(
                UnsafeArchiveKind::TotalSizeExceeded,
                format!("{} bytes uncompressed (limit {})", total_uncompressed, MAX_TOTAL_UNCOMPRESSED),
            ));
        }

        if size > 0 && (compressed == 0 || size / compressed.max(1) > MAX_COMPRESSION_RATIO) {
            return Err(unsafe_archive(
                UnsafeArchiveKind::CompressionRatioExceeded,
                format!("entry '{}': {} -> {} bytes", name, compressed, size),
            ));
        }

        // First manifest wins; Finder resource forks are not manifests.
        if manifest_entry.is_none()
            && !name.starts_with("__MACOSX/")
            && name
                .rsplit('/')
                .next()
                .map(|base| base.eq_ignore_ascii_case("imsmanifest.xml"))
                .unwrap_or(false)
        {
            manifest_entry = Some(name.clone());
        }
    }

    let root_prefix = manifest_entry
        .as_deref()
        .and_then(|m| m.rfind('/').map(|pos| m[..pos + 1].to_string()))
        .unwrap_or_default();

    Ok(ValidationReport {
        entry_count: archive.len(),
        total_uncompressed,
        manifest_entry,
        root_prefix,
    })
}

/// Stream-extract a validated archive into `dest`. Entry names are repaired
/// and NFC-normalized on the way out; the scratch tree therefore contains
/// exactly the archive's file tree under cleaned names.
pub fn extract_archive(zip_path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = clean_entry_name(&String::from_utf8_lossy(entry.name_raw()));

        // Validation already ran, but never trust a name we are about to join.
        if escapes_root(&name) {
            return Err(unsafe_archive(
                UnsafeArchiveKind::PathTraversal,
                format!("entry '{}'", name),
            ));
        }

        let out_path = dest.join(&name);

        if name.ends_with('/') {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    Ok(())
}

/// Rewrite the original archive into `output`, replacing only the entries
/// named in `modified` with the bytes now present in `working`.
///
/// Contract (per entry, in central-directory order):
/// - modified entries keep compression method, permissions, timestamp and
///   extra fields from the original;
/// - untouched entries are copied verbatim;
/// - files present in `working` but absent from the original are appended
///   at the end with default attributes.
pub fn repackage(
    original_zip: &Path,
    working: &Path,
    modified: &HashSet<String>,
    output: &Path,
) -> Result<()> {
    let file = fs::File::open(original_zip)?;
    let mut archive = ZipArchive::new(file)?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let out_file = fs::File::create(output)?;
    let mut writer = ZipWriter::new(out_file);

    let mut original_names: HashSet<String> = HashSet::new();

    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        let name = clean_entry_name(&String::from_utf8_lossy(entry.name_raw()));
        original_names.insert(name.clone());

        if !modified.contains(&name) {
            writer.raw_copy_file(entry)?;
            continue;
        }

        let mut options = FileOptions::default()
            .compression_method(entry.compression())
            .last_modified_time(entry.last_modified());
        if let Some(mode) = entry.unix_mode() {
            options = options.unix_permissions(mode);
        }
        let extra = entry.extra_data().to_vec();
        drop(entry);

        let content = fs::read(working.join(&name))?;

        if extra.is_empty() {
            writer.start_file(name.as_str(), options)?;
        } else {
            writer.start_file_with_extra_data(name.as_str(), options)?;
            writer.write_all(&extra)?;
            writer.end_extra_data()?;
        }
        writer.write_all(&content)?;
    }

    // Anything the rebuild created from scratch goes at the end.
    let mut created: Vec<String> = Vec::new();
    collect_files(working, working, &mut created)?;
    created.sort();
    for rel in created {
        if original_names.contains(&rel) {
            continue;
        }
        let content = fs::read(working.join(&rel))?;
        writer.start_file(rel.as_str(), FileOptions::default())?;
        writer.write_all(&content)?;
    }

    writer.finish()?;
    Ok(())
}

/// Zip a directory tree from scratch with default attributes. Only used
/// when filename normalization renamed entries and the attribute-copying
/// rewrite no longer lines up with the original central directory.
pub fn zip_directory(source: &Path, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(output)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o755);

    let mut files: Vec<String> = Vec::new();
    collect_files(source, source, &mut files)?;
    files.sort();
    for rel in files {
        let content = fs::read(source.join(&rel))?;
        writer.start_file(rel.as_str(), options)?;
        writer.write_all(&content)?;
    }

    writer.finish()?;
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }
    Ok(())
}

/// Read one entry's bytes without extracting the whole archive.
pub fn read_entry(zip_path: &Path, entry_name: &str) -> Result<Vec<u8>> {
    let file = fs::File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = clean_entry_name(&String::from_utf8_lossy(entry.name_raw()));
        if name == entry_name {
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            return Ok(buf);
        }
    }
    Err(TranslateError::Internal(format!(
        "entry '{}' not found in archive",
        entry_name
    )))
}
