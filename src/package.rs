//! A parsed SCORM package: validated archive, scratch tree, manifest model.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::info;
use uuid::Uuid;

use crate::archive;
use crate::error::{Result, TranslateError};
use crate::manifest::{parse_manifest, ManifestTree, ScormVersion};

/// A SCORM archive extracted into a scratch directory.
///
/// The scratch directory is owned by this value and removed when it drops,
/// on every exit path. After construction the scratch tree is treated as
/// read-only; rebuilds stage their own working copies from it.
#[derive(Debug)]
pub struct Package {
    pub original_path: PathBuf,
    scratch: TempDir,
    /// In-archive prefix of the package root ("" or "courseName/").
    pub root_prefix: String,
    pub manifest_entry: String,
    pub version: ScormVersion,
    pub manifest: ManifestTree,
    pub course_title: Option<String>,
    /// Source language from manifest metadata, if declared.
    pub language_hint: Option<String>,
    /// HTML files relative to the package root, sorted lexicographically.
    pub html_files: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Package {
    /// Validate, extract and parse an archive.
    pub fn open(zip_path: &Path) -> Result<Package> {
        let report = archive::validate_archive(zip_path)?;
        let manifest_entry = report.manifest_entry.ok_or(TranslateError::NotAScorm)?;

        let scratch = tempfile::Builder::new()
            .prefix(&format!("scorm_{}_", Uuid::new_v4().simple()))
            .tempdir()?;
        archive::extract_archive(zip_path, scratch.path())?;

        let manifest_bytes = fs::read(scratch.path().join(&manifest_entry))?;
        let manifest = parse_manifest(&manifest_bytes)?;

        let root_prefix = report.root_prefix;
        let content_root = scratch.path().join(&root_prefix);
        let mut html_files = Vec::new();
        find_html_files(&content_root, &content_root, &mut html_files)?;
        html_files.sort();

        let course_title = manifest.course_title().map(|t| t.to_string());
        let language_hint = manifest.metadata_language.clone();
        let version = manifest.version;

        info!(
            package = %zip_path.display(),
            version = version.as_str(),
            html_files = html_files.len(),
            "package opened"
        );

        Ok(Package {
            original_path: zip_path.to_path_buf(),
            scratch,
            root_prefix,
            manifest_entry,
            version,
            manifest,
            course_title,
            language_hint,
            html_files,
            created_at: Utc::now(),
        })
    }

    /// Root of the extracted archive tree (above the package root prefix).
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Directory that contains `imsmanifest.xml`.
    pub fn content_root(&self) -> PathBuf {
        self.scratch.path().join(&self.root_prefix)
    }

    /// Archive-relative path for a package-root-relative one.
    pub fn archive_path(&self, package_rel: &str) -> String {
        format!("{}{}", self.root_prefix, package_rel)
    }
}

fn find_html_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if entry.file_name() == "__MACOSX" {
                continue;
            }
            find_html_files(root, &path, out)?;
            continue;
        }
        let is_html = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
            .unwrap_or(false);
        if is_html {
            if let Ok(rel) = path.strip_prefix(root) {
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(rel);
            }
        }
    }
    Ok(())
}
