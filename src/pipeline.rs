//! Pipeline orchestration: archive → manifest → segments → translations →
//! rebuilds, with progress reporting, cooperative cancellation, and
//! guaranteed teardown of every temporary directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{Result, TranslateError};
use crate::extract::{self, RiseFields};
use crate::package::Package;
use crate::provider::{self, ProviderConfig};
use crate::rebuild;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    Uploaded,
    Validating,
    Parsing,
    Translating,
    Rebuilding,
    Completed,
    Failed,
}

/// Cooperative cancellation flag, checked at segment-loop granularity.
/// In-flight provider calls run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TranslateError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranslateOptions {
    /// Source language hint; providers receive "auto" when absent and the
    /// manifest declares nothing.
    pub source_language: Option<String>,
    pub target_languages: Vec<String>,
    pub provider: ProviderConfig,
    pub rise_fields: RiseFields,
    /// Optional ASCII-folding of resource names (off by default).
    pub normalize_filenames: bool,
    pub output_dir: PathBuf,
}

impl TranslateOptions {
    pub fn new(target_languages: Vec<String>, provider: ProviderConfig, output_dir: PathBuf) -> Self {
        TranslateOptions {
            source_language: None,
            target_languages,
            provider,
            rise_fields: RiseFields::default(),
            normalize_filenames: false,
            output_dir,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslateStats {
    pub scorm_version: String,
    pub segments_extracted: usize,
    pub segments_translated: usize,
    pub segments_applied: usize,
    pub anchors_unresolved: usize,
    pub files_processed: usize,
    pub files_failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TranslateOutcome {
    /// Target language -> produced archive path.
    pub outputs: BTreeMap<String, PathBuf>,
    pub stats: TranslateStats,
}

/// Progress callback: `(status, percent 0-100, sanitized error message)`.
pub type ProgressFn<'a> = dyn FnMut(ProgressStatus, u8, Option<&str>) + 'a;

struct Reporter<'a, 'b> {
    cb: &'a mut ProgressFn<'b>,
    last: u8,
}

impl<'a, 'b> Reporter<'a, 'b> {
    fn report(&mut self, status: ProgressStatus, percent: u8) {
        self.last = percent;
        (self.cb)(status, percent, None);
    }
}

/// Translate a SCORM archive into each target language.
///
/// Progress bands: extraction 0-40, translation 40-80 (spread evenly
/// across languages), rebuild 80-100. On any fatal error the callback
/// receives `Failed` with a sanitized message and the error is returned;
/// temporaries are removed on every path, and cancellation deletes any
/// archives already produced so it never leaves partial output.
pub fn translate_package(
    input_zip: &Path,
    options: &TranslateOptions,
    progress: &mut ProgressFn<'_>,
    cancel: &CancelToken,
) -> Result<TranslateOutcome> {
    translate_with(input_zip, options, None, progress, cancel)
}

/// Convenience entry point for callers holding the archive in memory
/// (e.g. an upload body): spools the bytes to a temporary file first.
pub fn translate_package_bytes(
    input_zip: &[u8],
    options: &TranslateOptions,
    progress: &mut ProgressFn<'_>,
    cancel: &CancelToken,
) -> Result<TranslateOutcome> {
    let spool = tempfile::Builder::new()
        .prefix("scorm_upload_")
        .suffix(".zip")
        .tempfile()?;
    fs::write(spool.path(), input_zip)?;
    translate_with(spool.path(), options, None, progress, cancel)
}

/// Same pipeline, but with a caller-supplied backend instead of one built
/// from `options.provider`. This is how embedders plug in custom backends
/// and how the test suite drives the pipeline with deterministic providers.
pub fn translate_package_with_provider(
    input_zip: &Path,
    options: &TranslateOptions,
    provider: &mut dyn crate::provider::TranslationProvider,
    progress: &mut ProgressFn<'_>,
    cancel: &CancelToken,
) -> Result<TranslateOutcome> {
    translate_with(input_zip, options, Some(provider), progress, cancel)
}

fn translate_with(
    input_zip: &Path,
    options: &TranslateOptions,
    external: Option<&mut dyn crate::provider::TranslationProvider>,
    progress: &mut ProgressFn<'_>,
    cancel: &CancelToken,
) -> Result<TranslateOutcome> {
    let mut reporter = Reporter { cb: progress, last: 0 };
    let mut produced: Vec<PathBuf> = Vec::new();

    match run(input_zip, options, external, &mut reporter, cancel, &mut produced) {
        Ok(outcome) => {
            reporter.report(ProgressStatus::Completed, 100);
            Ok(outcome)
        }
        Err(e) => {
            if matches!(e, TranslateError::Cancelled) {
                for path in &produced {
                    let _ = fs::remove_file(path);
                }
            }
            error!(error = %e, "pipeline failed");
            let message = e.sanitized_message();
            let last = reporter.last;
            (reporter.cb)(ProgressStatus::Failed, last, Some(&message));
            Err(e)
        }
    }
}

fn run(
    input_zip: &Path,
    options: &TranslateOptions,
    external: Option<&mut dyn crate::provider::TranslationProvider>,
    reporter: &mut Reporter<'_, '_>,
    cancel: &CancelToken,
    produced: &mut Vec<PathBuf>,
) -> Result<TranslateOutcome> {
    let started_at = Utc::now();

    if options.target_languages.is_empty() {
        return Err(TranslateError::Internal(
            "no target languages requested".to_string(),
        ));
    }

    reporter.report(ProgressStatus::Validating, 0);
    cancel.check()?;

    let pkg = Package::open(input_zip)?;
    reporter.report(ProgressStatus::Parsing, 20);
    cancel.check()?;

    let extraction = extract::extract_package(&pkg, &options.rise_fields)?;
    reporter.report(ProgressStatus::Parsing, 40);

    let source_language = options
        .source_language
        .clone()
        .or_else(|| pkg.language_hint.clone())
        .unwrap_or_else(|| "auto".to_string());
    let course_context = pkg.course_title.clone().unwrap_or_default();

    let mut built;
    let backend: &mut dyn crate::provider::TranslationProvider = match external {
        Some(p) => p,
        None => {
            built = provider::build_provider(&options.provider, &course_context)?;
            built.as_mut()
        }
    };

    let languages = &options.target_languages;
    let n = languages.len() as u32;

    let mut translations_by_language = Vec::with_capacity(languages.len());
    for (i, target) in languages.iter().enumerate() {
        cancel.check()?;
        reporter.report(
            ProgressStatus::Translating,
            (40 + 40 * i as u32 / n) as u8,
        );
        info!(lang = %target, segments = extraction.total_segments(), "translating");

        let map = provider::translate_segments(
            backend,
            &extraction.segments,
            &source_language,
            target,
            cancel,
        )?;
        translations_by_language.push(map);
    }
    reporter.report(ProgressStatus::Translating, 80);

    let originals: std::collections::HashMap<&str, &str> = extraction
        .segments
        .iter()
        .map(|s| (s.id.as_str(), s.text.as_str()))
        .collect();

    let mut outputs = BTreeMap::new();
    let mut segments_translated = 0usize;
    let mut segments_applied = 0usize;
    let mut anchors_unresolved = 0usize;
    let mut files_processed = 0usize;
    let mut files_failed = 0usize;

    for (i, (target, map)) in languages.iter().zip(&translations_by_language).enumerate() {
        cancel.check()?;
        reporter.report(
            ProgressStatus::Rebuilding,
            (80 + 20 * i as u32 / n) as u8,
        );

        segments_translated += map
            .iter()
            .filter(|(id, translated)| {
                originals
                    .get(id.as_str())
                    .map(|original| original != &translated.as_str())
                    .unwrap_or(false)
            })
            .count();

        let (output_path, stats) = rebuild::rebuild_language(
            &pkg,
            &extraction,
            map,
            &options.rise_fields,
            &options.output_dir,
            target,
            options.normalize_filenames,
        )?;
        produced.push(output_path.clone());
        segments_applied += stats.segments_applied;
        anchors_unresolved += stats.anchors_unresolved;
        files_processed += stats.files_processed;
        files_failed += stats.files_failed;
        outputs.insert(target.clone(), output_path);
    }

    Ok(TranslateOutcome {
        outputs,
        stats: TranslateStats {
            scorm_version: pkg.version.as_str().to_string(),
            segments_extracted: extraction.total_segments(),
            segments_translated,
            segments_applied,
            anchors_unresolved,
            files_processed,
            files_failed,
            started_at,
            finished_at: Utc::now(),
        },
    })
}
