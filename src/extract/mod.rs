//! Translatable-content extraction.
//!
//! Three sub-extractors feed one ordered segment list: manifest text,
//! generic HTML, and Articulate Rise course models. Segment ids are
//! deterministic given the traversal, and every segment carries the anchor
//! the rebuilder needs to write its translation back.

mod html;
mod manifest_text;
mod rise;

pub use rise::RiseFields;

use std::collections::{BTreeMap, HashMap};
use std::fs;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::Result;
use crate::package::Package;

/// Minimum trimmed length for HTML text and attribute values.
pub const MIN_TEXT_LENGTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentKind {
    XmlText,
    HtmlText,
    HtmlAttr,
    RiseJson,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::XmlText => "XML_TEXT",
            ContentKind::HtmlText => "HTML_TEXT",
            ContentKind::HtmlAttr => "HTML_ATTR",
            ContentKind::RiseJson => "RISE_JSON",
        }
    }
}

/// Where a translation gets written back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Anchor {
    /// Resolved XPath into the manifest.
    XmlPath(String),
    /// Literal direct text, replaced first-occurrence in the raw bytes.
    HtmlText { tag: String, ordinal: usize, literal: String },
    /// (tag, attribute, original value), first-match on the raw bytes.
    HtmlAttr { tag: String, ordinal: usize, attribute: String, literal: String },
    /// Dotted path into the decoded Rise course model.
    RisePath(String),
}

/// One translatable unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub text: String,
    pub kind: ContentKind,
    pub anchor: Anchor,
    /// The text itself contains inline HTML that must survive translation.
    pub is_html: bool,
    /// Package-root-relative path, or the manifest sentinel.
    pub file_path: String,
    /// Human-readable context forwarded to LLM providers.
    pub context: String,
}

/// The manifest's sentinel file path.
pub const MANIFEST_FILE: &str = "imsmanifest.xml";

/// Ordered segments plus a file-keyed index into them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub segments: Vec<Segment>,
    /// file path -> indices into `segments`, ascending (emission order).
    pub by_file: BTreeMap<String, Vec<usize>>,
}

impl ExtractionResult {
    pub fn push(&mut self, segment: Segment) {
        let idx = self.segments.len();
        self.by_file
            .entry(segment.file_path.clone())
            .or_default()
            .push(idx);
        self.segments.push(segment);
    }

    pub fn total_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn total_characters(&self) -> usize {
        self.segments.iter().map(|s| s.text.chars().count()).sum()
    }

    pub fn segments_for<'a>(&'a self, file: &str) -> impl Iterator<Item = &'a Segment> {
        self.by_file
            .get(file)
            .into_iter()
            .flatten()
            .map(move |&i| &self.segments[i])
    }
}

/// Translations keyed by segment id. Missing ids mean "keep the original".
pub type TranslationMap = HashMap<String, String>;

/// Walk the whole package and emit every translatable segment.
///
/// Files are visited in the package's sorted `html_files` order after the
/// manifest; a per-file failure logs and contributes zero segments rather
/// than aborting the pipeline.
pub fn extract_package(pkg: &Package, rise_fields: &RiseFields) -> Result<ExtractionResult> {
    let mut result = ExtractionResult::default();

    manifest_text::extract(&pkg.manifest, &mut result);

    for html_file in &pkg.html_files {
        let path = pkg.content_root().join(html_file);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                error!(file = %html_file, error = %e, "failed to read HTML file");
                continue;
            }
        };

        if rise::is_rise_bootstrap(&bytes) {
            rise::extract(&bytes, html_file, rise_fields, &mut result);
        } else {
            html::extract(&bytes, html_file, &mut result);
        }
    }

    info!(
        segments = result.total_segments(),
        characters = result.total_characters(),
        files = result.by_file.len(),
        "extraction complete"
    );

    Ok(result)
}

pub(crate) use html::{apply_html_translations, find_unconsumed, splice};
pub(crate) use rise::apply_rise_translations;
