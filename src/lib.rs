//! Translates SCORM packages while leaving everything that is not
//! human-readable text byte-for-byte intact.
//!
//! The pipeline is `parse -> extract -> translate -> rebuild`: a validated
//! ZIP is extracted to a scratch tree, the manifest, HTML files and
//! Articulate Rise course models are segmented into addressable units,
//! a translation backend fills a segment-id -> text map, and per-language
//! working copies are rewritten and repackaged with the original archive's
//! entry attributes preserved.
//!
//! ```no_run
//! use scorm_translator::{
//!     translate_package, CancelToken, ProviderConfig, TranslateOptions,
//! };
//!
//! let options = TranslateOptions::new(
//!     vec!["en".to_string(), "fr".to_string()],
//!     ProviderConfig::OnlineMt,
//!     "./out".into(),
//! );
//! let mut progress = |status, percent, _err: Option<&str>| {
//!     println!("{:?} {}%", status, percent);
//! };
//! let outcome = translate_package(
//!     "curso.zip".as_ref(),
//!     &options,
//!     &mut progress,
//!     &CancelToken::new(),
//! )?;
//! for (lang, path) in &outcome.outputs {
//!     println!("{} -> {}", lang, path.display());
//! }
//! # Ok::<(), scorm_translator::TranslateError>(())
//! ```

pub mod archive;
pub mod error;
pub mod extract;
pub mod filename;
pub mod manifest;
pub mod normalize;
pub mod package;
pub mod pipeline;
pub mod provider;
pub mod rebuild;

pub use error::{Result, TranslateError, UnsafeArchiveKind};
pub use extract::{
    Anchor, ContentKind, ExtractionResult, RiseFields, Segment, TranslationMap,
};
pub use manifest::{ManifestTree, ScormVersion};
pub use package::Package;
pub use pipeline::{
    translate_package, translate_package_bytes, translate_package_with_provider, CancelToken,
    ProgressFn, ProgressStatus, TranslateOptions, TranslateOutcome, TranslateStats,
};
pub use provider::{build_provider, ProviderConfig, SegmentRequest, TranslationProvider};
