//! Translation backends.
//!
//! One trait, three implementations (online MT, offline MT, LLM) selected
//! by a tagged config. The driver enforces the partial-failure policy: a
//! provider call that dies after retries degrades to pass-through for its
//! segments, and the job keeps going.

mod html;
mod llm;
mod offline;
mod online;

pub use llm::LlmProvider;
pub use offline::OfflineMtProvider;
pub use online::OnlineMtProvider;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Result;
use crate::extract::{Segment, TranslationMap};
use crate::pipeline::CancelToken;

/// Timeout for a single backend HTTP call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for one whole `translate_many` pass over a segment list.
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Segments are handed to providers in chunks of this size.
const DRIVER_CHUNK: usize = 50;

/// What a provider sees of a segment.
#[derive(Debug, Clone)]
pub struct SegmentRequest<'a> {
    pub id: &'a str,
    pub text: &'a str,
    pub context: &'a str,
    pub kind: &'static str,
}

/// A translation backend.
///
/// `translate_many` MUST return exactly one translation per request, in
/// order; a segment the backend could not translate comes back as its
/// original text (and the backend logs the failure).
pub trait TranslationProvider {
    fn name(&self) -> &'static str;

    fn translate_many(
        &mut self,
        segments: &[SegmentRequest<'_>],
        source: &str,
        target: &str,
    ) -> Result<Vec<String>>;

    fn translate_one(&mut self, text: &str, source: &str, target: &str) -> Result<String>;
}

/// Backend selection, passed by value into the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Free web MT. Stateless, rate-limited, serialized calls.
    OnlineMt,
    /// Local per-language-pair models.
    OfflineMt {
        #[serde(default)]
        auto_download: bool,
        #[serde(default)]
        model_dir: Option<PathBuf>,
        #[serde(default)]
        model_index_url: Option<String>,
    },
    /// LLM batch translation.
    Llm {
        api_key: String,
        model: String,
        #[serde(default = "default_max_batch")]
        max_batch: usize,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        #[serde(default = "default_temperature")]
        temperature: f32,
    },
}

fn default_max_batch() -> usize {
    50
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.3
}

/// Instantiate the configured backend. `course_context` feeds LLM prompts.
pub fn build_provider(
    config: &ProviderConfig,
    course_context: &str,
) -> Result<Box<dyn TranslationProvider>> {
    Ok(match config {
        ProviderConfig::OnlineMt => Box::new(OnlineMtProvider::new()?),
        ProviderConfig::OfflineMt {
            auto_download,
            model_dir,
            model_index_url,
        } => Box::new(OfflineMtProvider::new(
            model_dir.clone(),
            *auto_download,
            model_index_url.clone(),
        )?),
        ProviderConfig::Llm {
            api_key,
            model,
            max_batch,
            max_tokens,
            temperature,
        } => Box::new(LlmProvider::new(
            api_key.clone(),
            model.clone(),
            *max_batch,
            *max_tokens,
            *temperature,
            course_context.to_string(),
        )?),
    })
}

/// Translate every segment, in emission order.
///
/// HTML-flagged segments go through the structure-preserving path one by
/// one; plain segments go to the backend in chunks. Failures degrade to
/// originals, never abort. Cancellation is checked at chunk granularity
/// and the 10-minute batch deadline turns the tail of the list into
/// pass-through.
pub fn translate_segments(
    provider: &mut dyn TranslationProvider,
    segments: &[Segment],
    source: &str,
    target: &str,
    cancel: &CancelToken,
) -> Result<TranslationMap> {
    let mut map = TranslationMap::new();
    let deadline = Instant::now() + BATCH_TIMEOUT;

    let (html_segments, plain_segments): (Vec<&Segment>, Vec<&Segment>) =
        segments.iter().partition(|s| s.is_html);

    for chunk in plain_segments.chunks(DRIVER_CHUNK) {
        cancel.check()?;

        if Instant::now() > deadline {
            error!(
                provider = provider.name(),
                remaining = chunk.len(),
                "batch deadline exceeded, remaining segments pass through"
            );
            for s in chunk {
                map.insert(s.id.clone(), s.text.clone());
            }
            continue;
        }

        let requests: Vec<SegmentRequest<'_>> = chunk
            .iter()
            .map(|s| SegmentRequest {
                id: &s.id,
                text: &s.text,
                context: &s.context,
                kind: s.kind.as_str(),
            })
            .collect();

        match provider.translate_many(&requests, source, target) {
            Ok(translations) => {
                if translations.len() != chunk.len() {
                    error!(
                        provider = provider.name(),
                        expected = chunk.len(),
                        got = translations.len(),
                        "provider returned wrong translation count, passing originals through"
                    );
                    for s in chunk {
                        map.insert(s.id.clone(), s.text.clone());
                    }
                } else {
                    for (s, t) in chunk.iter().zip(translations) {
                        map.insert(s.id.clone(), t);
                    }
                }
            }
            Err(e) => {
                error!(
                    provider = provider.name(),
                    error = %e,
                    segments = chunk.len(),
                    "provider call failed after retries, passing originals through"
                );
                for s in chunk {
                    map.insert(s.id.clone(), s.text.clone());
                }
            }
        }
    }

    for segment in html_segments {
        cancel.check()?;

        if Instant::now() > deadline {
            map.insert(segment.id.clone(), segment.text.clone());
            continue;
        }

        match html::translate_html_string(provider, &segment.text, source, target) {
            Ok(translated) => {
                map.insert(segment.id.clone(), translated);
            }
            Err(e) => {
                error!(segment = %segment.id, error = %e, "HTML segment failed, passing original through");
                map.insert(segment.id.clone(), segment.text.clone());
            }
        }
    }

    Ok(map)
}
