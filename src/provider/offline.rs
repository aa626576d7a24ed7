//! Offline MT backend.
//!
//! Models are per-language-pair glossary files (`<src>-<tgt>.json`, a flat
//! string map) in a local model directory. A missing pair can optionally be
//! fetched from a configured model index; if it still is not available,
//! every segment passes through unchanged with a warning, and the job
//! completes anyway.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::error::Result;

use super::{SegmentRequest, TranslationProvider, CALL_TIMEOUT};

pub struct OfflineMtProvider {
    model_dir: PathBuf,
    auto_download: bool,
    model_index_url: Option<String>,
    glossaries: HashMap<String, HashMap<String, String>>,
    unavailable: HashSet<String>,
    total_requests: u64,
}

impl OfflineMtProvider {
    pub fn new(
        model_dir: Option<PathBuf>,
        auto_download: bool,
        model_index_url: Option<String>,
    ) -> Result<Self> {
        let model_dir =
            model_dir.unwrap_or_else(|| std::env::temp_dir().join("scorm-translator-models"));
        Ok(OfflineMtProvider {
            model_dir,
            auto_download,
            model_index_url,
            glossaries: HashMap::new(),
            unavailable: HashSet::new(),
            total_requests: 0,
        })
    }

    fn pair_key(source: &str, target: &str) -> String {
        format!("{}-{}", source.to_lowercase(), target.to_lowercase())
    }

    /// Load (or fetch, then load) the model for a pair. Failures are final
    /// for the lifetime of the provider so we only warn once per pair.
    fn ensure_pair(&mut self, source: &str, target: &str) -> bool {
        let pair = Self::pair_key(source, target);
        if self.glossaries.contains_key(&pair) {
            return true;
        }
        if self.unavailable.contains(&pair) {
            return false;
        }

        let model_path = self.model_dir.join(format!("{}.json", pair));

        if !model_path.exists() && self.auto_download {
            match &self.model_index_url {
                Some(index) => {
                    info!(pair = %pair, "downloading translation model");
                    if let Err(e) = self.download_model(index.clone(), &pair, &model_path) {
                        error!(pair = %pair, error = %e, "model download failed");
                    }
                }
                None => warn!(pair = %pair, "auto_download set but no model index configured"),
            }
        }

        if model_path.exists() {
            match fs::read_to_string(&model_path)
                .map_err(crate::error::TranslateError::from)
                .and_then(|s| {
                    serde_json::from_str::<HashMap<String, String>>(&s)
                        .map_err(crate::error::TranslateError::from)
                }) {
                Ok(glossary) => {
                    info!(pair = %pair, entries = glossary.len(), "translation model loaded");
                    self.glossaries.insert(pair, glossary);
                    return true;
                }
                Err(e) => error!(pair = %pair, error = %e, "model file unreadable"),
            }
        }

        warn!(
            pair = %pair,
            "no translation model for language pair, segments will pass through unchanged"
        );
        self.unavailable.insert(pair);
        false
    }

    fn download_model(&self, index: String, pair: &str, dest: &PathBuf) -> Result<()> {
        let url = format!("{}/{}.json", index.trim_end_matches('/'), pair);
        let client = reqwest::blocking::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()?;
        let response = client.get(&url).send()?.error_for_status()?;
        let body = response.bytes()?;
        fs::create_dir_all(&self.model_dir)?;
        fs::write(dest, &body)?;
        Ok(())
    }

    fn lookup(&self, pair: &str, text: &str) -> Option<String> {
        let glossary = self.glossaries.get(pair)?;
        glossary
            .get(text)
            .or_else(|| glossary.get(text.trim()))
            .or_else(|| glossary.get(&text.trim().to_lowercase()))
            .cloned()
    }
}

impl TranslationProvider for OfflineMtProvider {
    fn name(&self) -> &'static str {
        "offline_mt"
    }

    fn translate_many(
        &mut self,
        segments: &[SegmentRequest<'_>],
        source: &str,
        target: &str,
    ) -> Result<Vec<String>> {
        if !self.ensure_pair(source, target) {
            return Ok(segments.iter().map(|s| s.text.to_string()).collect());
        }

        let pair = Self::pair_key(source, target);
        let mut out = Vec::with_capacity(segments.len());
        for segment in segments {
            self.total_requests += 1;
            out.push(
                self.lookup(&pair, segment.text)
                    .unwrap_or_else(|| segment.text.to_string()),
            );
        }
        Ok(out)
    }

    fn translate_one(&mut self, text: &str, source: &str, target: &str) -> Result<String> {
        if !self.ensure_pair(source, target) {
            return Ok(text.to_string());
        }
        self.total_requests += 1;
        let pair = Self::pair_key(source, target);
        Ok(self.lookup(&pair, text).unwrap_or_else(|| text.to_string()))
    }
}
