//! Free web MT backend (MyMemory).
//!
//! No API key, so the service is aggressively rate-limited: calls are
//! strictly serialized, and the driver pauses half a second every 20 calls.

use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::error::{Result, TranslateError};

use super::{SegmentRequest, TranslationProvider, CALL_TIMEOUT};

const ENDPOINT: &str = "https://api.mymemory.translated.net/get";
const PAUSE_EVERY: usize = 20;
const PAUSE: Duration = Duration::from_millis(500);
const LOG_EVERY: usize = 50;

pub struct OnlineMtProvider {
    client: reqwest::blocking::Client,
    total_requests: u64,
    total_chars: u64,
}

impl OnlineMtProvider {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()?;
        Ok(OnlineMtProvider {
            client,
            total_requests: 0,
            total_chars: 0,
        })
    }

    fn request(&mut self, text: &str, source: &str, target: &str) -> Result<String> {
        self.total_requests += 1;
        self.total_chars += text.chars().count() as u64;

        let langpair = format!("{}|{}", source, target);
        let response = self
            .client
            .get(ENDPOINT)
            .query(&[("q", text), ("langpair", langpair.as_str())])
            .send()?;

        if !response.status().is_success() {
            return Err(TranslateError::ProviderTransient(format!(
                "MT service returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response.json()?;
        body.get("responseData")
            .and_then(|d| d.get("translatedText"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                TranslateError::ProviderTransient("MT response missing translatedText".to_string())
            })
    }
}

impl TranslationProvider for OnlineMtProvider {
    fn name(&self) -> &'static str {
        "online_mt"
    }

    fn translate_many(
        &mut self,
        segments: &[SegmentRequest<'_>],
        source: &str,
        target: &str,
    ) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(segments.len());

        for (i, segment) in segments.iter().enumerate() {
            if i > 0 && i % PAUSE_EVERY == 0 {
                thread::sleep(PAUSE);
            }
            if i > 0 && i % LOG_EVERY == 0 {
                info!(done = i, total = segments.len(), "online MT progress");
            }

            match self.request(segment.text, source, target) {
                Ok(translated) => out.push(translated),
                Err(e) => {
                    error!(segment = segment.id, error = %e, "online MT failed, keeping original");
                    out.push(segment.text.to_string());
                }
            }
        }

        Ok(out)
    }

    fn translate_one(&mut self, text: &str, source: &str, target: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Ok(text.to_string());
        }
        self.request(text, source, target)
    }
}
