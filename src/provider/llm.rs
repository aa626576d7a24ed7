//! LLM batch translation backend.
//!
//! Packs up to `max_batch` segments into one JSON-shaped prompt, demands a
//! strict JSON reply, and parses fenced code blocks defensively because
//! models wrap output in markdown no matter how firmly told not to.
//! Transient failures retry with exponential backoff; a batch that dies
//! after retries falls back to originals and the job continues.

use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{debug, error, info};

use crate::error::{Result, TranslateError};

use super::{SegmentRequest, TranslationProvider, CALL_TIMEOUT};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").unwrap());

#[derive(Debug)]
pub struct LlmProvider {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    max_batch: usize,
    max_tokens: u32,
    temperature: f32,
    course_context: String,
    total_requests: u64,
}

impl LlmProvider {
    pub fn new(
        api_key: String,
        model: String,
        max_batch: usize,
        max_tokens: u32,
        temperature: f32,
        course_context: String,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(TranslateError::Internal(
                "LLM provider requires an API key".to_string(),
            ));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()?;
        Ok(LlmProvider {
            client,
            api_key,
            model,
            max_batch: max_batch.max(1),
            max_tokens,
            temperature,
            course_context,
            total_requests: 0,
        })
    }

    fn build_prompt(&self, segments: &[SegmentRequest<'_>], source: &str, target: &str) -> String {
        let texts: Vec<serde_json::Value> = segments
            .iter()
            .map(|s| {
                json!({
                    "segment_id": s.id,
                    "text": s.text,
                    "context": s.context,
                    "kind": s.kind,
                })
            })
            .collect();

        let context = if self.course_context.is_empty() {
            "E-learning course"
        } else {
            self.course_context.as_str()
        };

        format!(
            "You are an expert translator of e-learning and SCORM content.\n\n\
             TASK:\n\
             Translate the following texts from {source} to {target}.\n\n\
             CRITICAL RULES:\n\
             1. PRESERVE any HTML structure (tags, attributes, classes, ids).\n\
             2. Do NOT translate JavaScript code, variable names, URLs or file names.\n\
             3. Keep standard e-learning terminology.\n\
             4. Translate naturally and fluently, not word for word.\n\
             5. Respect the capitalization of the original where relevant.\n\n\
             COURSE CONTEXT:\n{context}\n\n\
             TEXTS TO TRANSLATE:\n{texts}\n\n\
             RESPONSE FORMAT:\n\
             Return ONLY a JSON object with this exact shape:\n\
             {{\"translations\": [{{\"segment_id\": \"...\", \"translated_text\": \"...\"}}]}}\n\n\
             IMPORTANT: return ONLY the JSON, with no explanations and no markdown.",
            source = language_name(source),
            target = language_name(target),
            context = context,
            texts = serde_json::to_string_pretty(&texts).unwrap_or_default(),
        )
    }

    fn call_api(&mut self, prompt: &str) -> Result<String> {
        self.total_requests += 1;

        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(TranslateError::ProviderTransient(format!(
                "LLM API returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(TranslateError::Internal(format!(
                "LLM API rejected the request with {}",
                status
            )));
        }

        let payload: serde_json::Value = response.json()?;
        payload
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                TranslateError::ProviderTransient("LLM response carried no text block".to_string())
            })
    }

    fn translate_batch(
        &mut self,
        segments: &[SegmentRequest<'_>],
        source: &str,
        target: &str,
    ) -> Result<Vec<String>> {
        let prompt = self.build_prompt(segments, source, target);

        let mut attempt = 0;
        let response_text = loop {
            attempt += 1;
            match self.call_api(&prompt) {
                Ok(text) => break text,
                Err(e) if attempt < MAX_ATTEMPTS && is_retryable(&e) => {
                    let backoff = BACKOFF_BASE
                        .saturating_mul(2u32.saturating_pow(attempt - 1))
                        .min(BACKOFF_CAP);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying LLM call");
                    thread::sleep(backoff);
                }
                Err(e) => return Err(e),
            }
        };

        let map = parse_response(&response_text)?;
        Ok(segments
            .iter()
            .map(|s| map.get(s.id).cloned().unwrap_or_else(|| s.text.to_string()))
            .collect())
    }
}

fn is_retryable(err: &TranslateError) -> bool {
    matches!(
        err,
        TranslateError::ProviderTransient(_) | TranslateError::Network(_)
    )
}

/// Pull the translations object out of a model reply, tolerating markdown
/// fences and surrounding chatter.
fn parse_response(text: &str) -> Result<std::collections::HashMap<String, String>> {
    let cleaned = text.trim();
    let stripped: String;
    let candidate: &str = if let Some(captures) = FENCED_JSON.captures(cleaned) {
        captures.get(1).map(|m| m.as_str()).unwrap_or(cleaned)
    } else if cleaned.contains("```") {
        // Unbalanced fences: strip the markers and hope for the best.
        stripped = cleaned.replace("```json", "").replace("```", "");
        &stripped
    } else {
        cleaned
    };

    let value: serde_json::Value = serde_json::from_str(candidate.trim()).map_err(|e| {
        TranslateError::ProviderTransient(format!("LLM reply was not valid JSON: {}", e))
    })?;

    let mut map = std::collections::HashMap::new();
    if let Some(items) = value.get("translations").and_then(|t| t.as_array()) {
        for item in items {
            let id = item.get("segment_id").and_then(|v| v.as_str());
            let translated = item.get("translated_text").and_then(|v| v.as_str());
            if let (Some(id), Some(translated)) = (id, translated) {
                map.insert(id.to_string(), translated.to_string());
            }
        }
    }
    Ok(map)
}

impl TranslationProvider for LlmProvider {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn translate_many(
        &mut self,
        segments: &[SegmentRequest<'_>],
        source: &str,
        target: &str,
    ) -> Result<Vec<String>> {
        if segments.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            segments = segments.len(),
            from = %source,
            to = %target,
            "LLM translation starting"
        );

        let mut out = Vec::with_capacity(segments.len());
        let batches: Vec<&[SegmentRequest<'_>]> = segments.chunks(self.max_batch).collect();
        for (i, batch) in batches.iter().enumerate() {
            debug!(batch = i + 1, batches = batches.len(), "LLM batch");
            match self.translate_batch(batch, source, target) {
                Ok(mut translated) => out.append(&mut translated),
                Err(e) => {
                    error!(batch = i + 1, error = %e, "LLM batch failed, keeping originals");
                    out.extend(batch.iter().map(|s| s.text.to_string()));
                }
            }
        }
        Ok(out)
    }

    fn translate_one(&mut self, text: &str, source: &str, target: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Ok(text.to_string());
        }
        let segment = SegmentRequest {
            id: "single",
            text,
            context: "Single text translation",
            kind: "TEXT",
        };
        let out = self.translate_batch(&[segment], source, target)?;
        Ok(out.into_iter().next().unwrap_or_else(|| text.to_string()))
    }
}

fn language_name(code: &str) -> &str {
    match code.to_lowercase().as_str() {
        "en" => "English",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "it" => "Italian",
        "pt" => "Portuguese",
        "nl" => "Dutch",
        "pl" => "Polish",
        "zh" => "Chinese",
        "ja" => "Japanese",
        "ru" => "Russian",
        "ar" => "Arabic",
        _ => code,
    }
}
