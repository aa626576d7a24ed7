//! Articulate Rise course models.
//!
//! Rise bootstraps embed the whole course as base64-encoded JSON inside a
//! `deserialize("...")` call. Extraction decodes the blob and walks the
//! model; apply-back re-walks it, replaces the translated strings, and
//! splices the re-encoded blob over exactly the captured bytes, leaving
//! everything around the call untouched.

use std::collections::HashSet;

use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::{Anchor, ContentKind, ExtractionResult, Segment, TranslationMap, MIN_TEXT_LENGTH};

/// Detection window at the top of the file.
const DETECT_WINDOW: usize = 5 * 1024;

static DESERIALIZE_CALL: Lazy<BytesRegex> =
    Lazy::new(|| BytesRegex::new(r#"deserialize\("([A-Za-z0-9+/=]+)"\)"#).unwrap());

static HEX_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F-]{32,}$").unwrap());
static COLOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#[0-9a-fA-F]{6}([0-9a-fA-F]{2})?$").unwrap());

/// Which parts of a Rise course model are translated.
///
/// The whitelist is configuration, not code: deployments that want
/// `subheading` or `hint` translated add them here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiseFields {
    /// Dict keys (case-insensitive) whose string values are content.
    pub content_fields: Vec<String>,
    /// Dotted-path substrings that mark UI-string subtrees.
    pub path_markers: Vec<String>,
    /// Dict keys whose subtrees are never visited.
    pub skip_keys: Vec<String>,
}

impl Default for RiseFields {
    fn default() -> Self {
        RiseFields {
            content_fields: [
                "title", "heading", "paragraph", "description", "caption", "text", "label",
                "buttonText", "question", "answer", "feedback",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            path_markers: vec!["labelSet.labels".to_string()],
            skip_keys: [
                "id", "key", "src", "href", "color", "icon", "media", "settings", "background",
                "exportSettings",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl RiseFields {
    fn is_content_key(&self, key: &str) -> bool {
        self.content_fields.iter().any(|f| f.eq_ignore_ascii_case(key))
    }

    fn is_marked_path(&self, path: &str) -> bool {
        self.path_markers.iter().any(|m| path.contains(m.as_str()))
    }

    fn is_skip_key(&self, key: &str) -> bool {
        self.skip_keys.iter().any(|k| k == key)
    }
}

/// A file is a Rise bootstrap iff its first 5 KiB carry both markers.
pub fn is_rise_bootstrap(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(DETECT_WINDOW)];
    contains(window, b"__fetchCourse") && contains(window, b"deserialize(\"")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Strings that are identifiers, URLs or styling, never prose.
fn looks_non_textual(s: &str) -> bool {
    let t = s.trim();
    let lower = t.to_lowercase();
    if lower.starts_with("http://")
        || lower.starts_with("https://")
        || lower.starts_with("mailto:")
        || t.starts_with("//")
    {
        return true;
    }
    if HEX_TOKEN.is_match(t) || COLOR.is_match(t) {
        return true;
    }
    !t.is_empty()
        && t.chars()
            .all(|c| c.is_ascii_digit() || c.is_whitespace() || c.is_ascii_punctuation())
}

fn is_translatable(key: &str, path: &str, value: &str, fields: &RiseFields) -> bool {
    if value.chars().count() < MIN_TEXT_LENGTH {
        return false;
    }
    if !fields.is_content_key(key) && !fields.is_marked_path(path) {
        return false;
    }
    !looks_non_textual(value)
}

/// Depth-first walk over the course model, visiting translatable strings.
/// `key` is the nearest enclosing dict key (arrays inherit it).
fn walk(
    value: &mut Value,
    key: Option<&str>,
    path: &str,
    fields: &RiseFields,
    f: &mut dyn FnMut(&str, &mut String),
) {
    match value {
        Value::Object(map) => {
            for (k, v) in map.iter_mut() {
                if fields.is_skip_key(k) {
                    continue;
                }
                let child_path = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", path, k)
                };
                match v {
                    Value::String(s) => {
                        if is_translatable(k, &child_path, s, fields) {
                            f(&child_path, s);
                        }
                    }
                    _ => walk(v, Some(k.as_str()), &child_path, fields, f),
                }
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter_mut().enumerate() {
                let child_path = format!("{}[{}]", path, i);
                match v {
                    Value::String(s) => {
                        if let Some(k) = key {
                            if is_translatable(k, &child_path, s, fields) {
                                f(&child_path, s);
                            }
                        }
                    }
                    _ => walk(v, key, &child_path, fields, f),
                }
            }
        }
        _ => {}
    }
}

fn segment_id(path: &str) -> String {
    format!("rise_{}", path.replace(['.', '[', ']'], "_"))
}

fn decode_course_model(bytes: &[u8]) -> Option<(Value, std::ops::Range<usize>)> {
    let captures = DESERIALIZE_CALL.captures(bytes)?;
    let group = captures.get(1)?;
    let decoded = match general_purpose::STANDARD.decode(group.as_bytes()) {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "Rise blob is not valid base64");
            return None;
        }
    };
    let text = match String::from_utf8(decoded) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "Rise blob is not valid UTF-8");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(v) => Some((v, group.range())),
        Err(e) => {
            warn!(error = %e, "Rise blob is not valid JSON");
            return None;
        }
    }
}

/// Emit RISE_JSON segments for a bootstrap file. Decode failures log and
/// contribute nothing; the pipeline carries on.
pub fn extract(bytes: &[u8], rel_path: &str, fields: &RiseFields, result: &mut ExtractionResult) {
    let Some((mut model, _)) = decode_course_model(bytes) else {
        warn!(file = %rel_path, "Rise bootstrap detected but course model not decodable");
        return;
    };

    let mut seen: HashSet<String> = HashSet::new();
    walk(&mut model, None, "", fields, &mut |path, s| {
        let id = segment_id(path);
        if !seen.insert(id.clone()) {
            warn!(id = %id, "duplicate Rise segment id, keeping first");
            return;
        }
        result.push(Segment {
            id,
            text: s.clone(),
            kind: ContentKind::RiseJson,
            anchor: Anchor::RisePath(path.to_string()),
            is_html: s.contains('<'),
            file_path: rel_path.to_string(),
            context: format!("Rise course field '{}'", path),
        });
    });
}

/// Re-walk the decoded model, replace translated strings in place, and
/// splice the re-encoded blob over the captured base64 bytes. Returns the
/// new file bytes only when at least one value actually changed.
pub(crate) fn apply_rise_translations(
    original: &[u8],
    segments: &[&Segment],
    translations: &TranslationMap,
    fields: &RiseFields,
) -> (Option<Vec<u8>>, usize, usize) {
    let Some((mut model, range)) = decode_course_model(original) else {
        let expected = segments
            .iter()
            .filter(|s| translations.contains_key(&s.id))
            .count();
        return (None, 0, expected);
    };

    let mut applied_ids: HashSet<String> = HashSet::new();
    let mut changed = false;
    walk(&mut model, None, "", fields, &mut |path, s| {
        let id = segment_id(path);
        if applied_ids.contains(&id) {
            return;
        }
        if let Some(translated) = translations.get(&id) {
            if translated != s {
                *s = translated.clone();
                changed = true;
            }
            applied_ids.insert(id);
        }
    });

    let mut unresolved = 0usize;
    for segment in segments {
        if translations.contains_key(&segment.id) && !applied_ids.contains(&segment.id) {
            warn!(segment = %segment.id, "Rise path no longer present, segment skipped");
            unresolved += 1;
        }
    }

    if !changed {
        return (None, applied_ids.len(), unresolved);
    }

    let json = match serde_json::to_string(&model) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "failed to re-serialize Rise course model");
            return (None, 0, segments.len());
        }
    };
    let encoded = general_purpose::STANDARD.encode(json.as_bytes());

    let mut out = Vec::with_capacity(original.len());
    out.extend_from_slice(&original[..range.start]);
    out.extend_from_slice(encoded.as_bytes());
    out.extend_from_slice(&original[range.end..]);

    (Some(out), applied_ids.len(), unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrap(json: &str) -> Vec<u8> {
        let b64 = general_purpose::STANDARD.encode(json.as_bytes());
        format!(
            "<html><script>window.__fetchCourse = function() {{ return Course.deserialize(\"{}\"); }};</script></html>",
            b64
        )
        .into_bytes()
    }

    const COURSE: &str = r#"{"blocks":[{"id":"abc","heading":"Welcome","items":[{"paragraph":"<p>Hi</p>"}]}],"labelSet":{"labels":{"next":"Next"}}}"#;

    #[test]
    fn test_detects_bootstrap_markers() {
        let bytes = bootstrap(COURSE);
        assert!(is_rise_bootstrap(&bytes));
        assert!(!is_rise_bootstrap(b"<html><body>plain page</body></html>"));
        // Only one marker present: not a bootstrap.
        assert!(!is_rise_bootstrap(b"var x = deserialize(\"YWJj\");"));
    }

    fn extract_course(json: &str) -> ExtractionResult {
        let bytes = bootstrap(json);
        let mut result = ExtractionResult::default();
        extract(&bytes, "index.html", &RiseFields::default(), &mut result);
        result
    }

    #[test]
    fn test_extracts_whitelisted_fields_only() {
        let result = extract_course(COURSE);
        let ids: Vec<&str> = result.segments.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "rise_blocks_0__heading",
                "rise_blocks_0__items_0__paragraph",
                "rise_labelSet_labels_next",
            ]
        );
        // "id":"abc" is a skip key and must never appear.
        assert!(result.segments.iter().all(|s| !s.text.contains("abc")));
    }

    #[test]
    fn test_html_flag_set_for_markup_values() {
        let result = extract_course(COURSE);
        let para = result
            .segments
            .iter()
            .find(|s| s.id == "rise_blocks_0__items_0__paragraph")
            .unwrap();
        assert!(para.is_html);
        assert_eq!(para.text, "<p>Hi</p>");
        let heading = result.segments.iter().find(|s| s.id == "rise_blocks_0__heading").unwrap();
        assert!(!heading.is_html);
    }

    #[test]
    fn test_rejects_non_textual_strings() {
        let json = r##"{"heading":"https://example.com/x","caption":"#ff00aa","label":"123-456","text":"Texto real"}"##;
        let result = extract_course(json);
        let texts: Vec<&str> = result.segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["Texto real"]);
    }

    #[test]
    fn test_custom_whitelist_is_honored() {
        let json = r#"{"subheading":"Una introducción","heading":"Bienvenida"}"#;
        let bytes = bootstrap(json);

        let mut defaults = ExtractionResult::default();
        extract(&bytes, "index.html", &RiseFields::default(), &mut defaults);
        assert_eq!(defaults.segments.len(), 1);

        let mut fields = RiseFields::default();
        fields.content_fields.push("subheading".to_string());
        let mut extended = ExtractionResult::default();
        extract(&bytes, "index.html", &fields, &mut extended);
        assert_eq!(extended.segments.len(), 2);
    }

    #[test]
    fn test_apply_round_trips_and_preserves_surroundings() {
        let bytes = bootstrap(COURSE);
        let result = extract_course(COURSE);
        let refs: Vec<&Segment> = result.segments.iter().collect();

        let mut translations = TranslationMap::new();
        translations.insert("rise_blocks_0__heading".to_string(), "Bienvenido".to_string());
        translations.insert(
            "rise_blocks_0__items_0__paragraph".to_string(),
            "<p>Hola</p>".to_string(),
        );
        translations.insert("rise_labelSet_labels_next".to_string(), "Siguiente".to_string());

        let (out, applied, unresolved) =
            apply_rise_translations(&bytes, &refs, &translations, &RiseFields::default());
        assert_eq!(applied, 3);
        assert_eq!(unresolved, 0);
        let out = out.unwrap();

        // Bytes around the deserialize() call are untouched.
        let captures = DESERIALIZE_CALL.captures(&out).unwrap();
        let range = captures.get(1).unwrap().range();
        let original_range = DESERIALIZE_CALL.captures(&bytes).unwrap().get(1).unwrap().range();
        assert_eq!(&out[..range.start], &bytes[..original_range.start]);
        assert_eq!(&out[range.end..], &bytes[original_range.end..]);

        // Decoded output matches the expected translated model.
        let decoded = general_purpose::STANDARD.decode(&out[range.clone()]).unwrap();
        let value: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["blocks"][0]["heading"], "Bienvenido");
        assert_eq!(value["blocks"][0]["items"][0]["paragraph"], "<p>Hola</p>");
        assert_eq!(value["labelSet"]["labels"]["next"], "Siguiente");
        assert_eq!(value["blocks"][0]["id"], "abc");
    }

    #[test]
    fn test_apply_without_changes_leaves_file_untouched() {
        let bytes = bootstrap(COURSE);
        let result = extract_course(COURSE);
        let refs: Vec<&Segment> = result.segments.iter().collect();

        // Identity map: every value translates to itself.
        let mut translations = TranslationMap::new();
        for s in &result.segments {
            translations.insert(s.id.clone(), s.text.clone());
        }

        let (out, applied, unresolved) =
            apply_rise_translations(&bytes, &refs, &translations, &RiseFields::default());
        assert!(out.is_none());
        assert_eq!(applied, 3);
        assert_eq!(unresolved, 0);
    }

    #[test]
    fn test_undecodable_blob_yields_zero_segments() {
        let bytes = b"<script>__fetchCourse; deserialize(\"!!notbase64!!\");</script>".to_vec();
        let mut result = ExtractionResult::default();
        extract(&bytes, "index.html", &RiseFields::default(), &mut result);
        assert!(result.segments.is_empty());
    }
}
