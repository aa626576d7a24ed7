//! Generic HTML extraction and raw-byte apply-back.
//!
//! SCORM authoring tools emit HTML that no conformant serializer
//! round-trips, so the writeback path never re-serializes: extraction
//! remembers the literal text, and translations are spliced into the
//! original bytes first-occurrence-by-first-occurrence. The event walk
//! runs with relaxed end-name checking to survive tag soup.

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::warn;

use super::{Anchor, ContentKind, ExtractionResult, Segment, TranslationMap, MIN_TEXT_LENGTH};

/// Tags whose direct text is translated.
const TRANSLATABLE_TAGS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "span", "div", "li", "td", "th", "a", "label",
    "button", "strong", "em", "b", "i", "u", "blockquote", "figcaption", "caption", "legend",
    "summary", "details", "option", "title",
];

/// Subtrees that are dropped before scanning.
const NON_TRANSLATABLE_TAGS: &[&str] = &["script", "style", "code", "pre", "noscript"];

/// Attributes whose values are translated.
const TRANSLATABLE_ATTRIBUTES: &[&str] = &["alt", "title", "placeholder", "aria-label", "aria-description"];

/// HTML void elements: a bare `<br>` never gets an end tag.
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

struct ElementRecord {
    tag: String,
    ordinal: usize,
    /// Translatable attributes in tag order: (name, trimmed raw value).
    attrs: Vec<(String, String)>,
    /// Trimmed direct text children in document order.
    texts: Vec<String>,
}

struct OpenElement {
    name: String,
    record: Option<usize>,
}

/// Emit HTML_TEXT / HTML_ATTR segments for one file.
pub fn extract(bytes: &[u8], rel_path: &str, result: &mut ExtractionResult) {
    let text = String::from_utf8_lossy(bytes);
    let mut reader = Reader::from_str(&text);
    reader.check_end_names(false);

    let mut records: Vec<ElementRecord> = Vec::new();
    let mut stack: Vec<OpenElement> = Vec::new();
    let mut skip_depth = 0usize;
    let mut ordinal = 0usize;

    loop {
        let event = match reader.read_event() {
            Ok(ev) => ev,
            Err(e) => {
                // Tag soup beyond what the reader tolerates: keep what we have.
                warn!(file = %rel_path, error = %e, "stopping HTML scan early");
                break;
            }
        };

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();
                let is_void = matches!(event, Event::Empty(_)) || VOID_TAGS.contains(&name.as_str());

                if skip_depth > 0 {
                    if !is_void {
                        if NON_TRANSLATABLE_TAGS.contains(&name.as_str()) {
                            skip_depth += 1;
                        }
                        stack.push(OpenElement { name, record: None });
                    }
                    continue;
                }

                if NON_TRANSLATABLE_TAGS.contains(&name.as_str()) {
                    if !is_void {
                        skip_depth += 1;
                        stack.push(OpenElement { name, record: None });
                    }
                    continue;
                }

                let record = if TRANSLATABLE_TAGS.contains(&name.as_str()) {
                    let mut attrs = Vec::new();
                    for a in e.attributes().flatten() {
                        let attr_name =
                            String::from_utf8_lossy(a.key.local_name().as_ref()).to_lowercase();
                        if !TRANSLATABLE_ATTRIBUTES.contains(&attr_name.as_str()) {
                            continue;
                        }
                        let value = String::from_utf8_lossy(&a.value).trim().to_string();
                        if value.chars().count() >= MIN_TEXT_LENGTH {
                            attrs.push((attr_name, value));
                        }
                    }
                    records.push(ElementRecord {
                        tag: name.clone(),
                        ordinal,
                        attrs,
                        texts: Vec::new(),
                    });
                    ordinal += 1;
                    Some(records.len() - 1)
                } else {
                    None
                };

                if !is_void {
                    stack.push(OpenElement { name, record });
                }
            }
            Event::End(_) => {
                if let Some(closed) = stack.pop() {
                    if skip_depth > 0 && NON_TRANSLATABLE_TAGS.contains(&closed.name.as_str()) {
                        skip_depth -= 1;
                    }
                }
            }
            Event::Text(ref t) => {
                if skip_depth == 0 {
                    if let Some(open) = stack.last() {
                        if let Some(rec) = open.record {
                            let raw = String::from_utf8_lossy(t.as_ref());
                            let trimmed = raw.trim();
                            if !trimmed.is_empty() {
                                records[rec].texts.push(trimmed.to_string());
                            }
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    for record in &records {
        let direct_text = record.texts.join(" ");
        if direct_text.chars().count() >= MIN_TEXT_LENGTH {
            result.push(Segment {
                id: format!("html_{}_{}_{}", rel_path, record.tag, record.ordinal),
                text: direct_text.clone(),
                kind: ContentKind::HtmlText,
                anchor: Anchor::HtmlText {
                    tag: record.tag.clone(),
                    ordinal: record.ordinal,
                    literal: direct_text,
                },
                is_html: false,
                file_path: rel_path.to_string(),
                context: format!("{} element in {}", record.tag, rel_path),
            });
        }
        for (attr_name, value) in &record.attrs {
            result.push(Segment {
                id: format!("html_{}_{}_{}_{}", rel_path, record.tag, record.ordinal, attr_name),
                text: value.clone(),
                kind: ContentKind::HtmlAttr,
                anchor: Anchor::HtmlAttr {
                    tag: record.tag.clone(),
                    ordinal: record.ordinal,
                    attribute: attr_name.clone(),
                    literal: value.clone(),
                },
                is_html: false,
                file_path: rel_path.to_string(),
                context: format!("{} attribute of {} in {}", attr_name, record.tag, rel_path),
            });
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from + needle.len() > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn overlaps(consumed: &[(usize, usize)], start: usize, end: usize) -> bool {
    consumed.iter().any(|&(s, e)| start < e && s < end)
}

/// First occurrence of `needle` that does not overlap an already-consumed span.
pub(crate) fn find_unconsumed(
    content: &[u8],
    needle: &[u8],
    consumed: &[(usize, usize)],
) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = find_subslice(content, needle, from) {
        if !overlaps(consumed, pos, pos + needle.len()) {
            return Some(pos);
        }
        from = pos + 1;
    }
    None
}

pub(crate) fn splice(
    content: &mut Vec<u8>,
    consumed: &mut Vec<(usize, usize)>,
    pos: usize,
    old_len: usize,
    replacement: &[u8],
) {
    content.splice(pos..pos + old_len, replacement.iter().copied());
    let delta = replacement.len() as isize - old_len as isize;
    for span in consumed.iter_mut() {
        if span.0 >= pos + old_len {
            span.0 = (span.0 as isize + delta) as usize;
            span.1 = (span.1 as isize + delta) as usize;
        }
    }
    consumed.push((pos, pos + replacement.len()));
}

/// Apply this file's translations in emission order, consuming each match
/// exactly once. Returns the new bytes (when anything changed) plus
/// (applied, unresolved) counts.
pub(crate) fn apply_html_translations(
    original: &[u8],
    segments: &[&Segment],
    translations: &TranslationMap,
) -> (Option<Vec<u8>>, usize, usize) {
    let mut content = original.to_vec();
    let mut consumed: Vec<(usize, usize)> = Vec::new();
    let mut applied = 0usize;
    let mut unresolved = 0usize;
    let mut changed = false;

    for segment in segments {
        let Some(translated) = translations.get(&segment.id) else {
            continue;
        };

        match &segment.anchor {
            Anchor::HtmlText { literal, .. } => {
                let needle = literal.as_bytes();
                match find_unconsumed(&content, needle, &consumed) {
                    Some(pos) => {
                        if translated != literal {
                            splice(&mut content, &mut consumed, pos, needle.len(), translated.as_bytes());
                            changed = true;
                        } else {
                            consumed.push((pos, pos + needle.len()));
                        }
                        applied += 1;
                    }
                    None => {
                        warn!(segment = %segment.id, "anchor text not found, segment skipped");
                        unresolved += 1;
                    }
                }
            }
            Anchor::HtmlAttr { literal, .. } => {
                // Prefer a quoted match so we never rewrite element text by accident.
                let mut found = false;
                for quote in [b'"', b'\''] {
                    let mut needle = Vec::with_capacity(literal.len() + 2);
                    needle.push(quote);
                    needle.extend_from_slice(literal.as_bytes());
                    needle.push(quote);
                    if let Some(pos) = find_unconsumed(&content, &needle, &consumed) {
                        if translated != literal {
                            let mut replacement = Vec::with_capacity(translated.len() + 2);
                            replacement.push(quote);
                            replacement.extend_from_slice(translated.as_bytes());
                            replacement.push(quote);
                            splice(&mut content, &mut consumed, pos, needle.len(), &replacement);
                            changed = true;
                        } else {
                            consumed.push((pos, pos + needle.len()));
                        }
                        applied += 1;
                        found = true;
                        break;
                    }
                }
                if !found {
                    // Values with surrounding whitespace only match bare.
                    let needle = literal.as_bytes();
                    match find_unconsumed(&content, needle, &consumed) {
                        Some(pos) => {
                            if translated != literal {
                                splice(&mut content, &mut consumed, pos, needle.len(), translated.as_bytes());
                                changed = true;
                            } else {
                                consumed.push((pos, pos + needle.len()));
                            }
                            applied += 1;
                        }
                        None => {
                            warn!(segment = %segment.id, "anchor attribute not found, segment skipped");
                            unresolved += 1;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    (changed.then_some(content), applied, unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_str(html: &str) -> ExtractionResult {
        let mut result = ExtractionResult::default();
        extract(html.as_bytes(), "index.html", &mut result);
        result
    }

    #[test]
    fn test_extracts_direct_text_in_document_order() {
        let html = "<html><body><h1>Hola mundo</h1><p>Primer párrafo</p></body></html>";
        let result = extract_str(html);
        let ids: Vec<&str> = result.segments.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["html_index.html_h1_0", "html_index.html_p_1"]);
        assert_eq!(result.segments[0].text, "Hola mundo");
        assert_eq!(result.segments[1].text, "Primer párrafo");
    }

    #[test]
    fn test_skips_script_and_style_subtrees() {
        let html = "<div>Visible text<script>var hidden = 'Texto oculto';</script>\
                    <style>.c { content: 'nope'; }</style></div>";
        let result = extract_str(html);
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].text, "Visible text");
    }

    #[test]
    fn test_nested_elements_keep_direct_text_only() {
        let html = "<div>Outer <span>Inner text</span></div>";
        let result = extract_str(html);
        // div direct text "Outer" is too short alone? It is 5 chars, emitted.
        let texts: Vec<&str> = result.segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["Outer", "Inner text"]);
        // Shared ordinal counter: div is 0, span is 1.
        assert_eq!(result.segments[1].id, "html_index.html_span_1");
    }

    #[test]
    fn test_short_text_is_skipped() {
        let result = extract_str("<p>ok</p><p>long enough</p>");
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].text, "long enough");
    }

    #[test]
    fn test_translatable_attributes_are_emitted() {
        let html = r#"<p title="Un consejo">Texto del párrafo</p>"#;
        let result = extract_str(html);
        let ids: Vec<&str> = result.segments.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["html_index.html_p_0", "html_index.html_p_0_title"]
        );
        assert_eq!(result.segments[1].text, "Un consejo");
    }

    #[test]
    fn test_void_elements_do_not_break_nesting() {
        let html = "<p>Antes<br>Después de salto</p><p>Siguiente bloque</p>";
        let result = extract_str(html);
        let texts: Vec<&str> = result.segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["Antes Después de salto", "Siguiente bloque"]);
    }

    #[test]
    fn test_ids_are_stable_across_runs() {
        let html = "<h1>Título</h1><p>Texto</p><p>Texto</p>";
        let a = extract_str(html);
        let b = extract_str(html);
        let ids_a: Vec<_> = a.segments.iter().map(|s| &s.id).collect();
        let ids_b: Vec<_> = b.segments.iter().map(|s| &s.id).collect();
        assert_eq!(ids_a, ids_b);
    }

    fn seg_refs(result: &ExtractionResult) -> Vec<&Segment> {
        result.segments.iter().collect()
    }

    #[test]
    fn test_apply_replaces_first_occurrence() {
        let html = "<h1>Hola mundo</h1>";
        let result = extract_str(html);
        let mut translations = TranslationMap::new();
        translations.insert("html_index.html_h1_0".to_string(), "Hello world".to_string());

        let (out, applied, unresolved) =
            apply_html_translations(html.as_bytes(), &seg_refs(&result), &translations);
        assert_eq!(applied, 1);
        assert_eq!(unresolved, 0);
        assert_eq!(String::from_utf8(out.unwrap()).unwrap(), "<h1>Hello world</h1>");
    }

    #[test]
    fn test_apply_consumes_colliding_texts_once_each() {
        let html = "<p>Mismo texto</p><p>Mismo texto</p>";
        let result = extract_str(html);
        let mut translations = TranslationMap::new();
        translations.insert("html_index.html_p_0".to_string(), "Primera".to_string());
        translations.insert("html_index.html_p_1".to_string(), "Segunda".to_string());

        let (out, applied, _) =
            apply_html_translations(html.as_bytes(), &seg_refs(&result), &translations);
        assert_eq!(applied, 2);
        assert_eq!(
            String::from_utf8(out.unwrap()).unwrap(),
            "<p>Primera</p><p>Segunda</p>"
        );
    }

    #[test]
    fn test_apply_identity_first_then_translation_hits_second_occurrence() {
        let html = "<p>Mismo texto</p><p>Mismo texto</p>";
        let result = extract_str(html);
        let mut translations = TranslationMap::new();
        // First stays, second translated: the second replacement must not
        // touch the first element.
        translations.insert("html_index.html_p_0".to_string(), "Mismo texto".to_string());
        translations.insert("html_index.html_p_1".to_string(), "Cambiado".to_string());

        let (out, applied, _) =
            apply_html_translations(html.as_bytes(), &seg_refs(&result), &translations);
        assert_eq!(applied, 2);
        assert_eq!(
            String::from_utf8(out.unwrap()).unwrap(),
            "<p>Mismo texto</p><p>Cambiado</p>"
        );
    }

    #[test]
    fn test_apply_attribute_value() {
        let html = r#"<label title="Texto de ayuda">Nombre completo</label>"#;
        let result = extract_str(html);
        let mut translations = TranslationMap::new();
        translations.insert("html_index.html_label_0_title".to_string(), "Help text".to_string());

        let (out, applied, _) =
            apply_html_translations(html.as_bytes(), &seg_refs(&result), &translations);
        assert_eq!(applied, 1);
        assert_eq!(
            String::from_utf8(out.unwrap()).unwrap(),
            r#"<label title="Help text">Nombre completo</label>"#
        );
    }

    #[test]
    fn test_apply_missing_anchor_warns_and_skips() {
        let html = "<p>Texto original</p>";
        let result = extract_str(html);
        let mut translations = TranslationMap::new();
        translations.insert("html_index.html_p_0".to_string(), "Translated".to_string());

        // Pretend the staged copy diverged.
        let (out, applied, unresolved) =
            apply_html_translations(b"<p>Otro contenido</p>", &seg_refs(&result), &translations);
        assert!(out.is_none());
        assert_eq!(applied, 0);
        assert_eq!(unresolved, 1);
    }

    #[test]
    fn test_identity_translation_leaves_bytes_untouched() {
        let html = "<h1>Hola mundo</h1>";
        let result = extract_str(html);
        let mut translations = TranslationMap::new();
        translations.insert("html_index.html_h1_0".to_string(), "Hola mundo".to_string());

        let (out, applied, _) =
            apply_html_translations(html.as_bytes(), &seg_refs(&result), &translations);
        assert!(out.is_none());
        assert_eq!(applied, 1);
    }
}
