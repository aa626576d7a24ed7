//! Structure-preserving translation of strings that contain inline HTML.
//!
//! Only text nodes are translated; tags, attributes and entity references
//! pass through byte-for-byte. Leading and trailing whitespace of each
//! text node is kept around the translated core.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::Result;

use super::TranslationProvider;

/// Text nodes shorter than this stay untranslated.
const MIN_NODE_LENGTH: usize = 2;

pub fn translate_html_string(
    provider: &mut dyn TranslationProvider,
    html: &str,
    source: &str,
    target: &str,
) -> Result<String> {
    let mut reader = Reader::from_str(html);
    reader.check_end_names(false);

    let mut out = String::with_capacity(html.len());

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                out.push('<');
                out.push_str(&String::from_utf8_lossy(&e));
                out.push('>');
            }
            Ok(Event::Empty(e)) => {
                out.push('<');
                out.push_str(&String::from_utf8_lossy(&e));
                out.push_str("/>");
            }
            Ok(Event::End(e)) => {
                out.push_str("</");
                out.push_str(&String::from_utf8_lossy(e.name().as_ref()));
                out.push('>');
            }
            Ok(Event::Text(t)) => {
                let raw = String::from_utf8_lossy(t.as_ref()).into_owned();
                let trimmed = raw.trim();
                if trimmed.chars().count() >= MIN_NODE_LENGTH {
                    let translated = provider.translate_one(trimmed, source, target)?;
                    let leading = &raw[..raw.len() - raw.trim_start().len()];
                    let trailing = &raw[raw.trim_end().len()..];
                    out.push_str(leading);
                    out.push_str(&translated);
                    out.push_str(trailing);
                } else {
                    out.push_str(&raw);
                }
            }
            Ok(Event::CData(t)) => {
                out.push_str("<![CDATA[");
                out.push_str(&String::from_utf8_lossy(t.as_ref()));
                out.push_str("]]>");
            }
            Ok(Event::Comment(t)) => {
                out.push_str("<!--");
                out.push_str(&String::from_utf8_lossy(t.as_ref()));
                out.push_str("-->");
            }
            Ok(Event::Eof) => break,
            // Declarations and PIs do not occur inside content strings;
            // anything else passes through dropped rather than corrupted.
            Ok(_) => {}
            Err(_) => {
                // Not parseable as markup after all: translate whole string.
                return provider.translate_one(html, source, target);
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SegmentRequest;

    struct Upper;

    impl TranslationProvider for Upper {
        fn name(&self) -> &'static str {
            "upper"
        }

        fn translate_many(
            &mut self,
            segments: &[SegmentRequest<'_>],
            _s: &str,
            _t: &str,
        ) -> Result<Vec<String>> {
            Ok(segments.iter().map(|s| s.text.to_uppercase()).collect())
        }

        fn translate_one(&mut self, text: &str, _s: &str, _t: &str) -> Result<String> {
            Ok(text.to_uppercase())
        }
    }

    #[test]
    fn test_translates_text_nodes_only() {
        let mut p = Upper;
        let out = translate_html_string(&mut p, "<p class=\"intro\">hola <b>mundo</b></p>", "es", "en")
            .unwrap();
        assert_eq!(out, "<p class=\"intro\">HOLA <b>MUNDO</b></p>");
    }

    #[test]
    fn test_short_nodes_stay_untranslated() {
        let mut p = Upper;
        let out = translate_html_string(&mut p, "<p>a</p>", "es", "en").unwrap();
        assert_eq!(out, "<p>a</p>");
    }

    #[test]
    fn test_whitespace_around_nodes_is_preserved() {
        let mut p = Upper;
        let out = translate_html_string(&mut p, "<p>  hola mundo  </p>", "es", "en").unwrap();
        assert_eq!(out, "<p>  HOLA MUNDO  </p>");
    }

    #[test]
    fn test_self_closing_tags_survive() {
        let mut p = Upper;
        let out = translate_html_string(&mut p, "<p>antes<br/>despues</p>", "es", "en").unwrap();
        assert_eq!(out, "<p>ANTES<br/>DESPUES</p>");
    }
}
