//! XML_TEXT segments from the parsed manifest tree.

use crate::manifest::ManifestTree;

use super::{Anchor, ContentKind, ExtractionResult, Segment, MANIFEST_FILE};

// Single-character titles are noise, not course structure.
const MIN_XML_TEXT_LENGTH: usize = 2;

fn push_xml_segment(result: &mut ExtractionResult, id: String, text: &str, context: String, xpath: String) {
    let text = text.trim();
    if text.chars().count() < MIN_XML_TEXT_LENGTH {
        return;
    }
    result.push(Segment {
        id,
        text: text.to_string(),
        kind: ContentKind::XmlText,
        anchor: Anchor::XmlPath(xpath),
        is_html: false,
        file_path: MANIFEST_FILE.to_string(),
        context,
    });
}

/// Document-order walk: course metadata, then each organization's title,
/// then every item title depth first.
pub fn extract(manifest: &ManifestTree, result: &mut ExtractionResult) {
    if let Some(title) = &manifest.metadata_title {
        push_xml_segment(
            result,
            "manifest_metadata_title".to_string(),
            title,
            "Course title (metadata)".to_string(),
            "//metadata/lom/general/title/langstring".to_string(),
        );
    }

    if let Some(description) = &manifest.metadata_description {
        push_xml_segment(
            result,
            "manifest_metadata_description".to_string(),
            description,
            "Course description (metadata)".to_string(),
            "//metadata/lom/general/description/langstring".to_string(),
        );
    }

    for org in &manifest.organizations {
        if !org.title.is_empty() {
            push_xml_segment(
                result,
                format!("org_{}_title", org.identifier),
                &org.title,
                format!("Organization '{}' title", org.identifier),
                format!("//organization[@identifier='{}']/title", org.identifier),
            );
        }

        for idx in manifest.items_in_order(org) {
            let item = &manifest.items[idx];
            if item.title.is_empty() {
                continue;
            }
            push_xml_segment(
                result,
                format!("item_{}_title", item.identifier),
                &item.title,
                format!("Item '{}' title", item.identifier),
                format!("//item[@identifier='{}']/title", item.identifier),
            );
        }
    }
}
