//! Per-language rebuild: stage a working copy, write translations back
//! through each segment's anchor, repackage.
//!
//! The manifest and HTML paths are raw-byte rewrites on purpose. Tree
//! serializers normalize attribute order, whitespace and declarations,
//! which breaks the round-trip property the repackager guarantees; do not
//! "fix" this into quick-xml writer code.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::escape::partial_escape;
use tracing::{error, info, warn};

use crate::archive;
use crate::error::Result;
use crate::extract::{
    apply_html_translations, apply_rise_translations, find_unconsumed, splice, ContentKind,
    ExtractionResult, RiseFields, Segment, TranslationMap, MANIFEST_FILE,
};
use crate::normalize;
use crate::package::Package;

#[derive(Debug, Clone, Copy, Default)]
pub struct RebuildStats {
    pub files_processed: usize,
    pub files_failed: usize,
    pub segments_applied: usize,
    pub anchors_unresolved: usize,
}

/// Rewrite `<title>` payloads (and metadata strings) in the raw manifest
/// bytes. Both sides are XML-escaped; each occurrence is consumed once.
fn apply_manifest_translations(
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

        let needle = format!(">{}<", partial_escape(&segment.text));
        let replacement = format!(">{}<", partial_escape(translated));

        match find_unconsumed(&content, needle.as_bytes(), &consumed) {
            Some(pos) => {
                if replacement != needle {
                    splice(
                        &mut content,
                        &mut consumed,
                        pos,
                        needle.len(),
                        replacement.as_bytes(),
                    );
                    changed = true;
                } else {
                    consumed.push((pos, pos + needle.len()));
                }
                applied += 1;
            }
            None => {
                warn!(segment = %segment.id, "manifest text not found, segment skipped");
                unresolved += 1;
            }
        }
    }

    (changed.then_some(content), applied, unresolved)
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if src.is_dir() {
            copy_dir(&src, &dst)?;
        } else {
            fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

/// Apply one file's segments to the working copy. Returns whether the file
/// was modified. Errors here demote the file to "copied unchanged".
fn apply_file(
    working_root: &Path,
    root_prefix: &str,
    rel_path: &str,
    segments: &[&Segment],
    translations: &TranslationMap,
    rise_fields: &RiseFields,
    rename_map: &HashMap<String, String>,
    stats: &mut RebuildStats,
) -> Result<bool> {
    let resolved = normalize::resolved_path(rename_map, rel_path);
    let disk_path = working_root.join(root_prefix).join(resolved);
    let original = fs::read(&disk_path)?;

    let kind = segments.first().map(|s| s.kind);
    let (updated, applied, unresolved) = match kind {
        Some(ContentKind::XmlText) => apply_manifest_translations(&original, segments, translations),
        Some(ContentKind::RiseJson) => {
            apply_rise_translations(&original, segments, translations, rise_fields)
        }
        Some(_) => apply_html_translations(&original, segments, translations),
        None => (None, 0, 0),
    };

    stats.segments_applied += applied;
    stats.anchors_unresolved += unresolved;

    match updated {
        Some(bytes) => {
            fs::write(&disk_path, bytes)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Build `<stem>_<lang>.zip` for one target language.
pub fn rebuild_language(
    pkg: &Package,
    extraction: &ExtractionResult,
    translations: &TranslationMap,
    rise_fields: &RiseFields,
    output_dir: &Path,
    target_language: &str,
    normalize_filenames: bool,
) -> Result<(PathBuf, RebuildStats)> {
    // Working copy is owned here and removed on every exit path.
    let working = tempfile::Builder::new().prefix("scorm_rebuild_").tempdir()?;
    copy_dir(pkg.scratch_dir(), working.path())?;

    let rename_map = if normalize_filenames {
        normalize::run(&working.path().join(&pkg.root_prefix))?
    } else {
        HashMap::new()
    };

    let mut stats = RebuildStats::default();
    let mut modified: HashSet<String> = HashSet::new();

    for (file, indices) in &extraction.by_file {
        let segments: Vec<&Segment> = indices.iter().map(|&i| &extraction.segments[i]).collect();
        let rel = if file.as_str() == MANIFEST_FILE {
            MANIFEST_FILE
        } else {
            file.as_str()
        };

        match apply_file(
            working.path(),
            &pkg.root_prefix,
            rel,
            &segments,
            translations,
            rise_fields,
            &rename_map,
            &mut stats,
        ) {
            Ok(true) => {
                stats.files_processed += 1;
                modified.insert(pkg.archive_path(normalize::resolved_path(&rename_map, rel)));
            }
            Ok(false) => {
                stats.files_processed += 1;
            }
            Err(e) => {
                error!(file = %rel, error = %e, "file rebuild failed, copied unchanged");
                stats.files_failed += 1;
            }
        }
    }

    let stem = pkg
        .original_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("package");
    let output_path = output_dir.join(format!("{}_{}.zip", stem, target_language));

    if rename_map.is_empty() {
        archive::repackage(&pkg.original_path, working.path(), &modified, &output_path)?;
    } else {
        archive::zip_directory(working.path(), &output_path)?;
    }

    info!(
        language = target_language,
        files = stats.files_processed,
        applied = stats.segments_applied,
        unresolved = stats.anchors_unresolved,
        output = %output_path.display(),
        "language rebuilt"
    );

    Ok((output_path, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Anchor;

    fn xml_segment(id: &str, text: &str) -> Segment {
        Segment {
            id: id.to_string(),
            text: text.to_string(),
            kind: ContentKind::XmlText,
            anchor: Anchor::XmlPath(format!("//title[.='{}']", text)),
            is_html: false,
            file_path: MANIFEST_FILE.to_string(),
            context: String::new(),
        }
    }

    #[test]
    fn test_manifest_rewrite_preserves_everything_else() {
        let xml = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
                   <!-- authored by tool -->\n\
                   <manifest identifier=\"m\">\n\
                     <organization identifier=\"o\"><title>Curso de Ejemplo</title></organization>\n\
                   </manifest>";
        let seg = xml_segment("org_o_title", "Curso de Ejemplo");
        let refs = vec![&seg];
        let mut translations = TranslationMap::new();
        translations.insert("org_o_title".to_string(), "Sample Course".to_string());

        let (out, applied, unresolved) =
            apply_manifest_translations(xml.as_bytes(), &refs, &translations);
        assert_eq!(applied, 1);
        assert_eq!(unresolved, 0);
        let out = String::from_utf8(out.unwrap()).unwrap();
        assert!(out.contains("<title>Sample Course</title>"));
        assert!(out.contains("<!-- authored by tool -->"));
        assert!(out.contains("encoding=\"UTF-8\""));
    }

    #[test]
    fn test_manifest_rewrite_escapes_markup_characters() {
        let xml = "<manifest><title>Ofertas &amp; Demanda</title></manifest>";
        let seg = xml_segment("t", "Ofertas & Demanda");
        let refs = vec![&seg];
        let mut translations = TranslationMap::new();
        translations.insert("t".to_string(), "Supply & Demand".to_string());

        let (out, applied, _) = apply_manifest_translations(xml.as_bytes(), &refs, &translations);
        assert_eq!(applied, 1);
        assert_eq!(
            String::from_utf8(out.unwrap()).unwrap(),
            "<manifest><title>Supply &amp; Demand</title></manifest>"
        );
    }

    #[test]
    fn test_manifest_identity_keeps_bytes() {
        let xml = "<manifest><title>Curso</title></manifest>";
        let seg = xml_segment("t", "Curso");
        let refs = vec![&seg];
        let mut translations = TranslationMap::new();
        translations.insert("t".to_string(), "Curso".to_string());

        let (out, applied, unresolved) =
            apply_manifest_translations(xml.as_bytes(), &refs, &translations);
        assert!(out.is_none());
        assert_eq!(applied, 1);
        assert_eq!(unresolved, 0);
    }

    #[test]
    fn test_manifest_duplicate_titles_consumed_in_order() {
        let xml = "<manifest><title>Tema</title><title>Tema</title></manifest>";
        let first = xml_segment("a", "Tema");
        let second = xml_segment("b", "Tema");
        let refs = vec![&first, &second];
        let mut translations = TranslationMap::new();
        translations.insert("a".to_string(), "Topic One".to_string());
        translations.insert("b".to_string(), "Topic Two".to_string());

        let (out, applied, _) = apply_manifest_translations(xml.as_bytes(), &refs, &translations);
        assert_eq!(applied, 2);
        assert_eq!(
            String::from_utf8(out.unwrap()).unwrap(),
            "<manifest><title>Topic One</title><title>Topic Two</title></manifest>"
        );
    }
}
