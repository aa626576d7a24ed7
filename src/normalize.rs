//! Optional filename normalization.
//!
//! Some LMSes choke on accented or otherwise non-ASCII resource names.
//! When the pass is enabled it ASCII-folds every path in the working copy
//! and updates inbound references in HTML, XML, CSS and JS together.
//! When disabled, nothing here runs at all.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use tracing::debug;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::error::Result;

fn map_char(c: char) -> Option<&'static str> {
    Some(match c {
        'á' | 'à' | 'ä' | 'â' | 'ã' => "a",
        'é' | 'è' | 'ë' | 'ê' => "e",
        'í' | 'ì' | 'ï' | 'î' => "i",
        'ó' | 'ò' | 'ö' | 'ô' | 'õ' => "o",
        'ú' | 'ù' | 'ü' | 'û' => "u",
        'Á' | 'À' | 'Ä' | 'Â' | 'Ã' => "A",
        'É' | 'È' | 'Ë' | 'Ê' => "E",
        'Í' | 'Ì' | 'Ï' | 'Î' => "I",
        'Ó' | 'Ò' | 'Ö' | 'Ô' | 'Õ' => "O",
        'Ú' | 'Ù' | 'Ü' | 'Û' => "U",
        'ñ' => "n",
        'Ñ' => "N",
        'ç' => "c",
        'Ç' => "C",
        'ß' => "ss",
        ' ' => "_",
        '(' | ')' | '[' | ']' | '{' | '}' | '\'' | '"' | '`' | '´' | '¨' => "",
        _ => return None,
    })
}

/// Normalize one name component (no path separators, no extension logic).
pub fn normalize_single_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());

    for c in name.chars() {
        if let Some(mapped) = map_char(c) {
            out.push_str(mapped);
        } else if c.is_ascii() && (c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            out.push(c);
        } else {
            // Strip combining marks and keep the ASCII base if there is one.
            let base: String = c
                .to_string()
                .nfd()
                .filter(|c| !is_combining_mark(*c))
                .collect();
            if base.chars().all(|b| b.is_ascii_alphanumeric()) && !base.is_empty() {
                out.push_str(&base);
            } else {
                out.push('_');
            }
        }
    }

    // Collapse runs of underscores introduced above.
    let mut collapsed = String::with_capacity(out.len());
    let mut prev_underscore = false;
    for c in out.chars() {
        if c == '_' {
            if !prev_underscore {
                collapsed.push(c);
            }
            prev_underscore = true;
        } else {
            collapsed.push(c);
            prev_underscore = false;
        }
    }
    let trimmed = collapsed.trim_matches('_');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Normalize a file name, keeping the extension as-is.
pub fn normalize_filename(filename: &str) -> String {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => {
            let (stem, ext) = filename.split_at(pos);
            format!("{}{}", normalize_single_name(stem), ext)
        }
        _ => normalize_single_name(filename),
    }
}

/// Normalize a relative path: directory components as bare names, the last
/// component as a file name.
pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    let mut normalized: Vec<String> = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            normalized.push(normalize_filename(part));
        } else {
            normalized.push(normalize_single_name(part));
        }
    }
    normalized.join("/")
}

fn collect_relative_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_relative_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
            );
        }
    }
    Ok(())
}

/// Rename every file whose path normalizes differently. Returns the
/// original -> normalized map (empty when nothing changed).
pub fn normalize_tree(root: &Path) -> Result<HashMap<String, String>> {
    let mut files = Vec::new();
    collect_relative_files(root, root, &mut files)?;
    files.sort();

    let mut rename_map = HashMap::new();
    for rel in files {
        let normalized = normalize_path(&rel);
        if normalized == rel {
            continue;
        }
        let from = root.join(&rel);
        let to = root.join(&normalized);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, &to)?;
        debug!(from = %rel, to = %normalized, "renamed");
        rename_map.insert(rel, normalized);
    }

    if !rename_map.is_empty() {
        remove_empty_dirs(root, root)?;
    }
    Ok(rename_map)
}

fn remove_empty_dirs(root: &Path, dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            remove_empty_dirs(root, &path)?;
            if fs::read_dir(&path)?.next().is_none() {
                fs::remove_dir(&path)?;
            }
        }
    }
    Ok(())
}

fn replace_attr_refs(content: &str, attrs: &[&str], original: &str, normalized: &str) -> String {
    let mut updated = content.to_string();
    let escaped = regex::escape(original);
    for attr in attrs {
        let pattern = format!(r#"(?i)({}\s*=\s*["'])({})(["'])"#, attr, escaped);
        if let Ok(re) = Regex::new(&pattern) {
            updated = re
                .replace_all(&updated, format!("${{1}}{}${{3}}", normalized))
                .into_owned();
        }
    }
    updated
}

fn replace_css_urls(content: &str, original: &str, normalized: &str) -> String {
    let escaped = regex::escape(original);
    let pattern = format!(r#"(?i)(url\s*\(\s*["']?)({})(["']?\s*\))"#, escaped);
    match Regex::new(&pattern) {
        Ok(re) => re
            .replace_all(content, format!("${{1}}{}${{3}}", normalized))
            .into_owned(),
        Err(_) => content.to_string(),
    }
}

pub fn update_references_in_html(content: &str, rename_map: &HashMap<String, String>) -> String {
    let mut updated = content.to_string();
    for (original, normalized) in rename_map {
        updated = replace_attr_refs(
            &updated,
            &["src", "href", "data-src", "poster", "background"],
            original,
            normalized,
        );
        updated = replace_css_urls(&updated, original, normalized);
    }
    updated
}

pub fn update_references_in_xml(content: &str, rename_map: &HashMap<String, String>) -> String {
    let mut updated = content.to_string();
    for (original, normalized) in rename_map {
        updated = replace_attr_refs(&updated, &["href", "xml:base"], original, normalized);
    }
    updated
}

pub fn update_references_in_css(content: &str, rename_map: &HashMap<String, String>) -> String {
    let mut updated = content.to_string();
    for (original, normalized) in rename_map {
        updated = replace_css_urls(&updated, original, normalized);
    }
    updated
}

pub fn update_references_in_js(content: &str, rename_map: &HashMap<String, String>) -> String {
    let mut updated = content.to_string();
    for (original, normalized) in rename_map {
        updated = updated.replace(&format!("\"{}\"", original), &format!("\"{}\"", normalized));
        updated = updated.replace(&format!("'{}'", original), &format!("'{}'", normalized));
    }
    updated
}

/// The whole pass: rename, then update references across all four file
/// types in one sweep so no reference is left pointing at an old name.
pub fn run(root: &Path) -> Result<HashMap<String, String>> {
    let rename_map = normalize_tree(root)?;
    if rename_map.is_empty() {
        return Ok(rename_map);
    }

    let mut files = Vec::new();
    collect_relative_files(root, root, &mut files)?;
    for rel in files {
        let path = root.join(&rel);
        let ext = Path::new(&rel)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            // Binary file: nothing to rewrite.
            Err(_) => continue,
        };

        let updated = match ext.as_str() {
            "html" | "htm" => update_references_in_html(&content, &rename_map),
            "xml" => update_references_in_xml(&content, &rename_map),
            "css" => update_references_in_css(&content, &rename_map),
            "js" => update_references_in_js(&content, &rename_map),
            _ => continue,
        };

        if updated != content {
            fs::write(&path, updated)?;
            debug!(file = %rel, "references updated");
        }
    }

    Ok(rename_map)
}

/// Where a (possibly renamed) package-relative path now lives.
pub fn resolved_path<'a>(rename_map: &'a HashMap<String, String>, rel: &'a str) -> &'a str {
    rename_map.get(rel).map(String::as_str).unwrap_or(rel)
}
