//! XXE-hardened parser for `imsmanifest.xml`.
//!
//! quick-xml never resolves external entities, never loads DTDs and never
//! touches the network; on top of that the walk bounds nesting depth and
//! total event count so a crafted manifest cannot blow up the tree.
//!
//! Items live in a flat arena indexed by position; parentage is an index
//! comparison, which keeps "direct child of X" queries trivial and the
//! walk order identical to document order.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TranslateError};

const MAX_DEPTH: usize = 64;
const MAX_EVENTS: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScormVersion {
    V12,
    V2004,
    Xapi,
}

impl ScormVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScormVersion::V12 => "1.2",
            ScormVersion::V2004 => "2004",
            ScormVersion::Xapi => "xapi",
        }
    }
}

/// SCORM 2004 sequencing control-mode flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlMode {
    pub choice: bool,
    pub flow: bool,
    pub forward_only: bool,
    pub constrained_choice: bool,
    pub prevent_activation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub identifier: String,
    pub satisfied_by_measure: bool,
    pub min_normalized_measure: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestItem {
    pub identifier: String,
    pub title: String,
    pub identifierref: Option<String>,
    pub parameters: Option<String>,
    pub is_visible: bool,
    /// Arena index of the parent item; `None` for organization-level items.
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    // SCORM 2004 only
    pub control_mode: Option<ControlMode>,
    pub objectives: Vec<Objective>,
    pub completion_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub identifier: String,
    pub title: String,
    pub structure: Option<String>,
    /// Arena indices of the organization's top-level items.
    pub roots: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestResource {
    pub identifier: String,
    pub resource_type: String,
    pub href: Option<String>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestTree {
    pub identifier: String,
    pub version: ScormVersion,
    pub schema_version: Option<String>,
    pub metadata_title: Option<String>,
    pub metadata_description: Option<String>,
    pub metadata_language: Option<String>,
    pub default_organization: Option<String>,
    pub organizations: Vec<Organization>,
    /// Item arena in document order.
    pub items: Vec<ManifestItem>,
    pub resources: Vec<ManifestResource>,
}

impl ManifestTree {
    /// First `<title>` descendant of any organization, in document order.
    pub fn course_title(&self) -> Option<&str> {
        for org in &self.organizations {
            if !org.title.trim().is_empty() {
                return Some(org.title.trim());
            }
            for &root in &org.roots {
                if let Some(title) = self.first_item_title(root) {
                    return Some(title);
                }
            }
        }
        None
    }

    fn first_item_title(&self, idx: usize) -> Option<&str> {
        let item = &self.items[idx];
        if !item.title.trim().is_empty() {
            return Some(item.title.trim());
        }
        item.children.iter().find_map(|&c| self.first_item_title(c))
    }

    /// Document-order indices of an organization's items, depth first.
    pub fn items_in_order(&self, org: &Organization) -> Vec<usize> {
        let mut out = Vec::new();
        for &root in &org.roots {
            self.push_subtree(root, &mut out);
        }
        out
    }

    fn push_subtree(&self, idx: usize, out: &mut Vec<usize>) {
        out.push(idx);
        for &child in &self.items[idx].children {
            self.push_subtree(child, out);
        }
    }
}

fn attr(start: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    for a in start.attributes().flatten() {
        if a.key.local_name().as_ref() == name {
            return a
                .unescape_value()
                .map(|v| v.into_owned())
                .ok()
                .or_else(|| Some(String::from_utf8_lossy(&a.value).into_owned()));
        }
    }
    None
}

fn attr_bool(start: &BytesStart<'_>, name: &[u8], default: bool) -> bool {
    match attr(start, name) {
        Some(v) => v.eq_ignore_ascii_case("true"),
        None => default,
    }
}

/// Detect the SCORM flavor per the schemaversion/namespace rules.
fn detect_version(schema_version: Option<&str>, default_namespace: Option<&str>) -> ScormVersion {
    if let Some(sv) = schema_version {
        let sv = sv.to_lowercase();
        if sv.contains("1.2") || sv.contains("1.1") {
            return ScormVersion::V12;
        }
        if sv.contains("2004") || sv.contains("1.3") {
            return ScormVersion::V2004;
        }
    }
    if let Some(ns) = default_namespace {
        if ns.to_lowercase().contains("tincan") {
            return ScormVersion::Xapi;
        }
    }
    ScormVersion::V12
}

/// Parse raw `imsmanifest.xml` bytes into a [`ManifestTree`].
pub fn parse_manifest(bytes: &[u8]) -> Result<ManifestTree> {
    let text = String::from_utf8_lossy(bytes);
    let mut reader = Reader::from_str(&text);
    reader.check_end_names(false);

    let mut tree = ManifestTree {
        identifier: "unknown".to_string(),
        version: ScormVersion::V12,
        schema_version: None,
        metadata_title: None,
        metadata_description: None,
        metadata_language: None,
        default_organization: None,
        organizations: Vec::new(),
        items: Vec::new(),
        resources: Vec::new(),
    };

    // Element stack of local names, lowercased.
    let mut stack: Vec<String> = Vec::new();
    // Open-item arena indices, innermost last.
    let mut item_stack: Vec<usize> = Vec::new();
    let mut default_namespace: Option<String> = None;
    let mut events = 0usize;
    let mut saw_root = false;

    loop {
        events += 1;
        if events > MAX_EVENTS {
            return Err(TranslateError::MalformedManifest(
                "manifest exceeds event limit".to_string(),
            ));
        }

        let event = reader
            .read_event()
            .map_err(|e| TranslateError::MalformedManifest(e.to_string()))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();

                if stack.len() >= MAX_DEPTH {
                    return Err(TranslateError::MalformedManifest(
                        "manifest exceeds depth limit".to_string(),
                    ));
                }

                match local.as_str() {
                    "manifest" if stack.is_empty() => {
                        saw_root = true;
                        if let Some(id) = attr(e, b"identifier") {
                            tree.identifier = id;
                        }
                        if let Some(sv) = attr(e, b"schemaversion") {
                            tree.schema_version = Some(sv);
                        }
                        for a in e.attributes().flatten() {
                            if a.key.as_ref() == b"xmlns" {
                                default_namespace =
                                    Some(String::from_utf8_lossy(&a.value).into_owned());
                            }
                        }
                    }
                    "organizations" => {
                        tree.default_organization = attr(e, b"default");
                    }
                    "organization" if parent_is(&stack, "organizations") => {
                        tree.organizations.push(Organization {
                            identifier: attr(e, b"identifier").unwrap_or_default(),
                            title: String::new(),
                            structure: attr(e, b"structure"),
                            roots: Vec::new(),
                        });
                    }
                    "item" => {
                        let idx = tree.items.len();
                        let parent = item_stack.last().copied();
                        tree.items.push(ManifestItem {
                            identifier: attr(e, b"identifier").unwrap_or_default(),
                            title: String::new(),
                            identifierref: attr(e, b"identifierref"),
                            parameters: attr(e, b"parameters"),
                            is_visible: attr_bool(e, b"isvisible", true),
                            parent,
                            children: Vec::new(),
                            control_mode: None,
                            objectives: Vec::new(),
                            completion_threshold: None,
                        });
                        match parent {
                            Some(p) => tree.items[p].children.push(idx),
                            None => {
                                if let Some(org) = tree.organizations.last_mut() {
                                    org.roots.push(idx);
                                }
                            }
                        }
                        if !is_empty {
                            item_stack.push(idx);
                        }
                    }
                    "controlmode" if in_element(&stack, "sequencing") => {
                        if let Some(&owner) = item_stack.last() {
                            tree.items[owner].control_mode = Some(ControlMode {
                                choice: attr_bool(e, b"choice", true),
                                flow: attr_bool(e, b"flow", false),
                                forward_only: attr_bool(e, b"forwardOnly", false),
                                constrained_choice: attr_bool(e, b"constrainedChoice", false),
                                prevent_activation: attr_bool(e, b"preventActivation", false),
                            });
                        }
                    }
                    "primaryobjective" | "objective" if in_element(&stack, "objectives") => {
                        if let Some(&owner) = item_stack.last() {
                            tree.items[owner].objectives.push(Objective {
                                identifier: attr(e, b"objectiveID")
                                    .or_else(|| attr(e, b"objectiveid"))
                                    .unwrap_or_default(),
                                satisfied_by_measure: attr_bool(e, b"satisfiedByMeasure", false),
                                min_normalized_measure: None,
                            });
                        }
                    }
                    "completionthreshold" => {
                        if let Some(&owner) = item_stack.last() {
                            if let Some(v) = attr(e, b"minProgressMeasure") {
                                tree.items[owner].completion_threshold = v.parse().ok();
                            }
                        }
                    }
                    "resource" if parent_is(&stack, "resources") => {
                        tree.resources.push(ManifestResource {
                            identifier: attr(e, b"identifier").unwrap_or_default(),
                            resource_type: attr(e, b"type")
                                .unwrap_or_else(|| "webcontent".to_string()),
                            href: attr(e, b"href"),
                            files: Vec::new(),
                        });
                    }
                    "file" if parent_is(&stack, "resource") => {
                        if let Some(href) = attr(e, b"href") {
                            if let Some(res) = tree.resources.last_mut() {
                                res.files.push(href);
                            }
                        }
                    }
                    _ => {}
                }

                if !is_empty {
                    stack.push(local);
                }
            }
            Event::Text(ref t) => {
                let value = t
                    .unescape()
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).into_owned());
                handle_text(&mut tree, &stack, &item_stack, &value);
            }
            Event::CData(ref t) => {
                let value = String::from_utf8_lossy(t.as_ref()).into_owned();
                handle_text(&mut tree, &stack, &item_stack, &value);
            }
            Event::End(_) => {
                if let Some(closed) = stack.pop() {
                    if closed == "item" {
                        item_stack.pop();
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(TranslateError::MalformedManifest(
            "no <manifest> root element".to_string(),
        ));
    }

    tree.version = detect_version(tree.schema_version.as_deref(), default_namespace.as_deref());

    check_identifierrefs(&tree);

    Ok(tree)
}

fn handle_text(tree: &mut ManifestTree, stack: &[String], item_stack: &[usize], raw: &str) {
    let value = raw.trim();
    if value.is_empty() {
        return;
    }
    let Some(current) = stack.last() else { return };

    match current.as_str() {
        "schemaversion" if tree.schema_version.is_none() => {
            tree.schema_version = Some(value.to_string());
        }
        "title" => {
            match stack.get(stack.len().wrapping_sub(2)).map(String::as_str) {
                Some("organization") => {
                    if let Some(org) = tree.organizations.last_mut() {
                        if org.title.is_empty() {
                            org.title = value.to_string();
                        }
                    }
                }
                Some("item") => {
                    if let Some(&owner) = item_stack.last() {
                        if tree.items[owner].title.is_empty() {
                            tree.items[owner].title = value.to_string();
                        }
                    }
                }
                _ => {}
            }
        }
        // <langstring> children of metadata title/description (LOM layout).
        "langstring" | "string" if in_element(stack, "metadata") => {
            if in_element(stack, "title") && tree.metadata_title.is_none() {
                tree.metadata_title = Some(value.to_string());
            } else if in_element(stack, "description") && tree.metadata_description.is_none() {
                tree.metadata_description = Some(value.to_string());
            }
        }
        "language" if in_element(stack, "metadata") && tree.metadata_language.is_none() => {
            tree.metadata_language = Some(value.to_string());
        }
        "minnormalizedmeasure" => {
            if let Some(&owner) = item_stack.last() {
                if let Some(obj) = tree.items[owner].objectives.last_mut() {
                    obj.min_normalized_measure = value.parse().ok();
                }
            }
        }
        "completionthreshold" => {
            if let Some(&owner) = item_stack.last() {
                if tree.items[owner].completion_threshold.is_none() {
                    tree.items[owner].completion_threshold = value.parse().ok();
                }
            }
        }
        _ => {}
    }
}

fn parent_is(stack: &[String], name: &str) -> bool {
    stack.last().map(String::as_str) == Some(name)
}

fn in_element(stack: &[String], name: &str) -> bool {
    stack.iter().any(|s| s == name)
}

/// Every identifierref should resolve to some resource id. Broken links are
/// common in exported packages, so this only warns.
fn check_identifierrefs(tree: &ManifestTree) {
    for item in &tree.items {
        if let Some(idref) = &item.identifierref {
            if !tree.resources.iter().any(|r| &r.identifier == idref) {
                warn!(
                    item = %item.identifier,
                    identifierref = %idref,
                    "item references a resource that does not exist"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCORM12: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest identifier="curso-001" version="1.0"
    xmlns="http://www.imsproject.org/xsd/imscp_rootv1p1p2"
    xmlns:adlcp="http://www.adlnet.org/xsd/adlcp_rootv1p2">
  <metadata>
    <schema>ADL SCORM</schema>
    <schemaversion>1.2</schemaversion>
  </metadata>
  <organizations default="org1">
    <organization identifier="org1">
      <title>Curso de Ejemplo</title>
      <item identifier="item1" identifierref="res1">
        <title>Lección 1</title>
        <item identifier="item1a" identifierref="res1">
          <title>Parte A</title>
        </item>
      </item>
    </organization>
  </organizations>
  <resources>
    <resource identifier="res1" type="webcontent" href="index.html" adlcp:scormtype="sco">
      <file href="index.html"/>
      <file href="style.css"/>
    </resource>
  </resources>
</manifest>"#;

    const SCORM2004: &str = r#"<?xml version="1.0"?>
<manifest identifier="c2004" schemaversion="2004 3rd Edition"
    xmlns="http://www.imsglobal.org/xsd/imscp_v1p1"
    xmlns:imsss="http://www.imsglobal.org/xsd/imsss">
  <organizations default="o1">
    <organization identifier="o1">
      <title>Advanced Course</title>
      <item identifier="i1" identifierref="r1">
        <title>Module 1</title>
        <imsss:sequencing>
          <imsss:controlMode choice="true" flow="true" forwardOnly="false"/>
          <imsss:objectives>
            <imsss:primaryObjective objectiveID="obj1" satisfiedByMeasure="true">
              <imsss:minNormalizedMeasure>0.8</imsss:minNormalizedMeasure>
            </imsss:primaryObjective>
          </imsss:objectives>
        </imsss:sequencing>
      </item>
    </organization>
  </organizations>
  <resources>
    <resource identifier="r1" type="webcontent" href="sco1.html"/>
  </resources>
</manifest>"#;

    #[test]
    fn test_parses_scorm12_structure() {
        let tree = parse_manifest(SCORM12.as_bytes()).unwrap();
        assert_eq!(tree.version, ScormVersion::V12);
        assert_eq!(tree.identifier, "curso-001");
        assert_eq!(tree.organizations.len(), 1);
        assert_eq!(tree.organizations[0].title, "Curso de Ejemplo");
        assert_eq!(tree.items.len(), 2);
        assert_eq!(tree.items[0].title, "Lección 1");
        assert_eq!(tree.items[1].title, "Parte A");
        assert_eq!(tree.items[1].parent, Some(0));
        assert_eq!(tree.items[0].children, vec![1]);
        assert_eq!(tree.resources.len(), 1);
        assert_eq!(tree.resources[0].files, vec!["index.html", "style.css"]);
        assert_eq!(tree.default_organization.as_deref(), Some("org1"));
    }

    #[test]
    fn test_detects_scorm2004_and_sequencing() {
        let tree = parse_manifest(SCORM2004.as_bytes()).unwrap();
        assert_eq!(tree.version, ScormVersion::V2004);
        let item = &tree.items[0];
        let cm = item.control_mode.as_ref().expect("control mode parsed");
        assert!(cm.choice);
        assert!(cm.flow);
        assert!(!cm.forward_only);
        assert_eq!(item.objectives.len(), 1);
        assert_eq!(item.objectives[0].identifier, "obj1");
        assert!(item.objectives[0].satisfied_by_measure);
        assert_eq!(item.objectives[0].min_normalized_measure, Some(0.8));
    }

    #[test]
    fn test_version_defaults_to_12() {
        let xml = r#"<manifest identifier="x"><organizations/></manifest>"#;
        let tree = parse_manifest(xml.as_bytes()).unwrap();
        assert_eq!(tree.version, ScormVersion::V12);
    }

    #[test]
    fn test_version_tincan_namespace() {
        let xml = r#"<manifest identifier="x" xmlns="http://projecttincan.com/tincan.xsd"/>"#;
        let tree = parse_manifest(xml.as_bytes()).unwrap();
        assert_eq!(tree.version, ScormVersion::Xapi);
    }

    #[test]
    fn test_xxe_entity_is_not_expanded() {
        let xml = r#"<?xml version="1.0"?>
<!DOCTYPE manifest [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<manifest identifier="m">
  <organizations>
    <organization identifier="o"><title>&xxe;</title></organization>
  </organizations>
</manifest>"#;
        let tree = parse_manifest(xml.as_bytes()).unwrap();
        // The entity must never be fetched or expanded into file contents.
        assert!(!tree.organizations[0].title.contains("root:"));
    }

    #[test]
    fn test_input_without_manifest_root_is_an_error() {
        let err = parse_manifest(b"this is not a manifest").unwrap_err();
        assert!(matches!(err, TranslateError::MalformedManifest(_)));
    }

    #[test]
    fn test_course_title_prefers_org_title() {
        let tree = parse_manifest(SCORM12.as_bytes()).unwrap();
        assert_eq!(tree.course_title(), Some("Curso de Ejemplo"));
    }

    #[test]
    fn test_items_in_order_is_depth_first() {
        let tree = parse_manifest(SCORM12.as_bytes()).unwrap();
        let order = tree.items_in_order(&tree.organizations[0]);
        assert_eq!(order, vec![0, 1]);
    }
}
