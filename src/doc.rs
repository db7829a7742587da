//! Document tree shared by shader sources, snippet files, combiner libraries
//! and generated shaders.
//!
//! Documents are stored as JSON. An element is
//! `{"name": "..", "attrs": {..}, "children": [..]}`, the other node kinds are
//! `{"text": ".."}`, `{"comment": ".."}` and `{"pi": ".."}`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocNode {
    Text { text: String },
    Comment { comment: String },
    /// Processing instruction; conditional wrappers are stored as `if <cond>`
    /// and `endif`.
    Instruction { pi: String },
    Element(Element),
}

impl DocNode {
    pub fn text(text: impl Into<String>) -> Self {
        DocNode::Text { text: text.into() }
    }

    pub fn comment(comment: impl Into<String>) -> Self {
        DocNode::Comment {
            comment: comment.into(),
        }
    }

    pub fn instruction(pi: impl Into<String>) -> Self {
        DocNode::Instruction { pi: pi.into() }
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            DocNode::Element(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Element> for DocNode {
    fn from(e: Element) -> Self {
        DocNode::Element(e)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DocNode>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: impl Into<DocNode>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(DocNode::text(text));
        self
    }

    /// Attribute value; empty values count as absent.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn attr_int(&self, key: &str) -> i32 {
        self.attr(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn attr_bool(&self, key: &str) -> bool {
        matches!(
            self.attr(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("true" | "yes" | "on" | "1")
        )
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn copy_attrs_from(&mut self, other: &Element) {
        for (k, v) in &other.attrs {
            self.attrs.insert(k.clone(), v.clone());
        }
    }

    pub fn push(&mut self, node: impl Into<DocNode>) {
        self.children.push(node.into());
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(DocNode::as_element)
    }

    pub fn elements_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |e| e.name == name)
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// Concatenated text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|c| match c {
                DocNode::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Canonical single-string form used for hashing.
    pub fn flatten(&self) -> String {
        self.to_string()
    }
}

fn escape(s: &str, out: &mut impl fmt::Write, quote: bool) -> fmt::Result {
    for c in s.chars() {
        match c {
            '&' => out.write_str("&amp;")?,
            '<' => out.write_str("&lt;")?,
            '>' => out.write_str("&gt;")?,
            '"' if quote => out.write_str("&quot;")?,
            c => out.write_char(c)?,
        }
    }
    Ok(())
}

impl fmt::Display for DocNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocNode::Text { text } => escape(text, f, false),
            DocNode::Comment { comment } => write!(f, "<!--{comment}-->"),
            DocNode::Instruction { pi } => write!(f, "<?{pi}?>"),
            DocNode::Element(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        for (k, v) in &self.attrs {
            write!(f, " {k}=\"")?;
            escape(v, f, true)?;
            f.write_str("\"")?;
        }
        if self.children.is_empty() {
            return f.write_str("/>");
        }
        f.write_str(">")?;
        for c in &self.children {
            fmt::Display::fmt(c, f)?;
        }
        write!(f, "</{}>", self.name)
    }
}

/// FNV-1a over `text`, base64 encoded. Stable across runs and platforms.
pub fn fingerprint(text: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in text.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    base64::engine::general_purpose::STANDARD.encode(hash.to_le_bytes())
}

pub fn parse_document(text: &str) -> Result<Element> {
    serde_json::from_str(text).context("failed to parse document json")
}

pub fn load_document_from_path(path: impl AsRef<Path>) -> Result<Element> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read document at {}", path.display()))?;
    parse_document(&text).with_context(|| format!("invalid document {}", path.display()))
}

/// The element named `root_name`: `doc` itself, or its first child of that name.
pub fn select_root<'a>(doc: &'a Element, root_name: &str) -> Option<&'a Element> {
    if doc.name == root_name {
        Some(doc)
    } else {
        doc.child(root_name)
    }
}

/// Resolves `file="..."` references.
pub trait DocumentSource: Send + Sync {
    fn load(&self, path: &str) -> Result<Element>;
}

/// Loads documents relative to a root directory.
#[derive(Debug, Clone)]
pub struct FsDocumentSource {
    root: PathBuf,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DocumentSource for FsDocumentSource {
    fn load(&self, path: &str) -> Result<Element> {
        load_document_from_path(self.root.join(path))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentSource {
    docs: HashMap<String, Element>,
}

impl MemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, doc: Element) {
        self.docs.insert(path.into(), doc);
    }

    pub fn with(mut self, path: impl Into<String>, doc: Element) -> Self {
        self.insert(path, doc);
        self
    }
}

impl DocumentSource for MemoryDocumentSource {
    fn load(&self, path: &str) -> Result<Element> {
        self.docs
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no document registered at {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_nodes() {
        let doc = parse_document(
            r#"{"name":"block","attrs":{"location":"pass"},"children":[
                {"text":"a<b"},{"comment":"c"},{"pi":"if x"},
                {"name":"texture","attrs":{"name":"t"}}]}"#,
        )
        .unwrap_or_else(|e| panic!("parse failed: {e:#}"));
        assert_eq!(doc.attr("location"), Some("pass"));
        assert_eq!(doc.text(), "a<b");
        assert_eq!(doc.child("texture").and_then(|t| t.attr("name")), Some("t"));
        assert_eq!(
            doc.to_string(),
            "<block location=\"pass\">a&lt;b<!--c--><?if x?><texture name=\"t\"/></block>"
        );
    }

    #[test]
    fn empty_attribute_is_absent() {
        let e = Element::new("x").with_attr("a", "").with_attr("b", "yes");
        assert_eq!(e.attr("a"), None);
        assert!(e.attr_bool("b"));
        assert_eq!(e.attr_int("missing"), 0);
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }

    #[test]
    fn select_root_prefers_self() {
        let pass = Element::new("pass");
        let wrapper = Element::new("doc").with_child(Element::new("pass").with_attr("k", "v"));
        assert_eq!(select_root(&pass, "pass"), Some(&pass));
        assert_eq!(
            select_root(&wrapper, "pass").and_then(|p| p.attr("k")),
            Some("v")
        );
        assert!(select_root(&wrapper, "snippet").is_none());
    }
}
