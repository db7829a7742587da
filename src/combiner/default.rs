use std::collections::BTreeSet;

use crate::combiner::{Combiner, OutputTarget};
use crate::doc::{DocNode, Element};

/// Combiner for blocks that are not program code: pass-level nodes
/// (`pass`), shader variable declarations (`shadervars`) and technique tags
/// (`tags`). Other locations are ignored.
#[derive(Debug, Default)]
pub struct DefaultCombiner {
    pass_nodes: Vec<DocNode>,
    shader_vars: Vec<Element>,
    tags: BTreeSet<String>,
}

impl DefaultCombiner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn take_shader_vars(&mut self) -> Vec<Element> {
        std::mem::take(&mut self.shader_vars)
    }

    pub fn take_tags(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.tags)
    }
}

impl Combiner for DefaultCombiner {
    fn begin_snippet(&mut self, _annotation: &str) {}
    fn add_input(&mut self, _name: &str, _ty: &str) {}
    fn add_input_value(&mut self, _name: &str, _ty: &str, _value: &str) {}
    fn add_output(&mut self, _name: &str, _ty: &str) {}
    fn input_rename(&mut self, _from: &str, _to: &str) {}
    fn output_rename(&mut self, _from: &str, _to: &str) {}
    fn link(&mut self, _from: &str, _to: &str) {}

    fn write_block(&mut self, location: &str, block: &Element) {
        match location {
            "pass" => self.pass_nodes.extend(block.children.iter().cloned()),
            "shadervars" => self
                .shader_vars
                .extend(block.elements().filter(|e| e.name == "shadervar").cloned()),
            "tags" => {
                for tag in block.elements_named("tag") {
                    let text = tag.text();
                    let text = text.trim();
                    if !text.is_empty() {
                        self.tags.insert(text.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    fn end_snippet(&mut self) -> bool {
        true
    }

    fn add_global(&mut self, _name: &str, _ty: &str, _annotation: Option<&str>) {}
    fn set_output(&mut self, _target: OutputTarget, _name: &str, _annotation: Option<&str>) {}

    fn write_to_pass(&mut self, pass: &mut Element) {
        pass.children.append(&mut self.pass_nodes);
    }

    fn query_input_tag(&self, location: &str, block: &Element) -> Option<String> {
        if location != "pass" {
            return None;
        }
        let mut result: Option<String> = None;
        for node in block.elements() {
            let tag = match node.name.as_str() {
                "texture" => node.attr("name").map(|n| format!("texture:{n}")),
                "buffer" => node.attr("source").map(|s| format!("buffer:{s}")),
                _ => None,
            };
            let Some(tag) = tag else { continue };
            match &result {
                Some(prev) if *prev != tag => return None,
                _ => result = Some(tag),
            }
        }
        result
    }
}
