//! Shader-level driver: weaves the preferred technique of a `<shader>` and
//! assembles the document handed to the downstream shader compiler.

use std::collections::HashSet;

use anyhow::{Result, anyhow};

use crate::doc::{DocNode, Element, fingerprint, select_root};
use crate::weaver::WeaverCompiler;
use crate::weaver::builder::{SnippetNumbers, TechniqueGraphBuilder};
use crate::weaver::snippet::{FileAliases, SnippetParser, SnippetTree, node_or_from_file};
use crate::weaver::synth::{OuterPass, SynthesisOutput, Synthesizer};

struct PassCollector<'p, 'c> {
    parser: SnippetParser<'c>,
    aliases: &'p FileAliases,
    passes: Vec<OuterPass>,
    pending: Vec<DocNode>,
}

impl PassCollector<'_, '_> {
    fn push_pass(&mut self, pass: Element) {
        let key = format!("pass{}", self.passes.len());
        let snippet = self.parser.parse_pass(&pass, &key, self.aliases);
        self.passes.push(OuterPass {
            snippet,
            source: pass,
            pre_nodes: std::mem::take(&mut self.pending),
        });
    }

    /// One pass per `sequence` entry, each with an int parameter `param`
    /// set to the entry.
    fn generate_passes(&mut self, compiler: &WeaverCompiler, node: &Element) {
        let Some(param) = node.attr("param") else {
            compiler
                .reporter()
                .warn_at(node, "<passgen> node needs 'param' attribute");
            return;
        };
        let Some(sequence) = node.attr("sequence") else {
            compiler
                .reporter()
                .warn_at(node, "<passgen> node needs 'sequence' attribute");
            return;
        };
        let compare_sv = node.attr("comparesv");

        for value in sequence.split(',').map(str::trim).filter(|v| !v.is_empty()) {
            if let Some(sv) = compare_sv {
                self.pending
                    .push(DocNode::instruction(format!("if vars.\"{sv}\".int >= {value}")));
            }
            let mut pass = Element::new("pass");
            let mut has_param = false;
            for child in &node.children {
                pass.push(child.clone());
                if !has_param && child.as_element().is_some_and(|e| e.name == "combiner") {
                    pass.push(
                        Element::new("parameter")
                            .with_attr("id", param)
                            .with_attr("type", "int")
                            .with_text(value),
                    );
                    has_param = true;
                }
            }
            self.push_pass(pass);
            if compare_sv.is_some() {
                self.pending.push(DocNode::instruction("endif"));
            }
        }
    }
}

fn dedup_shader_vars(vars: Vec<Element>) -> Element {
    let mut seen = HashSet::new();
    let mut node = Element::new("shadervars");
    for var in vars {
        if let Some(name) = var.attr("name")
            && !seen.insert(name.to_string())
        {
            continue;
        }
        node.push(var);
    }
    node
}

impl WeaverCompiler {
    /// Weaves `doc` (a `<shader>` or a document containing one).
    ///
    /// Only the highest priority source technique is woven; the others are
    /// kept in a `<fallbackshader>`. A shader no combination could be built
    /// for comes back without techniques.
    pub fn compile_shader(&self, doc: &Element) -> Result<Element> {
        let source =
            select_root(doc, "shader").ok_or_else(|| anyhow!("document has no 'shader' node"))?;
        let name = source.attr("name").unwrap_or("(unnamed)");
        if let Some(compiler) = source.attr("compiler")
            && compiler != "shaderweaver"
        {
            log::warn!("shader '{name}' names compiler '{compiler}', weaving anyway");
        }

        let mut aliases = FileAliases::new();
        for alias in source.elements_named("alias") {
            aliases.parse_node(self, alias);
        }
        let mut techniques: Vec<&Element> = source.elements_named("technique").collect();
        techniques.sort_by_key(|t| std::cmp::Reverse(t.attr_int("priority")));

        let mut shader = Element::new("shader");
        shader.copy_attrs_from(source);
        shader.set_attr("compiler", "xmlshader");

        let mut shader_vars: Vec<Element> = source.elements_named("shadervar").cloned().collect();
        let woven = match techniques.first() {
            Some(best) => self.weave_technique(name, best, &aliases),
            None => {
                self.reporter().warn_at(source, "Shader has no techniques");
                SynthesisOutput::default()
            }
        };
        shader_vars.extend(woven.shader_vars);
        let shader_vars = dedup_shader_vars(shader_vars);
        if !shader_vars.children.is_empty() {
            shader.push(shader_vars);
        }

        let count = woven.techniques.len();
        log::info!("shader '{name}': {count} techniques");
        for (index, generated) in woven.techniques.into_iter().enumerate() {
            let mut node = generated.node;
            node.set_attr("priority", (count - index).to_string());
            match generated.condition {
                Some(condition) => {
                    shader.push(DocNode::instruction(format!("if {condition}")));
                    shader.push(node);
                    shader.push(DocNode::instruction("endif"));
                }
                None => shader.push(node),
            }
        }

        if let [best, second, ..] = techniques.as_slice() {
            let mut fallback = Element::new("fallbackshader");
            fallback.copy_attrs_from(source);
            let base = name.split("@@").next().unwrap_or(name);
            fallback.set_attr("name", format!("{base}@@{}", second.attr_int("priority")));
            for child in &source.children {
                if child.as_element().is_some_and(|e| std::ptr::eq(e, *best)) {
                    continue;
                }
                fallback.push(child.clone());
            }
            shader.push(fallback);
        } else if let Some(fallback) = source.child("fallbackshader") {
            shader.push(fallback.clone());
        }

        let mut code_strings: Vec<String> = woven.loaders.iter().map(|l| l.code_string()).collect();
        code_strings.sort();
        let mut cache_tag = fingerprint(&source.flatten());
        for code in code_strings {
            cache_tag.push(';');
            cache_tag.push_str(&code);
        }
        shader.set_attr("_cachetag", cache_tag);
        Ok(shader)
    }

    fn weave_technique(
        &self,
        shader_name: &str,
        technique: &Element,
        aliases: &FileAliases,
    ) -> SynthesisOutput {
        let mut tree = SnippetTree::new();
        let (passes, post_nodes) = {
            let mut collector = PassCollector {
                parser: SnippetParser::new(self, &mut tree),
                aliases,
                passes: Vec::new(),
                pending: Vec::new(),
            };
            for child in &technique.children {
                match child.as_element() {
                    Some(el) if el.name == "pass" => {
                        if let Some((pass, _)) = node_or_from_file(self, el, "pass", aliases) {
                            collector.push_pass(pass);
                        }
                    }
                    Some(el) if el.name == "passgen" => collector.generate_passes(self, el),
                    _ => collector.pending.push(child.clone()),
                }
            }
            (collector.passes, collector.pending)
        };

        let numbers = SnippetNumbers::from_tree(&tree);
        let builder = TechniqueGraphBuilder::new(&tree, &numbers);
        let graphs = passes.iter().map(|p| builder.build_graphs(p.snippet)).collect();
        Synthesizer::new(self, &tree, shader_name, passes, graphs, post_nodes).synthesize(technique)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_vars_dedup_by_name() {
        let vars = vec![
            Element::new("shadervar").with_attr("name", "a").with_text("1"),
            Element::new("shadervar").with_attr("name", "a").with_text("2"),
            Element::new("shadervar").with_attr("name", "b"),
        ];
        let node = dedup_shader_vars(vars);
        assert_eq!(node.elements().count(), 2);
        assert_eq!(node.elements().next().map(Element::text), Some("1".to_string()));
    }
}
