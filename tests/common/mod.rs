#![allow(dead_code)]

use std::sync::Arc;

use shader_weaver::doc::{DocNode, Element, MemoryDocumentSource};
use shader_weaver::weaver::builder::{SnippetNumbers, TechniqueGraphBuilder};
use shader_weaver::weaver::graph::TechniqueGraph;
use shader_weaver::weaver::snippet::{FileAliases, SnippetParser, SnippetTree};
use shader_weaver::weaver::technique::SnippetId;
use shader_weaver::{WeaverCompiler, WeaverConfig};

pub const CG: &str = "weaver.combiner.glcg";

pub fn compiler(docs: MemoryDocumentSource) -> WeaverCompiler {
    compiler_with(
        WeaverConfig {
            threaded_synthesis: false,
            ..WeaverConfig::default()
        },
        docs,
    )
}

pub fn compiler_with(config: WeaverConfig, docs: MemoryDocumentSource) -> WeaverCompiler {
    WeaverCompiler::new(config, Arc::new(docs))
}

pub fn combiner() -> Element {
    Element::new("combiner").with_attr("name", "cg").with_attr("plugin", CG)
}

pub fn input(name: &str, ty: &str) -> Element {
    Element::new("input").with_attr("name", name).with_attr("type", ty)
}

pub fn output(name: &str, ty: &str) -> Element {
    Element::new("output").with_attr("name", name).with_attr("type", ty)
}

pub fn fragment(code: &str) -> Element {
    Element::new("block")
        .with_attr("location", "cg:fragmentMain")
        .with_text(code)
}

pub fn vertex(code: &str) -> Element {
    Element::new("block")
        .with_attr("location", "cg:vertexMain")
        .with_text(code)
}

/// Atom technique with a `cg` combiner and the given children.
pub fn atom(priority: i32, children: Vec<Element>) -> Element {
    children.into_iter().fold(
        Element::new("technique")
            .with_attr("priority", priority.to_string())
            .with_child(combiner()),
        |t, c| t.with_child(c),
    )
}

pub fn snippet(id: &str, techniques: Vec<Element>) -> Element {
    techniques
        .into_iter()
        .fold(Element::new("snippet").with_attr("id", id), |s, t| s.with_child(t))
}

pub fn position_snippet() -> Element {
    snippet(
        "position",
        vec![atom(
            0,
            vec![
                output("position", "position4_screen"),
                vertex("position = mul (ModelViewProj, vertexIn.position);"),
            ],
        )],
    )
}

pub fn red_snippet(id: &str) -> Element {
    snippet(
        id,
        vec![atom(
            0,
            vec![output("color", "rgba"), fragment("color = float4 (1, 0, 0, 1);")],
        )],
    )
}

pub fn connection(from: &str, to: &str) -> Element {
    Element::new("connection").with_attr("from", from).with_attr("to", to)
}

/// `<pass>` with the cg combiner and the given children.
pub fn pass(children: Vec<Element>) -> Element {
    children
        .into_iter()
        .fold(Element::new("pass").with_child(combiner()), |p, c| p.with_child(c))
}

pub fn parse_pass(compiler: &WeaverCompiler, pass: &Element) -> (SnippetTree, SnippetId) {
    let mut tree = SnippetTree::new();
    let sid = SnippetParser::new(compiler, &mut tree).parse_pass(pass, "pass0", &FileAliases::new());
    (tree, sid)
}

pub fn build_graphs(tree: &SnippetTree, sid: SnippetId) -> Vec<TechniqueGraph> {
    let numbers = SnippetNumbers::from_tree(tree);
    TechniqueGraphBuilder::new(tree, &numbers).build_graphs(sid)
}

/// Text of the program in the `host` (`cgvp` / `cgfp`) element of a pass.
pub fn program_text(nodes: &[DocNode], host: &str) -> String {
    let program = nodes
        .iter()
        .filter_map(DocNode::as_element)
        .find_map(|e| e.elements().find(|c| c.name == host))
        .and_then(|h| h.child("program"))
        .unwrap_or_else(|| panic!("no {host} program"));
    program.children.iter().map(|c| c.to_string()).collect()
}
