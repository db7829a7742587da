mod common;

use common::*;
use shader_weaver::WeaverConfig;
use shader_weaver::doc::{DocNode, Element, MemoryDocumentSource};

fn technique(priority: i32, passes: Vec<Element>) -> Element {
    passes.into_iter().fold(
        Element::new("technique").with_attr("priority", priority.to_string()),
        |t, p| t.with_child(p),
    )
}

fn shader(name: &str, techniques: Vec<Element>) -> Element {
    techniques.into_iter().fold(
        Element::new("shader")
            .with_attr("name", name)
            .with_attr("compiler", "shaderweaver"),
        |s, t| s.with_child(t),
    )
}

fn simple_pass() -> Element {
    pass(vec![position_snippet(), red_snippet("color")])
}

/// Pass with a position snippet and a `color` snippet of `count` alternatives.
fn tinted_pass(id: &str, count: i32) -> Element {
    let alternatives = (0..count)
        .map(|p| {
            atom(
                p,
                vec![
                    output("color", "rgba"),
                    fragment(&format!("color = float4 ({p}, 0, 0, 1);")),
                ],
            )
        })
        .collect();
    pass(vec![position_snippet(), snippet(id, alternatives)])
}

fn instructions(node: &Element) -> Vec<&str> {
    node.children
        .iter()
        .filter_map(|c| match c {
            DocNode::Instruction { pi } => Some(pi.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn best_technique_woven_and_rest_kept_as_fallback() {
    let c = compiler(MemoryDocumentSource::new());
    let source = shader(
        "plain",
        vec![technique(100, vec![simple_pass()]), technique(200, vec![simple_pass()])],
    );
    let out = c
        .compile_shader(&source)
        .unwrap_or_else(|e| panic!("weave failed: {e:#}"));

    assert_eq!(out.attr("compiler"), Some("xmlshader"));
    assert_eq!(out.attr("name"), Some("plain"));
    assert!(out.child("shadervars").is_none());

    let woven: Vec<&Element> = out.elements_named("technique").collect();
    assert_eq!(woven.len(), 1);
    assert_eq!(woven[0].attr("priority"), Some("1"));
    assert_eq!(woven[0].elements_named("pass").count(), 1);

    let fallback = out
        .child("fallbackshader")
        .unwrap_or_else(|| panic!("no fallback"));
    assert_eq!(fallback.attr("name"), Some("plain@@100"));
    let kept: Vec<_> = fallback
        .elements_named("technique")
        .map(|t| t.attr_int("priority"))
        .collect();
    assert_eq!(kept, vec![100]);

    let tag = out.attr("_cachetag").unwrap_or_else(|| panic!("no cache tag"));
    assert!(tag.contains(';'));
}

#[test]
fn cache_tag_follows_the_source() {
    let c = compiler(MemoryDocumentSource::new());
    let a = shader("a", vec![technique(1, vec![simple_pass()])]);
    let b = shader("b", vec![technique(1, vec![simple_pass()])]);
    let tag = |s: &Element| {
        c.compile_shader(s)
            .unwrap_or_else(|e| panic!("weave failed: {e:#}"))
            .attr("_cachetag")
            .map(str::to_string)
    };
    assert_eq!(tag(&a), tag(&a));
    assert_ne!(tag(&a), tag(&b));
}

#[test]
fn single_technique_passes_source_fallback_through() {
    let c = compiler(MemoryDocumentSource::new());
    let source = shader("one", vec![technique(1, vec![simple_pass()])])
        .with_child(Element::new("fallbackshader").with_attr("name", "simple"));
    let out = c
        .compile_shader(&source)
        .unwrap_or_else(|e| panic!("weave failed: {e:#}"));
    assert_eq!(
        out.child("fallbackshader").and_then(|f| f.attr("name")),
        Some("simple")
    );
}

#[test]
fn shared_snippet_file_agrees_across_passes() {
    let shared = snippet(
        "shared",
        vec![
            atom(0, vec![output("color", "rgba"), fragment("color = float4 (0, 0, 1, 1);")]),
            atom(1, vec![output("color", "rgba"), fragment("color = float4 (1, 0, 0, 1);")]),
        ],
    );
    let c = compiler(MemoryDocumentSource::new().with("shared.json", shared));
    let uses_shared = || {
        pass(vec![
            position_snippet(),
            Element::new("snippet").with_attr("id", "color").with_attr("file", "shared.json"),
        ])
    };
    let source = shader("multi", vec![technique(1, vec![uses_shared(), uses_shared()])]);
    let out = c
        .compile_shader(&source)
        .unwrap_or_else(|e| panic!("weave failed: {e:#}"));

    let woven: Vec<&Element> = out.elements_named("technique").collect();
    assert_eq!(woven.len(), 2);
    let prios: Vec<_> = woven.iter().map(|t| t.attr_int("priority")).collect();
    assert_eq!(prios, vec![2, 1]);
    for t in &woven {
        assert_eq!(t.elements_named("pass").count(), 2);
    }
}

#[test]
fn passgen_repeats_the_pass_per_value() {
    let c = compiler(MemoryDocumentSource::new());
    let passgen = Element::new("passgen")
        .with_attr("param", "layer")
        .with_attr("sequence", "1, 2")
        .with_attr("comparesv", "layers")
        .with_child(combiner())
        .with_child(position_snippet())
        .with_child(red_snippet("color"));
    let source = shader("layered", vec![technique(1, Vec::new()).with_child(passgen)]);
    let out = c
        .compile_shader(&source)
        .unwrap_or_else(|e| panic!("weave failed: {e:#}"));

    let woven = out
        .child("technique")
        .unwrap_or_else(|| panic!("nothing woven: {:?}", c.reporter().diagnostics()));
    assert_eq!(woven.elements_named("pass").count(), 2);
    assert_eq!(
        instructions(woven),
        vec![
            "if vars.\"layers\".int >= 1",
            "endif",
            "if vars.\"layers\".int >= 2",
            "endif"
        ]
    );
}

#[test]
fn passgen_without_sequence_is_reported() {
    let c = compiler(MemoryDocumentSource::new());
    let passgen = Element::new("passgen").with_attr("param", "layer");
    let source = shader("broken", vec![technique(1, Vec::new()).with_child(passgen)]);
    let out = c
        .compile_shader(&source)
        .unwrap_or_else(|e| panic!("weave failed: {e:#}"));
    assert!(c.reporter().contains("<passgen> node needs 'sequence' attribute"));
    assert!(out.child("technique").is_none());
}

#[test]
fn source_shader_vars_are_collected() {
    let c = compiler(MemoryDocumentSource::new());
    let source = shader("vars", vec![technique(1, vec![simple_pass()])])
        .with_child(Element::new("shadervar").with_attr("name", "tint").with_text("1"))
        .with_child(Element::new("shadervar").with_attr("name", "tint").with_text("2"));
    let out = c
        .compile_shader(&source)
        .unwrap_or_else(|e| panic!("weave failed: {e:#}"));
    let vars = out
        .child("shadervars")
        .unwrap_or_else(|| panic!("no shadervars"));
    assert_eq!(vars.elements().count(), 1);
}

#[test]
fn shader_without_techniques_is_reported() {
    let c = compiler(MemoryDocumentSource::new());
    let out = c
        .compile_shader(&shader("empty", Vec::new()))
        .unwrap_or_else(|e| panic!("weave failed: {e:#}"));
    assert!(out.child("technique").is_none());
    assert!(c.reporter().contains("Shader has no techniques"));
}

#[test]
fn documents_without_shader_are_rejected() {
    let c = compiler(MemoryDocumentSource::new());
    assert!(c.compile_shader(&Element::new("material")).is_err());
}

#[test]
fn shader_found_below_the_document_root() {
    let c = compiler(MemoryDocumentSource::new());
    let doc = Element::new("library").with_child(shader("nested", vec![technique(1, vec![simple_pass()])]));
    let out = c
        .compile_shader(&doc)
        .unwrap_or_else(|e| panic!("weave failed: {e:#}"));
    assert_eq!(out.attr("name"), Some("nested"));
    assert_eq!(out.elements_named("technique").count(), 1);
}

#[test]
fn worker_pool_weaves_the_same_techniques() {
    let source = shader(
        "pooled",
        vec![technique(1, vec![tinted_pass("base", 3), tinted_pass("glow", 3)])],
    );
    let weave = |threaded: bool| {
        let config = WeaverConfig {
            threaded_synthesis: threaded,
            worker_threads: 4,
            ..WeaverConfig::default()
        };
        let c = compiler_with(config, MemoryDocumentSource::new());
        let out = c
            .compile_shader(&source)
            .unwrap_or_else(|e| panic!("weave failed: {e:#}"));
        assert!(!c.reporter().has_errors(), "{:?}", c.reporter().diagnostics());
        out.elements_named("technique")
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
    };

    let sequential = weave(false);
    let threaded = weave(true);
    assert_eq!(sequential.len(), 9);
    assert_eq!(threaded, sequential);
}

#[test]
fn exhausted_budget_skips_every_combination() {
    let config = WeaverConfig {
        threaded_synthesis: false,
        synthesis_budget_ms: Some(0),
        ..WeaverConfig::default()
    };
    let c = compiler_with(config, MemoryDocumentSource::new());
    let source = shader("hurried", vec![technique(1, vec![tinted_pass("color", 2)])]);
    let out = c
        .compile_shader(&source)
        .unwrap_or_else(|e| panic!("weave failed: {e:#}"));
    assert!(out.child("technique").is_none());
    assert!(c.reporter().contains("synthesis budget exhausted"));
}

#[test]
fn conditional_technique_is_wrapped() {
    let c = compiler(MemoryDocumentSource::new());
    let color = snippet(
        "color",
        vec![atom(
            0,
            vec![output("color", "rgba"), fragment("color = float4 (1, 0, 0, 1);")],
        )
        .with_attr("condition", "vars.\"x\".int")],
    );
    let source = shader(
        "gated",
        vec![technique(1, vec![pass(vec![position_snippet(), color])])],
    );
    let out = c
        .compile_shader(&source)
        .unwrap_or_else(|e| panic!("weave failed: {e:#}"));

    assert_eq!(instructions(&out), vec!["if (vars.\"x\".int)", "endif"]);
    let order: Vec<&str> = out
        .children
        .iter()
        .filter_map(|c| match c {
            DocNode::Instruction { pi } => Some(pi.as_str()),
            DocNode::Element(e) if e.name == "technique" => Some("technique"),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec!["if (vars.\"x\".int)", "technique", "endif"]);
}
