mod common;

use common::*;
use shader_weaver::doc::{Element, MemoryDocumentSource, parse_document};
use shader_weaver::weaver::snippet::TechniqueLookup;
use shader_weaver::weaver::technique::TechniqueId;

fn sample_pass() -> Element {
    let tint = input("tint", "rgba")
        .with_attr("default", "value")
        .with_attr("defval", "1, 1, 1, 1");
    pass(vec![
        position_snippet(),
        snippet(
            "color",
            vec![
                atom(2, vec![tint.clone(), output("color", "rgba"), fragment("color = tint;")]),
                atom(1, vec![output("color", "rgba"), fragment("color = float4 (1, 0, 0, 1) & 1;")]),
            ],
        ),
    ])
}

#[test]
fn serialized_snippets_parse_the_same() {
    let original = sample_pass();
    let json = serde_json::to_string_pretty(&original)
        .unwrap_or_else(|e| panic!("serialize failed: {e}"));
    let reparsed = parse_document(&json).unwrap_or_else(|e| panic!("parse failed: {e:#}"));
    assert_eq!(reparsed, original);

    let c = compiler(MemoryDocumentSource::new());
    let (a, _) = parse_pass(&c, &original);
    let (b, _) = parse_pass(&c, &reparsed);
    assert_eq!(a.technique_count(), b.technique_count());
    for n in 0..a.technique_count() {
        let (ta, tb) = (a.technique(TechniqueId(n)), b.technique(TechniqueId(n)));
        assert_eq!(ta.atom_id(), tb.atom_id());
        assert_eq!(ta.priority, tb.priority);
        assert_eq!(ta.inputs.len(), tb.inputs.len());
        assert_eq!(ta.outputs.len(), tb.outputs.len());
    }
    assert!(!c.reporter().has_errors());
}

#[test]
fn snippet_alternatives_sorted_by_priority() {
    let c = compiler(MemoryDocumentSource::new());
    let (tree, _) = parse_pass(&c, &sample_pass());
    let color = (0..tree.snippet_count())
        .map(shader_weaver::weaver::technique::SnippetId)
        .find(|s| tree.snippet(*s).name == "color")
        .unwrap_or_else(|| panic!("no color snippet"));
    let prios: Vec<i32> = tree.techniques_of(color).map(|t| t.priority).collect();
    assert_eq!(prios, vec![2, 1]);
}

#[test]
fn markup_escapes_text() {
    let node = Element::new("block")
        .with_attr("note", "a \"b\"")
        .with_text("x < y && z");
    assert_eq!(
        node.to_string(),
        "<block note=\"a &quot;b&quot;\">x &lt; y &amp;&amp; z</block>"
    );
}

#[test]
fn file_references_resolve_through_aliases() {
    let docs = MemoryDocumentSource::new().with("snippets/red.json", red_snippet("red"));
    let c = compiler(docs);
    let pass = pass(vec![
        Element::new("alias")
            .with_attr("name", "red")
            .with_attr("file", "snippets/red.json"),
        Element::new("snippet").with_attr("id", "color").with_attr("filealias", "red"),
    ]);
    let (tree, _) = parse_pass(&c, &pass);
    assert_eq!(tree.technique_count(), 2, "{:?}", c.reporter().diagnostics());
}

#[test]
fn missing_snippet_file_is_reported() {
    let c = compiler(MemoryDocumentSource::new());
    let pass = pass(vec![
        Element::new("snippet").with_attr("id", "color").with_attr("file", "nowhere.json"),
    ]);
    let _ = parse_pass(&c, &pass);
    assert!(c.reporter().count(shader_weaver::report::Severity::Warning) > 0);
}
