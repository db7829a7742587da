//! Expansion of a snippet tree into every consistent combination of
//! technique choices.

use std::collections::HashMap;

use crate::weaver::graph::{Connection, ExplicitSource, TechniqueGraph};
use crate::weaver::snippet::{SnippetTree, TechniqueLookup};
use crate::weaver::technique::{SnippetId, TechniqueId};

/// Dense numbers for snippet source identities. Snippets loaded from the same
/// file share a number, wherever they are referenced.
#[derive(Debug, Clone, Default)]
pub struct SnippetNumbers {
    numbers: HashMap<String, usize>,
}

impl SnippetNumbers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tree(tree: &SnippetTree) -> Self {
        let mut numbers = Self::new();
        for n in 0..tree.snippet_count() {
            numbers.number(&tree.snippet(SnippetId(n)).source_key);
        }
        numbers
    }

    pub fn number(&mut self, source_key: &str) -> usize {
        let next = self.numbers.len();
        *self.numbers.entry(source_key.to_string()).or_insert(next)
    }

    pub fn get(&self, source_key: &str) -> Option<usize> {
        self.numbers.get(source_key).copied()
    }

    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct GraphInfo {
    graph: TechniqueGraph,
    /// Entry techniques of each expanded snippet.
    to_tech_in: Vec<(SnippetId, TechniqueId)>,
    /// Exit techniques of each expanded snippet.
    to_tech_out: Vec<(SnippetId, TechniqueId)>,
    /// Every atom technique contained (transitively) in each snippet.
    members: Vec<(SnippetId, TechniqueId)>,
    /// Compound techniques chosen in this combination.
    compounds: Vec<TechniqueId>,
}

fn techs_of(map: &[(SnippetId, TechniqueId)], snippet: SnippetId) -> impl Iterator<Item = TechniqueId> + '_ {
    map.iter()
        .filter(move |(s, _)| *s == snippet)
        .map(|(_, t)| *t)
}

impl GraphInfo {
    fn merge(&mut self, other: &GraphInfo) {
        self.graph.merge(&other.graph);
        for (dst, src) in [
            (&mut self.to_tech_in, &other.to_tech_in),
            (&mut self.to_tech_out, &other.to_tech_out),
            (&mut self.members, &other.members),
        ] {
            for entry in src {
                if !dst.contains(entry) {
                    dst.push(*entry);
                }
            }
        }
        self.compounds.extend(other.compounds.iter().copied());
    }

    fn map_inputs_outputs(&mut self, snippet: SnippetId) {
        for t in self.graph.input_techniques() {
            self.to_tech_in.push((snippet, *t));
        }
        for t in self.graph.output_techniques() {
            self.to_tech_out.push((snippet, *t));
        }
        for t in self.graph.techniques() {
            self.members.push((snippet, *t));
        }
    }
}

pub struct TechniqueGraphBuilder<'a> {
    tree: &'a SnippetTree,
    numbers: &'a SnippetNumbers,
}

impl<'a> TechniqueGraphBuilder<'a> {
    pub fn new(tree: &'a SnippetTree, numbers: &'a SnippetNumbers) -> Self {
        Self { tree, numbers }
    }

    /// All combinations for `snippet`, preferred ones first.
    pub fn build_graphs(&self, snippet: SnippetId) -> Vec<TechniqueGraph> {
        self.build_sub_graphs(snippet)
            .into_iter()
            .map(|mut info| {
                self.fixup_explicit_connections(&mut info);
                info.graph
            })
            .collect()
    }

    fn build_sub_graphs(&self, snippet_id: SnippetId) -> Vec<GraphInfo> {
        let snippet = self.tree.snippet(snippet_id);
        let number = if snippet.techniques.len() > 1 {
            self.numbers.get(&snippet.source_key)
        } else {
            None
        };
        let mut graphs = Vec::new();
        for &tech_id in &snippet.techniques {
            let tech = self.tree.technique(tech_id);
            let tech_graphs = match tech.as_compound() {
                None => {
                    let mut info = GraphInfo::default();
                    info.graph.add_technique(tech_id);
                    vec![info]
                }
                Some(compound) => {
                    let mut combined: Option<Vec<GraphInfo>> = None;
                    for (_, sub) in compound.snippets.iter().rev() {
                        let sub_graphs = self.build_sub_graphs(*sub);
                        combined = Some(match combined {
                            None => sub_graphs,
                            Some(prev) => merge_combinations(&prev, &sub_graphs),
                        });
                    }
                    let mut tech_graphs = combined.unwrap_or_default();
                    for info in &mut tech_graphs {
                        for conn in &compound.connections {
                            let froms: Vec<_> = techs_of(&info.to_tech_out, conn.from).collect();
                            let tos: Vec<_> = techs_of(&info.to_tech_in, conn.to).collect();
                            for from in &froms {
                                for to in &tos {
                                    info.graph.add_connection(Connection::strong(*from, *to));
                                }
                            }
                        }
                        info.compounds.push(tech_id);
                    }
                    tech_graphs
                }
            };
            for mut info in tech_graphs {
                if let Some(n) = number {
                    match info.graph.priorities().get(n) {
                        Some(p) if p != tech.priority => continue,
                        _ => info.graph.priorities_mut().set(n, tech.priority),
                    }
                }
                graphs.push(info);
            }
        }
        for info in &mut graphs {
            info.map_inputs_outputs(snippet_id);
        }
        graphs
    }

    /// Turns the `<explicit>` bindings of every chosen compound technique
    /// into explicit sources on the atom techniques that carry the named
    /// input and output.
    fn fixup_explicit_connections(&self, info: &mut GraphInfo) {
        for &compound_id in &info.compounds {
            let Some(compound) = self.tree.technique(compound_id).as_compound() else {
                continue;
            };
            for binding in &compound.explicit {
                let has_output = |t: &TechniqueId| self.tree.technique(*t).output(&binding.output).is_some();
                let source = techs_of(&info.to_tech_out, binding.from)
                    .find(|t| has_output(t))
                    .or_else(|| techs_of(&info.members, binding.from).find(|t| has_output(t)));
                let Some(source) = source else {
                    log::warn!(
                        "explicit binding: no technique of '{}' has output '{}'",
                        self.tree.snippet(binding.from).name,
                        binding.output
                    );
                    continue;
                };
                let targets: Vec<_> = techs_of(&info.members, binding.to)
                    .filter(|t| *t != source && self.tree.technique(*t).input(&binding.input).is_some())
                    .collect();
                if targets.is_empty() {
                    log::warn!(
                        "explicit binding: no technique of '{}' has input '{}'",
                        self.tree.snippet(binding.to).name,
                        binding.input
                    );
                }
                for target in targets {
                    info.graph.add_explicit(
                        target,
                        &binding.input,
                        ExplicitSource {
                            from: source,
                            output: binding.output.clone(),
                        },
                    );
                    info.graph.add_connection(Connection::strong(source, target));
                }
            }
        }
    }
}

/// Cross product of two candidate lists, skipping pairs that chose different
/// alternatives of the same snippet.
fn merge_combinations(prev: &[GraphInfo], next: &[GraphInfo]) -> Vec<GraphInfo> {
    let mut merged = Vec::with_capacity(prev.len() * next.len());
    for new in next {
        for old in prev {
            if old.graph.priorities().conflicts_with(new.graph.priorities()) {
                continue;
            }
            let mut info = old.clone();
            info.merge(new);
            merged.push(info);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    use crate::config::WeaverConfig;
    use crate::doc::{Element, MemoryDocumentSource};
    use crate::weaver::WeaverCompiler;
    use crate::weaver::snippet::{FileAliases, SnippetParser};

    fn atom(priority: i32, output: &str) -> Element {
        Element::new("technique")
            .with_attr("priority", priority.to_string())
            .with_child(Element::new("combiner").with_attr("name", "cg").with_attr("plugin", "x"))
            .with_child(Element::new("output").with_attr("name", output).with_attr("type", "rgba"))
    }

    fn snippet_with(n: usize) -> Element {
        (0..n).fold(Element::new("snippet"), |s, i| s.with_child(atom(i as i32, "out")))
    }

    fn build(pass: &Element, docs: MemoryDocumentSource) -> (SnippetTree, Vec<TechniqueGraph>) {
        let c = WeaverCompiler::new(WeaverConfig::default(), Arc::new(docs));
        let mut tree = SnippetTree::new();
        let sid = SnippetParser::new(&c, &mut tree).parse_pass(pass, "p", &FileAliases::new());
        let numbers = SnippetNumbers::from_tree(&tree);
        let graphs = TechniqueGraphBuilder::new(&tree, &numbers).build_graphs(sid);
        (tree, graphs)
    }

    #[test]
    fn single_atom_gives_single_graph() {
        let pass = Element::new("pass").with_child(snippet_with(1).with_attr("id", "a"));
        let (_, graphs) = build(&pass, MemoryDocumentSource::new());
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].techniques().len(), 1);
    }

    #[test]
    fn connections_join_out_to_in() {
        let pass = Element::new("pass")
            .with_child(snippet_with(1).with_attr("id", "a"))
            .with_child(snippet_with(1).with_attr("id", "b"))
            .with_child(Element::new("connection").with_attr("from", "a").with_attr("to", "b"));
        let (_, graphs) = build(&pass, MemoryDocumentSource::new());
        assert_eq!(graphs.len(), 1);
        let g = &graphs[0];
        assert_eq!(g.connections().len(), 1);
        assert_eq!(g.input_techniques().len(), 1);
        assert_eq!(g.output_techniques().len(), 1);
    }

    #[test]
    fn shared_snippet_file_picks_one_alternative() {
        let docs = MemoryDocumentSource::new().with("shared.json", snippet_with(2));
        let pass = Element::new("pass")
            .with_child(Element::new("snippet").with_attr("id", "a").with_attr("file", "shared.json"))
            .with_child(Element::new("snippet").with_attr("id", "b").with_attr("file", "shared.json"));
        let (tree, graphs) = build(&pass, docs);
        assert_eq!(graphs.len(), 2);
        for g in &graphs {
            let prios: Vec<_> = g.techniques().iter().map(|t| tree.technique(*t).priority).collect();
            assert_eq!(prios[0], prios[1]);
        }
        // Highest priority first.
        assert_eq!(tree.technique(graphs[0].techniques()[0]).priority, 1);
    }

    #[test]
    fn numbers_shared_by_source() {
        let mut n = SnippetNumbers::new();
        assert_eq!(n.number("file:a"), 0);
        assert_eq!(n.number("file:b"), 1);
        assert_eq!(n.number("file:a"), 0);
        assert_eq!(n.len(), 2);
    }
}
