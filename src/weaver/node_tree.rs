//! Per-pass emission order of techniques and the global names their
//! outputs are written to.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::combiner::{CoerceLink, Combiner};
use crate::weaver::WeaverCompiler;
use crate::weaver::graph::{Connection, ExplicitSource, TechniqueGraph};
use crate::weaver::snippet::{SnippetTree, TechniqueLookup, load_library_technique};
use crate::weaver::technique::{CombinerPlugin, Technique, TechniqueId};

/// Snippet tree techniques plus the techniques created while synthesizing a
/// single pass. Scratch ids continue after the tree's own ids.
pub struct TechniqueStore<'a> {
    tree: &'a SnippetTree,
    scratch: Vec<Technique>,
}

impl<'a> TechniqueStore<'a> {
    pub fn new(tree: &'a SnippetTree) -> Self {
        Self {
            tree,
            scratch: Vec::new(),
        }
    }

    pub fn add(&mut self, tech: Technique) -> TechniqueId {
        self.scratch.push(tech);
        TechniqueId(self.tree.technique_count() + self.scratch.len() - 1)
    }
}

impl TechniqueLookup for TechniqueStore<'_> {
    fn technique(&self, id: TechniqueId) -> &Technique {
        match id.0.checked_sub(self.tree.technique_count()) {
            Some(n) => &self.scratch[n],
            None => self.tree.technique(id),
        }
    }
}

/// One technique's placement in the generated program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// `None` once the slot was vacated by a move or a merge.
    pub tech: Option<TechniqueId>,
    /// Input name -> global it reads.
    pub input_links: BTreeMap<String, String>,
    /// Input name -> literal value.
    pub input_defaults: BTreeMap<String, String>,
    /// Output name -> global it writes.
    pub output_renames: BTreeMap<String, String>,
    pub annotation: String,
}

#[derive(Debug, Default)]
pub struct NodeTree {
    nodes: Vec<Node>,
    tech_to_node: HashMap<TechniqueId, usize>,
    rename_counter: usize,
    annotate: bool,
}

impl NodeTree {
    pub fn new(annotate: bool) -> Self {
        Self {
            annotate,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut Node {
        &mut self.nodes[index]
    }

    pub fn index_of(&self, tech: TechniqueId) -> Option<usize> {
        self.tech_to_node.get(&tech).copied()
    }

    pub fn node_for(&self, tech: TechniqueId) -> Option<&Node> {
        self.index_of(tech).map(|i| &self.nodes[i])
    }

    pub fn node_for_mut(&mut self, tech: TechniqueId) -> Option<&mut Node> {
        self.index_of(tech).map(|i| &mut self.nodes[i])
    }

    /// Occupied slots in order.
    pub fn live_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.tech.is_some())
    }

    /// Gives every output of `tech` a unique global and declares it.
    fn compute_renames(&mut self, node: &mut Node, tech: &Technique, combiner: &mut dyn Combiner) {
        for output in &tech.outputs {
            let unique = format!("{}_{}", output.name, self.rename_counter);
            self.rename_counter += 1;
            let annotation = self.annotate.then(|| {
                format!(
                    "Unique name for snippet \"{}<{}>\" output \"{}\"",
                    tech.snippet_name, tech.priority, output.name
                )
            });
            combiner.add_global(&unique, &output.ty, annotation.as_deref());
            node.output_renames.insert(output.name.clone(), unique);
        }
    }

    fn push_new(
        &mut self,
        tech_id: TechniqueId,
        techs: &impl TechniqueLookup,
        combiner: &mut dyn Combiner,
    ) -> usize {
        let mut node = Node {
            tech: Some(tech_id),
            ..Node::default()
        };
        self.compute_renames(&mut node, techs.technique(tech_id), combiner);
        self.nodes.push(node);
        let index = self.nodes.len() - 1;
        self.tech_to_node.insert(tech_id, index);
        index
    }

    /// Appends `start` and, breadth first, everything it depends on. A
    /// technique met again is moved to the end so it ends up after all of
    /// its dependants; reversing the array then yields dependencies first.
    pub fn add_all_input_nodes(
        &mut self,
        graph: &TechniqueGraph,
        start: TechniqueId,
        techs: &impl TechniqueLookup,
        combiner: &mut dyn Combiner,
    ) {
        let n = graph.techniques().len() + 1;
        let limit = n * n * 4;
        let mut steps = 0;
        let mut queue = VecDeque::from([start]);
        while let Some(tech_id) = queue.pop_front() {
            steps += 1;
            if steps > limit {
                log::debug!("input walk did not settle; the graph likely has a cycle");
                break;
            }
            match self.tech_to_node.get(&tech_id).copied() {
                None => {
                    self.push_new(tech_id, techs, combiner);
                }
                Some(old) if old + 1 != self.nodes.len() => {
                    let moved = std::mem::take(&mut self.nodes[old]);
                    self.nodes.push(moved);
                    self.tech_to_node.insert(tech_id, self.nodes.len() - 1);
                }
                Some(_) => {}
            }
            queue.extend(graph.dependencies(tech_id, false));
        }
    }

    pub fn reverse(&mut self) {
        self.nodes.reverse();
        let last = self.nodes.len().saturating_sub(1);
        for index in self.tech_to_node.values_mut() {
            *index = last - *index;
        }
    }

    /// Replaces the direct edge `out_tech -> in_tech` by a chain of library
    /// coercion techniques and links input `in_name` to the chain's end.
    #[allow(clippy::too_many_arguments)]
    pub fn augment_coerce_chain(
        &mut self,
        compiler: &WeaverCompiler,
        store: &mut TechniqueStore<'_>,
        graph: &mut TechniqueGraph,
        combiner: &mut dyn Combiner,
        chain: &[CoerceLink],
        plugin: &CombinerPlugin,
        in_tech: TechniqueId,
        in_name: &str,
        out_tech: TechniqueId,
        out_name: &str,
    ) -> bool {
        if chain.is_empty() {
            return false;
        }
        let target = store.technique(in_tech);
        let target_name = format!("{}<{}>", target.snippet_name, target.priority);

        graph.remove_connection(out_tech, in_tech);
        let mut prev = (out_tech, out_name.to_string());
        for link in chain {
            let Some(mut tech) = load_library_technique(compiler, &link.node, plugin) else {
                return false;
            };
            tech.snippet_name = format!(
                "coerce {} to {} for {}",
                link.from_type, link.to_type, target_name
            );
            let (Some(input), Some(output)) = (tech.inputs.first(), tech.outputs.first()) else {
                compiler.reporter().warn_at(
                    &link.node,
                    "Coercion technique needs at least one input and one output",
                );
                return false;
            };
            let (input, output) = (input.name.clone(), output.name.clone());
            let id = store.add(tech);
            graph.add_technique(id);
            graph.add_connection(Connection::strong(prev.0, id));
            graph.add_explicit(
                id,
                &input,
                ExplicitSource {
                    from: prev.0,
                    output: prev.1.clone(),
                },
            );
            self.push_new(id, &*store, combiner);
            prev = (id, output);
        }
        graph.add_connection(Connection::strong(prev.0, in_tech));

        let Some(global) = self
            .node_for(prev.0)
            .and_then(|n| n.output_renames.get(&prev.1))
            .cloned()
        else {
            return false;
        };
        match self.node_for_mut(in_tech) {
            Some(node) => {
                node.input_links.insert(in_name.to_string(), global);
                true
            }
            None => false,
        }
    }

    fn same_inputs(&self, a: usize, b: usize, tech: &Technique) -> bool {
        let (a, b) = (&self.nodes[a], &self.nodes[b]);
        tech.inputs.iter().all(|input| {
            a.input_links.get(&input.name) == b.input_links.get(&input.name)
                && a.input_defaults.get(&input.name) == b.input_defaults.get(&input.name)
        })
    }

    /// Folds nodes running the same code on the same inputs into one.
    /// Returns which technique replaced which.
    pub fn collapse(
        &mut self,
        graph: &mut TechniqueGraph,
        techs: &impl TechniqueLookup,
    ) -> HashMap<TechniqueId, TechniqueId> {
        let mut replaced = HashMap::new();
        loop {
            let mut merge = None;
            let mut seen: HashMap<&str, Vec<usize>> = HashMap::new();
            'scan: for (index, node) in self.nodes.iter().enumerate() {
                let Some(tech_id) = node.tech else { continue };
                let tech = techs.technique(tech_id);
                let Some(atom_id) = tech.atom_id() else { continue };
                let candidates = seen.entry(atom_id).or_default();
                for &other in candidates.iter() {
                    if self.same_inputs(index, other, tech) {
                        merge = Some((index, other));
                        break 'scan;
                    }
                }
                candidates.push(index);
            }
            let Some((removed, kept)) = merge else { break };
            let (Some(removed_tech), Some(kept_tech)) =
                (self.nodes[removed].tech, self.nodes[kept].tech)
            else {
                break;
            };

            let removed_renames = std::mem::take(&mut self.nodes[removed].output_renames);
            let kept_renames = self.nodes[kept].output_renames.clone();
            let rewrite: HashMap<&String, &String> = removed_renames
                .iter()
                .filter_map(|(output, global)| kept_renames.get(output).map(|k| (global, k)))
                .collect();
            for node in &mut self.nodes {
                for link in node.input_links.values_mut() {
                    if let Some(new) = rewrite.get(link) {
                        *link = (*new).clone();
                    }
                }
            }
            self.nodes[removed] = Node::default();
            self.tech_to_node.remove(&removed_tech);
            graph.switch_techs(removed_tech, kept_tech);
            for target in replaced.values_mut() {
                if *target == removed_tech {
                    *target = kept_tech;
                }
            }
            replaced.insert(removed_tech, kept_tech);
        }
        replaced
    }

    /// Re-orders the nodes so that, after reversal, every technique follows
    /// everything it depends on. Errors on a dependency cycle with the chain
    /// of snippet names involved.
    pub fn rebuild(
        &mut self,
        graph: &TechniqueGraph,
        outputs: &[TechniqueId],
        techs: &impl TechniqueLookup,
    ) -> Result<(), String> {
        let mut walk = RebuildWalk {
            old: self,
            graph,
            techs,
            nodes: Vec::new(),
            placed: HashMap::new(),
            path: HashSet::new(),
        };
        for &out in outputs {
            walk.visit(out)?;
        }
        let (nodes, placed) = (walk.nodes, walk.placed);
        self.nodes = nodes;
        self.tech_to_node = placed;
        Ok(())
    }
}

struct RebuildWalk<'w, L> {
    old: &'w NodeTree,
    graph: &'w TechniqueGraph,
    techs: &'w L,
    nodes: Vec<Node>,
    placed: HashMap<TechniqueId, usize>,
    path: HashSet<TechniqueId>,
}

impl<L: TechniqueLookup> RebuildWalk<'_, L> {
    fn name_of(&self, tech: TechniqueId) -> String {
        let t = self.techs.technique(tech);
        format!("{}<{}>", t.snippet_name, t.priority)
    }

    fn visit(&mut self, tech: TechniqueId) -> Result<(), String> {
        if !self.path.insert(tech) {
            return Err(format!(
                "Circular dependency detected. Snippet stack:\n {}\n",
                self.name_of(tech)
            ));
        }
        let node = match self.placed.get(&tech).copied() {
            Some(old) => std::mem::take(&mut self.nodes[old]),
            None => self
                .old
                .node_for(tech)
                .cloned()
                .ok_or_else(|| format!("No node for snippet {}", self.name_of(tech)))?,
        };
        self.nodes.push(node);
        self.placed.insert(tech, self.nodes.len() - 1);

        for dep in self.graph.dependencies(tech, false) {
            if let Err(mut msg) = self.visit(dep) {
                msg.push_str(&format!(" {}\n", self.name_of(tech)));
                return Err(msg);
            }
        }
        self.path.remove(&tech);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::combiner::DefaultCombiner;
    use crate::weaver::snippet::create_passthrough;

    fn store_with(tree: &SnippetTree, n: usize) -> (TechniqueStore<'_>, Vec<TechniqueId>) {
        let mut store = TechniqueStore::new(tree);
        let ids = (0..n)
            .map(|i| store.add(create_passthrough(&format!("v{i}"), "float")))
            .collect();
        (store, ids)
    }

    fn chain_graph(ids: &[TechniqueId]) -> TechniqueGraph {
        let mut g = TechniqueGraph::new();
        for id in ids {
            g.add_technique(*id);
        }
        for w in ids.windows(2) {
            g.add_connection(Connection::strong(w[0], w[1]));
        }
        g
    }

    #[test]
    fn scratch_ids_follow_tree_ids() {
        let tree = SnippetTree::new();
        let (store, ids) = store_with(&tree, 2);
        assert_eq!(ids, vec![TechniqueId(0), TechniqueId(1)]);
        assert_eq!(store.technique(ids[1]).outputs[0].name, "v1");
    }

    #[test]
    fn renames_are_unique() {
        let tree = SnippetTree::new();
        let (store, ids) = store_with(&tree, 2);
        let g = chain_graph(&ids);
        let mut nodes = NodeTree::new(false);
        nodes.add_all_input_nodes(&g, ids[1], &store, &mut DefaultCombiner::new());
        let a = &nodes.node_for(ids[0]).unwrap().output_renames["v0"];
        let b = &nodes.node_for(ids[1]).unwrap().output_renames["v1"];
        assert_ne!(a, b);
    }

    #[test]
    fn reversed_order_puts_dependencies_first() {
        let tree = SnippetTree::new();
        let (store, ids) = store_with(&tree, 3);
        let mut g = chain_graph(&ids);
        // Diamond: 0 feeds 2 directly as well.
        g.add_connection(Connection::strong(ids[0], ids[2]));
        let mut nodes = NodeTree::new(false);
        nodes.add_all_input_nodes(&g, ids[2], &store, &mut DefaultCombiner::new());
        nodes.reverse();
        let order: Vec<_> = nodes.live_nodes().filter_map(|n| n.tech).collect();
        assert_eq!(order, ids);
        assert_eq!(nodes.node(nodes.index_of(ids[2]).unwrap()).tech, Some(ids[2]));
    }

    #[test]
    fn collapse_merges_identical_nodes() {
        let tree = SnippetTree::new();
        let mut store = TechniqueStore::new(&tree);
        let src = store.add(create_passthrough("s", "float"));
        let a = store.add(create_passthrough("x", "float"));
        let b = store.add(create_passthrough("x", "float"));
        let sink = store.add(create_passthrough("y", "float"));
        let mut g = TechniqueGraph::new();
        for t in [src, a, b, sink] {
            g.add_technique(t);
        }
        g.add_connection(Connection::strong(src, a));
        g.add_connection(Connection::strong(src, b));
        g.add_connection(Connection::strong(a, sink));
        g.add_connection(Connection::strong(b, sink));

        let mut nodes = NodeTree::new(false);
        nodes.add_all_input_nodes(&g, sink, &store, &mut DefaultCombiner::new());
        let src_global = nodes.node_for(src).unwrap().output_renames["s"].clone();
        for t in [a, b] {
            nodes.node_for_mut(t).unwrap().input_links.insert("x".into(), src_global.clone());
        }
        let b_global = nodes.node_for(b).unwrap().output_renames["x"].clone();
        nodes.node_for_mut(sink).unwrap().input_links.insert("y".into(), b_global);

        let replaced = nodes.collapse(&mut g, &store);
        assert_eq!(replaced.len(), 1);
        let (gone, kept) = replaced.iter().next().map(|(k, v)| (*k, *v)).unwrap();
        assert!(!g.contains(gone));
        let kept_global = &nodes.node_for(kept).unwrap().output_renames["x"];
        assert_eq!(&nodes.node_for(sink).unwrap().input_links["y"], kept_global);
    }

    #[test]
    fn rebuild_reports_cycles() {
        let tree = SnippetTree::new();
        let (store, ids) = store_with(&tree, 2);
        let mut g = chain_graph(&ids);
        let mut nodes = NodeTree::new(false);
        nodes.add_all_input_nodes(&g, ids[1], &store, &mut DefaultCombiner::new());
        g.add_connection(Connection::weak(ids[1], ids[0]));
        let err = nodes.rebuild(&g, &[ids[1]], &store).unwrap_err();
        assert!(err.starts_with("Circular dependency detected"));
        assert!(err.contains("(passthrough)<0>"));
    }

    #[test]
    fn rebuild_keeps_acyclic_order() {
        let tree = SnippetTree::new();
        let (store, ids) = store_with(&tree, 3);
        let g = chain_graph(&ids);
        let mut nodes = NodeTree::new(false);
        nodes.add_all_input_nodes(&g, ids[2], &store, &mut DefaultCombiner::new());
        nodes.rebuild(&g, &[ids[2]], &store).unwrap();
        nodes.reverse();
        let order: Vec<_> = nodes.live_nodes().filter_map(|n| n.tech).collect();
        assert_eq!(order, ids);
    }
}
