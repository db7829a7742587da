//! Synthesis: linking the techniques of one graph into a pass, and
//! multiplexing the graphs of all passes into techniques.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::combiner::{Combiner, CombinerLoader, DefaultCombiner, OutputTarget};
use crate::doc::{DocNode, Element};
use crate::report::Severity;
use crate::types::TypeTable;
use crate::weaver::WeaverCompiler;
use crate::weaver::graph::{Connection, ExplicitSource, SnippetTechPriorities, TechniqueGraph};
use crate::weaver::node_tree::{Node, NodeTree, TechniqueStore};
use crate::weaver::snippet::{
    FileAliases, SnippetTree, TechniqueLookup, create_passthrough, read_blocks,
};
use crate::weaver::technique::{
    Block, CombinerPlugin, DefaultKind, Input, Output, SnippetId, Technique, TechniqueId,
};

/// Output chosen by [`find_output`] and what it costs to coerce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundOutput {
    pub technique: TechniqueId,
    pub output: Output,
    pub cost: u32,
}

fn offer_outputs(
    tech_id: TechniqueId,
    techs: &impl TechniqueLookup,
    combiner: &dyn Combiner,
    desired: &str,
    best: &mut Option<FoundOutput>,
) -> bool {
    for output in &techs.technique(tech_id).outputs {
        let cost = if output.ty == desired {
            Some(0)
        } else {
            combiner.coerce_cost(&output.ty, desired)
        };
        let Some(cost) = cost else { continue };
        if best.as_ref().is_none_or(|b| cost < b.cost) {
            *best = Some(FoundOutput {
                technique: tech_id,
                output: output.clone(),
                cost,
            });
        }
        if cost == 0 {
            return true;
        }
    }
    false
}

/// Output of type `desired`, or the one cheapest to coerce into it. The
/// graph's output techniques are searched first; their dependencies only
/// when none of them qualifies.
pub fn find_output(
    graph: &TechniqueGraph,
    techs: &impl TechniqueLookup,
    combiner: &dyn Combiner,
    desired: &str,
) -> Option<FoundOutput> {
    let mut best = None;
    for &tech in graph.output_techniques() {
        if offer_outputs(tech, techs, combiner, desired, &mut best) {
            return best;
        }
    }
    if best.is_some() {
        return best;
    }

    let mut visited: HashSet<TechniqueId> = graph.output_techniques().iter().copied().collect();
    let mut queue: std::collections::VecDeque<TechniqueId> = graph
        .output_techniques()
        .iter()
        .flat_map(|t| graph.dependencies(*t, true))
        .collect();
    while let Some(tech) = queue.pop_front() {
        if !visited.insert(tech) {
            continue;
        }
        if offer_outputs(tech, techs, combiner, desired, &mut best) {
            return best;
        }
        queue.extend(graph.dependencies(tech, true));
    }
    best
}

/// Candidate source for an input. `direct` means no coercion is needed.
#[derive(Debug, Clone)]
struct InputMatch {
    tech: TechniqueId,
    output: Output,
    direct: bool,
}

fn direct_match(types: &TypeTable, output: &Output, input: &Input) -> bool {
    if output.ty == input.ty {
        return true;
    }
    match (types.query_type_info(&output.ty), types.query_type_info(&input.ty)) {
        (Some(out_info), Some(in_info)) => out_info.satisfies(in_info),
        _ => false,
    }
}

/// Cheapest source among `candidates`; returns early on a direct match.
fn pick_source<'c>(
    types: &TypeTable,
    combiner: &dyn Combiner,
    input: &Input,
    candidates: impl IntoIterator<Item = (TechniqueId, &'c Output)>,
    best: &mut Option<(u32, InputMatch)>,
) -> Option<InputMatch> {
    for (tech, output) in candidates {
        if direct_match(types, output, input) {
            return Some(InputMatch {
                tech,
                output: output.clone(),
                direct: true,
            });
        }
        if let Some(cost) = combiner.coerce_cost(&output.ty, &input.ty)
            && best.as_ref().is_none_or(|(c, _)| cost < *c)
        {
            *best = Some((
                cost,
                InputMatch {
                    tech,
                    output: output.clone(),
                    direct: false,
                },
            ));
        }
    }
    None
}

fn find_explicit_input(
    graph: &TechniqueGraph,
    techs: &impl TechniqueLookup,
    combiner: &dyn Combiner,
    types: &TypeTable,
    receiving: TechniqueId,
    input: &Input,
) -> Option<InputMatch> {
    let sources = graph.explicit_sources(receiving, &input.name);
    if sources.is_empty() {
        return None;
    }
    let candidates = sources.iter().filter_map(|ExplicitSource { from, output }| {
        techs.technique(*from).output(output).map(|o| (*from, o))
    });
    let mut best = None;
    pick_source(types, combiner, input, candidates, &mut best).or(best.map(|(_, m)| m))
}

/// Breadth-first search of the receiving technique's dependencies, level by
/// level, for an unused output feeding `input`. A direct match wins at once;
/// otherwise the cheapest coercion of the nearest level that has one.
fn find_input(
    graph: &TechniqueGraph,
    techs: &impl TechniqueLookup,
    combiner: &dyn Combiner,
    types: &TypeTable,
    receiving: TechniqueId,
    input: &Input,
    used: &HashSet<(TechniqueId, String)>,
) -> Option<InputMatch> {
    let mut checked = HashSet::new();
    let mut level = graph.dependencies(receiving, true);
    let mut best = None;
    while !level.is_empty() {
        let mut next = Vec::new();
        for tech in level {
            if !checked.insert(tech) {
                continue;
            }
            let candidates = techs.technique(tech).outputs.iter().filter(|o| {
                !o.coercion_output && !used.contains(&(tech, o.name.clone()))
            });
            if let Some(found) =
                pick_source(types, combiner, input, candidates.map(|o| (tech, o)), &mut best)
            {
                return Some(found);
            }
            next.extend(graph.dependencies(tech, true));
        }
        if best.is_some() {
            break;
        }
        level = next;
    }
    best.map(|(_, m)| m)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Default,
    Backend,
}

/// Which combiner a block of a technique requesting `requested` goes to, if
/// any. Unprefixed blocks belong to the default combiner.
fn route(
    pass_plugin: &CombinerPlugin,
    requested: &CombinerPlugin,
    block_combiner: &str,
    backend: &dyn Combiner,
) -> Option<Target> {
    if block_combiner.is_empty() {
        return Some(Target::Default);
    }
    (pass_plugin.class_id == requested.class_id
        && requested.name == block_combiner
        && backend.compatible_params(requested.params.as_deref()))
    .then_some(Target::Backend)
}

/// Copy of `node` with its children between `?if cond?` and `?endif?`.
fn enclose_in_condition(node: &Element, condition: &str) -> Element {
    let mut wrapped = Element::new(node.name.clone());
    wrapped.copy_attrs_from(node);
    wrapped.push(DocNode::instruction(format!("if {condition}")));
    wrapped.children.extend(node.children.iter().cloned());
    wrapped.push(DocNode::instruction("endif"));
    wrapped
}

/// Which global an input of a written technique ended up reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLink {
    pub snippet: String,
    pub input: String,
    pub source: String,
}

/// Everything one successfully synthesized pass contributes.
pub struct PassOutput {
    /// Children of the generated `<pass>`.
    pub nodes: Vec<DocNode>,
    pub tags: BTreeSet<String>,
    pub shader_vars: Vec<Element>,
    /// Outer conditions of the written techniques, parenthesized.
    pub conditions: Vec<String>,
    pub loader: Arc<dyn CombinerLoader>,
    pub links: Vec<InputLink>,
}

/// Complex default written once and shared by inputs with the same tag.
struct EmittedInput {
    tech: TechniqueId,
    name: String,
    ty: String,
    blocks: Vec<Block>,
    conditions: Vec<String>,
    tag: Option<String>,
    global: String,
}

struct PassState<'s> {
    store: TechniqueStore<'s>,
    graph: TechniqueGraph,
    nodes: NodeTree,
    combiner: Box<dyn Combiner>,
    defaults: DefaultCombiner,
    plugin: CombinerPlugin,
    loader: Arc<dyn CombinerLoader>,
    emitted: Vec<EmittedInput>,
    merged_globals: HashSet<String>,
}

/// Synthesizes single passes from single technique graphs.
pub struct PassSynthesizer<'a> {
    compiler: &'a WeaverCompiler,
    tree: &'a SnippetTree,
    shader_name: &'a str,
}

impl<'a> PassSynthesizer<'a> {
    pub fn new(compiler: &'a WeaverCompiler, tree: &'a SnippetTree, shader_name: &'a str) -> Self {
        Self {
            compiler,
            tree,
            shader_name,
        }
    }

    fn warn(&self, source: &Element, message: impl std::fmt::Display) {
        self.compiler
            .reporter()
            .warn_at(source, format!("{}: {message}", self.shader_name));
    }

    /// Links and emits the techniques of `graph` as one pass. `None` when
    /// the pass cannot be built; the reason was reported.
    pub fn synthesize(
        &self,
        snippet: SnippetId,
        graph: &TechniqueGraph,
        source: &Element,
    ) -> Option<PassOutput> {
        let Some(plugin) = self.tree.techniques_of(snippet).next().map(|t| t.combiner.clone())
        else {
            self.warn(source, "Pass without technique");
            return None;
        };
        let loader = match self.compiler.combiners().load(&plugin.class_id) {
            Ok(loader) => loader,
            Err(e) => {
                self.warn(
                    source,
                    format!("Could not load combiner plugin '{}': {e:#}", plugin.class_id),
                );
                return None;
            }
        };
        let combiner = match loader.create_combiner(plugin.params.as_deref()) {
            Ok(c) => c,
            Err(e) => {
                self.warn(
                    source,
                    format!("Could not get combiner from '{}': {e:#}", plugin.class_id),
                );
                return None;
            }
        };
        let mut pass = PassState {
            store: TechniqueStore::new(self.tree),
            graph: graph.clone(),
            nodes: NodeTree::new(self.compiler.annotate()),
            combiner,
            defaults: DefaultCombiner::new(),
            plugin,
            loader,
            emitted: Vec::new(),
            merged_globals: HashSet::new(),
        };

        let Some(color) = find_output(&pass.graph, &pass.store, &*pass.combiner, "rgba") else {
            self.warn(source, "No suitable color output found");
            return None;
        };
        let Some(position) =
            find_output(&pass.graph, &pass.store, &*pass.combiner, "position4_screen")
        else {
            self.warn(source, "No suitable position output found");
            return None;
        };
        let depth = find_output(&pass.graph, &pass.store, &*pass.combiner, "depth");

        let color_sink = add_sink(&mut pass, "output", "rgba", &color);
        let depth_sink = depth
            .as_ref()
            .map(|d| add_sink(&mut pass, "outputDepth", "depth", d));
        let roots: Vec<TechniqueId> = std::iter::once(color_sink)
            .chain(depth_sink)
            .chain(std::iter::once(position.technique))
            .collect();
        for &root in &roots {
            pass.nodes
                .add_all_input_nodes(&pass.graph, root, &pass.store, &mut *pass.combiner);
        }
        pass.nodes.reverse();

        // Coercions append nodes; they get linked too.
        let mut index = 0;
        while index < pass.nodes.len() {
            if let Some(tech) = pass.nodes.node(index).tech
                && !self.link_inputs(&mut pass, index, tech)
            {
                return None;
            }
            index += 1;
        }
        if !self.emit_merged_inputs(&mut pass, source) {
            return None;
        }

        let replaced = pass.nodes.collapse(&mut pass.graph, &pass.store);
        let resolve = |t: TechniqueId| replaced.get(&t).copied().unwrap_or(t);
        let roots: Vec<TechniqueId> = roots.into_iter().map(resolve).collect();
        if let Err(msg) = pass.nodes.rebuild(&pass.graph, &roots, &pass.store) {
            self.warn(source, msg);
            return None;
        }
        pass.nodes.reverse();

        let mut conditions = Vec::new();
        let mut links = Vec::new();
        for index in 0..pass.nodes.len() {
            let node = pass.nodes.node(index).clone();
            let Some(tech_id) = node.tech else { continue };
            if !self.write_node(&mut pass, &node, tech_id, &mut conditions, &mut links) {
                let tech = pass.store.technique(tech_id);
                self.warn(
                    source,
                    format!(
                        "Combiner rejected snippet '{}<{}>'",
                        tech.snippet_name, tech.priority
                    ),
                );
                return None;
            }
        }

        let sinks = [
            (OutputTarget::Color0, Some(color_sink), "output"),
            (OutputTarget::Depth, depth_sink, "outputDepth"),
        ];
        for (target, sink, name) in sinks {
            let Some(sink) = sink.map(resolve) else { continue };
            let Some(global) = pass
                .nodes
                .node_for(sink)
                .and_then(|n| n.output_renames.get(name))
            else {
                continue;
            };
            let annotation = self
                .compiler
                .annotate()
                .then(|| format!("Output for {target:?}"));
            pass.combiner.set_output(target, global, annotation.as_deref());
        }

        let mut scratch = Element::new("pass");
        pass.defaults.write_to_pass(&mut scratch);
        pass.combiner.write_to_pass(&mut scratch);
        Some(PassOutput {
            nodes: scratch.children,
            tags: pass.defaults.take_tags(),
            shader_vars: pass.defaults.take_shader_vars(),
            conditions,
            loader: pass.loader,
            links,
        })
    }

    fn link_inputs(&self, pass: &mut PassState<'_>, index: usize, tech_id: TechniqueId) -> bool {
        let tech = pass.store.technique(tech_id).clone();
        let types = self.compiler.types();
        let mut used: HashSet<(TechniqueId, String)> = HashSet::new();
        let mut delayed = Vec::new();

        for input in &tech.inputs {
            let node = pass.nodes.node(index);
            if node.input_links.contains_key(&input.name)
                || node.input_defaults.contains_key(&input.name)
            {
                if self.compiler.config().verbose {
                    self.compiler.reporter().report(
                        Severity::Warning,
                        format!(
                            "Duplicate input named '{}' of snippet '{}'",
                            input.name, tech.snippet_name
                        ),
                    );
                }
                continue;
            }

            let found = if input.private {
                None
            } else {
                find_explicit_input(&pass.graph, &pass.store, &*pass.combiner, types, tech_id, input)
                    .or_else(|| {
                        find_input(
                            &pass.graph,
                            &pass.store,
                            &*pass.combiner,
                            types,
                            tech_id,
                            input,
                            &used,
                        )
                    })
            };
            if let Some(found) = found {
                used.insert((found.tech, found.output.name.clone()));
                if !self.link_found(pass, index, tech_id, &tech, input, found) {
                    return false;
                }
                continue;
            }

            let default_blocks = match &input.default {
                DefaultKind::Complex(blocks) => Some(blocks.clone()),
                DefaultKind::ShaderVar(sv) => self.shader_var_blocks(&*pass.loader, &tech, input, sv),
                _ => None,
            };
            match (&input.default, default_blocks) {
                (_, Some(blocks)) => {
                    self.merge_default(pass, index, tech_id, input, blocks, &mut delayed);
                }
                (DefaultKind::Undefined, None) => {}
                (DefaultKind::Value(value), None) => {
                    pass.nodes
                        .node_mut(index)
                        .input_defaults
                        .insert(input.name.clone(), value.clone());
                }
                _ => {
                    let message = format!(
                        "No matching input found and no default given for '{} {}' of snippet '{}'",
                        input.ty, input.name, tech.snippet_name
                    );
                    let severity = if self.compiler.config().verbose {
                        Severity::Warning
                    } else {
                        Severity::Debug
                    };
                    self.compiler.reporter().report(severity, message);
                    return false;
                }
            }
        }
        for conn in delayed {
            pass.graph.add_connection(conn);
        }
        true
    }

    fn link_found(
        &self,
        pass: &mut PassState<'_>,
        index: usize,
        tech_id: TechniqueId,
        tech: &Technique,
        input: &Input,
        found: InputMatch,
    ) -> bool {
        if found.direct {
            let Some(global) = pass
                .nodes
                .node_for(found.tech)
                .and_then(|n| n.output_renames.get(&found.output.name))
                .cloned()
            else {
                log::debug!(
                    "output '{}' feeding '{}' has no node",
                    found.output.name,
                    input.name
                );
                return false;
            };
            let node = pass.nodes.node_mut(index);
            if self.compiler.annotate() {
                node.annotation.push_str(&format!(
                    "Input: {} {} - linked to {} {}\n",
                    input.ty, input.name, found.output.ty, global
                ));
            }
            node.input_links.insert(input.name.clone(), global);
            pass.graph.add_connection(Connection::weak(found.tech, tech_id));
            return true;
        }

        let chain = pass.combiner.query_coerce_chain(&found.output.ty, &input.ty);
        let plugin = CombinerPlugin {
            name: "combiner".to_string(),
            ..pass.plugin.clone()
        };
        let ok = pass.nodes.augment_coerce_chain(
            self.compiler,
            &mut pass.store,
            &mut pass.graph,
            &mut *pass.combiner,
            &chain,
            &plugin,
            tech_id,
            &input.name,
            found.tech,
            &found.output.name,
        );
        if !ok {
            self.compiler.reporter().report(
                Severity::Warning,
                format!(
                    "Could not coerce '{}' to '{}' for input '{}' of snippet '{}'",
                    found.output.ty, input.ty, input.name, tech.snippet_name
                ),
            );
        } else if self.compiler.annotate() {
            pass.nodes.node_mut(index).annotation.push_str(&format!(
                "Input: {} {} - coerced from {}\n",
                input.ty, input.name, found.output.ty
            ));
        }
        ok
    }

    fn shader_var_blocks(
        &self,
        loader: &dyn CombinerLoader,
        tech: &Technique,
        input: &Input,
        sv: &str,
    ) -> Option<Vec<Block>> {
        let mut holder = Element::new("input");
        loader.generate_sv_input_blocks(&mut holder, &tech.combiner.name, sv, &input.ty, &input.name, sv);
        read_blocks(self.compiler, &holder, "", &FileAliases::new())
    }

    /// Tag of the first default block that has one: blocks for the default
    /// combiner are asked first, then the backend's.
    fn input_tag(&self, pass: &PassState<'_>, requested: &CombinerPlugin, blocks: &[Block]) -> Option<String> {
        let tag = blocks
            .iter()
            .filter(|b| b.combiner_name.is_empty())
            .find_map(|b| pass.defaults.query_input_tag(&b.location, &b.node));
        tag.or_else(|| {
            blocks
                .iter()
                .filter(|b| {
                    route(&pass.plugin, requested, &b.combiner_name, &*pass.combiner)
                        == Some(Target::Backend)
                })
                .find_map(|b| pass.combiner.query_input_tag(&b.location, &b.node))
        })
    }

    fn merge_default(
        &self,
        pass: &mut PassState<'_>,
        index: usize,
        tech_id: TechniqueId,
        input: &Input,
        blocks: Vec<Block>,
        delayed: &mut Vec<Connection>,
    ) {
        let requested = pass.store.technique(tech_id).combiner.clone();
        let tag = if input.no_merge {
            None
        } else {
            self.input_tag(pass, &requested, &blocks)
        };
        let prev = tag.as_deref().and_then(|tag| {
            pass.emitted
                .iter()
                .position(|e| e.tag.as_deref() == Some(tag) && e.ty == input.ty)
        });

        let global = match prev {
            Some(p) => {
                let emitted = &mut pass.emitted[p];
                match &input.condition {
                    None => emitted.conditions.clear(),
                    Some(c) if !emitted.conditions.is_empty() => emitted.conditions.push(c.clone()),
                    Some(_) => {}
                }
                let prev_tech = emitted.tech;
                let global = emitted.global.clone();
                if prev_tech != tech_id && !pass.graph.is_dependency_of(tech_id, prev_tech) {
                    delayed.push(Connection::weak(prev_tech, tech_id));
                }
                global
            }
            None => {
                let mut global = format!("in_{}", input.name);
                let mut n = 1;
                while pass.merged_globals.contains(&global) {
                    global = format!("in_{}_{n}", input.name);
                    n += 1;
                }
                pass.merged_globals.insert(global.clone());
                pass.emitted.push(EmittedInput {
                    tech: tech_id,
                    name: input.name.clone(),
                    ty: input.ty.clone(),
                    blocks,
                    conditions: input.condition.iter().cloned().collect(),
                    tag,
                    global: global.clone(),
                });
                global
            }
        };
        let node = pass.nodes.node_mut(index);
        if self.compiler.annotate() {
            node.annotation.push_str(&format!(
                "Input: {} {} - default from {}\n",
                input.ty, input.name, global
            ));
        }
        node.input_links.insert(input.name.clone(), global);
    }

    /// Writes the shared complex defaults, each as its own snippet.
    fn emit_merged_inputs(&self, pass: &mut PassState<'_>, source: &Element) -> bool {
        for emitted in std::mem::take(&mut pass.emitted) {
            let requested = pass.store.technique(emitted.tech).combiner.clone();
            let annotation = if self.compiler.annotate() {
                format!("Default input '{} {}'", emitted.ty, emitted.name)
            } else {
                String::new()
            };
            pass.combiner.add_global(
                &emitted.global,
                &emitted.ty,
                self.compiler.annotate().then_some(annotation.as_str()),
            );
            pass.defaults.begin_snippet(&annotation);
            pass.combiner.begin_snippet(&annotation);
            let condition = (!emitted.conditions.is_empty()).then(|| {
                emitted
                    .conditions
                    .iter()
                    .map(|c| format!("({c})"))
                    .collect::<Vec<_>>()
                    .join(" || ")
            });
            for block in &emitted.blocks {
                let node = match &condition {
                    Some(c) => enclose_in_condition(&block.node, c),
                    None => (*block.node).clone(),
                };
                match route(&pass.plugin, &requested, &block.combiner_name, &*pass.combiner) {
                    Some(Target::Default) => pass.defaults.write_block(&block.location, &node),
                    Some(Target::Backend) => pass.combiner.write_block(&block.location, &node),
                    None => {}
                }
            }
            pass.combiner.add_output(&emitted.name, &emitted.ty);
            pass.combiner.output_rename(&emitted.name, &emitted.global);
            if !pass.combiner.end_snippet() {
                self.warn(
                    source,
                    format!("Combiner rejected default of input '{}'", emitted.name),
                );
                return false;
            }
            pass.defaults.end_snippet();
        }
        true
    }

    fn write_node(
        &self,
        pass: &mut PassState<'_>,
        node: &Node,
        tech_id: TechniqueId,
        conditions: &mut Vec<String>,
        links: &mut Vec<InputLink>,
    ) -> bool {
        let tech = pass.store.technique(tech_id);
        if let Some(c) = &tech.outer_condition {
            let c = format!("({c})");
            if !conditions.contains(&c) {
                conditions.push(c);
            }
        }
        let annotation = if self.compiler.annotate() {
            format!(
                "snippet \"{}<{}>\"\n\n{}",
                tech.snippet_name, tech.priority, node.annotation
            )
        } else {
            String::new()
        };

        for (input, source) in &node.input_links {
            links.push(InputLink {
                snippet: tech.snippet_name.clone(),
                input: input.clone(),
                source: source.clone(),
            });
        }

        if tech.is_passthrough() {
            pass.combiner.begin_snippet(&annotation);
            for output in &tech.outputs {
                if let (Some(from), Some(to)) = (
                    node.input_links.get(&output.name),
                    node.output_renames.get(&output.name),
                ) {
                    pass.combiner.link(from, to);
                }
            }
            return pass.combiner.end_snippet();
        }

        pass.defaults.begin_snippet(&annotation);
        pass.combiner.begin_snippet(&annotation);
        for input in &tech.inputs {
            let renamed = match node.input_defaults.get(&input.name) {
                Some(value) => {
                    pass.combiner.add_input_value(&input.name, &input.ty, value);
                    Some(&input.name)
                }
                None => {
                    pass.combiner.add_input(&input.name, &input.ty);
                    node.input_links.get(&input.name)
                }
            };
            if let Some(from) = renamed {
                pass.combiner.input_rename(from, &input.name);
            }
            for attr in &input.attributes {
                pass.combiner
                    .add_input_attribute(&input.name, &attr.name, &attr.ty, &attr.default_value);
            }
        }
        for output in &tech.outputs {
            pass.combiner.add_output(&output.name, &output.ty);
            if let Some(global) = node.output_renames.get(&output.name) {
                pass.combiner.output_rename(&output.name, global);
            }
            if let Some(src) = &output.inherit_attr_from
                && node.input_links.contains_key(src)
            {
                pass.combiner.propagate_attributes(src, &output.name);
            }
            for attr in &output.attributes {
                pass.combiner
                    .add_output_attribute(&output.name, &attr.name, &attr.ty);
            }
        }

        let inner = tech.owner.and_then(|o| self.tree.condition(o));
        for block in tech.blocks() {
            let target = route(&pass.plugin, &tech.combiner, &block.combiner_name, &*pass.combiner);
            let Some(target) = target else { continue };
            let content = match &inner {
                Some(c) => enclose_in_condition(&block.node, c),
                None => (*block.node).clone(),
            };
            match target {
                Target::Default => pass.defaults.write_block(&block.location, &content),
                Target::Backend => pass.combiner.write_block(&block.location, &content),
            }
        }
        let ok = pass.combiner.end_snippet();
        pass.defaults.end_snippet();
        ok
    }
}

fn add_sink(pass: &mut PassState<'_>, name: &str, ty: &str, found: &FoundOutput) -> TechniqueId {
    let sink = pass.store.add(create_passthrough(name, ty));
    pass.graph.add_technique(sink);
    pass.graph
        .add_connection(Connection::strong(found.technique, sink));
    pass.graph.add_explicit(
        sink,
        name,
        ExplicitSource {
            from: found.technique,
            output: found.output.name.clone(),
        },
    );
    sink
}

/// A top-level pass of the source technique.
#[derive(Debug, Clone)]
pub struct OuterPass {
    pub snippet: SnippetId,
    /// The source `<pass>`; its attributes carry over.
    pub source: Element,
    /// Non-pass nodes preceding the pass.
    pub pre_nodes: Vec<DocNode>,
}

#[derive(Debug, Clone)]
pub struct GeneratedTechnique {
    pub node: Element,
    /// Conditions of all written techniques, AND-ed.
    pub condition: Option<String>,
}

#[derive(Default)]
pub struct SynthesisOutput {
    pub techniques: Vec<GeneratedTechnique>,
    pub shader_vars: Vec<Element>,
    pub loaders: Vec<Arc<dyn CombinerLoader>>,
}

enum JobResult {
    Done(PassOutput),
    Failed,
    Skipped,
}

/// Generates one technique per consistent combination of pass graphs.
pub struct Synthesizer<'a> {
    compiler: &'a WeaverCompiler,
    tree: &'a SnippetTree,
    shader_name: &'a str,
    passes: Vec<OuterPass>,
    /// Candidate graphs per pass, preferred first.
    graphs: Vec<Vec<TechniqueGraph>>,
    post_nodes: Vec<DocNode>,
}

impl<'a> Synthesizer<'a> {
    pub fn new(
        compiler: &'a WeaverCompiler,
        tree: &'a SnippetTree,
        shader_name: &'a str,
        passes: Vec<OuterPass>,
        graphs: Vec<Vec<TechniqueGraph>>,
        post_nodes: Vec<DocNode>,
    ) -> Self {
        Self {
            compiler,
            tree,
            shader_name,
            passes,
            graphs,
            post_nodes,
        }
    }

    /// Graph index per pass for every combination whose choices agree on
    /// the snippets the passes share.
    pub fn combinations(&self) -> Vec<Vec<usize>> {
        if self.graphs.is_empty() || self.graphs.iter().any(Vec::is_empty) {
            return Vec::new();
        }
        let Some(total) = self
            .graphs
            .iter()
            .try_fold(1usize, |acc, g| acc.checked_mul(g.len()))
        else {
            self.compiler.reporter().report(
                Severity::Error,
                format!("{}: too many technique combinations", self.shader_name),
            );
            return Vec::new();
        };

        let mut combos = Vec::new();
        'combo: for current in 0..total {
            let mut rest = current;
            let mut picks = Vec::with_capacity(self.graphs.len());
            let mut priorities = SnippetTechPriorities::default();
            for graphs in &self.graphs {
                let pick = rest % graphs.len();
                rest /= graphs.len();
                let graph_prios = graphs[pick].priorities();
                if priorities.conflicts_with(graph_prios) {
                    continue 'combo;
                }
                priorities.merge(graph_prios);
                picks.push(pick);
            }
            combos.push(picks);
        }
        combos
    }

    fn run_job(&self, (pass, graph): (usize, usize), deadline: Option<Instant>) -> JobResult {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return JobResult::Skipped;
        }
        let outer = &self.passes[pass];
        match PassSynthesizer::new(self.compiler, self.tree, self.shader_name).synthesize(
            outer.snippet,
            &self.graphs[pass][graph],
            &outer.source,
        ) {
            Some(out) => JobResult::Done(out),
            None => JobResult::Failed,
        }
    }

    fn run_jobs(&self, jobs: &[(usize, usize)], deadline: Option<Instant>) -> Vec<JobResult> {
        let config = self.compiler.config();
        let workers = config.worker_count().min(jobs.len());
        if !config.threaded_synthesis || workers <= 1 {
            return jobs.iter().map(|job| self.run_job(*job, deadline)).collect();
        }
        log::debug!(
            "{}: synthesizing {} passes on {workers} workers",
            self.shader_name,
            jobs.len()
        );

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<usize>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<(usize, JobResult)>();
        for index in 0..jobs.len() {
            let _ = job_tx.send(index);
        }
        drop(job_tx);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for index in job_rx.iter() {
                        let result = self.run_job(jobs[index], deadline);
                        if result_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut results: Vec<Option<JobResult>> = (0..jobs.len()).map(|_| None).collect();
        for (index, result) in result_rx.iter() {
            results[index] = Some(result);
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or(JobResult::Failed))
            .collect()
    }

    /// Synthesizes every combination. Techniques come out in combination
    /// order; combinations where every pass failed are dropped.
    pub fn synthesize(&self, source_technique: &Element) -> SynthesisOutput {
        let combos = self.combinations();
        let pass_count = self.passes.len();
        let jobs: Vec<(usize, usize)> = combos
            .iter()
            .flat_map(|picks| picks.iter().copied().enumerate())
            .collect();
        let deadline = self
            .compiler
            .config()
            .synthesis_budget_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut results: Vec<Option<JobResult>> =
            self.run_jobs(&jobs, deadline).into_iter().map(Some).collect();

        let mut out = SynthesisOutput::default();
        let mut skipped = 0usize;
        for combo in 0..combos.len() {
            let mut technique = Element::new("technique");
            technique.copy_attrs_from(source_technique);
            let mut conditions: Vec<String> = Vec::new();
            let mut tags = BTreeSet::new();
            let mut any_pass = false;
            let mut was_skipped = false;

            for (pass_index, outer) in self.passes.iter().enumerate() {
                technique.children.extend(outer.pre_nodes.iter().cloned());
                let result = results[combo * pass_count + pass_index].take();
                let pass_out = match result {
                    Some(JobResult::Done(p)) => p,
                    Some(JobResult::Skipped) => {
                        was_skipped = true;
                        break;
                    }
                    _ => continue,
                };
                let mut pass = Element::new("pass");
                pass.copy_attrs_from(&outer.source);
                pass.children.extend(
                    self.tree
                        .snippet(outer.snippet)
                        .forwarded
                        .iter()
                        .cloned()
                        .map(DocNode::from),
                );
                pass.children.extend(pass_out.nodes);
                technique.push(pass);
                any_pass = true;

                for c in pass_out.conditions {
                    if !conditions.contains(&c) {
                        conditions.push(c);
                    }
                }
                tags.extend(pass_out.tags);
                out.shader_vars.extend(pass_out.shader_vars);
                if !out
                    .loaders
                    .iter()
                    .any(|l| l.class_id() == pass_out.loader.class_id())
                {
                    out.loaders.push(pass_out.loader);
                }
            }
            if was_skipped {
                skipped += 1;
                continue;
            }
            if !any_pass {
                continue;
            }
            technique.children.extend(self.post_nodes.iter().cloned());
            for tag in tags.into_iter().rev() {
                technique
                    .children
                    .insert(0, Element::new("tag").with_text(tag).into());
            }
            out.techniques.push(GeneratedTechnique {
                node: technique,
                condition: (!conditions.is_empty()).then(|| conditions.join(" && ")),
            });
        }
        if skipped > 0 {
            self.compiler.reporter().report(
                Severity::Warning,
                format!(
                    "{}: synthesis budget exhausted, skipped {skipped} technique combinations",
                    self.shader_name
                ),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::combiner::DefaultCombiner;
    use crate::types::TypeTable;
    use crate::weaver::snippet::create_passthrough;

    struct CostCombiner;

    impl Combiner for CostCombiner {
        fn begin_snippet(&mut self, _annotation: &str) {}
        fn add_input(&mut self, _name: &str, _ty: &str) {}
        fn add_input_value(&mut self, _name: &str, _ty: &str, _value: &str) {}
        fn add_output(&mut self, _name: &str, _ty: &str) {}
        fn input_rename(&mut self, _from: &str, _to: &str) {}
        fn output_rename(&mut self, _from: &str, _to: &str) {}
        fn link(&mut self, _from: &str, _to: &str) {}
        fn write_block(&mut self, _location: &str, _block: &Element) {}
        fn end_snippet(&mut self) -> bool {
            true
        }
        fn add_global(&mut self, _name: &str, _ty: &str, _annotation: Option<&str>) {}
        fn set_output(&mut self, _target: OutputTarget, _name: &str, _annotation: Option<&str>) {}
        fn write_to_pass(&mut self, _pass: &mut Element) {}
        fn coerce_cost(&self, from: &str, to: &str) -> Option<u32> {
            (from == "rgb" && to == "rgba").then_some(1)
        }
        fn query_input_tag(&self, _location: &str, _block: &Element) -> Option<String> {
            None
        }
    }

    fn single(store: &mut TechniqueStore<'_>, ty: &str) -> (TechniqueGraph, TechniqueId) {
        let id = store.add(create_passthrough("col", ty));
        let mut g = TechniqueGraph::new();
        g.add_technique(id);
        (g, id)
    }

    #[test]
    fn exact_output_costs_nothing() {
        let tree = SnippetTree::new();
        let mut store = TechniqueStore::new(&tree);
        let (g, id) = single(&mut store, "rgba");
        let found = find_output(&g, &store, &CostCombiner, "rgba").unwrap();
        assert_eq!(found.technique, id);
        assert_eq!(found.cost, 0);
        assert_eq!(found.output.name, "col");
    }

    #[test]
    fn exact_output_beats_coercible_one() {
        let tree = SnippetTree::new();
        let mut store = TechniqueStore::new(&tree);
        let (mut g, rgb) = single(&mut store, "rgb");
        let rgba = store.add(create_passthrough("col2", "rgba"));
        g.add_technique(rgba);
        let found = find_output(&g, &store, &CostCombiner, "rgba").unwrap();
        assert_eq!(found.technique, rgba);
        let only_rgb = {
            let mut g = TechniqueGraph::new();
            g.add_technique(rgb);
            g
        };
        assert_eq!(find_output(&only_rgb, &store, &CostCombiner, "rgba").unwrap().cost, 1);
    }

    #[test]
    fn dependencies_searched_when_ends_fail() {
        let tree = SnippetTree::new();
        let mut store = TechniqueStore::new(&tree);
        let (mut g, col) = single(&mut store, "rgba");
        let sink = store.add(create_passthrough("n", "float"));
        g.add_technique(sink);
        g.add_connection(Connection::strong(col, sink));
        let found = find_output(&g, &store, &DefaultCombiner::new(), "rgba").unwrap();
        assert_eq!(found.technique, col);
        assert!(find_output(&g, &store, &DefaultCombiner::new(), "depth").is_none());
    }

    #[test]
    fn input_search_skips_used_and_coercion_outputs() {
        let tree = SnippetTree::new();
        let mut store = TechniqueStore::new(&tree);
        let types = TypeTable::builtin();
        let (mut g, a) = single(&mut store, "rgba");
        let mut coerced = create_passthrough("c", "rgba");
        coerced.outputs[0].coercion_output = true;
        let b = store.add(coerced);
        let sink = store.add(create_passthrough("output", "rgba"));
        for t in [b, sink] {
            g.add_technique(t);
        }
        g.add_connection(Connection::strong(a, sink));
        g.add_connection(Connection::strong(b, sink));
        let input = store.technique(sink).inputs[0].clone();

        let mut used = HashSet::new();
        let found = find_input(&g, &store, &CostCombiner, &types, sink, &input, &used).unwrap();
        assert_eq!(found.tech, a);
        assert!(found.direct);
        used.insert((a, "col".to_string()));
        assert!(find_input(&g, &store, &CostCombiner, &types, sink, &input, &used).is_none());
    }

    #[test]
    fn routing_follows_combiner_names() {
        let pass = CombinerPlugin {
            name: "cg".into(),
            class_id: "x".into(),
            params: None,
        };
        let backend = CostCombiner;
        assert_eq!(route(&pass, &pass, "", &backend), Some(Target::Default));
        assert_eq!(route(&pass, &pass, "cg", &backend), Some(Target::Backend));
        assert_eq!(route(&pass, &pass, "other", &backend), None);
        let foreign = CombinerPlugin {
            class_id: "y".into(),
            ..pass.clone()
        };
        assert_eq!(route(&pass, &foreign, "cg", &backend), None);
    }

    #[test]
    fn conditions_wrap_children() {
        let block = Element::new("block").with_text("x = 1;");
        let wrapped = enclose_in_condition(&block, "(a)");
        assert_eq!(wrapped.children.len(), 3);
        assert_eq!(wrapped.children[0], DocNode::instruction("if (a)"));
        assert_eq!(wrapped.children[2], DocNode::instruction("endif"));
    }
}
