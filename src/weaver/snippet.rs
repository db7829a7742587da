//! Snippet documents to techniques.
//!
//! Parsing never fails as a whole: structural problems are reported through
//! the compiler's [`Reporter`](crate::report::Reporter) and drop the smallest
//! enclosing unit (an input, a technique, a connection).

use std::collections::HashMap;
use std::sync::Arc;

use crate::doc::{Element, fingerprint, select_root};
use crate::report::Severity;
use crate::weaver::WeaverCompiler;
use crate::weaver::technique::{
    Attribute, Block, CombinerPlugin, CompoundTechnique, DefaultKind, ExplicitBinding, Input,
    Output, SnippetConnection, SnippetId, Technique, TechniqueId, TechniqueKind,
};

/// Resolves technique ids to techniques.
pub trait TechniqueLookup {
    fn technique(&self, id: TechniqueId) -> &Technique;
}

#[derive(Debug, Clone)]
pub struct Snippet {
    /// Diagnostic name, `parent<prio> -> id`.
    pub name: String,
    /// Identity for priority bookkeeping; shared by every use of the same file.
    pub source_key: String,
    pub is_compound: bool,
    /// Alternatives, highest priority first.
    pub techniques: Vec<TechniqueId>,
    pub condition: Option<String>,
    pub parent: Option<SnippetId>,
    /// Unknown nodes of a top-level pass, copied into the generated pass.
    pub forwarded: Vec<Element>,
}

/// Arena owning all snippets and techniques parsed for one shader.
#[derive(Debug, Clone, Default)]
pub struct SnippetTree {
    snippets: Vec<Snippet>,
    techniques: Vec<Technique>,
}

impl SnippetTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snippet(&self, id: SnippetId) -> &Snippet {
        &self.snippets[id.0]
    }

    pub fn snippet_count(&self) -> usize {
        self.snippets.len()
    }

    pub fn technique_count(&self) -> usize {
        self.techniques.len()
    }

    pub fn techniques_of(&self, id: SnippetId) -> impl Iterator<Item = &Technique> {
        self.snippet(id)
            .techniques
            .iter()
            .map(move |t| &self.techniques[t.0])
    }

    /// Own condition AND-ed with all ancestors' conditions.
    pub fn condition(&self, id: SnippetId) -> Option<String> {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(sid) = cur {
            let snippet = self.snippet(sid);
            if let Some(c) = &snippet.condition {
                parts.push(format!("({c})"));
            }
            cur = snippet.parent;
        }
        if parts.is_empty() {
            return None;
        }
        parts.reverse();
        Some(parts.join(" && "))
    }

    fn push_snippet(&mut self, snippet: Snippet) -> SnippetId {
        self.snippets.push(snippet);
        SnippetId(self.snippets.len() - 1)
    }

    /// Inserts after every technique of equal or higher priority.
    fn add_technique(&mut self, sid: SnippetId, tech: Technique) -> TechniqueId {
        let id = TechniqueId(self.techniques.len());
        let priority = tech.priority;
        self.techniques.push(tech);
        let pos = {
            let list = &self.snippets[sid.0].techniques;
            list.iter()
                .position(|t| self.techniques[t.0].priority < priority)
                .unwrap_or(list.len())
        };
        self.snippets[sid.0].techniques.insert(pos, id);
        id
    }
}

impl TechniqueLookup for SnippetTree {
    fn technique(&self, id: TechniqueId) -> &Technique {
        &self.techniques[id.0]
    }
}

/// Name -> file table consulted by `filealias` attributes.
#[derive(Debug, Clone, Default)]
pub struct FileAliases {
    entries: HashMap<String, (String, bool)>,
}

impl FileAliases {
    pub fn new() -> Self {
        Self::default()
    }

    /// A weak alias never replaces an existing one.
    pub fn add(&mut self, name: impl Into<String>, file: impl Into<String>, weak: bool) {
        let name = name.into();
        if weak && self.entries.contains_key(&name) {
            return;
        }
        self.entries.insert(name, (file.into(), weak));
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|(file, _)| file.as_str())
    }

    pub fn parse_node(&mut self, compiler: &WeaverCompiler, node: &Element) {
        let Some(name) = node.attr("name") else {
            compiler
                .reporter()
                .warn_at(node, "'alias' node without 'name' attribute");
            return;
        };
        let Some(file) = node.attr("file") else {
            compiler
                .reporter()
                .warn_at(node, "'alias' node without 'file' attribute");
            return;
        };
        self.add(name, file, node.attr_bool("weak"));
    }
}

/// Returns `node` itself, or the `root_name` node of the document named by
/// its `file` / `filealias` attribute, along with the file name.
pub(crate) fn node_or_from_file(
    compiler: &WeaverCompiler,
    node: &Element,
    root_name: &str,
    aliases: &FileAliases,
) -> Option<(Element, Option<String>)> {
    let file = match (node.attr("file"), node.attr("filealias")) {
        (Some(file), _) => file.to_string(),
        (None, Some(alias)) => match aliases.resolve(alias) {
            Some(file) => file.to_string(),
            None => {
                compiler
                    .reporter()
                    .warn_at(node, format!("Unknown file alias '{alias}'"));
                return None;
            }
        },
        (None, None) => return Some((node.clone(), None)),
    };
    let doc = match compiler.documents().load(&file) {
        Ok(doc) => doc,
        Err(e) => {
            compiler
                .reporter()
                .report_at(Severity::Warning, node, format!("{e:#}"));
            return None;
        }
    };
    let Some(found) = select_root(&doc, root_name) else {
        compiler.reporter().report(
            Severity::Warning,
            format!("Expected '{root_name}' node in file '{file}'"),
        );
        return None;
    };
    Some((found.clone(), Some(file)))
}

fn parse_combiner(compiler: &WeaverCompiler, node: &Element) -> Option<CombinerPlugin> {
    let Some(name) = node.attr("name") else {
        compiler
            .reporter()
            .warn_at(node, "'combiner' node without 'name' attribute");
        return None;
    };
    let Some(plugin) = node.attr("plugin") else {
        compiler
            .reporter()
            .warn_at(node, "'combiner' node without 'plugin' attribute");
        return None;
    };
    Some(CombinerPlugin {
        name: name.to_string(),
        class_id: plugin.to_string(),
        params: Some(Arc::new(node.clone())),
    })
}

fn parse_attribute(compiler: &WeaverCompiler, node: &Element) -> Option<Attribute> {
    let Some(name) = node.attr("name") else {
        compiler
            .reporter()
            .warn_at(node, "'attribute' node without 'name' attribute");
        return None;
    };
    let Some(ty) = node.attr("type") else {
        compiler
            .reporter()
            .warn_at(node, "'attribute' node without 'type' attribute");
        return None;
    };
    Some(Attribute {
        name: name.to_string(),
        ty: ty.to_string(),
        default_value: node.attr("defval").unwrap_or_default().to_string(),
    })
}

fn parse_attributes(compiler: &WeaverCompiler, node: &Element) -> Option<Vec<Attribute>> {
    node.elements_named("attribute")
        .map(|a| parse_attribute(compiler, a))
        .collect()
}

/// `<block location="[combiner:]location">` children of `node`.
pub(crate) fn read_blocks(
    compiler: &WeaverCompiler,
    node: &Element,
    default_combiner_name: &str,
    aliases: &FileAliases,
) -> Option<Vec<Block>> {
    let mut blocks = Vec::new();
    for child in node.elements_named("block") {
        let Some(location) = child.attr("location") else {
            compiler
                .reporter()
                .warn_at(child, "'block' node without 'location' attribute");
            return None;
        };
        let (combiner_name, location) = match location.split_once(':') {
            Some((combiner, loc)) => (combiner.to_string(), loc.to_string()),
            None => (default_combiner_name.to_string(), location.to_string()),
        };
        let (block_node, _) = node_or_from_file(compiler, child, "block", aliases)?;
        blocks.push(Block {
            combiner_name,
            location,
            node: Arc::new(block_node),
        });
    }
    Some(blocks)
}

fn parse_input(
    compiler: &WeaverCompiler,
    child: &Element,
    default_combiner_name: &str,
    aliases: &FileAliases,
) -> Option<Input> {
    let (node, _) = node_or_from_file(compiler, child, "input", aliases)?;
    let reporter = compiler.reporter();
    let Some(name) = node.attr("name") else {
        reporter.warn_at(&node, "'input' node without 'name' attribute");
        return None;
    };
    let Some(ty) = node.attr("type") else {
        reporter.warn_at(&node, "'input' node without 'type' attribute");
        return None;
    };
    let default = match node.attr("default") {
        None => DefaultKind::None,
        Some("complex") => DefaultKind::Complex(read_blocks(
            compiler,
            &node,
            default_combiner_name,
            aliases,
        )?),
        Some("value") => match node.attr("defval") {
            Some(v) => DefaultKind::Value(v.to_string()),
            None => {
                reporter.warn_at(
                    &node,
                    "'input' node with a 'value' default but without 'defval' attribute",
                );
                return None;
            }
        },
        Some("undefined") => DefaultKind::Undefined,
        Some("shadervar") => match node.attr("defsv") {
            Some(sv) => DefaultKind::ShaderVar(sv.to_string()),
            None => {
                reporter.warn_at(
                    &node,
                    "'input' node with a 'shadervar' default but without 'defsv' attribute",
                );
                return None;
            }
        },
        Some(other) => {
            reporter.warn_at(
                &node,
                format!("Invalid 'default' attribute for 'input' node: {other}"),
            );
            DefaultKind::None
        }
    };
    let attributes = parse_attributes(compiler, child)?;
    Some(Input {
        name: name.to_string(),
        ty: ty.to_string(),
        condition: child.attr("condition").map(str::to_string),
        default,
        private: child.attr_bool("private"),
        no_merge: child.attr_bool("forcenomerge"),
        attributes,
        node: Arc::new(node.clone()),
    })
}

fn parse_output(compiler: &WeaverCompiler, node: &Element) -> Option<Output> {
    let Some(name) = node.attr("name") else {
        compiler
            .reporter()
            .warn_at(node, "'output' node without 'name' attribute");
        return None;
    };
    let Some(ty) = node.attr("type") else {
        compiler
            .reporter()
            .warn_at(node, "'output' node without 'type' attribute");
        return None;
    };
    Some(Output {
        name: name.to_string(),
        ty: ty.to_string(),
        inherit_attr_from: node.attr("inheritattr").map(str::to_string),
        attributes: parse_attributes(compiler, node)?,
        coercion_output: false,
    })
}

/// Parses one atom `<technique>`. Unprefixed blocks go to the combiner named
/// `default_combiner_name`.
pub(crate) fn parse_atom_technique(
    compiler: &WeaverCompiler,
    node: &Element,
    snippet_name: &str,
    can_omit_combiner: bool,
    default_combiner_name: &str,
    aliases: &FileAliases,
) -> Option<Technique> {
    let mut combiner: Option<CombinerPlugin> = None;
    for child in node.elements_named("combiner") {
        if combiner.is_some() {
            compiler
                .reporter()
                .warn_at(child, "Multiple 'combiner' nodes");
        }
        let parsed = parse_combiner(compiler, child)?;
        if combiner.is_none() {
            combiner = Some(parsed);
        }
    }
    if combiner.is_none() && !can_omit_combiner {
        compiler
            .reporter()
            .warn_at(node, "Technique without 'combiner' node");
        return None;
    }

    let inputs = node
        .elements_named("input")
        .map(|c| parse_input(compiler, c, default_combiner_name, aliases))
        .collect::<Option<Vec<_>>>()?;
    let outputs = node
        .elements_named("output")
        .map(|c| parse_output(compiler, c))
        .collect::<Option<Vec<_>>>()?;
    let blocks = read_blocks(compiler, node, default_combiner_name, aliases)?;

    Some(Technique {
        owner: None,
        snippet_name: snippet_name.to_string(),
        priority: node.attr_int("priority"),
        outer_condition: node.attr("condition").map(str::to_string),
        combiner: combiner.unwrap_or_default(),
        inputs,
        outputs,
        kind: TechniqueKind::Atom {
            id: fingerprint(&node.flatten()),
            blocks,
        },
    })
}

/// Loads a coercion technique from a combiner library. Its blocks target
/// `combiner` and its outputs never satisfy plain input matching.
pub fn load_library_technique(
    compiler: &WeaverCompiler,
    node: &Element,
    combiner: &CombinerPlugin,
) -> Option<Technique> {
    let mut tech = parse_atom_technique(
        compiler,
        node,
        "(library)",
        true,
        &combiner.name,
        &FileAliases::new(),
    )?;
    tech.combiner = combiner.clone();
    for output in &mut tech.outputs {
        output.coercion_output = true;
    }
    Some(tech)
}

/// Technique whose single input is copied to its same-named output.
pub fn create_passthrough(var_name: &str, ty: &str) -> Technique {
    let id = fingerprint(&format!("__passthrough_{var_name}_{ty}__"));
    Technique {
        owner: None,
        snippet_name: "(passthrough)".to_string(),
        priority: 0,
        outer_condition: None,
        combiner: CombinerPlugin::default(),
        inputs: vec![Input {
            name: var_name.to_string(),
            ty: ty.to_string(),
            condition: None,
            default: DefaultKind::None,
            private: false,
            no_merge: false,
            attributes: Vec::new(),
            node: Arc::new(Element::new("input")),
        }],
        outputs: vec![Output {
            name: var_name.to_string(),
            ty: ty.to_string(),
            ..Output::default()
        }],
        kind: TechniqueKind::Atom {
            id,
            blocks: Vec::new(),
        },
    }
}

fn parse_floats(text: &str) -> Vec<f32> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().unwrap_or(0.0))
        .collect()
}

/// Fills a [`SnippetTree`] from document nodes.
pub struct SnippetParser<'a> {
    compiler: &'a WeaverCompiler,
    tree: &'a mut SnippetTree,
}

impl<'a> SnippetParser<'a> {
    pub fn new(compiler: &'a WeaverCompiler, tree: &'a mut SnippetTree) -> Self {
        Self { compiler, tree }
    }

    /// Parses a top-level `<pass>`. Its `<technique>` children are the
    /// alternatives; without any, the pass itself is the only one.
    pub fn parse_pass(&mut self, pass: &Element, source_key: &str, aliases: &FileAliases) -> SnippetId {
        let sid = self.tree.push_snippet(Snippet {
            name: String::new(),
            source_key: source_key.to_string(),
            is_compound: true,
            techniques: Vec::new(),
            condition: pass.attr("condition").map(str::to_string),
            parent: None,
            forwarded: Vec::new(),
        });
        if pass.child("technique").is_none() {
            self.load_compound_technique(sid, pass, aliases, true);
            return sid;
        }
        let mut aliases = aliases.clone();
        for child in pass.elements() {
            match child.name.as_str() {
                "technique" => self.load_compound_technique(sid, child, &aliases, false),
                "alias" => aliases.parse_node(self.compiler, child),
                _ => self.tree.snippets[sid.0].forwarded.push(child.clone()),
            }
        }
        sid
    }

    /// Parses a nested `<snippet>` body.
    pub fn parse_snippet(
        &mut self,
        node: &Element,
        name: String,
        source_key: String,
        parent: Option<SnippetId>,
        condition: Option<String>,
        aliases: &FileAliases,
    ) -> SnippetId {
        let is_compound = match node.attr("type") {
            Some("atom") => Some(false),
            Some("compound") => Some(true),
            Some(other) => {
                self.compiler
                    .reporter()
                    .warn_at(node, format!("Unknown snippet type '{other}'"));
                None
            }
            None => Some(
                node.elements_named("technique")
                    .any(|t| t.child("snippet").is_some()),
            ),
        };
        let sid = self.tree.push_snippet(Snippet {
            name,
            source_key,
            is_compound: is_compound.unwrap_or(false),
            techniques: Vec::new(),
            condition,
            parent,
            forwarded: Vec::new(),
        });
        let Some(is_compound) = is_compound else {
            return sid;
        };
        let mut aliases = aliases.clone();
        for child in node.elements() {
            match child.name.as_str() {
                "technique" if is_compound => {
                    self.load_compound_technique(sid, child, &aliases, false)
                }
                "technique" => self.load_atom_technique(sid, child, &aliases),
                "alias" => aliases.parse_node(self.compiler, child),
                _ => self.report_bad_token(child),
            }
        }
        sid
    }

    fn report_bad_token(&self, node: &Element) {
        self.compiler
            .reporter()
            .warn_at(node, format!("Unexpected node '{}'", node.name));
    }

    fn load_atom_technique(&mut self, sid: SnippetId, node: &Element, aliases: &FileAliases) {
        let name = self.tree.snippet(sid).name.clone();
        if let Some(mut tech) = parse_atom_technique(self.compiler, node, &name, false, "", aliases) {
            tech.owner = Some(sid);
            self.tree.add_technique(sid, tech);
        }
    }

    fn load_compound_technique(
        &mut self,
        sid: SnippetId,
        node: &Element,
        aliases: &FileAliases,
        forward_unknown: bool,
    ) {
        let mut tech = Technique {
            owner: Some(sid),
            snippet_name: self.tree.snippet(sid).name.clone(),
            priority: node.attr_int("priority"),
            outer_condition: node.attr("condition").map(str::to_string),
            combiner: CombinerPlugin::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            kind: TechniqueKind::Compound(CompoundTechnique::default()),
        };
        let mut compound = CompoundTechnique::default();
        let mut aliases = aliases.clone();
        for child in node.elements() {
            match child.name.as_str() {
                "combiner" => self.handle_combiner(&mut tech.combiner, child),
                "snippet" => self.handle_snippet(sid, tech.priority, &mut compound, child, &aliases),
                "connection" => self.handle_connection(&mut compound, child),
                "parameter" => self.handle_parameter(sid, &tech, &mut compound, child, &aliases),
                "varying" => self.handle_varying(sid, &tech, &mut compound, child, &aliases),
                "alias" => aliases.parse_node(self.compiler, child),
                _ if forward_unknown => self.tree.snippets[sid.0].forwarded.push(child.clone()),
                _ => self.report_bad_token(child),
            }
        }
        tech.kind = TechniqueKind::Compound(compound);
        self.tree.add_technique(sid, tech);
    }

    fn handle_combiner(&self, current: &mut CombinerPlugin, node: &Element) {
        if !current.class_id.is_empty() {
            self.compiler
                .reporter()
                .warn_at(node, "Multiple 'combiner' nodes");
        }
        let Some(plugin) = node.attr("plugin") else {
            self.compiler
                .reporter()
                .warn_at(node, "'combiner' node without 'plugin' attribute");
            return;
        };
        if current.class_id.is_empty() {
            *current = CombinerPlugin {
                name: node.attr("name").unwrap_or_default().to_string(),
                class_id: plugin.to_string(),
                params: Some(Arc::new(node.clone())),
            };
        }
    }

    fn handle_snippet(
        &mut self,
        parent: SnippetId,
        parent_priority: i32,
        compound: &mut CompoundTechnique,
        node: &Element,
        aliases: &FileAliases,
    ) {
        let reporter = self.compiler.reporter();
        let Some(id) = node.attr("id") else {
            reporter.warn_at(node, "Referenced snippets must have an 'id' attribute");
            return;
        };
        if compound.snippet(id).is_some() {
            reporter.warn_at(node, format!("Duplicate snippet id '{id}'"));
            return;
        }
        let Some((snippet_node, file)) = node_or_from_file(self.compiler, node, "snippet", aliases)
        else {
            return;
        };
        let parent_snippet = self.tree.snippet(parent);
        let name = if parent_snippet.name.is_empty() {
            id.to_string()
        } else {
            format!("{}<{}> -> {}", parent_snippet.name, parent_priority, id)
        };
        let source_key = match file {
            Some(file) => format!("file:{file}"),
            None => format!("{}/{}", parent_snippet.source_key, id),
        };
        let condition = node
            .attr("condition")
            .or_else(|| snippet_node.attr("condition"))
            .map(str::to_string);
        let child = self.parse_snippet(&snippet_node, name, source_key, Some(parent), condition, aliases);
        compound.snippets.push((id.to_string(), child));
    }

    fn handle_connection(&self, compound: &mut CompoundTechnique, node: &Element) {
        let reporter = self.compiler.reporter();
        let mut ends = [SnippetId(0); 2];
        for (slot, attr) in ends.iter_mut().zip(["from", "to"]) {
            let Some(id) = node.attr(attr) else {
                reporter.warn_at(node, format!("'connection' node lacks '{attr}' attribute"));
                return;
            };
            let Some(sid) = compound.snippet(id) else {
                reporter.warn_at(node, format!("Invalid '{attr}' attribute {id}"));
                return;
            };
            *slot = sid;
        }
        let [from, to] = ends;
        for explicit in node.elements_named("explicit") {
            let (Some(output), Some(input)) = (explicit.attr("from"), explicit.attr("to")) else {
                reporter.warn_at(explicit, "'explicit' node needs 'from' and 'to' attributes");
                continue;
            };
            compound.explicit.push(ExplicitBinding {
                from,
                output: output.to_string(),
                to,
                input: input.to_string(),
            });
        }
        compound.connections.push(SnippetConnection { from, to });
    }

    /// Common checks of `<parameter>` / `<varying>`; returns the id and a
    /// technique node carrying a combiner `c` of the enclosing class.
    fn generated_snippet_base<'n>(
        &self,
        tech: &Technique,
        compound: &CompoundTechnique,
        node: &'n Element,
    ) -> Option<(&'n str, Element)> {
        let reporter = self.compiler.reporter();
        if tech.combiner.class_id.is_empty() {
            reporter.warn_at(node, format!("Need a combiner to use <{}>", node.name));
            return None;
        }
        let Some(id) = node.attr("id") else {
            reporter.warn_at(node, "Parameters must have an 'id' attribute");
            return None;
        };
        if compound.snippet(id).is_some() {
            reporter.warn_at(node, format!("Duplicate snippet id '{id}'"));
            return None;
        }
        let tech_node = Element::new("technique").with_child(
            Element::new("combiner")
                .with_attr("name", "c")
                .with_attr("plugin", tech.combiner.class_id.as_str()),
        );
        Some((id, tech_node))
    }

    fn handle_parameter(
        &mut self,
        parent: SnippetId,
        tech: &Technique,
        compound: &mut CompoundTechnique,
        node: &Element,
        aliases: &FileAliases,
    ) {
        let Some((id, mut tech_node)) = self.generated_snippet_base(tech, compound, node) else {
            return;
        };
        let loader = match self.compiler.combiners().load(&tech.combiner.class_id) {
            Ok(loader) => loader,
            Err(e) => {
                // Reported again when the pass is synthesized.
                log::debug!("parameter '{id}': {e:#}");
                return;
            }
        };
        let kind = node.attr("type").unwrap_or("float");
        let components = match kind {
            "float" | "int" => Some(1),
            "vector2" => Some(2),
            "vector3" => Some(3),
            "vector4" => Some(4),
            _ => None,
        };
        let weaver_type = match components {
            Some(n) => {
                let mut value = [0.0f32; 4];
                for (slot, v) in value.iter_mut().zip(parse_floats(&node.text())) {
                    *slot = v;
                }
                loader.generate_constant_input_blocks(&mut tech_node, "c", value, n, "output");
                if n > 1 { format!("float{n}") } else { "float".to_string() }
            }
            None if kind == "shadervar" || kind == "expr" => {
                let Some(weaver_type) = node.attr("weavertype") else {
                    self.compiler.reporter().warn_at(
                        node,
                        "Need a 'weavertype' attribute for non-constant parameters",
                    );
                    return;
                };
                let sv_name = node.text();
                loader.generate_sv_input_blocks(
                    &mut tech_node,
                    "c",
                    sv_name.trim(),
                    weaver_type,
                    "output",
                    id,
                );
                weaver_type.to_string()
            }
            None => {
                self.compiler.reporter().warn_at(
                    node,
                    format!("Constant parameter of unsupported type {kind}"),
                );
                return;
            }
        };
        tech_node.push(
            Element::new("output")
                .with_attr("type", weaver_type)
                .with_attr("name", "output"),
        );
        let snippet_node = Element::new("snippet").with_attr("id", id).with_child(tech_node);
        self.handle_snippet(parent, tech.priority, compound, &snippet_node, aliases);
    }

    fn handle_varying(
        &mut self,
        parent: SnippetId,
        tech: &Technique,
        compound: &mut CompoundTechnique,
        node: &Element,
        aliases: &FileAliases,
    ) {
        let Some((id, mut tech_node)) = self.generated_snippet_base(tech, compound, node) else {
            return;
        };
        let (Some(source), Some(weaver_type)) = (node.attr("source"), node.attr("weavertype"))
        else {
            self.compiler
                .reporter()
                .warn_at(node, "'varying' node needs 'source' and 'weavertype' attributes");
            return;
        };
        let loader = match self.compiler.combiners().load(&tech.combiner.class_id) {
            Ok(loader) => loader,
            Err(e) => {
                log::debug!("varying '{id}': {e:#}");
                return;
            }
        };
        loader.generate_buffer_input_blocks(&mut tech_node, "c", source, weaver_type, "output", id);
        tech_node.push(
            Element::new("output")
                .with_attr("type", weaver_type)
                .with_attr("name", "output"),
        );
        let snippet_node = Element::new("snippet").with_attr("id", id).with_child(tech_node);
        self.handle_snippet(parent, tech.priority, compound, &snippet_node, aliases);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::combiner::cg::CG_COMBINER_CLASS;
    use crate::config::WeaverConfig;
    use crate::doc::MemoryDocumentSource;

    fn compiler(docs: MemoryDocumentSource) -> WeaverCompiler {
        WeaverCompiler::new(WeaverConfig::default(), Arc::new(docs))
    }

    fn atom(priority: i32, output_ty: &str) -> Element {
        Element::new("technique")
            .with_attr("priority", priority.to_string())
            .with_child(
                Element::new("combiner")
                    .with_attr("name", "cg")
                    .with_attr("plugin", CG_COMBINER_CLASS),
            )
            .with_child(
                Element::new("output")
                    .with_attr("name", "result")
                    .with_attr("type", output_ty),
            )
    }

    #[test]
    fn techniques_sorted_by_priority() {
        let c = compiler(MemoryDocumentSource::new());
        let mut tree = SnippetTree::new();
        let node = Element::new("snippet")
            .with_child(atom(1, "rgb"))
            .with_child(atom(5, "rgba"))
            .with_child(atom(1, "float"));
        let sid = SnippetParser::new(&c, &mut tree).parse_snippet(
            &node,
            "s".into(),
            "s".into(),
            None,
            None,
            &FileAliases::new(),
        );
        let prios: Vec<_> = tree.techniques_of(sid).map(|t| t.priority).collect();
        assert_eq!(prios, vec![5, 1, 1]);
        let first_low = tree.techniques_of(sid).nth(1).map(|t| t.outputs[0].ty.clone());
        assert_eq!(first_low.as_deref(), Some("rgb"));
    }

    #[test]
    fn missing_combiner_drops_technique() {
        let c = compiler(MemoryDocumentSource::new());
        let mut tree = SnippetTree::new();
        let node = Element::new("snippet").with_child(
            Element::new("technique").with_child(
                Element::new("output")
                    .with_attr("name", "x")
                    .with_attr("type", "rgba"),
            ),
        );
        let sid = SnippetParser::new(&c, &mut tree).parse_snippet(
            &node,
            "s".into(),
            "s".into(),
            None,
            None,
            &FileAliases::new(),
        );
        assert_eq!(tree.techniques_of(sid).count(), 0);
        assert!(c.reporter().contains("Technique without 'combiner' node"));
    }

    #[test]
    fn block_locations_split_on_colon() {
        let c = compiler(MemoryDocumentSource::new());
        let node = atom(0, "rgba")
            .with_child(Element::new("block").with_attr("location", "cg:fragmentMain"))
            .with_child(Element::new("block").with_attr("location", "pass"));
        let tech = parse_atom_technique(&c, &node, "s", false, "", &FileAliases::new())
            .unwrap_or_else(|| panic!("technique should parse"));
        let blocks: Vec<_> = tech
            .blocks()
            .iter()
            .map(|b| (b.combiner_name.as_str(), b.location.as_str()))
            .collect();
        assert_eq!(blocks, vec![("cg", "fragmentMain"), ("", "pass")]);
    }

    #[test]
    fn input_defaults() {
        let c = compiler(MemoryDocumentSource::new());
        let node = atom(0, "rgba")
            .with_child(
                Element::new("input")
                    .with_attr("name", "a")
                    .with_attr("type", "float")
                    .with_attr("default", "value")
                    .with_attr("defval", "0.5"),
            )
            .with_child(
                Element::new("input")
                    .with_attr("name", "b")
                    .with_attr("type", "float")
                    .with_attr("default", "bogus")
                    .with_attr("private", "true"),
            );
        let tech = parse_atom_technique(&c, &node, "s", false, "", &FileAliases::new())
            .unwrap_or_else(|| panic!("technique should parse"));
        assert!(matches!(&tech.inputs[0].default, DefaultKind::Value(v) if v == "0.5"));
        assert!(matches!(tech.inputs[1].default, DefaultKind::None));
        assert!(tech.inputs[1].private);
        assert!(c.reporter().contains("Invalid 'default' attribute"));
    }

    #[test]
    fn value_default_needs_defval() {
        let c = compiler(MemoryDocumentSource::new());
        let node = atom(0, "rgba").with_child(
            Element::new("input")
                .with_attr("name", "a")
                .with_attr("type", "float")
                .with_attr("default", "value"),
        );
        assert!(parse_atom_technique(&c, &node, "s", false, "", &FileAliases::new()).is_none());
    }

    #[test]
    fn weak_alias_does_not_override() {
        let mut aliases = FileAliases::new();
        aliases.add("lib", "strong.json", false);
        aliases.add("lib", "weak.json", true);
        aliases.add("other", "weak.json", true);
        assert_eq!(aliases.resolve("lib"), Some("strong.json"));
        assert_eq!(aliases.resolve("other"), Some("weak.json"));
        aliases.add("other", "strong.json", false);
        assert_eq!(aliases.resolve("other"), Some("strong.json"));
    }

    #[test]
    fn nested_snippets_from_files_and_aliases() {
        let leaf = Element::new("snippet").with_child(atom(0, "rgba"));
        let docs = MemoryDocumentSource::new().with("leaf.json", leaf);
        let c = compiler(docs);
        let pass = Element::new("pass")
            .with_child(Element::new("alias").with_attr("name", "leaf").with_attr("file", "leaf.json"))
            .with_child(Element::new("snippet").with_attr("id", "a").with_attr("file", "leaf.json"))
            .with_child(Element::new("snippet").with_attr("id", "b").with_attr("filealias", "leaf"))
            .with_child(Element::new("snippet").with_attr("id", "a").with_attr("file", "leaf.json"))
            .with_child(Element::new("connection").with_attr("from", "a").with_attr("to", "b"))
            .with_child(Element::new("texture").with_attr("name", "t"));
        let mut tree = SnippetTree::new();
        let sid = SnippetParser::new(&c, &mut tree).parse_pass(&pass, "pass0", &FileAliases::new());
        let top = tree.techniques_of(sid).next().unwrap_or_else(|| panic!("no technique"));
        let compound = top.as_compound().unwrap_or_else(|| panic!("not compound"));
        assert_eq!(compound.snippets.len(), 2);
        assert_eq!(compound.connections.len(), 1);
        assert!(c.reporter().contains("Duplicate snippet id 'a'"));
        let a = compound.snippet("a").unwrap_or_else(|| panic!("no a"));
        let b = compound.snippet("b").unwrap_or_else(|| panic!("no b"));
        assert_eq!(tree.snippet(a).source_key, tree.snippet(b).source_key);
        assert_eq!(tree.snippet(sid).forwarded.len(), 1);
    }

    #[test]
    fn conditions_chain_through_parents() {
        let c = compiler(MemoryDocumentSource::new());
        let pass = Element::new("pass").with_attr("condition", "vars.a").with_child(
            Element::new("snippet")
                .with_attr("id", "s")
                .with_attr("condition", "vars.b")
                .with_child(atom(0, "rgba")),
        );
        let mut tree = SnippetTree::new();
        let sid = SnippetParser::new(&c, &mut tree).parse_pass(&pass, "p", &FileAliases::new());
        let child = tree
            .techniques_of(sid)
            .next()
            .and_then(|t| t.as_compound())
            .and_then(|c| c.snippet("s"))
            .unwrap_or_else(|| panic!("no child"));
        assert_eq!(tree.condition(child).as_deref(), Some("(vars.a) && (vars.b)"));
        assert_eq!(tree.snippet(child).name, "s");
    }

    #[test]
    fn parameter_generates_constant_snippet() {
        let c = compiler(MemoryDocumentSource::new());
        let pass = Element::new("pass")
            .with_child(
                Element::new("combiner")
                    .with_attr("name", "cg")
                    .with_attr("plugin", CG_COMBINER_CLASS),
            )
            .with_child(
                Element::new("parameter")
                    .with_attr("id", "scale")
                    .with_attr("type", "vector2")
                    .with_text("1, 2"),
            );
        let mut tree = SnippetTree::new();
        let sid = SnippetParser::new(&c, &mut tree).parse_pass(&pass, "p", &FileAliases::new());
        let param = tree
            .techniques_of(sid)
            .next()
            .and_then(|t| t.as_compound())
            .and_then(|c| c.snippet("scale"))
            .unwrap_or_else(|| panic!("no parameter snippet"));
        let tech = tree.techniques_of(param).next().unwrap_or_else(|| panic!("no technique"));
        assert_eq!(tech.outputs[0].ty, "float2");
        assert!(!tech.blocks().is_empty());
        assert!(tech.blocks().iter().all(|b| b.combiner_name == "c"));
    }

    #[test]
    fn passthrough_copies_input() {
        let p = create_passthrough("output", "rgba");
        assert!(p.is_passthrough());
        assert_eq!(p.inputs[0].name, p.outputs[0].name);
    }
}
