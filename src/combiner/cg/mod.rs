//! Cg backend: emits a vertex and a fragment program per pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;

use crate::combiner::{CoerceLink, Combiner, CombinerLoader, OutputTarget};
use crate::doc::{DocNode, Element};
use crate::types::{BaseType, TypeTable};

mod coerce;

pub use coerce::{CoerceRule, CoercionLibrary};

pub const CG_COMBINER_CLASS: &str = "weaver.combiner.glcg";

#[derive(Debug)]
struct CgShared {
    types: Arc<TypeTable>,
    library: CoercionLibrary,
    annotate: bool,
}

impl CgShared {
    fn cg_type(&self, weaver_type: &str) -> String {
        let Some(info) = self.types.query_type_info(weaver_type) else {
            return weaver_type.to_string();
        };
        match info.base {
            BaseType::Vector | BaseType::VectorB | BaseType::VectorI => {
                let base = match info.base {
                    BaseType::VectorB => "bool",
                    BaseType::VectorI => "int",
                    _ => "float",
                };
                if info.dimensions == 1 {
                    base.to_string()
                } else {
                    format!("{base}{}", info.dimensions)
                }
            }
            BaseType::Sampler if info.sampler_is_cube => "samplerCUBE".to_string(),
            BaseType::Sampler => format!("sampler{}D", info.dimensions),
            BaseType::Matrix => format!("float{0}x{0}", info.dimensions),
        }
    }

    fn chain(&self, from: &str, to: &str) -> Vec<CoerceLink> {
        self.library
            .find_chain(from, to)
            .into_iter()
            .map(|r| CoerceLink {
                from_type: r.from.clone(),
                to_type: r.to.clone(),
                cost: r.cost,
                node: r.node.clone(),
            })
            .collect()
    }
}

/// Turns an arbitrary tag into a Cg identifier.
fn make_identifier(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 1);
    if !s.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        out.push('_');
    }
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{b:02x}"));
        }
    }
    out
}

fn text_block(location: String, text: String) -> Element {
    Element::new("block")
        .with_attr("location", location)
        .with_text(text)
}

pub struct CgCombinerLoader {
    shared: Arc<CgShared>,
}

impl CgCombinerLoader {
    pub fn new(types: Arc<TypeTable>, library: CoercionLibrary, annotate: bool) -> Self {
        Self {
            shared: Arc::new(CgShared {
                types,
                library,
                annotate,
            }),
        }
    }
}

impl CombinerLoader for CgCombinerLoader {
    fn class_id(&self) -> &str {
        CG_COMBINER_CLASS
    }

    fn code_string(&self) -> String {
        self.shared.library.checksum().to_string()
    }

    fn create_combiner(&self, _params: Option<&Element>) -> Result<Box<dyn Combiner>> {
        Ok(Box::new(CgCombiner::new(self.shared.clone())))
    }

    fn coerce_cost(&self, from: &str, to: &str) -> Option<u32> {
        self.shared.library.cost(from, to)
    }

    fn query_coerce_chain(&self, from: &str, to: &str) -> Vec<CoerceLink> {
        self.shared.chain(from, to)
    }

    fn generate_constant_input_blocks(
        &self,
        technique: &mut Element,
        location_prefix: &str,
        value: [f32; 4],
        used_components: usize,
        output_name: &str,
    ) {
        let used = used_components.clamp(1, 4);
        let values: Vec<String> = value[..used].iter().map(|v| format!("{v:?}")).collect();
        let code = if used > 1 {
            format!("{output_name} = float{used}({});", values.join(", "))
        } else {
            format!("{output_name} = {};", values[0])
        };
        technique.push(text_block(format!("{location_prefix}:fragmentMain"), code.clone()));
        technique.push(text_block(format!("{location_prefix}:vertexMain"), code));
    }

    fn generate_sv_input_blocks(
        &self,
        technique: &mut Element,
        location_prefix: &str,
        sv_name: &str,
        output_type: &str,
        output_name: &str,
        unique_tag: &str,
    ) {
        let ident = make_identifier(unique_tag);
        let is_texture = self
            .shared
            .types
            .query_type_info(output_type)
            .is_some_and(|t| t.base == BaseType::Sampler);

        if is_texture {
            let texture = |dest: &str| {
                Element::new("texture")
                    .with_attr("name", sv_name)
                    .with_attr("destination", format!("{dest}.{ident}"))
            };
            technique.push(
                Element::new("block")
                    .with_attr("location", "pass")
                    .with_child(texture("vertexIn"))
                    .with_child(texture("fragmentIn")),
            );
        } else {
            let map = |dest: &str| {
                Element::new("variablemap")
                    .with_attr("variable", sv_name)
                    .with_attr("destination", format!("{dest}.{ident}"))
            };
            technique.push(
                Element::new("block")
                    .with_attr("location", format!("{location_prefix}:variablemap"))
                    .with_child(map("vertexIn"))
                    .with_child(map("fragmentIn")),
            );
        }

        for loc in ["fragmentIn", "vertexIn"] {
            technique.push(
                Element::new("block")
                    .with_attr("location", format!("{location_prefix}:{loc}"))
                    .with_child(
                        Element::new("uniform")
                            .with_attr("type", output_type)
                            .with_attr("name", ident.as_str()),
                    ),
            );
        }
        technique.push(text_block(
            format!("{location_prefix}:fragmentMain"),
            format!("{output_name} = fragmentIn.{ident};"),
        ));
        technique.push(text_block(
            format!("{location_prefix}:vertexMain"),
            format!("{output_name} = vertexIn.{ident};"),
        ));
    }

    fn generate_buffer_input_blocks(
        &self,
        technique: &mut Element,
        location_prefix: &str,
        buffer_name: &str,
        output_type: &str,
        output_name: &str,
        unique_tag: &str,
    ) {
        let ident = make_identifier(unique_tag);
        technique.push(
            Element::new("block").with_attr("location", "pass").with_child(
                Element::new("buffer")
                    .with_attr("source", buffer_name)
                    .with_attr("destination", format!("vertexIn.{ident}")),
            ),
        );
        let varying = || {
            Element::new("varying")
                .with_attr("type", output_type)
                .with_attr("name", ident.as_str())
        };
        technique.push(
            Element::new("block")
                .with_attr("location", format!("{location_prefix}:vertexToFragment"))
                .with_child(varying()),
        );
        technique.push(
            Element::new("block")
                .with_attr("location", format!("{location_prefix}:vertexIn"))
                .with_child(varying()),
        );
        technique.push(text_block(
            format!("{location_prefix}:fragmentMain"),
            format!("{output_name} = {ident};\n"),
        ));
        technique.push(text_block(
            format!("{location_prefix}:vertexMain"),
            format!("{output_name} = vertexIn.{ident};\n{ident} = vertexIn.{ident};\n"),
        ));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CgAttribute {
    name: String,
    ty: String,
}

#[derive(Debug, Default)]
struct CgSnippet {
    annotation: String,
    local_ids: HashSet<String>,
    locals: String,
    input_maps: Vec<(String, String)>,
    output_maps: Vec<(String, String)>,
    attr_input_maps: Vec<(String, String)>,
    attr_output_maps: Vec<(String, String)>,
    links: String,
    vert2frag: Vec<DocNode>,
    v2f_maps: HashMap<String, String>,
    vertex_body: Vec<DocNode>,
    fragment_body: Vec<DocNode>,
    vertex_in: Vec<DocNode>,
    fragment_in: Vec<DocNode>,
}

impl CgSnippet {
    fn unique_v2f<'a>(&'a self, name: &'a str) -> &'a str {
        self.v2f_maps.get(name).map(String::as_str).unwrap_or(name)
    }

    fn has_vertex_code(&self) -> bool {
        !self.locals.is_empty()
            || !self.input_maps.is_empty()
            || !self.vertex_body.is_empty()
            || !self.output_maps.is_empty()
    }

    fn has_fragment_code(&self) -> bool {
        !self.locals.is_empty()
            || !self.input_maps.is_empty()
            || !self.fragment_body.is_empty()
            || !self.output_maps.is_empty()
    }
}

enum V2fEntry<'a> {
    Varying {
        node: &'a Element,
        name: String,
        count: usize,
    },
    Other(&'a DocNode),
}

fn map_get<'a>(map: &'a [(String, String)], key: &str) -> Option<&'a str> {
    map.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn attr_identifier(var: &str, attr: &str) -> String {
    format!("{var}_attr_{attr}")
}

/// `name[4]` -> (`name`, 4); plain names have a count of 0.
fn split_off_array_count(name: &str) -> (String, usize) {
    match name.find('[') {
        None => (name.to_string(), 0),
        Some(pos) => {
            let digits: String = name[pos + 1..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            (name[..pos].to_string(), digits.parse().unwrap_or(0))
        }
    }
}

fn make_comment(s: &str) -> String {
    if !s.contains(['\r', '\n']) {
        return format!("// {s}\n");
    }
    let mut out = String::from("/* ");
    let lines: Vec<&str> = s.split(['\r', '\n']).collect();
    out.push_str(&lines.join("\n   "));
    out.push_str("\n */\n");
    out
}

/// Accumulates program text, keeping non-text nodes (conditional
/// instructions) as separate document nodes.
#[derive(Default)]
struct ProgramAppender {
    nodes: Vec<DocNode>,
    pending: String,
}

impl ProgramAppender {
    fn push_str(&mut self, s: &str) {
        self.pending.push_str(s);
    }

    fn push_node(&mut self, node: &DocNode) {
        match node {
            DocNode::Text { text } => self.pending.push_str(text),
            DocNode::Comment { .. } => {}
            other => {
                self.flush();
                self.nodes.push(other.clone());
            }
        }
    }

    fn push_nodes(&mut self, nodes: &[DocNode]) {
        for n in nodes {
            self.push_node(n);
        }
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.nodes.push(DocNode::text(std::mem::take(&mut self.pending)));
        }
    }

    fn finish(mut self) -> Element {
        self.flush();
        let mut program = Element::new("program");
        program.children = self.nodes;
        program
    }
}

/// Picks `COLOR0`/`COLOR1` for varyings without explicit binding when the
/// target supports float color buffers.
struct AutoSemantics {
    preamble: String,
    postamble: String,
    cycle: String,
}

impl AutoSemantics {
    fn new(snippets: &[CgSnippet]) -> Self {
        let mut bindings: HashSet<&str> = HashSet::new();
        for snippet in snippets {
            for node in snippet.vert2frag.iter().filter_map(DocNode::as_element) {
                if node.name != "varying" || node.attr("name").is_none() {
                    continue;
                }
                if let Some(binding) = node.attr("binding") {
                    bindings.insert(binding);
                }
            }
        }
        if bindings.contains("COLOR") {
            bindings.insert("COLOR0");
        }
        let available: Vec<&str> = ["COLOR1", "COLOR0"]
            .into_iter()
            .filter(|b| !bindings.contains(b))
            .collect();

        let mut preamble = String::from("#ifdef HAVE_ARB_color_buffer_float\n");
        let mut postamble = String::new();
        for (i, b) in available.iter().enumerate() {
            preamble.push_str(&format!("#define _V2F_AUTOSEMANTIC_{i}\t: {b}\n"));
            postamble.push_str(&format!("#undef _V2F_AUTOSEMANTIC_{i}\n"));
        }
        if available.is_empty() {
            preamble.push_str("#define _V2F_AUTOSEMANTIC\n");
        } else {
            preamble.push_str("#define _V2F_AUTOSEMANTIC\t_V2F_AUTOSEMANTIC_0\n");
            preamble.push_str("#define _V2F_AUTOSEMANTIC_CURRENT\t0\n");
        }
        preamble.push_str("#else\n#define _V2F_AUTOSEMANTIC\n#endif\n");
        postamble.push_str("#undef _V2F_AUTOSEMANTIC\n");

        let mut cycle = String::new();
        if !available.is_empty() {
            let last = available.len() - 1;
            cycle.push_str("#ifdef HAVE_ARB_color_buffer_float\n#if 0\n");
            for i in 0..last {
                cycle.push_str(&format!("#elif _V2F_AUTOSEMANTIC_CURRENT == {i}\n"));
                cycle.push_str("#undef _V2F_AUTOSEMANTIC_CURRENT\n#undef _V2F_AUTOSEMANTIC\n");
                cycle.push_str(&format!("#define _V2F_AUTOSEMANTIC_CURRENT\t{}\n", i + 1));
                cycle.push_str(&format!(
                    "#define _V2F_AUTOSEMANTIC\t_V2F_AUTOSEMANTIC_{}\n",
                    i + 1
                ));
            }
            cycle.push_str(&format!("#elif _V2F_AUTOSEMANTIC_CURRENT == {last}\n"));
            cycle.push_str("#undef _V2F_AUTOSEMANTIC_CURRENT\n#undef _V2F_AUTOSEMANTIC\n");
            cycle.push_str(&format!(
                "#define _V2F_AUTOSEMANTIC_CURRENT\t{}\n",
                available.len()
            ));
            cycle.push_str("#define _V2F_AUTOSEMANTIC\n#endif\n#endif\n");
        }
        Self {
            preamble,
            postamble,
            cycle,
        }
    }
}

pub struct CgCombiner {
    shared: Arc<CgShared>,
    snippets: Vec<CgSnippet>,
    current: CgSnippet,
    globals: String,
    global_ids: HashSet<String>,
    attributes: HashMap<String, Vec<CgAttribute>>,
    variable_maps: Vec<DocNode>,
    vertex_compiler_args: Vec<DocNode>,
    fragment_compiler_args: Vec<DocNode>,
    definitions: Vec<DocNode>,
    output_assign: [String; 2],
    unique_counter: usize,
}

impl CgCombiner {
    fn new(shared: Arc<CgShared>) -> Self {
        Self {
            shared,
            snippets: Vec::new(),
            current: CgSnippet::default(),
            globals: String::new(),
            global_ids: HashSet::new(),
            attributes: HashMap::new(),
            variable_maps: Vec::new(),
            vertex_compiler_args: Vec::new(),
            fragment_compiler_args: Vec::new(),
            definitions: Vec::new(),
            output_assign: [String::new(), String::new()],
            unique_counter: 0,
        }
    }

    fn annotate(&self) -> bool {
        self.shared.annotate
    }

    fn declare_local(&mut self, kind: &str, name: &str, ty: &str) -> bool {
        let already_used = !self.current.local_ids.insert(name.to_string());
        let cg = self.shared.cg_type(ty);
        if self.annotate() {
            self.current
                .locals
                .push_str(&format!("// {kind}: {ty} {name}\n"));
            if already_used {
                self.current.locals.push_str("//");
            }
        }
        if self.annotate() || !already_used {
            self.current.locals.push_str(&format!("{cg} {name};\n"));
        }
        already_used
    }

    fn append_snippet_map(map: &[(String, String)], app: &mut ProgramAppender) {
        for (from, to) in map {
            if from != to {
                app.push_str(&format!("{to} = {from};\n"));
            }
        }
    }

    fn append_program_input(&self, node: &DocNode, app: &mut ProgramAppender) {
        let Some(e) = node.as_element() else {
            app.push_node(node);
            return;
        };
        let keyword = match e.name.as_str() {
            "uniform" => "uniform",
            "varying" => "varying",
            _ => return,
        };
        let (Some(name), Some(ty)) = (e.attr("name"), e.attr("type")) else {
            return;
        };
        let binding = e.attr("binding").map(|b| format!(" : {b}")).unwrap_or_default();
        app.push_str(&format!(
            "{keyword} {} {name}{binding};\n",
            self.shared.cg_type(ty)
        ));
    }

    fn v2f_entries(snippet: &CgSnippet) -> impl Iterator<Item = V2fEntry<'_>> {
        snippet.vert2frag.iter().filter_map(|node| match node.as_element() {
            Some(e) if e.name == "varying" => {
                let (name, count) = split_off_array_count(e.attr("name")?);
                Some(V2fEntry::Varying { node: e, name, count })
            }
            Some(_) => None,
            None => Some(V2fEntry::Other(node)),
        })
    }

    fn append_v2f_head(&self, snippet: &CgSnippet, app: &mut ProgramAppender) {
        for entry in Self::v2f_entries(snippet) {
            let V2fEntry::Varying { name, count, .. } = entry else {
                continue;
            };
            let unique = snippet.unique_v2f(&name);
            if count > 0 {
                for i in 0..count {
                    app.push_str(&format!(
                        "//@@UNUSED? PARAM_vertexToFragment_{unique}_{i}__UNUSED\n"
                    ));
                }
            } else {
                app.push_str(&format!(
                    "//@@UNUSED? PARAM_vertexToFragment_{unique}_UNUSED\n"
                ));
            }
        }
    }

    fn append_v2f_decl(&self, snippet: &CgSnippet, auto: &AutoSemantics, app: &mut ProgramAppender) {
        for entry in Self::v2f_entries(snippet) {
            let (node, name, count) = match entry {
                V2fEntry::Varying { node, name, count } => (node, name, count),
                V2fEntry::Other(other) => {
                    self.append_program_input(other, app);
                    continue;
                }
            };
            let unique = snippet.unique_v2f(&name);
            let ty = node.attr("type");
            let binding = node.attr("binding").map(|b| format!(" : {b}"));
            if count > 0 {
                app.push_str("#if 0\n");
                for i in (0..count).rev() {
                    app.push_str(&format!(
                        "#elif !defined(PARAM_vertexToFragment_{unique}_{i}__UNUSED)\n"
                    ));
                    if let Some(ty) = ty {
                        app.push_str(&format!(
                            "varying {} {unique}[{}]{};\n",
                            self.shared.cg_type(ty),
                            i + 1,
                            binding.as_deref().unwrap_or("")
                        ));
                    }
                }
                app.push_str("#endif\n");
            } else {
                app.push_str(&format!(
                    "#ifndef PARAM_vertexToFragment_{unique}_UNUSED\n"
                ));
                if let Some(ty) = ty {
                    let cg = self.shared.cg_type(ty);
                    match &binding {
                        Some(b) => app.push_str(&format!("varying {cg} {unique}{b};\n")),
                        None => {
                            app.push_str(&format!("varying {cg} {unique} _V2F_AUTOSEMANTIC ;\n"));
                            app.push_str(&auto.cycle);
                        }
                    }
                }
                app.push_str("#endif\n");
            }
        }
    }

    fn append_v2f_locals(&self, snippet: &CgSnippet, app: &mut ProgramAppender) {
        for entry in Self::v2f_entries(snippet) {
            let (node, name, count) = match entry {
                V2fEntry::Varying { node, name, count } => (node, name, count),
                V2fEntry::Other(other) => {
                    self.append_program_input(other, app);
                    continue;
                }
            };
            let ty = node.attr("type").unwrap_or("");
            let already_used = snippet.local_ids.contains(&name);
            if self.annotate() {
                app.push_str(&format!("// Vertex to fragment: {ty} {name}\n"));
                if already_used {
                    app.push_str("//");
                }
            }
            if self.annotate() || !already_used {
                let cg = self.shared.cg_type(ty);
                if count > 0 {
                    app.push_str(&format!("{cg} {name}[{count}];\n"));
                } else {
                    app.push_str(&format!("{cg} {name};\n"));
                }
            }
        }
    }

    fn append_v2f_vp(&self, snippet: &CgSnippet, app: &mut ProgramAppender) {
        for entry in Self::v2f_entries(snippet) {
            let (name, count) = match entry {
                V2fEntry::Varying { name, count, .. } => (name, count),
                V2fEntry::Other(other) => {
                    self.append_program_input(other, app);
                    continue;
                }
            };
            let unique = snippet.unique_v2f(&name);
            if count > 0 {
                for i in 0..count {
                    app.push_str(&format!(
                        "#ifndef PARAM_vertexToFragment_{unique}_{i}__UNUSED\n"
                    ));
                    app.push_str(&format!(
                        "vertexToFragment.{unique}[{i}] = {name}[{i}];\n#endif\n"
                    ));
                }
            } else {
                app.push_str(&format!(
                    "#ifndef PARAM_vertexToFragment_{unique}_UNUSED\n"
                ));
                app.push_str(&format!("vertexToFragment.{unique} = {name};\n#endif\n"));
            }
        }
    }

    fn append_v2f_fp(&self, snippet: &CgSnippet, app: &mut ProgramAppender) {
        for entry in Self::v2f_entries(snippet) {
            let (node, name, count) = match entry {
                V2fEntry::Varying { node, name, count } => (node, name, count),
                V2fEntry::Other(other) => {
                    self.append_program_input(other, app);
                    continue;
                }
            };
            let unique = snippet.unique_v2f(&name);
            let cg = self.shared.cg_type(node.attr("type").unwrap_or(""));
            if count > 0 {
                for i in 0..count {
                    app.push_str(&format!(
                        "#ifndef PARAM_vertexToFragment_{unique}_{i}__UNUSED\n"
                    ));
                    app.push_str(&format!(
                        "{name}[{i}] = vertexToFragment.{unique}[{i}];\n"
                    ));
                    app.push_str("#else\n#ifdef _INITIALIZE_UNUSED_V2F\n");
                    app.push_str(&format!("{name}[{i}] = {cg}(0);\n"));
                    app.push_str("#endif\n#endif\n");
                }
            } else {
                app.push_str(&format!(
                    "#ifndef PARAM_vertexToFragment_{unique}_UNUSED\n"
                ));
                app.push_str(&format!("{name} = vertexToFragment.{unique};\n"));
                app.push_str("#else\n#ifdef _INITIALIZE_UNUSED_V2F\n");
                app.push_str(&format!("{name} = {cg}(0);\n"));
                app.push_str("#endif\n#endif\n");
            }
        }
    }

    fn append_v2f_struct(&self, auto: &AutoSemantics, app: &mut ProgramAppender) {
        app.push_str("struct vertex2fragment\n{\n  void dummy() {}\n");
        app.push_str(&auto.preamble);
        for s in &self.snippets {
            self.append_v2f_decl(s, auto, app);
        }
        app.push_str(&auto.postamble);
        app.push_str("};\n\n");
    }

    fn append_definitions(&self, app: &mut ProgramAppender) {
        if !self.definitions.is_empty() {
            app.push_str("\n");
            app.push_nodes(&self.definitions);
            app.push_str("\n");
        }
    }

    fn program_host(&self, name: &str, entry: &str, args: &[DocNode]) -> Element {
        let mut host = Element::new(name).with_child(Element::new("entry").with_text(entry));
        for arg in args {
            host.push(Element::new("compilerargs").with_child(arg.clone()));
        }
        for map in &self.variable_maps {
            host.push(map.clone());
        }
        host
    }

    fn vertex_program(&self, auto: &AutoSemantics) -> Element {
        let mut app = ProgramAppender::default();
        self.append_definitions(&mut app);
        self.append_v2f_struct(auto, &mut app);

        app.push_str("struct VertexInput\n{\n  void dummy() {}\n");
        for s in &self.snippets {
            for n in &s.vertex_in {
                self.append_program_input(n, &mut app);
            }
        }
        app.push_str("};\n\n");

        app.push_str("vertex2fragment vertexMain (VertexInput vertexIn)\n{\n");
        app.push_str("  vertex2fragment vertexToFragment;\n");
        app.push_str(&self.globals);
        for s in &self.snippets {
            if s.has_vertex_code() {
                if !s.annotation.is_empty() {
                    app.push_str(&make_comment(&s.annotation));
                }
                app.push_str("{\n");
                if self.annotate() {
                    app.push_str("// Locally used names for inputs + outputs\n");
                }
                app.push_str(&s.locals);
                self.append_v2f_locals(s, &mut app);
                Self::append_snippet_map(&s.input_maps, &mut app);
                Self::append_snippet_map(&s.attr_input_maps, &mut app);
                app.push_nodes(&s.vertex_body);
                self.append_v2f_vp(s, &mut app);
                Self::append_snippet_map(&s.output_maps, &mut app);
                Self::append_snippet_map(&s.attr_output_maps, &mut app);
                app.push_str("}\n");
            }
            app.push_str(&s.links);
            app.push_str("\n");
        }
        app.push_str("  return vertexToFragment;\n}\n");
        app.finish()
    }

    fn fragment_program(&self, auto: &AutoSemantics) -> Element {
        let mut app = ProgramAppender::default();
        for s in &self.snippets {
            self.append_v2f_head(s, &mut app);
        }
        self.append_definitions(&mut app);
        self.append_v2f_struct(auto, &mut app);

        app.push_str("struct FragmentInput\n{\n  void dummy() {}\n");
        for s in &self.snippets {
            for n in &s.fragment_in {
                self.append_program_input(n, &mut app);
            }
        }
        app.push_str("};\n\n");

        app.push_str("struct FragmentOutput\n{\n");
        app.push_str("  float4 color0 : COLOR0;\n  float depth : DEPTH;\n};\n\n");
        app.push_str(
            "FragmentOutput fragmentMain (vertex2fragment vertexToFragment, FragmentInput fragmentIn)\n{\n",
        );
        app.push_str(&self.globals);
        for s in &self.snippets {
            if s.has_fragment_code() {
                if !s.annotation.is_empty() {
                    app.push_str(&make_comment(&s.annotation));
                }
                app.push_str("{\n");
                if self.annotate() {
                    app.push_str("// Locally used names for inputs + outputs\n");
                }
                app.push_str(&s.locals);
                self.append_v2f_locals(s, &mut app);
                Self::append_snippet_map(&s.input_maps, &mut app);
                Self::append_snippet_map(&s.attr_input_maps, &mut app);
                self.append_v2f_fp(s, &mut app);
                app.push_nodes(&s.fragment_body);
                Self::append_snippet_map(&s.output_maps, &mut app);
                Self::append_snippet_map(&s.attr_output_maps, &mut app);
                app.push_str("}\n");
            }
            app.push_str(&s.links);
            app.push_str("\n");
        }
        if self.annotate() {
            app.push_str("  // Fragment program output\n");
        }
        app.push_str("  FragmentOutput OUT;\n");
        for assign in &self.output_assign {
            app.push_str(assign);
        }
        app.push_str("  return OUT;\n}\n");
        app.finish()
    }
}

impl Combiner for CgCombiner {
    fn begin_snippet(&mut self, annotation: &str) {
        self.current.annotation = annotation.to_string();
    }

    fn add_input(&mut self, name: &str, ty: &str) {
        self.declare_local("Input", name, ty);
    }

    fn add_input_value(&mut self, name: &str, ty: &str, value: &str) {
        if !self.declare_local("Input", name, ty) {
            let expr = format!("{} ({value})", self.shared.cg_type(ty));
            self.current.input_maps.push((expr, name.to_string()));
        }
    }

    fn add_output(&mut self, name: &str, ty: &str) {
        self.declare_local("Output", name, ty);
    }

    fn input_rename(&mut self, from: &str, to: &str) {
        self.current
            .input_maps
            .push((from.to_string(), to.to_string()));
    }

    fn output_rename(&mut self, from: &str, to: &str) {
        self.current
            .output_maps
            .push((from.to_string(), to.to_string()));
    }

    fn propagate_attributes(&mut self, from_input: &str, to_output: &str) {
        let Some(dst) = map_get(&self.current.output_maps, to_output).map(str::to_string) else {
            return;
        };
        let Some(src) = self
            .current
            .input_maps
            .iter()
            .find(|(_, to)| to == from_input)
            .map(|(from, _)| from.clone())
        else {
            return;
        };
        let Some(src_attrs) = self.attributes.get(&src).cloned() else {
            return;
        };
        self.attributes.insert(dst, src_attrs.clone());
        for attr in &src_attrs {
            self.current.attr_input_maps.push((
                attr_identifier(&src, &attr.name),
                attr_identifier(to_output, &attr.name),
            ));
            self.add_output_attribute(to_output, &attr.name, &attr.ty);
        }
    }

    fn add_output_attribute(&mut self, output: &str, name: &str, ty: &str) {
        let Some(dst) = map_get(&self.current.output_maps, output).map(str::to_string) else {
            return;
        };
        let attrs = self.attributes.entry(dst.clone()).or_default();
        if !attrs.iter().any(|a| a.name == name && a.ty == ty) {
            attrs.push(CgAttribute {
                name: name.to_string(),
                ty: ty.to_string(),
            });
        }
        let out_id = attr_identifier(output, name);
        let out_mapped = attr_identifier(&dst, name);
        self.current
            .attr_output_maps
            .push((out_id.clone(), out_mapped.clone()));

        let cg = self.shared.cg_type(ty);
        if self.annotate() {
            let first_line = self.current.annotation.lines().next().unwrap_or("");
            self.globals
                .push_str(&format!("// Attribute '{ty} {name}' for '{first_line}'\n"));
            self.current
                .locals
                .push_str(&format!("// Attribute '{ty} {name}'\n"));
        }
        self.globals.push_str(&format!("{cg} {out_mapped};\n"));
        self.current.locals.push_str(&format!("{cg} {out_id};\n"));
    }

    fn add_input_attribute(&mut self, input: &str, name: &str, ty: &str, default: &str) {
        let Some(src) = self
            .current
            .input_maps
            .iter()
            .find(|(_, to)| to == input)
            .map(|(from, _)| from.clone())
        else {
            return;
        };
        let out_id = attr_identifier(input, name);
        if self.annotate() {
            self.current
                .locals
                .push_str(&format!("// Attribute '{ty} {name}'\n"));
        }
        let cg = self.shared.cg_type(ty);
        self.current.locals.push_str(&format!("{cg} {out_id};\n"));
        let known = self
            .attributes
            .get(&src)
            .is_some_and(|attrs| attrs.iter().any(|a| a.name == name && a.ty == ty));
        let source = if known {
            attr_identifier(&src, name)
        } else {
            default.to_string()
        };
        self.current.attr_input_maps.push((source, out_id));
    }

    fn link(&mut self, from: &str, to: &str) {
        self.current.links.push_str(&format!("{to} = {from};\n"));
    }

    fn write_block(&mut self, location: &str, block: &Element) {
        let dest = match location {
            "variablemap" | "clips" => &mut self.variable_maps,
            "vertexCompilerArgs" => &mut self.vertex_compiler_args,
            "fragmentCompilerArgs" => &mut self.fragment_compiler_args,
            "vertexToFragment" => &mut self.current.vert2frag,
            "vertexMain" => &mut self.current.vertex_body,
            "fragmentMain" => &mut self.current.fragment_body,
            "vertexIn" => &mut self.current.vertex_in,
            "fragmentIn" => &mut self.current.fragment_in,
            "definitions" => &mut self.definitions,
            _ => return,
        };
        dest.extend(block.children.iter().cloned());
    }

    fn end_snippet(&mut self) -> bool {
        let mut maps = Vec::new();
        for node in self.current.vert2frag.iter().filter_map(DocNode::as_element) {
            let Some(name) = node.attr("name") else { continue };
            let (plain, _) = split_off_array_count(name);
            let unique = format!("{plain}_{}", self.unique_counter);
            self.unique_counter += 1;
            maps.push((plain, unique));
        }
        self.current.v2f_maps.extend(maps);
        self.snippets.push(std::mem::take(&mut self.current));
        true
    }

    fn add_global(&mut self, name: &str, ty: &str, annotation: Option<&str>) {
        if self.global_ids.insert(name.to_string()) {
            if let Some(a) = annotation {
                self.globals.push_str(&make_comment(a));
            }
            self.globals
                .push_str(&format!("{} {name};\n", self.shared.cg_type(ty)));
        }
    }

    fn set_output(&mut self, target: OutputTarget, name: &str, annotation: Option<&str>) {
        let field = match target {
            OutputTarget::Color0 => "color0",
            OutputTarget::Depth => "depth",
        };
        let mut assign = annotation.map(make_comment).unwrap_or_default();
        assign.push_str(&format!("OUT.{field} = {name};\n"));
        self.output_assign[target.index()] = assign;
    }

    fn write_to_pass(&mut self, pass: &mut Element) {
        let auto = AutoSemantics::new(&self.snippets);

        let mut cgvp = self.program_host("cgvp", "vertexMain", &self.vertex_compiler_args);
        cgvp.push(self.vertex_program(&auto));
        pass.push(Element::new("vp").with_attr("plugin", "glcg").with_child(cgvp));

        let mut cgfp =
            self.program_host("cgfp", "fragmentMain", &self.fragment_compiler_args);
        cgfp.push(self.fragment_program(&auto));
        pass.push(Element::new("fp").with_attr("plugin", "glcg").with_child(cgfp));
    }

    fn coerce_cost(&self, from: &str, to: &str) -> Option<u32> {
        self.shared.library.cost(from, to)
    }

    fn query_coerce_chain(&self, from: &str, to: &str) -> Vec<CoerceLink> {
        self.shared.chain(from, to)
    }

    fn query_input_tag(&self, location: &str, block: &Element) -> Option<String> {
        let mut result: Option<String> = None;
        let mut accept = |tag: String| -> bool {
            match &result {
                Some(prev) if *prev != tag => false,
                _ => {
                    result = Some(tag);
                    true
                }
            }
        };
        match location {
            "vertexIn" | "fragmentIn" => {
                for node in block.elements() {
                    if node.name != "uniform" && node.name != "varying" {
                        continue;
                    }
                    let Some(binding) = node.attr("binding") else { continue };
                    if !accept(binding.to_string()) {
                        return None;
                    }
                }
            }
            "variablemap" => {
                for node in block.elements_named("variablemap") {
                    if let Some(variable) = node.attr("variable") {
                        if !accept(variable.to_string()) {
                            return None;
                        }
                    } else if matches!(node.attr("type"), Some("expr" | "expression")) {
                        let tag: String = node
                            .children
                            .iter()
                            .filter(|c| !matches!(c, DocNode::Comment { .. }))
                            .map(|c| c.to_string())
                            .collect();
                        if !accept(tag) {
                            return None;
                        }
                    }
                }
            }
            _ => {}
        }
        result
    }
}
