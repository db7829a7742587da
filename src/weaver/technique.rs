use std::sync::Arc;

use crate::doc::Element;

/// Index of a snippet in a [`SnippetTree`](super::snippet::SnippetTree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnippetId(pub usize);

/// Index of a technique. Ids past the snippet tree's own techniques refer to
/// per-pass scratch techniques (passthroughs, coercions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TechniqueId(pub usize);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombinerPlugin {
    /// Local name blocks use as location prefix (`name:location`).
    pub name: String,
    pub class_id: String,
    pub params: Option<Arc<Element>>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub combiner_name: String,
    pub location: String,
    pub node: Arc<Element>,
}

/// What an input falls back to when nothing upstream provides it.
#[derive(Debug, Clone)]
pub enum DefaultKind {
    /// Unresolved input fails the pass.
    None,
    /// Left unassigned.
    Undefined,
    Value(String),
    /// Blocks computing the value.
    Complex(Vec<Block>),
    /// Read from a shader variable.
    ShaderVar(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub ty: String,
    pub default_value: String,
}

#[derive(Debug, Clone)]
pub struct Input {
    pub name: String,
    pub ty: String,
    pub condition: Option<String>,
    pub default: DefaultKind,
    pub private: bool,
    pub no_merge: bool,
    pub attributes: Vec<Attribute>,
    pub node: Arc<Element>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub name: String,
    pub ty: String,
    pub inherit_attr_from: Option<String>,
    pub attributes: Vec<Attribute>,
    /// Produced by a coercion; never picked by plain input matching.
    pub coercion_output: bool,
}

/// Binding of a named output of one contained snippet to a named input of
/// another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitBinding {
    pub from: SnippetId,
    pub output: String,
    pub to: SnippetId,
    pub input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnippetConnection {
    pub from: SnippetId,
    pub to: SnippetId,
}

#[derive(Debug, Clone, Default)]
pub struct CompoundTechnique {
    /// Contained snippets by id, in declaration order.
    pub snippets: Vec<(String, SnippetId)>,
    pub connections: Vec<SnippetConnection>,
    pub explicit: Vec<ExplicitBinding>,
}

impl CompoundTechnique {
    pub fn snippet(&self, id: &str) -> Option<SnippetId> {
        self.snippets
            .iter()
            .find(|(name, _)| name == id)
            .map(|(_, s)| *s)
    }
}

#[derive(Debug, Clone)]
pub enum TechniqueKind {
    Atom {
        /// Content hash; equal ids mean interchangeable code.
        id: String,
        blocks: Vec<Block>,
    },
    Compound(CompoundTechnique),
}

#[derive(Debug, Clone)]
pub struct Technique {
    /// `None` for synthesized techniques (passthroughs, coercions).
    pub owner: Option<SnippetId>,
    pub snippet_name: String,
    pub priority: i32,
    pub outer_condition: Option<String>,
    pub combiner: CombinerPlugin,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kind: TechniqueKind,
}

impl Technique {
    pub fn atom_id(&self) -> Option<&str> {
        match &self.kind {
            TechniqueKind::Atom { id, .. } => Some(id),
            TechniqueKind::Compound(_) => None,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        match &self.kind {
            TechniqueKind::Atom { blocks, .. } => blocks,
            TechniqueKind::Compound(_) => &[],
        }
    }

    pub fn as_compound(&self) -> Option<&CompoundTechnique> {
        match &self.kind {
            TechniqueKind::Compound(c) => Some(c),
            TechniqueKind::Atom { .. } => None,
        }
    }

    pub fn input(&self, name: &str) -> Option<&Input> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&Output> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Atom without code whose outputs copy the same-named inputs.
    pub fn is_passthrough(&self) -> bool {
        self.owner.is_none()
            && matches!(&self.kind, TechniqueKind::Atom { blocks, .. } if blocks.is_empty())
            && !self.outputs.is_empty()
            && self.outputs.iter().all(|o| self.input(&o.name).is_some())
    }
}
