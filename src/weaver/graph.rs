use std::collections::{HashMap, HashSet};

use crate::weaver::technique::TechniqueId;

/// Edge `from -> to`: `to` consumes something of `from`. Weak edges are
/// input links added during synthesis; structural edges come from snippet
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub from: TechniqueId,
    pub to: TechniqueId,
    pub weak: bool,
}

impl Connection {
    pub fn strong(from: TechniqueId, to: TechniqueId) -> Self {
        Self {
            from,
            to,
            weak: false,
        }
    }

    pub fn weak(from: TechniqueId, to: TechniqueId) -> Self {
        Self {
            from,
            to,
            weak: true,
        }
    }
}

/// Output `output` of technique `from`, explicitly bound to some input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitSource {
    pub from: TechniqueId,
    pub output: String,
}

/// Priority of the technique chosen for each snippet number, used to reject
/// graphs that pick different alternatives of the same snippet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnippetTechPriorities {
    priorities: Vec<Option<i32>>,
}

impl SnippetTechPriorities {
    pub fn set(&mut self, snippet: usize, priority: i32) {
        if self.priorities.len() <= snippet {
            self.priorities.resize(snippet + 1, None);
        }
        self.priorities[snippet] = Some(priority);
    }

    pub fn get(&self, snippet: usize) -> Option<i32> {
        self.priorities.get(snippet).copied().flatten()
    }

    pub fn conflicts_with(&self, other: &SnippetTechPriorities) -> bool {
        self.priorities
            .iter()
            .zip(&other.priorities)
            .any(|(a, b)| matches!((a, b), (Some(a), Some(b)) if a != b))
    }

    pub fn merge(&mut self, other: &SnippetTechPriorities) {
        for (snippet, p) in other.priorities.iter().enumerate() {
            if let Some(p) = p {
                self.set(snippet, *p);
            }
        }
    }
}

/// One combination of technique choices and the dependencies between them.
/// Techniques are referenced by id; the graph owns none of them.
#[derive(Debug, Clone, Default)]
pub struct TechniqueGraph {
    techniques: Vec<TechniqueId>,
    connections: Vec<Connection>,
    in_techniques: Vec<TechniqueId>,
    out_techniques: Vec<TechniqueId>,
    explicit: HashMap<TechniqueId, HashMap<String, Vec<ExplicitSource>>>,
    priorities: SnippetTechPriorities,
}

impl TechniqueGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn techniques(&self) -> &[TechniqueId] {
        &self.techniques
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Techniques nothing feeds into.
    pub fn input_techniques(&self) -> &[TechniqueId] {
        &self.in_techniques
    }

    /// Techniques feeding into nothing.
    pub fn output_techniques(&self) -> &[TechniqueId] {
        &self.out_techniques
    }

    pub fn contains(&self, tech: TechniqueId) -> bool {
        self.techniques.contains(&tech)
    }

    pub fn priorities(&self) -> &SnippetTechPriorities {
        &self.priorities
    }

    pub fn priorities_mut(&mut self) -> &mut SnippetTechPriorities {
        &mut self.priorities
    }

    pub fn add_technique(&mut self, tech: TechniqueId) {
        if self.contains(tech) {
            return;
        }
        self.techniques.push(tech);
        self.in_techniques.push(tech);
        self.out_techniques.push(tech);
    }

    pub fn remove_technique(&mut self, tech: TechniqueId) {
        self.techniques.retain(|t| *t != tech);
        self.connections.retain(|c| c.from != tech && c.to != tech);
        self.explicit.remove(&tech);
        for inputs in self.explicit.values_mut() {
            for sources in inputs.values_mut() {
                sources.retain(|s| s.from != tech);
            }
        }
        self.refresh_ends();
    }

    /// Adding an existing edge again only upgrades a weak edge to a strong one.
    pub fn add_connection(&mut self, conn: Connection) {
        if let Some(existing) = self
            .connections
            .iter_mut()
            .find(|c| c.from == conn.from && c.to == conn.to)
        {
            existing.weak &= conn.weak;
            return;
        }
        self.connections.push(conn);
        self.in_techniques.retain(|t| *t != conn.to);
        self.out_techniques.retain(|t| *t != conn.from);
    }

    pub fn remove_connection(&mut self, from: TechniqueId, to: TechniqueId) {
        self.connections.retain(|c| !(c.from == from && c.to == to));
        self.refresh_ends();
    }

    fn refresh_ends(&mut self) {
        let connections = &self.connections;
        self.in_techniques = self
            .techniques
            .iter()
            .copied()
            .filter(|t| !connections.iter().any(|c| c.to == *t))
            .collect();
        self.out_techniques = self
            .techniques
            .iter()
            .copied()
            .filter(|t| !connections.iter().any(|c| c.from == *t))
            .collect();
    }

    pub fn merge(&mut self, other: &TechniqueGraph) {
        for t in &other.techniques {
            self.add_technique(*t);
        }
        for c in &other.connections {
            self.add_connection(*c);
        }
        for (to, inputs) in &other.explicit {
            for (input, sources) in inputs {
                for source in sources {
                    self.add_explicit(*to, input, source.clone());
                }
            }
        }
        self.priorities.merge(&other.priorities);
    }

    /// Direct dependencies of `tech`, without duplicates.
    pub fn dependencies(&self, tech: TechniqueId, strong_only: bool) -> Vec<TechniqueId> {
        let mut deps = Vec::new();
        for c in &self.connections {
            if c.to == tech && (!strong_only || !c.weak) && !deps.contains(&c.from) {
                deps.push(c.from);
            }
        }
        deps
    }

    /// Direct dependants of `tech`, without duplicates.
    pub fn dependants(&self, tech: TechniqueId, strong_only: bool) -> Vec<TechniqueId> {
        let mut deps = Vec::new();
        for c in &self.connections {
            if c.from == tech && (!strong_only || !c.weak) && !deps.contains(&c.to) {
                deps.push(c.to);
            }
        }
        deps
    }

    /// Whether `dependant` transitively depends on `dep`.
    pub fn is_dependency_of(&self, dep: TechniqueId, dependant: TechniqueId) -> bool {
        let mut visited: HashSet<TechniqueId> = HashSet::new();
        let mut stack = vec![dependant];
        while let Some(t) = stack.pop() {
            if !visited.insert(t) {
                continue;
            }
            for c in &self.connections {
                if c.to == t {
                    if c.from == dep {
                        return true;
                    }
                    stack.push(c.from);
                }
            }
        }
        false
    }

    pub fn add_explicit(&mut self, to: TechniqueId, input: &str, source: ExplicitSource) {
        let sources = self
            .explicit
            .entry(to)
            .or_default()
            .entry(input.to_string())
            .or_default();
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    pub fn explicit_sources(&self, to: TechniqueId, input: &str) -> &[ExplicitSource] {
        self.explicit
            .get(&to)
            .and_then(|inputs| inputs.get(input))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Replaces `from` by `to` in every connection and explicit binding, then
    /// drops `from`.
    pub fn switch_techs(&mut self, from: TechniqueId, to: TechniqueId) {
        if from == to {
            return;
        }
        let old = std::mem::take(&mut self.connections);
        for mut c in old {
            if c.from == from {
                c.from = to;
            }
            if c.to == from {
                c.to = to;
            }
            if c.from == c.to {
                continue;
            }
            match self
                .connections
                .iter_mut()
                .find(|e| e.from == c.from && e.to == c.to)
            {
                Some(existing) => existing.weak &= c.weak,
                None => self.connections.push(c),
            }
        }
        if let Some(inputs) = self.explicit.remove(&from) {
            for (input, sources) in inputs {
                for source in sources {
                    self.add_explicit(to, &input, source);
                }
            }
        }
        for inputs in self.explicit.values_mut() {
            for sources in inputs.values_mut() {
                for s in sources.iter_mut() {
                    if s.from == from {
                        s.from = to;
                    }
                }
            }
        }
        self.add_technique(to);
        self.remove_technique(from);
    }
}
