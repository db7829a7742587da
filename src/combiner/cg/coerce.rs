use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};

use crate::doc::{Element, fingerprint, load_document_from_path, parse_document, select_root};
use crate::types::{Semantics, Space, TypeTable};

const BUNDLED_LIBRARY_JSON: &str = include_str!("../../../assets/cg-coercions.json");

/// A library technique turning a value of type `from` into type `to`.
#[derive(Debug, Clone)]
pub struct CoerceRule {
    pub from: String,
    pub to: String,
    pub cost: u32,
    pub node: Arc<Element>,
}

/// Coercion rules keyed by source type.
#[derive(Debug, Clone, Default)]
pub struct CoercionLibrary {
    rules: HashMap<String, Vec<CoerceRule>>,
    checksum: String,
}

/// Cheaper first; on equal cost, destinations with semantics, then with a
/// space, come first.
fn rule_order(types: &TypeTable, a: &CoerceRule, b: &CoerceRule) -> Ordering {
    a.cost.cmp(&b.cost).then_with(|| {
        let (Some(ta), Some(tb)) = (types.query_type_info(&a.to), types.query_type_info(&b.to))
        else {
            return Ordering::Equal;
        };
        let has_sem = |s: Semantics| s != Semantics::None;
        let has_space = |s: Space| s != Space::None;
        has_sem(tb.semantics)
            .cmp(&has_sem(ta.semantics))
            .then_with(|| has_space(tb.space).cmp(&has_space(ta.space)))
    })
}

impl CoercionLibrary {
    pub fn bundled(types: &TypeTable) -> Result<Self> {
        let doc = parse_document(BUNDLED_LIBRARY_JSON).context("bundled coercion library")?;
        Self::from_document(&doc, types)
    }

    pub fn from_path(path: impl AsRef<Path>, types: &TypeTable) -> Result<Self> {
        let path = path.as_ref();
        let doc = load_document_from_path(path)?;
        Self::from_document(&doc, types)
            .with_context(|| format!("invalid coercion library {}", path.display()))
    }

    pub fn from_document(doc: &Element, types: &TypeTable) -> Result<Self> {
        let root = select_root(doc, "combinerlibrary")
            .ok_or_else(|| anyhow!("expected 'combinerlibrary' node"))?;
        let mut library = Self {
            rules: HashMap::new(),
            checksum: fingerprint(&root.flatten()),
        };
        let mut templates: HashMap<&str, &Element> = HashMap::new();
        for child in root.elements() {
            match child.name.as_str() {
                "coercion" => library.add_rule(child.clone(), types)?,
                "coerciontemplate" => {
                    let name = child
                        .attr("name")
                        .ok_or_else(|| anyhow!("coercion template needs a non-empty 'name'"))?;
                    templates.insert(name, child);
                }
                other => bail!("unexpected '{other}' node in coercion library"),
            }
        }
        library.synthesize_defaults(&templates, types)?;
        Ok(library)
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    fn add_rule(&mut self, mut node: Element, types: &TypeTable) -> Result<()> {
        let from = node
            .attr("from")
            .ok_or_else(|| anyhow!("coercion needs a non-empty 'from' attribute"))?
            .to_string();
        let to = node
            .attr("to")
            .ok_or_else(|| anyhow!("coercion needs a non-empty 'to' attribute"))?
            .to_string();
        let cost = if node.attrs.contains_key("cost") {
            node.attr_int("cost").max(0) as u32
        } else {
            log::warn!("coercion {from} -> {to} has no 'cost' attribute, assuming 0");
            0
        };
        node.push(
            Element::new("input")
                .with_attr("name", "input")
                .with_attr("type", from.as_str()),
        );
        node.push(
            Element::new("output")
                .with_attr("name", "output")
                .with_attr("type", to.as_str())
                .with_attr("inheritattr", "input"),
        );
        let rule = CoerceRule {
            from: from.clone(),
            to,
            cost,
            node: Arc::new(node),
        };
        let list = self.rules.entry(from).or_default();
        let pos = list
            .iter()
            .position(|r| rule_order(types, &rule, r) == Ordering::Less)
            .unwrap_or(list.len());
        list.insert(pos, rule);
        Ok(())
    }

    /// Direction types get normalize/denormalize rules, spaced types a
    /// passthrough to their space-less variant.
    fn synthesize_defaults(
        &mut self,
        templates: &HashMap<&str, &Element>,
        types: &TypeTable,
    ) -> Result<()> {
        let normalize = *templates
            .get("normalize")
            .ok_or_else(|| anyhow!("no 'normalize' coercion template"))?;
        let passthrough = *templates
            .get("passthrough")
            .ok_or_else(|| anyhow!("no 'passthrough' coercion template"))?;

        let mut generated = Vec::new();
        for (name, info) in types.iter() {
            let mut target = *info;
            let template = if info.semantics == Semantics::Direction {
                target.unit = !info.unit;
                if info.unit { passthrough } else { normalize }
            } else if info.space != Space::None {
                target.space = Space::None;
                passthrough
            } else {
                continue;
            };
            let Some(target_name) = types.query_type(&target) else {
                continue;
            };
            let mut node = Element::new("coercion");
            node.children = template.children.clone();
            node.set_attr("from", name);
            node.set_attr("to", target_name);
            generated.push(node);
        }
        for node in generated {
            self.add_rule(node, types)?;
        }
        Ok(())
    }

    /// Cheapest chain of rules turning `from` into `to`; empty when there is
    /// none. Each type is visited at most once.
    pub fn find_chain<'a>(&'a self, from: &'a str, to: &'a str) -> Vec<&'a CoerceRule> {
        if from == to {
            return Vec::new();
        }
        let mut best: HashMap<&str, u32> = HashMap::new();
        let mut via: HashMap<&str, &CoerceRule> = HashMap::new();
        let mut settled: HashSet<&str> = HashSet::new();
        let mut queue = BinaryHeap::new();
        let mut seq = 0u64;
        best.insert(from, 0);
        queue.push(Reverse((0u32, seq, from)));

        while let Some(Reverse((cost, _, ty))) = queue.pop() {
            if !settled.insert(ty) {
                continue;
            }
            if ty == to {
                let mut chain = Vec::new();
                let mut cur = to;
                while cur != from {
                    let Some(&rule) = via.get(cur) else { break };
                    chain.push(rule);
                    cur = rule.from.as_str();
                }
                chain.reverse();
                return chain;
            }
            let Some(rules) = self.rules.get(ty) else {
                continue;
            };
            for rule in rules {
                let next = rule.to.as_str();
                if settled.contains(next) {
                    continue;
                }
                let total = cost.saturating_add(rule.cost);
                let better = match best.get(next) {
                    Some(&known) => total < known,
                    None => true,
                };
                if better {
                    best.insert(next, total);
                    via.insert(next, rule);
                    seq += 1;
                    queue.push(Reverse((total, seq, next)));
                }
            }
        }
        Vec::new()
    }

    pub fn cost(&self, from: &str, to: &str) -> Option<u32> {
        let chain = self.find_chain(from, to);
        if chain.is_empty() {
            return None;
        }
        Some(chain.iter().map(|r| r.cost).sum())
    }
}
