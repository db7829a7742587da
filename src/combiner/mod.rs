//! Code emission backends.
//!
//! A [`CombinerLoader`] is the per-backend service (coercion knowledge, input
//! block generators); a [`Combiner`] is the per-pass emitter it creates.
//! Loaders are resolved by class id through the [`CombinerRegistry`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Result, anyhow};

use crate::doc::Element;
use crate::types::TypeTable;

pub mod cg;
pub mod default;

pub use default::DefaultCombiner;

/// Render target an output is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputTarget {
    Color0,
    Depth,
}

impl OutputTarget {
    pub const ALL: [OutputTarget; 2] = [OutputTarget::Color0, OutputTarget::Depth];

    pub fn index(self) -> usize {
        match self {
            OutputTarget::Color0 => 0,
            OutputTarget::Depth => 1,
        }
    }
}

/// One step of a coercion chain. `node` is a library technique converting
/// `from_type` into `to_type`.
#[derive(Debug, Clone)]
pub struct CoerceLink {
    pub from_type: String,
    pub to_type: String,
    pub cost: u32,
    pub node: Arc<Element>,
}

/// Per-pass code emitter. Calls arrive bracketed per technique by
/// `begin_snippet` / `end_snippet`; `write_to_pass` is called once at the end.
pub trait Combiner {
    fn begin_snippet(&mut self, annotation: &str);
    fn add_input(&mut self, name: &str, ty: &str);
    fn add_input_value(&mut self, name: &str, ty: &str, value: &str);
    fn add_output(&mut self, name: &str, ty: &str);
    /// Binds global `from` to the snippet-local input `to`.
    fn input_rename(&mut self, from: &str, to: &str);
    /// Binds the snippet-local output `from` to global `to`.
    fn output_rename(&mut self, from: &str, to: &str);
    fn propagate_attributes(&mut self, _from_input: &str, _to_output: &str) {}
    fn add_input_attribute(&mut self, _input: &str, _name: &str, _ty: &str, _default: &str) {}
    fn add_output_attribute(&mut self, _output: &str, _name: &str, _ty: &str) {}
    /// Copies global `from` into global `to`.
    fn link(&mut self, from: &str, to: &str);
    fn write_block(&mut self, location: &str, block: &Element);
    fn end_snippet(&mut self) -> bool;
    fn add_global(&mut self, name: &str, ty: &str, annotation: Option<&str>);
    fn set_output(&mut self, target: OutputTarget, name: &str, annotation: Option<&str>);
    fn write_to_pass(&mut self, pass: &mut Element);

    /// `None` when `from` cannot be coerced into `to`.
    fn coerce_cost(&self, _from: &str, _to: &str) -> Option<u32> {
        None
    }
    fn query_coerce_chain(&self, _from: &str, _to: &str) -> Vec<CoerceLink> {
        Vec::new()
    }
    fn compatible_params(&self, _params: Option<&Element>) -> bool {
        true
    }
    /// Tag identifying what a default-input block reads, used to merge
    /// inputs reading the same thing. `None` when unknown or ambiguous.
    fn query_input_tag(&self, location: &str, block: &Element) -> Option<String>;
}

pub trait CombinerLoader: Send + Sync {
    fn class_id(&self) -> &str;
    /// Fingerprint of everything the generated code depends on besides the
    /// shader source (coercion library contents).
    fn code_string(&self) -> String;
    fn create_combiner(&self, params: Option<&Element>) -> Result<Box<dyn Combiner>>;
    fn coerce_cost(&self, from: &str, to: &str) -> Option<u32>;
    fn query_coerce_chain(&self, from: &str, to: &str) -> Vec<CoerceLink>;

    /// Appends blocks to `technique` that make output `output_name` a constant.
    fn generate_constant_input_blocks(
        &self,
        technique: &mut Element,
        location_prefix: &str,
        value: [f32; 4],
        used_components: usize,
        output_name: &str,
    );
    /// Appends blocks that read shader variable `sv_name` into `output_name`.
    fn generate_sv_input_blocks(
        &self,
        technique: &mut Element,
        location_prefix: &str,
        sv_name: &str,
        output_type: &str,
        output_name: &str,
        unique_tag: &str,
    );
    /// Appends blocks that read vertex buffer `buffer_name` into `output_name`.
    fn generate_buffer_input_blocks(
        &self,
        technique: &mut Element,
        location_prefix: &str,
        buffer_name: &str,
        output_type: &str,
        output_name: &str,
        unique_tag: &str,
    );
}

pub type LoaderFactory = Box<dyn Fn() -> Result<Arc<dyn CombinerLoader>> + Send + Sync>;

/// Class id -> loader. Loaders are created on first use and shared afterwards.
#[derive(Default)]
pub struct CombinerRegistry {
    factories: HashMap<String, LoaderFactory>,
    loaded: RwLock<HashMap<String, Arc<dyn CombinerLoader>>>,
}

impl CombinerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry knowing the Cg backend.
    pub fn with_builtin(
        types: Arc<TypeTable>,
        annotate: bool,
        coercion_library: Option<PathBuf>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register_factory(
            cg::CG_COMBINER_CLASS,
            Box::new(move || {
                let library = match &coercion_library {
                    Some(path) => cg::CoercionLibrary::from_path(path, &types)?,
                    None => cg::CoercionLibrary::bundled(&types)?,
                };
                let loader: Arc<dyn CombinerLoader> =
                    Arc::new(cg::CgCombinerLoader::new(types.clone(), library, annotate));
                Ok(loader)
            }),
        );
        registry
    }

    pub fn register_factory(&mut self, class_id: impl Into<String>, factory: LoaderFactory) {
        self.factories.insert(class_id.into(), factory);
    }

    /// Registers an already constructed loader under its class id.
    pub fn insert(&self, loader: Arc<dyn CombinerLoader>) -> Result<()> {
        let mut loaded = self
            .loaded
            .write()
            .map_err(|_| anyhow!("combiner registry lock poisoned"))?;
        loaded.insert(loader.class_id().to_string(), loader);
        Ok(())
    }

    pub fn load(&self, class_id: &str) -> Result<Arc<dyn CombinerLoader>> {
        {
            let loaded = self
                .loaded
                .read()
                .map_err(|_| anyhow!("combiner registry lock poisoned"))?;
            if let Some(loader) = loaded.get(class_id) {
                return Ok(loader.clone());
            }
        }
        let mut loaded = self
            .loaded
            .write()
            .map_err(|_| anyhow!("combiner registry lock poisoned"))?;
        if let Some(loader) = loaded.get(class_id) {
            return Ok(loader.clone());
        }
        let factory = self
            .factories
            .get(class_id)
            .ok_or_else(|| anyhow!("no combiner loader registered for class '{class_id}'"))?;
        let loader = factory()?;
        log::debug!("loaded combiner '{class_id}'");
        loaded.insert(class_id.to_string(), loader.clone());
        Ok(loader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_cg_once() {
        let registry = CombinerRegistry::with_builtin(Arc::new(TypeTable::builtin()), false, None);
        let a = registry
            .load(cg::CG_COMBINER_CLASS)
            .unwrap_or_else(|e| panic!("cg load failed: {e:#}"));
        let b = registry
            .load(cg::CG_COMBINER_CLASS)
            .unwrap_or_else(|e| panic!("cg load failed: {e:#}"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.code_string().is_empty());
    }

    #[test]
    fn unknown_class_fails() {
        let registry = CombinerRegistry::new();
        let err = match registry.load("nope") {
            Ok(_) => panic!("unexpected loader"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("nope"));
    }
}
