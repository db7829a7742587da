//! The shader weaver: parses snippet documents into technique graphs, picks
//! combinations and hands them to combiners for code generation.

use std::sync::Arc;

use crate::combiner::CombinerRegistry;
use crate::config::WeaverConfig;
use crate::doc::DocumentSource;
use crate::report::Reporter;
use crate::types::TypeTable;

pub mod builder;
pub mod graph;
pub mod node_tree;
pub mod shader;
pub mod snippet;
pub mod synth;
pub mod technique;

/// Shared services for compiling shaders. Immutable apart from the
/// reporter and the combiner registry cache, so one instance can serve
/// concurrent compilations.
pub struct WeaverCompiler {
    config: WeaverConfig,
    types: Arc<TypeTable>,
    combiners: Arc<CombinerRegistry>,
    documents: Arc<dyn DocumentSource>,
    reporter: Arc<Reporter>,
}

impl WeaverCompiler {
    /// Compiler with the built-in type table and the Cg backend.
    pub fn new(config: WeaverConfig, documents: Arc<dyn DocumentSource>) -> Self {
        let types = Arc::new(TypeTable::builtin());
        let combiners = Arc::new(CombinerRegistry::with_builtin(
            types.clone(),
            config.annotate_combined,
            config.coercion_library.clone(),
        ));
        Self::with_parts(config, types, combiners, documents, Arc::new(Reporter::new()))
    }

    pub fn with_parts(
        config: WeaverConfig,
        types: Arc<TypeTable>,
        combiners: Arc<CombinerRegistry>,
        documents: Arc<dyn DocumentSource>,
        reporter: Arc<Reporter>,
    ) -> Self {
        Self {
            config,
            types,
            combiners,
            documents,
            reporter,
        }
    }

    pub fn config(&self) -> &WeaverConfig {
        &self.config
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn combiners(&self) -> &CombinerRegistry {
        &self.combiners
    }

    pub fn documents(&self) -> &dyn DocumentSource {
        self.documents.as_ref()
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub(crate) fn annotate(&self) -> bool {
        self.config.annotate_combined
    }
}
