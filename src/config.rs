use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WeaverConfig {
    /// Write comments describing snippets and link decisions into the
    /// generated programs.
    pub annotate_combined: bool,
    pub verbose: bool,
    pub threaded_synthesis: bool,
    /// 0 picks the available parallelism.
    pub worker_threads: usize,
    pub synthesis_budget_ms: Option<u64>,
    /// Coercion library for the Cg combiner; the bundled one when unset.
    pub coercion_library: Option<PathBuf>,
}

impl Default for WeaverConfig {
    fn default() -> Self {
        Self {
            annotate_combined: false,
            verbose: false,
            threaded_synthesis: true,
            worker_threads: 0,
            synthesis_budget_ms: None,
            coercion_library: None,
        }
    }
}

impl WeaverConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read weaver config at {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse weaver config {}", path.display()))
    }

    pub fn worker_count(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: WeaverConfig = serde_json::from_str(r#"{"annotateCombined": true}"#)
            .unwrap_or_else(|e| panic!("config parse failed: {e}"));
        assert!(cfg.annotate_combined);
        assert!(cfg.threaded_synthesis);
        assert_eq!(cfg.synthesis_budget_ms, None);
    }

    #[test]
    fn explicit_worker_count_wins() {
        let cfg = WeaverConfig {
            worker_threads: 3,
            ..Default::default()
        };
        assert_eq!(cfg.worker_count(), 3);
    }
}
