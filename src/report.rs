use std::fmt;
use std::sync::Mutex;

use crate::doc::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Bug,
    Error,
    Warning,
    Notify,
    Debug,
}

impl Severity {
    fn log_level(self) -> log::Level {
        match self {
            Severity::Bug | Severity::Error => log::Level::Error,
            Severity::Warning => log::Level::Warn,
            Severity::Notify => log::Level::Info,
            Severity::Debug => log::Level::Debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Short description of the document node the message is about.
    pub context: Option<String>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "{:?}: {} (at {})", self.severity, self.message, ctx),
            None => write!(f, "{:?}: {}", self.severity, self.message),
        }
    }
}

/// Collects diagnostics raised while parsing and synthesizing. Shared between
/// synthesis workers, so reporting only needs `&self`.
#[derive(Debug, Default)]
pub struct Reporter {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

fn describe(node: &Element) -> String {
    match node.attr("id").or_else(|| node.attr("name")) {
        Some(id) => format!("<{} \"{}\">", node.name, id),
        None => format!("<{}>", node.name),
    }
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, severity: Severity, message: impl Into<String>) {
        self.push(Diagnostic {
            severity,
            message: message.into(),
            context: None,
        });
    }

    pub fn report_at(&self, severity: Severity, node: &Element, message: impl Into<String>) {
        self.push(Diagnostic {
            severity,
            message: message.into(),
            context: Some(describe(node)),
        });
    }

    pub fn warn_at(&self, node: &Element, message: impl Into<String>) {
        self.report_at(Severity::Warning, node, message);
    }

    fn push(&self, diagnostic: Diagnostic) {
        log::log!(diagnostic.severity.log_level(), "{diagnostic}");
        self.diagnostics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(diagnostic);
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    pub fn has_errors(&self) -> bool {
        self.count(Severity::Error) + self.count(Severity::Bug) > 0
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.diagnostics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|d| d.message.contains(needle))
    }
}
