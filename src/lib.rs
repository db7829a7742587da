//! Shader weaver: composes shader snippets into complete vertex/fragment
//! programs.

pub mod combiner;
pub mod config;
pub mod doc;
pub mod report;
pub mod types;
pub mod weaver;

pub use config::WeaverConfig;
pub use weaver::WeaverCompiler;
