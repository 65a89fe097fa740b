//! Context engine module - turns retrieval results into prompt context

pub mod context_builder;

pub use context_builder::{ContextAssembler, ContextAssemblerConfig};
