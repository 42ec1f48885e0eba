//! Collaborator interfaces consumed by the answer pipeline, plus their REST
//! adapters and the in-memory store implementations used by the CLI and the
//! test suites.
//!
//! The pipeline core depends only on the traits in [`traits`]; everything
//! else here is an adapter.

pub mod embedding;
pub mod llm;
pub mod rerank;
pub mod search;
pub mod stores;
pub mod traits;

pub use traits::*;
