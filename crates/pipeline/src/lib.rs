//! The answer pipeline: a fixed chain of processors that turns one user
//! question into a stream of progress events, answer tokens, and content
//! blocks.
//!
//! Entry point: [`chat::ChatService::stream_answer`].

pub mod blocks;
pub mod chat;
pub mod context;
pub mod processor;
pub mod processors;
pub mod rerank;
pub mod retrieval;
pub mod rewrite;
pub mod spans;

pub use chat::{AnswerInput, ChatService, Collaborators};
pub use context::RequestContext;
