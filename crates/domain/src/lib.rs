//! Shared domain types for the Sluice answer pipeline: the progress-event
//! protocol, retrieved-item model, provider stream types, configuration,
//! and the common error type.

pub mod config;
pub mod error;
pub mod event;
pub mod item;
pub mod stream;

pub use error::{Error, Result};
