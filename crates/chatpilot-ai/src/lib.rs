//! chatpilot-ai: structured-generation model backend
//!
//! This crate wraps the generative-language API used by chatpilot. Requests carry a
//! free-text prompt plus a target response schema and come back as parsed JSON.

pub mod error;
pub mod models;
pub mod providers;
pub mod types;

pub use error::{Error, Result};
pub use providers::StructuredProvider;
pub use types::*;
