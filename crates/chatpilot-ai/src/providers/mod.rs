//! Model provider implementations

pub mod google;

use crate::{Error, Model, Result, StructuredRequest};
use async_trait::async_trait;

/// Trait for backends that answer with JSON constrained to a schema
#[async_trait]
pub trait StructuredProvider: Send + Sync {
    /// Run one generation and return the parsed JSON response
    async fn generate_structured(
        &self,
        model: &Model,
        request: &StructuredRequest,
    ) -> Result<serde_json::Value>;
}

/// Get an API key from a provided value or the first environment variable that is set
pub fn get_api_key(provided: Option<&str>, env_vars: &[&str]) -> Result<String> {
    if let Some(key) = provided.filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }

    env_vars
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .ok_or(Error::InvalidApiKey)
}
