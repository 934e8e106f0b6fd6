//! Model registry with public lookup API.

use crate::Model;

/// Default endpoint for the Generative Language API
pub const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Model used when nothing else is configured
pub const DEFAULT_MODEL_ID: &str = "gemini-2.0-flash";

/// Models known to support schema-constrained JSON output
const KNOWN_MODELS: &[&str] = &[
    "gemini-2.0-flash",
    "gemini-2.0-flash-lite",
    "gemini-2.5-flash",
    "gemini-2.5-pro",
];

fn model(id: &str) -> Model {
    Model {
        id: id.to_string(),
        base_url: GOOGLE_BASE_URL.to_string(),
    }
}

/// Look up a model by ID.
pub fn get_model_by_id(id: &str) -> Option<Model> {
    KNOWN_MODELS.iter().find(|&&known| known == id).map(|id| model(id))
}

/// Resolve a model ID, constructing an entry for IDs the registry doesn't know.
pub fn resolve_model(id: &str) -> Model {
    get_model_by_id(id).unwrap_or_else(|| {
        tracing::debug!(model = id, "model not in registry, using it as given");
        model(id)
    })
}
