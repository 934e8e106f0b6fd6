//! Core types for structured model requests

use serde::{Deserialize, Serialize};

/// Model definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Model identifier (e.g., "gemini-2.0-flash")
    pub id: String,
    /// Base URL for API calls
    pub base_url: String,
}

/// Harm categories the backend can filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmCategory {
    HarmCategoryHarassment,
    HarmCategoryHateSpeech,
    HarmCategorySexuallyExplicit,
    HarmCategoryDangerousContent,
}

impl HarmCategory {
    /// Every category the backend accepts a threshold for
    pub const ALL: [HarmCategory; 4] = [
        HarmCategory::HarmCategoryHarassment,
        HarmCategory::HarmCategoryHateSpeech,
        HarmCategory::HarmCategorySexuallyExplicit,
        HarmCategory::HarmCategoryDangerousContent,
    ];
}

/// Blocking threshold for a harm category; chatpilot only ever turns filtering off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmBlockThreshold {
    #[default]
    BlockNone,
}

/// A single content-filter setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: HarmBlockThreshold,
}

impl SafetySetting {
    /// Permissive settings: nothing is blocked in any category
    pub fn permissive() -> Vec<SafetySetting> {
        HarmCategory::ALL
            .iter()
            .map(|&category| SafetySetting {
                category,
                threshold: HarmBlockThreshold::BlockNone,
            })
            .collect()
    }
}

/// Sampling and filtering parameters for a generation call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Temperature (0.0 - 2.0)
    pub temperature: f32,
    /// Nucleus sampling bound
    pub top_p: f32,
    /// Top-k sampling bound
    pub top_k: u32,
    /// Maximum tokens to generate
    pub max_output_tokens: u32,
    /// Content-filter thresholds
    pub safety_settings: Vec<SafetySetting>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            top_p: 1.0,
            top_k: 1,
            max_output_tokens: 2048,
            safety_settings: SafetySetting::permissive(),
        }
    }
}

/// A structured generation request: prompt in, JSON matching `response_schema` out
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    /// System instruction sent alongside the prompt
    pub system_instruction: Option<String>,
    /// Free-text prompt
    pub prompt: String,
    /// Schema the response must conform to
    pub response_schema: serde_json::Value,
    /// Generation parameters
    pub config: GenerationConfig,
}

impl StructuredRequest {
    /// Create a request with default generation parameters
    pub fn new(prompt: impl Into<String>, response_schema: serde_json::Value) -> Self {
        Self {
            system_instruction: None,
            prompt: prompt.into(),
            response_schema,
            config: GenerationConfig::default(),
        }
    }

    /// Set the system instruction
    pub fn with_system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Set generation parameters
    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }
}
