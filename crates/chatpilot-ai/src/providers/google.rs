//! Google Generative AI (Gemini) API provider

use crate::{
    error::{Error, Result},
    providers::StructuredProvider,
    types::{Model, SafetySetting, StructuredRequest},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Environment variables checked for an API key, in order
pub const API_KEY_ENV_VARS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];

/// Google Generative AI client
pub struct GoogleProvider {
    client: reqwest::Client,
    api_key: String,
}

impl GoogleProvider {
    /// Create a new Google provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }

    fn build_request<'a>(&self, request: &'a StructuredRequest) -> GeminiRequest<'a> {
        let system_instruction = request
            .system_instruction
            .as_ref()
            .map(|instruction| GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: instruction.clone(),
                }],
            });

        GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: request.prompt.clone(),
                }],
            }],
            system_instruction,
            generation_config: GeminiGenerationConfig {
                temperature: request.config.temperature,
                top_p: request.config.top_p,
                top_k: request.config.top_k,
                max_output_tokens: request.config.max_output_tokens,
                response_mime_type: "application/json",
                response_schema: &request.response_schema,
            },
            safety_settings: &request.config.safety_settings,
        }
    }
}

#[async_trait]
impl StructuredProvider for GoogleProvider {
    async fn generate_structured(
        &self,
        model: &Model,
        request: &StructuredRequest,
    ) -> Result<serde_json::Value> {
        let body = self.build_request(request);
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            model.base_url, model.id, self.api_key
        );

        tracing::debug!(model = %model.id, prompt_len = request.prompt.len(), "generateContent");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(Error::RateLimited { retry_after });
        }

        let text = response.text().await?;
        if !status.is_success() {
            return Err(parse_error_body(status, &text));
        }

        let parsed: GeminiResponse = serde_json::from_str(&text)?;
        extract_json(parsed)
    }
}

fn parse_error_body(status: reqwest::StatusCode, body: &str) -> Error {
    match serde_json::from_str::<GeminiErrorResponse>(body) {
        Ok(err) => Error::api(
            err.error.status.unwrap_or_else(|| status.as_u16().to_string()),
            err.error.message,
        ),
        Err(_) => Error::api(status.as_u16().to_string(), body.to_string()),
    }
}

/// Pull the JSON payload out of the first candidate
fn extract_json(response: GeminiResponse) -> Result<serde_json::Value> {
    if let Some(reason) = response
        .prompt_feedback
        .and_then(|feedback| feedback.block_reason)
    {
        return Err(Error::Blocked(reason));
    }

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::UnexpectedResponse("no candidates in response".to_string()))?;

    let text: String = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(match candidate.finish_reason.as_deref() {
            Some(reason @ ("SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST")) => {
                Error::Blocked(reason.to_string())
            }
            reason => Error::UnexpectedResponse(format!(
                "empty candidate (finish reason: {})",
                reason.unwrap_or("none")
            )),
        });
    }

    Ok(serde_json::from_str(strip_code_fence(&text))?)
}

/// Models occasionally wrap JSON in a markdown fence even in JSON mode
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

// Request types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig<'a>,
    safety_settings: &'a [SafetySetting],
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig<'a> {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
    response_mime_type: &'static str,
    response_schema: &'a serde_json::Value,
}

// Response types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
    status: Option<String>,
}
