//! Response generation: one structured model call per turn, wrapped in retry with backoff

use std::sync::Arc;
use std::time::Duration;

use chatpilot_ai::{GenerationConfig, Model, StructuredProvider, StructuredRequest};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::TurnEvent;
use crate::history::ConversationHistory;
use crate::message::{OutboundAction, Profile};

/// Instruction sent ahead of every prompt unless configured otherwise
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are chatting on a dating site on behalf of the user \
described below. Stay in character as that user, answer the partner's latest message naturally \
and briefly, and keep the conversation going. When a heartfelt gesture fits better than words, \
set sendSpecial to true instead of writing text.";

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of model calls before giving up
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay after a given failed attempt (0-indexed), never above `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Everything the generator needs besides the backend itself
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub system_prompt: String,
    pub generation: GenerationConfig,
    pub retry: RetryConfig,
    /// Upper bound on a single model call (`None` waits as long as the backend does)
    pub request_timeout: Option<Duration>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            generation: GenerationConfig::default(),
            retry: RetryConfig::default(),
            request_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Produces the next [`OutboundAction`] from the latest inbound message
pub struct ResponseGenerator {
    provider: Arc<dyn StructuredProvider>,
    model: Model,
    config: GeneratorConfig,
    validator: Option<jsonschema::Validator>,
    events: Option<broadcast::Sender<TurnEvent>>,
}

impl ResponseGenerator {
    pub fn new(provider: Arc<dyn StructuredProvider>, model: Model, config: GeneratorConfig) -> Self {
        let validator = match jsonschema::validator_for(&OutboundAction::response_schema()) {
            Ok(validator) => Some(validator),
            Err(e) => {
                tracing::warn!("Invalid response schema, skipping validation: {}", e);
                None
            }
        };

        Self {
            provider,
            model,
            config,
            validator,
            events: None,
        }
    }

    /// Forward retry notifications to a controller's event channel
    pub fn set_event_sender(&mut self, events: broadcast::Sender<TurnEvent>) {
        self.events = Some(events);
    }

    /// Generate the next action.
    ///
    /// `inbound_text` is appended to `history` as a user entry before the first call. On
    /// success the action is appended as a model entry. Fails with
    /// [`Error::RetriesExhausted`] once every attempt has failed, leaving only the user entry.
    pub async fn generate(
        &self,
        history: &mut ConversationHistory,
        inbound_text: &str,
        user: &Profile,
        partner: &Profile,
        has_image: bool,
        cancel: &CancellationToken,
    ) -> Result<OutboundAction> {
        history.push_user(inbound_text);

        let request = StructuredRequest::new(
            build_prompt(history, inbound_text, user, partner, has_image),
            OutboundAction::response_schema(),
        )
        .with_system(self.config.system_prompt.clone())
        .with_config(self.config.generation.clone());

        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;

        let action = loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = self.attempt(&request) => result,
            };

            match result {
                Ok(action) => break action,
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(attempts = attempt, "Model call failed, giving up: {}", e);
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = retry.delay_for_attempt(attempt - 1);
                    tracing::warn!(
                        "Model call failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt,
                        max_attempts,
                        delay,
                        e
                    );
                    if let Some(events) = &self.events {
                        let _ = events.send(TurnEvent::RetryScheduled {
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                            error: e.to_string(),
                        });
                    }

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        history.push_model(action.history_content());
        Ok(action)
    }

    /// One model call, bounded by the request timeout and checked against the schema
    async fn attempt(&self, request: &StructuredRequest) -> Result<OutboundAction> {
        let call = self.provider.generate_structured(&self.model, request);
        let value = match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| Error::RequestTimeout(limit))??,
            None => call.await?,
        };

        if let Some(validator) = &self.validator {
            if let Some(message) = validate_response(&value, validator) {
                return Err(Error::InvalidResponse(message));
            }
        }

        let action: OutboundAction = serde_json::from_value(value)
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        if !action.send_special && action.text.as_deref().unwrap_or("").is_empty() {
            return Err(Error::InvalidResponse(
                "text is empty and sendSpecial is false".to_string(),
            ));
        }

        Ok(action)
    }
}

/// Returns `Some(error_message)` if the model's answer does not match the schema
fn validate_response(value: &serde_json::Value, validator: &jsonschema::Validator) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}

fn build_prompt(
    history: &ConversationHistory,
    inbound_text: &str,
    user: &Profile,
    partner: &Profile,
    has_image: bool,
) -> String {
    let schema = serde_json::to_string_pretty(&OutboundAction::response_schema())
        .unwrap_or_default();

    format!(
        "User information: {}\n\
         Partner information: {}\n\
         Chat history: {}\n\
         Partner's message: {}\n\
         Photo: {}\n\n\
         Return the answer as JSON matching this schema:\n{}",
        serde_json::to_string(user).unwrap_or_default(),
        serde_json::to_string(partner).unwrap_or_default(),
        history.to_json(),
        inbound_text,
        has_image,
        schema
    )
}
