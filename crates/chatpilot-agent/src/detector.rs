//! Change detection: poll the surface until a genuinely new message shows up

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::message::{InboundMessage, Observation};
use crate::surface::ChatSurface;
use crate::transcript::{TranscriptEntry, TranscriptStore};

/// Polling cadence and staleness bound
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Pause before each read of the surface
    pub poll_interval: Duration,
    /// Give up when nothing new appears for this long (`None` waits forever)
    pub staleness_timeout: Option<Duration>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1500),
            staleness_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Outcome of comparing one observation against the last accepted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Empty, or the same (text, timestamp) pair as before
    NotUpdated,
    /// A message to act on
    New(InboundMessage),
}

/// Decide whether `observation` is a new message relative to `previous`.
///
/// New means non-empty text and a different (text, displayed timestamp) pair. The image is
/// reported only when its URL differs from the previous accepted URL.
pub fn evaluate(previous: &InboundMessage, observation: &Observation) -> Detection {
    let text = match observation.text.as_deref() {
        Some(text) if !text.is_empty() => text,
        _ => return Detection::NotUpdated,
    };

    if previous.text.as_deref() == Some(text)
        && previous.displayed_timestamp == observation.displayed_timestamp
    {
        return Detection::NotUpdated;
    }

    let has_image = observation.image_url.is_some() && observation.image_url != previous.image_url;

    Detection::New(InboundMessage {
        text: Some(text.to_string()),
        displayed_timestamp: observation.displayed_timestamp.clone(),
        has_image,
        image_url: observation.image_url.clone(),
    })
}

/// Polls a surface and records each accepted message
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    config: DetectorConfig,
}

impl ChangeDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Wait for the next message after `previous`.
    ///
    /// The accepted message is appended to the transcript as a `chat` entry before it is
    /// returned. Read failures count as "not updated".
    pub async fn observe_next(
        &self,
        surface: &mut dyn ChatSurface,
        previous: &InboundMessage,
        conversation_id: &str,
        transcript: &dyn TranscriptStore,
        cancel: &CancellationToken,
    ) -> Result<InboundMessage> {
        let started = Instant::now();
        let mut polls = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            polls += 1;

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                read = surface.read_latest() => read,
            };

            match read {
                Ok(observation) => {
                    if let Detection::New(message) = evaluate(previous, &observation) {
                        transcript.append(conversation_id, &TranscriptEntry::inbound(&message))?;
                        tracing::debug!(polls, "accepted new message");
                        return Ok(message);
                    }
                }
                Err(e) => tracing::debug!(polls, "surface read failed, treating as not updated: {}", e),
            }

            if let Some(limit) = self.config.staleness_timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(Error::PollingTimeout { waited, polls });
                }
            }
        }
    }
}
