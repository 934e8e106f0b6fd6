//! Turn controller: deliver, wait for a reply, generate, repeat

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::detector::ChangeDetector;
use crate::error::{Error, Result};
use crate::events::{TurnEvent, TurnState};
use crate::generator::ResponseGenerator;
use crate::history::ConversationHistory;
use crate::message::{InboundMessage, OutboundAction, Profile};
use crate::surface::{ChatSurface, SessionDriver};
use crate::transcript::{TranscriptEntry, TranscriptStore, validate_conversation_id};

/// Fixed inputs shared by every run
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// First message sent in every conversation
    pub start_message: String,
    /// The simulated user's own profile
    pub user_profile: Profile,
    /// Pause after opening the conversation before the first delivery
    pub settle_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            start_message: "Hi! How are you?".to_string(),
            user_profile: Profile::default(),
            settle_delay: Duration::from_secs(5),
        }
    }
}

/// Per-run parameters chosen by the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParams {
    pub iterations: u32,
    pub conversation_id: String,
    pub counterpart_id: String,
}

/// What a successful run leaves behind
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub conversation_id: String,
    pub turns_completed: u32,
    pub history: ConversationHistory,
    pub partner: Profile,
    pub last_message: InboundMessage,
}

/// Outcome of [`TurnController::execute`]
#[derive(Debug)]
pub struct RunReport {
    pub conversation_id: String,
    pub outcome: Result<RunSummary>,
    /// Human-readable transcript, if it could be rendered
    pub formatted_transcript: Option<String>,
}

/// Drives one conversation at a time through a fixed number of turns
pub struct TurnController {
    detector: ChangeDetector,
    generator: ResponseGenerator,
    transcript: Arc<dyn TranscriptStore>,
    config: ControllerConfig,
    event_tx: broadcast::Sender<TurnEvent>,
    state: TurnState,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl TurnController {
    pub fn new(
        detector: ChangeDetector,
        mut generator: ResponseGenerator,
        transcript: Arc<dyn TranscriptStore>,
        config: ControllerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        generator.set_event_sender(event_tx.clone());

        Self {
            detector,
            generator,
            transcript,
            config,
            event_tx,
            state: TurnState::Idle,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Get a handle to cancel the current run from outside
    pub fn cancel_handle(&self) -> Arc<Mutex<CancellationToken>> {
        Arc::clone(&self.cancel)
    }

    /// Install a fresh token for the next run and return it
    fn reset_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    fn emit(&self, event: TurnEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&mut self, turn: u32, state: TurnState) {
        tracing::debug!(turn, ?state, "state change");
        self.state = state;
        self.emit(TurnEvent::StateChanged { turn, state });
    }

    /// Run the turn loop on an already-open surface.
    ///
    /// The opening message is delivered first, then each of `iterations` turns waits for a
    /// reply and generates the next action, which is delivered before the next wait. Any
    /// error aborts the run; transcript entries already written stay written.
    pub async fn run(
        &mut self,
        params: &RunParams,
        surface: &mut dyn ChatSurface,
    ) -> Result<RunSummary> {
        let cancel = self.reset_cancel();
        self.run_with(params, surface, cancel).await
    }

    async fn run_with(
        &mut self,
        params: &RunParams,
        surface: &mut dyn ChatSurface,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "run",
            run_id = %run_id,
            conversation = %params.conversation_id
        );

        let result = self
            .run_turns(run_id, params, surface, &cancel)
            .instrument(span.clone())
            .await;

        let _guard = span.enter();
        match &result {
            Ok(summary) => {
                self.set_state(summary.turns_completed, TurnState::Finished);
                self.emit(TurnEvent::RunEnd {
                    turns_completed: summary.turns_completed,
                });
                tracing::info!(turns = summary.turns_completed, "run finished");
            }
            Err(e) => {
                self.state = TurnState::Failed;
                self.emit(TurnEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_turns(
        &mut self,
        run_id: String,
        params: &RunParams,
        surface: &mut dyn ChatSurface,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        validate_conversation_id(&params.conversation_id)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let conversation_id = params.conversation_id.as_str();

        tracing::info!(iterations = params.iterations, "run started");
        self.emit(TurnEvent::RunStart {
            run_id: run_id.clone(),
            conversation_id: conversation_id.to_string(),
            iterations: params.iterations,
        });

        let partner = surface.fetch_profile(&params.counterpart_id).await?;
        tracing::info!(partner = %partner, "profile loaded");
        self.emit(TurnEvent::ProfileLoaded {
            profile: partner.clone(),
        });

        surface.open_conversation(conversation_id).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(self.config.settle_delay) => {}
        }

        let mut history = ConversationHistory::seeded(self.config.start_message.clone());
        let mut action = OutboundAction::text(self.config.start_message.clone());
        let mut last_message = InboundMessage::default();
        let mut turns_completed = 0;

        for turn in 1..=params.iterations {
            self.set_state(turn, TurnState::AwaitingDelivery);
            self.deliver(turn, &action, conversation_id, surface, cancel)
                .await?;

            self.set_state(turn, TurnState::AwaitingReply);
            last_message = self
                .detector
                .observe_next(
                    surface,
                    &last_message,
                    conversation_id,
                    self.transcript.as_ref(),
                    cancel,
                )
                .await?;
            tracing::info!(turn, has_image = last_message.has_image, "message received");
            self.emit(TurnEvent::MessageReceived {
                turn,
                message: last_message.clone(),
            });

            self.set_state(turn, TurnState::Generating);
            action = self
                .generator
                .generate(
                    &mut history,
                    last_message.text(),
                    &self.config.user_profile,
                    &partner,
                    last_message.has_image,
                    cancel,
                )
                .await?;

            turns_completed = turn;
            self.emit(TurnEvent::TurnEnd { turn });
        }

        // The last generated action still goes out
        if params.iterations > 0 {
            self.set_state(params.iterations, TurnState::AwaitingDelivery);
            self.deliver(params.iterations, &action, conversation_id, surface, cancel)
                .await?;
        }

        Ok(RunSummary {
            run_id,
            conversation_id: conversation_id.to_string(),
            turns_completed,
            history,
            partner,
            last_message,
        })
    }

    /// Perform an action on the surface, then record it
    async fn deliver(
        &self,
        turn: u32,
        action: &OutboundAction,
        conversation_id: &str,
        surface: &mut dyn ChatSurface,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match action.delivered_text() {
            Some(text) => surface.send_text(text).await?,
            None => surface.send_special().await?,
        }
        self.transcript
            .append(conversation_id, &TranscriptEntry::outbound(action))?;

        tracing::info!(turn, special = action.send_special, "action delivered");
        self.emit(TurnEvent::ActionDelivered {
            turn,
            action: action.clone(),
        });
        Ok(())
    }

    /// Open a surface, run, and clean up on every exit path.
    ///
    /// The surface is always closed and the formatted transcript is always rendered,
    /// whether the run succeeded or not. Cancelling while the browser starts aborts the run.
    pub async fn execute(&mut self, driver: &dyn SessionDriver, params: &RunParams) -> RunReport {
        let cancel = self.reset_cancel();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            opened = driver.open() => opened,
        };

        let outcome = match opened {
            Ok(mut surface) => {
                let outcome = self.run_with(params, surface.as_mut(), cancel).await;
                if let Err(e) = surface.close().await {
                    tracing::warn!("Failed to close surface: {}", e);
                }
                outcome
            }
            Err(e) => {
                self.state = TurnState::Failed;
                self.emit(TurnEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        };

        if let Err(e) = &outcome {
            if e.is_cancelled() {
                tracing::warn!(conversation = %params.conversation_id, "run cancelled");
            } else {
                tracing::error!(conversation = %params.conversation_id, "run failed: {}", e);
            }
        }

        let formatted_transcript = match self.transcript.flush_formatted(&params.conversation_id) {
            Ok(formatted) => Some(formatted),
            Err(e) => {
                tracing::warn!("Failed to write formatted transcript: {}", e);
                None
            }
        };

        RunReport {
            conversation_id: params.conversation_id.clone(),
            outcome,
            formatted_transcript,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorConfig;
    use crate::generator::GeneratorConfig;
    use crate::history::Role;
    use crate::message::Observation;
    use crate::testing::{Delivery, ScriptedDriver, ScriptedProvider, ScriptedSurface};
    use crate::transcript::{MemoryTranscriptStore, Sender};
    use serde_json::json;

    fn controller(
        provider: Arc<ScriptedProvider>,
        transcript: Arc<MemoryTranscriptStore>,
    ) -> TurnController {
        let generator = ResponseGenerator::new(
            provider,
            chatpilot_ai::models::resolve_model("gemini-2.0-flash"),
            GeneratorConfig::default(),
        );
        TurnController::new(
            ChangeDetector::new(DetectorConfig::default()),
            generator,
            transcript,
            ControllerConfig {
                start_message: "Hey, nice profile!".to_string(),
                user_profile: Profile::new("Alex", "29", "Hiking and coffee"),
                settle_delay: Duration::from_secs(5),
            },
        )
    }

    fn params(iterations: u32) -> RunParams {
        RunParams {
            iterations,
            conversation_id: "c1".to_string(),
            counterpart_id: "p42".to_string(),
        }
    }

    fn reply(text: &str) -> chatpilot_ai::Result<serde_json::Value> {
        Ok(json!({"text": text, "sendSpecial": false}))
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_iteration_run_transcript() {
        let provider = Arc::new(ScriptedProvider::new(vec![reply("hello"), reply("see ya")]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider, transcript.clone());
        let mut surface = ScriptedSurface::replies(vec![
            Observation::text("hi", "10:00"),
            Observation::text("bye", "10:01"),
        ]);
        let log = surface.log();

        let summary = controller.run(&params(2), &mut surface).await.unwrap();

        let entries = transcript.entries("c1").unwrap();
        let seen: Vec<_> = entries
            .iter()
            .map(|e| (e.sender, e.text.clone().unwrap_or_default()))
            .collect();
        assert_eq!(
            seen,
            [
                (Sender::User, "Hey, nice profile!".to_string()),
                (Sender::Chat, "hi".to_string()),
                (Sender::User, "hello".to_string()),
                (Sender::Chat, "bye".to_string()),
                (Sender::User, "see ya".to_string()),
            ]
        );

        assert_eq!(summary.turns_completed, 2);
        assert_eq!(summary.partner.name, "Maria");
        assert_eq!(controller.state(), TurnState::Finished);

        let log = log.lock();
        assert_eq!(log.opened.as_deref(), Some("c1"));
        assert_eq!(log.profile_requests, ["p42"]);
        assert_eq!(
            log.deliveries,
            [
                Delivery::Text("Hey, nice profile!".into()),
                Delivery::Text("hello".into()),
                Delivery::Text("see ya".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_grows_two_per_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            reply("one"),
            reply("two"),
            reply("three"),
        ]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider, transcript);
        let mut surface = ScriptedSurface::replies(vec![
            Observation::text("a", "10:00"),
            Observation::text("b", "10:01"),
            Observation::text("c", "10:02"),
        ]);

        let summary = controller.run(&params(3), &mut surface).await.unwrap();

        let roles: Vec<Role> = summary.history.entries().iter().map(|e| e.role).collect();
        assert_eq!(summary.history.len(), 2 * 3 + 1);
        assert_eq!(
            roles,
            [
                Role::Model,
                Role::User,
                Role::Model,
                Role::User,
                Role::Model,
                Role::User,
                Role::Model,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_special_send_is_delivered_and_logged() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(
            json!({"text": "", "sendSpecial": true}),
        )]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider, transcript.clone());
        let mut surface = ScriptedSurface::replies(vec![
            Observation::text("look", "10:00").with_image("https://cdn/x.jpg"),
        ]);
        let log = surface.log();

        controller.run(&params(1), &mut surface).await.unwrap();

        let entries = transcript.entries("c1").unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].image.as_deref(), Some("https://cdn/x.jpg"));
        assert_eq!(entries[2].text, None);
        assert_eq!(entries[2].send_star, Some(true));
        assert_eq!(log.lock().deliveries.last(), Some(&Delivery::Special));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_failure_aborts_and_keeps_entries() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider, transcript.clone());
        let mut events = controller.subscribe();
        let mut surface = ScriptedSurface::replies(vec![Observation::text("hi", "10:00")]);

        let err = controller.run(&params(2), &mut surface).await.unwrap_err();

        assert!(matches!(err, Error::RetriesExhausted { attempts: 7, .. }));
        assert_eq!(controller.state(), TurnState::Failed);
        assert_eq!(transcript.entries("c1").unwrap().len(), 2);

        let mut retries = 0;
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            match event {
                TurnEvent::RetryScheduled { .. } => retries += 1,
                TurnEvent::Error { .. } => saw_error = true,
                _ => {}
            }
        }
        assert_eq!(retries, 6);
        assert!(saw_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_conversation_id_rejected_before_surface_use() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider, transcript);
        let mut surface = ScriptedSurface::replies(vec![]);
        let log = surface.log();

        let mut bad = params(1);
        bad.conversation_id = "../etc".to_string();
        let err = controller.run(&bad, &mut surface).await.unwrap_err();

        assert!(matches!(err, Error::InvalidConversationId(_)));
        assert!(log.lock().profile_requests.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_waiting_for_reply() {
        let provider = Arc::new(ScriptedProvider::new(vec![reply("hello")]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider, transcript.clone());
        let cancel = controller.cancel_handle();
        let mut surface = ScriptedSurface::replies(vec![]);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            cancel.lock().cancel();
        });

        let err = controller.run(&params(1), &mut surface).await.unwrap_err();
        assert!(err.is_cancelled());
        // The opening message was already persisted
        assert_eq!(transcript.entries("c1").unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_closes_surface_and_flushes_on_failure() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider, transcript.clone());
        let surface = ScriptedSurface::replies(vec![]).failing_sends();
        let log = surface.log();
        let driver = ScriptedDriver::new(surface);

        let report = controller.execute(&driver, &params(1)).await;

        assert!(matches!(report.outcome, Err(Error::Surface(_))));
        assert!(log.lock().closed);
        assert_eq!(report.formatted_transcript.as_deref(), Some(""));
        assert_eq!(transcript.formatted("c1").as_deref(), Some(""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_success_renders_transcript() {
        let provider = Arc::new(ScriptedProvider::new(vec![reply("hello")]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider, transcript);
        let surface = ScriptedSurface::replies(vec![Observation::text("hi", "10:00")]);
        let log = surface.log();
        let driver = ScriptedDriver::new(surface);

        let report = controller.execute(&driver, &params(1)).await;

        let summary = report.outcome.unwrap();
        assert_eq!(summary.turns_completed, 1);
        assert!(log.lock().closed);
        let formatted = report.formatted_transcript.unwrap();
        assert_eq!(formatted.lines().count(), 3);
        assert!(formatted.lines().next().unwrap().starts_with("🤖 User: Hey, nice profile!"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_reports_driver_failure() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider, transcript);

        let report = controller
            .execute(&ScriptedDriver::unavailable(), &params(1))
            .await;

        assert!(report.outcome.is_err());
        assert_eq!(controller.state(), TurnState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_browser_starts_aborts_run() {
        let provider = Arc::new(ScriptedProvider::new(vec![reply("hello")]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider.clone(), transcript.clone());
        let cancel = controller.cancel_handle();
        let surface = ScriptedSurface::replies(vec![Observation::text("hi", "10:00")]);
        let log = surface.log();
        let driver = ScriptedDriver::new(surface).on_open(move || cancel.lock().cancel());

        let report = controller.execute(&driver, &params(1)).await;

        assert!(report.outcome.unwrap_err().is_cancelled());
        assert!(transcript.entries("c1").unwrap().is_empty());
        assert_eq!(provider.calls(), 0);
        let log = log.lock();
        assert!(log.profile_requests.is_empty());
        assert!(log.closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_execute_is_cleared() {
        let provider = Arc::new(ScriptedProvider::new(vec![reply("hello")]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider, transcript);
        controller.cancel_handle().lock().cancel();
        let driver = ScriptedDriver::new(ScriptedSurface::replies(vec![Observation::text(
            "hi", "10:00",
        )]));

        let report = controller.execute(&driver, &params(1)).await;

        assert_eq!(report.outcome.unwrap().turns_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_failure_aborts_before_delivery() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let transcript = Arc::new(MemoryTranscriptStore::new());
        let mut controller = controller(provider, transcript.clone());
        let mut surface = ScriptedSurface::replies(vec![]).failing_profile();
        let log = surface.log();

        assert!(controller.run(&params(1), &mut surface).await.is_err());
        assert!(log.lock().deliveries.is_empty());
        assert!(transcript.entries("c1").unwrap().is_empty());
    }
}
