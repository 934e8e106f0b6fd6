//! Scripted surface and model backend for tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatpilot_ai::{Model, StructuredProvider, StructuredRequest};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::message::{Observation, Profile};
use crate::surface::{ChatSurface, SessionDriver};

/// Something the surface was asked to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Text(String),
    Special,
}

/// What a scripted surface saw, shared with the test after the surface is boxed
#[derive(Debug, Default)]
pub struct SurfaceLog {
    pub opened: Option<String>,
    pub profile_requests: Vec<String>,
    pub deliveries: Vec<Delivery>,
    pub reads: usize,
    pub closed: bool,
}

enum Script {
    /// Each read takes the next observation; the last one sticks
    Sequence(VecDeque<Observation>),
    /// Each delivery reveals the next reply; reads show the latest revealed reply
    Replies {
        pending: VecDeque<Observation>,
        current: Observation,
    },
}

pub struct ScriptedSurface {
    script: Script,
    profile: Profile,
    failing_reads: usize,
    fail_sends: bool,
    fail_profile: bool,
    log: Arc<Mutex<SurfaceLog>>,
}

impl ScriptedSurface {
    pub fn sequence(observations: Vec<Observation>) -> Self {
        Self::with_script(Script::Sequence(observations.into()))
    }

    pub fn replies(replies: Vec<Observation>) -> Self {
        Self::with_script(Script::Replies {
            pending: replies.into(),
            current: Observation::default(),
        })
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            profile: Profile::new("Maria", "27", "Loves cats"),
            failing_reads: 0,
            fail_sends: false,
            fail_profile: false,
            log: Arc::new(Mutex::new(SurfaceLog::default())),
        }
    }

    pub fn fail_next_reads(&mut self, count: usize) {
        self.failing_reads = count;
    }

    pub fn failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    pub fn failing_profile(mut self) -> Self {
        self.fail_profile = true;
        self
    }

    pub fn log(&self) -> Arc<Mutex<SurfaceLog>> {
        self.log.clone()
    }

    pub fn reads(&self) -> usize {
        self.log.lock().reads
    }

    fn deliver(&mut self, delivery: Delivery) -> Result<()> {
        if self.fail_sends {
            return Err(Error::surface("send button not found"));
        }
        self.log.lock().deliveries.push(delivery);
        if let Script::Replies { pending, current } = &mut self.script {
            if let Some(next) = pending.pop_front() {
                *current = next;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChatSurface for ScriptedSurface {
    async fn fetch_profile(&mut self, counterpart_id: &str) -> Result<Profile> {
        self.log.lock().profile_requests.push(counterpart_id.to_string());
        if self.fail_profile {
            return Err(Error::surface("profile page did not load"));
        }
        Ok(self.profile.clone())
    }

    async fn open_conversation(&mut self, conversation_id: &str) -> Result<()> {
        self.log.lock().opened = Some(conversation_id.to_string());
        Ok(())
    }

    async fn read_latest(&mut self) -> Result<Observation> {
        self.log.lock().reads += 1;
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(Error::surface("message element missing"));
        }
        Ok(match &mut self.script {
            Script::Sequence(observations) => {
                if observations.len() > 1 {
                    observations.pop_front().unwrap_or_default()
                } else {
                    observations.front().cloned().unwrap_or_default()
                }
            }
            Script::Replies { current, .. } => current.clone(),
        })
    }

    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.deliver(Delivery::Text(text.to_string()))
    }

    async fn send_special(&mut self) -> Result<()> {
        self.deliver(Delivery::Special)
    }

    async fn close(&mut self) -> Result<()> {
        self.log.lock().closed = true;
        Ok(())
    }
}

/// Hands out one prepared surface
pub struct ScriptedDriver {
    surface: Mutex<Option<ScriptedSurface>>,
    on_open: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ScriptedDriver {
    pub fn new(surface: ScriptedSurface) -> Self {
        Self {
            surface: Mutex::new(Some(surface)),
            on_open: None,
        }
    }

    /// A driver whose browser never comes up
    pub fn unavailable() -> Self {
        Self {
            surface: Mutex::new(None),
            on_open: None,
        }
    }

    /// Run `hook` while the browser is starting
    pub fn on_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl SessionDriver for ScriptedDriver {
    async fn open(&self) -> Result<Box<dyn ChatSurface>> {
        if let Some(hook) = &self.on_open {
            hook();
        }
        match self.surface.lock().take() {
            Some(surface) => Ok(Box::new(surface)),
            None => Err(Error::surface("browser failed to start")),
        }
    }
}

/// Model backend that replays canned answers and records every request
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<chatpilot_ai::Result<serde_json::Value>>>,
    requests: Mutex<Vec<StructuredRequest>>,
    latency: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<chatpilot_ai::Result<serde_json::Value>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<StructuredRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl StructuredProvider for ScriptedProvider {
    async fn generate_structured(
        &self,
        _model: &Model,
        request: &StructuredRequest,
    ) -> chatpilot_ai::Result<serde_json::Value> {
        self.requests.lock().push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Err(chatpilot_ai::Error::UnexpectedResponse(
                "script exhausted".to_string(),
            ))
        })
    }
}
