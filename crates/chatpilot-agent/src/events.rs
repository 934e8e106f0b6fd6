//! Turn controller event types

use serde::{Deserialize, Serialize};

use crate::message::{InboundMessage, OutboundAction, Profile};

/// Where the controller is within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    AwaitingDelivery,
    AwaitingReply,
    Generating,
    Finished,
    Failed,
}

/// Events emitted while a run progresses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// A run started
    RunStart {
        run_id: String,
        conversation_id: String,
        iterations: u32,
    },

    /// The counterpart's profile was read
    ProfileLoaded { profile: Profile },

    /// The controller moved to a new state
    StateChanged { turn: u32, state: TurnState },

    /// An action was delivered to the surface
    ActionDelivered { turn: u32, action: OutboundAction },

    /// A new message was accepted from the surface
    MessageReceived { turn: u32, message: InboundMessage },

    /// A model call failed and will be retried
    RetryScheduled {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A turn completed
    TurnEnd { turn: u32 },

    /// The run finished all its turns
    RunEnd { turns_completed: u32 },

    /// The run was aborted
    Error { message: String },
}
