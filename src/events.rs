use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::agent::FailureCause;
use crate::protocol::Operation;
use crate::session::ActionLogEntry;

/// Everything an observer (dashboard, CLI, test) can see of running sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OperatorEvent {
    Log {
        session_id: String,
        entry: ActionLogEntry,
    },
    SessionStarted {
        session_id: String,
        objective: String,
        model: String,
    },
    /// Terminal event for a stopped session.
    SessionStopped {
        session_id: String,
    },
    AgentThinking {
        session_id: String,
        loop_index: u32,
        status: String,
    },
    LlmResponse {
        session_id: String,
        loop_index: u32,
        operations: Vec<Operation>,
    },
    ActionExecuted {
        session_id: String,
        kind: String,
        details: Value,
        thought: Option<String>,
    },
    /// Terminal event for a completed objective.
    ObjectiveComplete {
        session_id: String,
        summary: String,
        total_reward: i64,
    },
    /// Terminal event for an exhausted loop budget.
    MaxLoopsReached {
        session_id: String,
        loops: u32,
        total_reward: i64,
    },
    /// Terminal event for a failed session.
    Error {
        session_id: String,
        cause: FailureCause,
        message: String,
        remediation: Option<String>,
    },
    FeedbackReceived {
        session_id: String,
        action_index: usize,
        success: bool,
        reward: i64,
        total_reward: i64,
    },
}

impl OperatorEvent {
    pub fn session_id(&self) -> &str {
        match self {
            OperatorEvent::Log { session_id, .. }
            | OperatorEvent::SessionStarted { session_id, .. }
            | OperatorEvent::SessionStopped { session_id }
            | OperatorEvent::AgentThinking { session_id, .. }
            | OperatorEvent::LlmResponse { session_id, .. }
            | OperatorEvent::ActionExecuted { session_id, .. }
            | OperatorEvent::ObjectiveComplete { session_id, .. }
            | OperatorEvent::MaxLoopsReached { session_id, .. }
            | OperatorEvent::Error { session_id, .. }
            | OperatorEvent::FeedbackReceived { session_id, .. } => session_id,
        }
    }

    /// Wire name, as found in the serialized `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            OperatorEvent::Log { .. } => "log",
            OperatorEvent::SessionStarted { .. } => "session_started",
            OperatorEvent::SessionStopped { .. } => "session_stopped",
            OperatorEvent::AgentThinking { .. } => "agent_thinking",
            OperatorEvent::LlmResponse { .. } => "llm_response",
            OperatorEvent::ActionExecuted { .. } => "action_executed",
            OperatorEvent::ObjectiveComplete { .. } => "objective_complete",
            OperatorEvent::MaxLoopsReached { .. } => "max_loops_reached",
            OperatorEvent::Error { .. } => "error",
            OperatorEvent::FeedbackReceived { .. } => "feedback_received",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperatorEvent::SessionStopped { .. }
                | OperatorEvent::ObjectiveComplete { .. }
                | OperatorEvent::MaxLoopsReached { .. }
                | OperatorEvent::Error { .. }
        )
    }
}

/// At-most-once fan-out; late subscribers see nothing that was sent before they joined.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OperatorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: OperatorEvent) {
        if self.sender.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperatorEvent> {
        self.sender.subscribe()
    }
}
