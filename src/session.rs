use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::events::{EventBus, OperatorEvent};

pub const DONE_REWARD: i64 = 20;
pub const MAX_LOOPS_PENALTY: i64 = -5;
pub const ERROR_PENALTY: i64 = -10;
pub const FEEDBACK_SUCCESS_REWARD: i64 = 10;
pub const FEEDBACK_FAILURE_PENALTY: i64 = -5;
pub const ACTION_FAILURE_PENALTY: i64 = -5;

// ========================= Session =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    MaxLoopsReached,
    Error,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Pending | SessionStatus::Running)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub objective: String,
    pub model: String,
    pub status: SessionStatus,
    pub loop_count: u32,
    pub max_loops: u32,
    pub started_at: DateTime<Utc>,
}

struct Progress {
    status: SessionStatus,
    loop_count: u32,
}

/// One run toward one objective. Only the owning loop task mutates it.
pub struct Session {
    id: String,
    objective: String,
    model: String,
    max_loops: u32,
    started_at: DateTime<Utc>,
    progress: RwLock<Progress>,
    log: ActionLog,
    events: EventBus,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        objective: impl Into<String>,
        model: impl Into<String>,
        max_loops: u32,
        events: EventBus,
    ) -> Self {
        let id = id.into();
        Self {
            log: ActionLog::new(id.clone(), events.clone()),
            events,
            id,
            objective: objective.into(),
            model: model.into(),
            max_loops,
            started_at: Utc::now(),
            progress: RwLock::new(Progress { status: SessionStatus::Pending, loop_count: 0 }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_loops(&self) -> u32 {
        self.max_loops
    }

    pub fn status(&self) -> SessionStatus {
        self.progress.read().status
    }

    pub fn loop_count(&self) -> u32 {
        self.progress.read().loop_count
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let progress = self.progress.read();
        SessionSnapshot {
            id: self.id.clone(),
            objective: self.objective.clone(),
            model: self.model.clone(),
            status: progress.status,
            loop_count: progress.loop_count,
            max_loops: self.max_loops,
            started_at: self.started_at,
        }
    }

    pub(crate) fn mark_running(&self) -> bool {
        let mut progress = self.progress.write();
        if progress.status != SessionStatus::Pending {
            return false;
        }
        progress.status = SessionStatus::Running;
        true
    }

    /// Moves into a terminal status once; later calls are ignored.
    pub(crate) fn finish(&self, status: SessionStatus) -> bool {
        let mut progress = self.progress.write();
        if progress.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        progress.status = status;
        true
    }

    /// Counts a finished iteration, never past `max_loops`.
    pub(crate) fn advance_loop(&self) -> u32 {
        let mut progress = self.progress.write();
        progress.loop_count = (progress.loop_count + 1).min(self.max_loops);
        progress.loop_count
    }
}

// ========================= Action Log =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    SessionStart,
    SessionStop,
    LlmResponse,
    Done,
    Press,
    Write,
    Click,
    MaxLoops,
    Error,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryKind::SessionStart => "SESSION_START",
            EntryKind::SessionStop => "SESSION_STOP",
            EntryKind::LlmResponse => "LLM_RESPONSE",
            EntryKind::Done => "DONE",
            EntryKind::Press => "PRESS",
            EntryKind::Write => "WRITE",
            EntryKind::Click => "CLICK",
            EntryKind::MaxLoops => "MAX_LOOPS",
            EntryKind::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub details: Value,
    /// `None` until the outcome is known.
    pub success: Option<bool>,
    pub reward: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub reward: i64,
    /// Percentage, 0 for an empty log.
    pub success_rate: f64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedbackError {
    #[error("invalid action index {index} (log has {len} entries)")]
    IndexOutOfRange { index: usize, len: usize },
}

#[derive(Default)]
struct LogState {
    entries: Vec<ActionLogEntry>,
    total_reward: i64,
}

/// Append-only action log with its reward accumulator.
pub struct ActionLog {
    session_id: String,
    state: RwLock<LogState>,
    events: EventBus,
}

impl ActionLog {
    pub fn new(session_id: impl Into<String>, events: EventBus) -> Self {
        Self {
            session_id: session_id.into(),
            state: RwLock::new(LogState::default()),
            events,
        }
    }

    /// Appends an entry; the reward only counts once the outcome is known.
    pub fn log_action(
        &self,
        kind: EntryKind,
        details: Value,
        success: Option<bool>,
        reward: i64,
    ) -> ActionLogEntry {
        let entry = {
            let mut state = self.state.write();
            let entry = ActionLogEntry {
                index: state.entries.len(),
                timestamp: Utc::now(),
                kind,
                details,
                success,
                reward,
            };
            state.entries.push(entry.clone());
            if success.is_some() {
                state.total_reward += reward;
            }
            entry
        };
        self.events.publish(OperatorEvent::Log {
            session_id: self.session_id.clone(),
            entry: entry.clone(),
        });
        entry
    }

    /// Applies human feedback to an entry. Every call adds a fresh delta.
    pub fn amend_feedback(&self, index: usize, success: bool) -> Result<ActionLogEntry, FeedbackError> {
        let reward = if success { FEEDBACK_SUCCESS_REWARD } else { FEEDBACK_FAILURE_PENALTY };
        let (entry, total_reward) = {
            let mut state = self.state.write();
            let len = state.entries.len();
            let entry = state
                .entries
                .get_mut(index)
                .ok_or(FeedbackError::IndexOutOfRange { index, len })?;
            entry.success = Some(success);
            entry.reward = reward;
            let entry = entry.clone();
            state.total_reward += reward;
            (entry, state.total_reward)
        };
        self.events.publish(OperatorEvent::FeedbackReceived {
            session_id: self.session_id.clone(),
            action_index: index,
            success,
            reward,
            total_reward,
        });
        Ok(entry)
    }

    pub fn entries(&self) -> Vec<ActionLogEntry> {
        self.state.read().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    pub fn total_reward(&self) -> i64 {
        self.state.read().total_reward
    }

    pub fn summary(&self) -> LogSummary {
        summarize(&self.state.read())
    }

    /// Entries and summary read under one lock.
    pub fn report(&self) -> (Vec<ActionLogEntry>, LogSummary) {
        let state = self.state.read();
        (state.entries.clone(), summarize(&state))
    }
}

fn summarize(state: &LogState) -> LogSummary {
    let total = state.entries.len();
    let successful = state.entries.iter().filter(|e| e.success == Some(true)).count();
    let failed = state.entries.iter().filter(|e| e.success == Some(false)).count();
    LogSummary {
        total,
        successful,
        failed,
        reward: state.total_reward,
        success_rate: if total > 0 {
            successful as f64 / total as f64 * 100.0
        } else {
            0.0
        },
    }
}
