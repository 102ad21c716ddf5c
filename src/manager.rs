use dashmap::DashMap;
use nanoid::nanoid;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{FailureCause, Operator, Outcome};
use crate::events::{EventBus, OperatorEvent};
use crate::model::ModelError;
use crate::session::{
    ActionLogEntry, EntryKind, FeedbackError, LogSummary, Session, SessionSnapshot,
};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("objective is required")]
    EmptyObjective,
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("model service is not running: {0}")]
    ModelUnavailable(ModelError),
    #[error(transparent)]
    Feedback(#[from] FeedbackError),
    #[error("session {0} is still running")]
    StillRunning(String),
}

/// Read-only view returned by [`SessionManager::logs`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionLogs {
    pub session: SessionSnapshot,
    pub actions: Vec<ActionLogEntry>,
    pub summary: LogSummary,
}

enum Task {
    Running(JoinHandle<Outcome>),
    Finished(Outcome),
}

struct SessionEntry {
    session: Arc<Session>,
    cancel: CancellationToken,
    task: Mutex<Task>,
}

/// Registry of sessions, one loop task each. Finished sessions stay until
/// [`SessionManager::remove`] or [`SessionManager::prune_finished`] drops them.
pub struct SessionManager {
    operator: Arc<Operator>,
    events: EventBus,
    sessions: DashMap<String, Arc<SessionEntry>>,
    // Last started session; reporting convenience only.
    current: RwLock<Option<String>>,
}

impl SessionManager {
    pub fn new(operator: Arc<Operator>) -> Self {
        let events = EventBus::new(operator.config().event_capacity);
        Self::with_events(operator, events)
    }

    pub fn with_events(operator: Arc<Operator>, events: EventBus) -> Self {
        Self {
            operator,
            events,
            sessions: DashMap::new(),
            current: RwLock::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperatorEvent> {
        self.events.subscribe()
    }

    /// Starts a new session in its own task. Other sessions keep running.
    pub async fn start(&self, objective: &str, model: Option<&str>) -> Result<String, ManagerError> {
        let objective = objective.trim();
        if objective.is_empty() {
            return Err(ManagerError::EmptyObjective);
        }
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.operator.config().default_model)
            .to_string();

        self.operator
            .client()
            .health()
            .await
            .map_err(ManagerError::ModelUnavailable)?;

        let session_id = format!("session_{}", nanoid!(12));
        let session = Arc::new(Session::new(
            session_id.clone(),
            objective,
            model.clone(),
            self.operator.config().max_loops,
            self.events.clone(),
        ));
        session.log().log_action(
            EntryKind::SessionStart,
            json!({ "objective": objective, "model": model }),
            None,
            0,
        );
        self.events.publish(OperatorEvent::SessionStarted {
            session_id: session_id.clone(),
            objective: objective.to_string(),
            model: model.clone(),
        });

        let cancel = CancellationToken::new();
        let task = {
            let operator = Arc::clone(&self.operator);
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move { operator.run(&session, &cancel).await })
        };

        self.sessions.insert(
            session_id.clone(),
            Arc::new(SessionEntry { session, cancel, task: Mutex::new(Task::Running(task)) }),
        );
        *self.current.write() = Some(session_id.clone());
        info!(session_id = %session_id, model = %model, "session started");
        Ok(session_id)
    }

    /// Requests a stop; takes effect at the next iteration boundary. Idempotent.
    pub fn stop(&self, session_id: &str) -> Result<(), ManagerError> {
        let entry = self.entry(session_id)?;
        if !entry.cancel.is_cancelled() {
            info!(session_id, "stop requested");
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Amends one action log entry with human feedback.
    pub fn feedback(
        &self,
        session_id: &str,
        action_index: usize,
        success: bool,
    ) -> Result<ActionLogEntry, ManagerError> {
        let entry = self.entry(session_id)?;
        let amended = entry.session.log().amend_feedback(action_index, success)?;
        Ok(amended)
    }

    pub fn logs(&self, session_id: &str) -> Result<SessionLogs, ManagerError> {
        let entry = self.entry(session_id)?;
        let (actions, summary) = entry.session.log().report();
        Ok(SessionLogs { session: entry.session.snapshot(), actions, summary })
    }

    pub fn session(&self, session_id: &str) -> Result<SessionSnapshot, ManagerError> {
        Ok(self.entry(session_id)?.session.snapshot())
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<_> = self.sessions.iter().map(|e| e.value().session.snapshot()).collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// The session most recently started.
    pub fn current(&self) -> Option<String> {
        self.current.read().clone()
    }

    /// Waits for the session's loop to finish and returns how it ended.
    /// Later calls return the same outcome.
    pub async fn wait(&self, session_id: &str) -> Result<Outcome, ManagerError> {
        let entry = self.entry(session_id)?;
        let mut task = entry.task.lock().await;
        let outcome = match &mut *task {
            Task::Finished(outcome) => return Ok(outcome.clone()),
            Task::Running(handle) => match handle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(session_id, error = %err, "session task ended abnormally");
                    Outcome::Failed { cause: FailureCause::Execution, message: err.to_string() }
                }
            },
        };
        *task = Task::Finished(outcome.clone());
        Ok(outcome)
    }

    /// Drops a finished session and hands back its final logs.
    pub fn remove(&self, session_id: &str) -> Result<SessionLogs, ManagerError> {
        let logs = self.logs(session_id)?;
        if !logs.session.status.is_terminal() {
            return Err(ManagerError::StillRunning(session_id.to_string()));
        }
        self.sessions.remove(session_id);
        self.forget_current(session_id);
        Ok(logs)
    }

    /// Drops every finished session; returns how many went.
    pub fn prune_finished(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, e| !e.session.status().is_terminal());
        let pruned = before.saturating_sub(self.sessions.len());
        if let Some(id) = self.current() {
            if !self.sessions.contains_key(&id) {
                self.forget_current(&id);
            }
        }
        pruned
    }

    fn forget_current(&self, session_id: &str) {
        let mut current = self.current.write();
        if current.as_deref() == Some(session_id) {
            *current = None;
        }
    }

    fn entry(&self, session_id: &str) -> Result<Arc<SessionEntry>, ManagerError> {
        self.sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ManagerError::UnknownSession(session_id.to_string()))
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for entry in self.sessions.iter() {
            entry.value().cancel.cancel();
        }
    }
}
