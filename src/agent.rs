use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::computer::{dispatch, ActionExecutor, Dispatch};
use crate::config::{ActionFailurePolicy, OperateConfig};
use crate::events::OperatorEvent;
use crate::model::{CallError, Conversation, ModelClient};
use crate::prompts;
use crate::protocol::Operation;
use crate::session::{
    EntryKind, Session, SessionStatus, ACTION_FAILURE_PENALTY, DONE_REWARD, ERROR_PENALTY,
    MAX_LOOPS_PENALTY,
};

// ========================= Outcomes =========================

/// Why a session ended in the error state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Model service unreachable, timed out or refused the request.
    Connection,
    /// Every attempt produced an unusable answer.
    RetryExhausted,
    /// An input action could not be carried out.
    Execution,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Completed { summary: String },
    MaxLoopsReached { loops: u32 },
    Failed { cause: FailureCause, message: String },
    Stopped,
}

impl Outcome {
    /// Process exit code: 0 success, 2 budget exhausted, 1 fatal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Completed { .. } => 0,
            Outcome::MaxLoopsReached { .. } => 2,
            Outcome::Failed { .. } | Outcome::Stopped => 1,
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self {
            Outcome::Completed { .. } => SessionStatus::Completed,
            Outcome::MaxLoopsReached { .. } => SessionStatus::MaxLoopsReached,
            Outcome::Failed { .. } => SessionStatus::Error,
            Outcome::Stopped => SessionStatus::Stopped,
        }
    }
}

// ========================= State Machine =========================

#[derive(Debug)]
struct Failure {
    cause: FailureCause,
    message: String,
    remediation: Option<String>,
}

#[derive(Debug)]
enum LoopState {
    Init,
    Analyzing,
    LlmCall,
    Executing(Vec<Operation>),
    Done { summary: String, details: Value },
    MaxLoops,
    Failed(Failure),
    Stopped,
}

/// The perception-action loop: capture, ask the model, act, repeat.
pub struct Operator {
    client: ModelClient,
    executor: Arc<dyn ActionExecutor>,
    cfg: Arc<OperateConfig>,
}

impl Operator {
    pub fn new(client: ModelClient, executor: Arc<dyn ActionExecutor>, cfg: Arc<OperateConfig>) -> Self {
        Self { client, executor, cfg }
    }

    pub fn client(&self) -> &ModelClient {
        &self.client
    }

    pub fn config(&self) -> &OperateConfig {
        &self.cfg
    }

    /// Drives `session` to a terminal state. `cancel` is honoured between iterations only.
    pub async fn run(&self, session: &Session, cancel: &CancellationToken) -> Outcome {
        let mut conversation =
            Conversation::new(prompts::system_prompt(session.model(), session.objective()));
        let mut state = LoopState::Init;

        loop {
            state = match state {
                LoopState::Init => {
                    session.mark_running();
                    info!(session_id = session.id(), model = session.model(), max_loops = session.max_loops(), "session running");
                    if session.max_loops() == 0 {
                        LoopState::MaxLoops
                    } else {
                        LoopState::Analyzing
                    }
                }
                LoopState::Analyzing => self.analyze(session, cancel),
                LoopState::LlmCall => self.call_model(session, &mut conversation).await,
                LoopState::Executing(operations) => self.execute(session, operations).await,
                LoopState::Done { summary, details } => return self.complete(session, summary, details),
                LoopState::MaxLoops => return self.exhaust(session),
                LoopState::Failed(failure) => return self.fail(session, failure),
                LoopState::Stopped => return self.halt(session),
            };
        }
    }

    fn analyze(&self, session: &Session, cancel: &CancellationToken) -> LoopState {
        if cancel.is_cancelled() {
            return LoopState::Stopped;
        }
        session.events().publish(OperatorEvent::AgentThinking {
            session_id: session.id().to_string(),
            loop_index: session.loop_count() + 1,
            status: "Analyzing screen...".into(),
        });
        LoopState::LlmCall
    }

    async fn call_model(&self, session: &Session, conversation: &mut Conversation) -> LoopState {
        let loop_index = session.loop_count() + 1;
        match self
            .client
            .next_operations(session.model(), session.objective(), conversation)
            .await
        {
            Ok(operations) => {
                info!(session_id = session.id(), loop_index, count = operations.len(), "model proposed operations");
                session.log().log_action(
                    EntryKind::LlmResponse,
                    json!({ "operations": operations, "loop": loop_index }),
                    None,
                    0,
                );
                session.events().publish(OperatorEvent::LlmResponse {
                    session_id: session.id().to_string(),
                    loop_index,
                    operations: operations.clone(),
                });
                LoopState::Executing(operations)
            }
            Err(err) => {
                let cause = match err {
                    CallError::Connection(_) => FailureCause::Connection,
                    CallError::RetryExhausted { .. } => FailureCause::RetryExhausted,
                };
                LoopState::Failed(Failure {
                    cause,
                    message: err.to_string(),
                    remediation: Some(err.remediation(session.model())),
                })
            }
        }
    }

    async fn execute(&self, session: &Session, operations: Vec<Operation>) -> LoopState {
        for op in operations {
            sleep(self.cfg.action_delay).await;
            match dispatch(self.executor.as_ref(), &op).await {
                Ok(Dispatch::Finished { summary }) => {
                    return LoopState::Done { summary, details: op.details() };
                }
                Ok(Dispatch::Executed) => {
                    session.log().log_action(entry_kind(&op), op.details(), None, 0);
                    session.events().publish(OperatorEvent::ActionExecuted {
                        session_id: session.id().to_string(),
                        kind: op.tag().to_string(),
                        details: op.details(),
                        thought: op.thought().map(str::to_string),
                    });
                }
                Err(err) => match self.cfg.on_action_failure {
                    ActionFailurePolicy::Abort => {
                        return LoopState::Failed(Failure {
                            cause: FailureCause::Execution,
                            message: format!("{} failed: {err}", op.tag()),
                            remediation: None,
                        });
                    }
                    ActionFailurePolicy::Skip => {
                        warn!(session_id = session.id(), operation = op.tag(), error = %err, "action failed, skipping");
                        let mut details = op.details();
                        details["error"] = json!(err.to_string());
                        session.log().log_action(entry_kind(&op), details, Some(false), ACTION_FAILURE_PENALTY);
                    }
                },
            }
        }

        let loops = session.advance_loop();
        if loops >= session.max_loops() {
            LoopState::MaxLoops
        } else {
            LoopState::Analyzing
        }
    }

    fn complete(&self, session: &Session, summary: String, details: Value) -> Outcome {
        session.log().log_action(EntryKind::Done, details, Some(true), DONE_REWARD);
        session.finish(SessionStatus::Completed);
        info!(session_id = session.id(), %summary, "objective complete");
        session.events().publish(OperatorEvent::ObjectiveComplete {
            session_id: session.id().to_string(),
            summary: summary.clone(),
            total_reward: session.log().total_reward(),
        });
        Outcome::Completed { summary }
    }

    fn exhaust(&self, session: &Session) -> Outcome {
        let loops = session.loop_count();
        session.log().log_action(
            EntryKind::MaxLoops,
            json!({ "loops": loops }),
            Some(false),
            MAX_LOOPS_PENALTY,
        );
        session.finish(SessionStatus::MaxLoopsReached);
        info!(session_id = session.id(), loops, "loop budget exhausted");
        session.events().publish(OperatorEvent::MaxLoopsReached {
            session_id: session.id().to_string(),
            loops,
            total_reward: session.log().total_reward(),
        });
        Outcome::MaxLoopsReached { loops }
    }

    fn fail(&self, session: &Session, failure: Failure) -> Outcome {
        session.log().log_action(
            EntryKind::Error,
            json!({ "error": failure.message, "cause": failure.cause, "loop": session.loop_count() }),
            Some(false),
            ERROR_PENALTY,
        );
        session.finish(SessionStatus::Error);
        warn!(session_id = session.id(), cause = ?failure.cause, error = %failure.message, "session failed");
        session.events().publish(OperatorEvent::Error {
            session_id: session.id().to_string(),
            cause: failure.cause,
            message: failure.message.clone(),
            remediation: failure.remediation,
        });
        Outcome::Failed { cause: failure.cause, message: failure.message }
    }

    fn halt(&self, session: &Session) -> Outcome {
        session.log().log_action(
            EntryKind::SessionStop,
            json!({ "loop": session.loop_count() }),
            None,
            0,
        );
        session.finish(SessionStatus::Stopped);
        info!(session_id = session.id(), "session stopped");
        session.events().publish(OperatorEvent::SessionStopped {
            session_id: session.id().to_string(),
        });
        Outcome::Stopped
    }
}

fn entry_kind(op: &Operation) -> EntryKind {
    match op {
        Operation::Done { .. } => EntryKind::Done,
        Operation::Press { .. } => EntryKind::Press,
        Operation::Write { .. } => EntryKind::Write,
        Operation::Click { .. } => EntryKind::Click,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_distinct_exit_codes() {
        assert_eq!(Outcome::Completed { summary: "ok".into() }.exit_code(), 0);
        assert_eq!(Outcome::MaxLoopsReached { loops: 10 }.exit_code(), 2);
        let failed = Outcome::Failed { cause: FailureCause::Connection, message: "down".into() };
        assert_eq!(failed.exit_code(), 1);
        assert_eq!(failed.status(), SessionStatus::Error);
        assert_eq!(Outcome::Stopped.status(), SessionStatus::Stopped);
    }

    #[test]
    fn outcome_serializes_with_cause() {
        let v = serde_json::to_value(Outcome::Failed {
            cause: FailureCause::RetryExhausted,
            message: "x".into(),
        })
        .unwrap();
        assert_eq!(v["outcome"], "failed");
        assert_eq!(v["cause"], "retry_exhausted");
    }

    #[test]
    fn entry_kinds_follow_operation() {
        let op = Operation::Click { x: 1, y: 2, thought: None };
        assert_eq!(entry_kind(&op), EntryKind::Click);
        assert_eq!(entry_kind(&Operation::Write { content: "a".into(), thought: None }), EntryKind::Write);
    }
}
