use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::computer::{ScreenAnnotator, ScreenCapture, ScreenLabel, Screenshot};
use crate::config::OperateConfig;
use crate::prompts;
use crate::protocol::{self, Operation};

// ========================= Messages =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub capture_id: String,
    pub png_base64: String,
}

impl From<&Screenshot> for ImageAttachment {
    fn from(shot: &Screenshot) -> Self {
        Self {
            capture_id: shot.id.clone(),
            png_base64: shot.png_base64.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), image: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), image: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), image: None }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.image = Some(image);
        self
    }

    /// Same message without its attachment.
    pub fn text_only(&self) -> Self {
        Self { role: self.role, content: self.content.clone(), image: None }
    }
}

/// Proof that a message with an attachment sits in the history; consumed by [`Conversation::strip`].
#[must_use = "an attached screenshot must be stripped after the call"]
#[derive(Debug)]
pub struct PendingAttachment {
    index: usize,
}

/// Ordered message history. Element 0 is always the system message.
#[derive(Clone, Debug, Serialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self { messages: vec![Message::system(system_prompt)] }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Only the system message so far.
    pub fn is_fresh(&self) -> bool {
        self.messages.len() == 1
    }

    /// Re-asserts the instructions in place; position 0 stays the system message.
    pub fn replace_system(&mut self, system_prompt: impl Into<String>) {
        self.messages[0] = Message::system(system_prompt);
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message.text_only());
    }

    pub fn attach(&mut self, message: Message) -> PendingAttachment {
        self.messages.push(message);
        PendingAttachment { index: self.messages.len() - 1 }
    }

    /// Replaces the attached message with its text-only form.
    pub fn strip(&mut self, pending: PendingAttachment) {
        if let Some(slot) = self.messages.get_mut(pending.index) {
            *slot = slot.text_only();
        }
    }

    /// Number of messages still carrying an image.
    pub fn attachment_count(&self) -> usize {
        self.messages.iter().filter(|m| m.image.is_some()).count()
    }

    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages[1..].iter().rev().find(|m| m.role == Role::Assistant)
    }

    // Drops everything appended after `len`; the system message always survives.
    fn rollback(&mut self, len: usize) {
        self.messages.truncate(len.max(1));
    }
}

// ========================= Model Backend =========================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("cannot reach model service at {host}: {reason}")]
    Connection { host: String, reason: String },
    #[error("model service timed out: {0}")]
    Timeout(String),
    #[error("model service rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("model exchange failed: {0}")]
    Exchange(String),
    #[error("cannot build HTTP client: {0}")]
    Client(String),
}

impl ModelError {
    /// Fatal errors end the session; the rest are retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ModelError::Exchange(_))
    }
}

/// A remote vision-language chat endpoint.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn chat(&self, model: &str, messages: &[Message]) -> Result<String, ModelError>;

    async fn health(&self) -> Result<(), ModelError> {
        Ok(())
    }
}

// ========================= Adapter =========================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CallError {
    #[error(transparent)]
    Connection(ModelError),
    #[error("no usable model response after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },
}

impl CallError {
    /// What a human should do about it.
    pub fn remediation(&self, model: &str) -> String {
        match self {
            CallError::Connection(_) => format!(
                "Couldn't connect to the model service. With Ollama installed, run `ollama pull {model}` then `ollama serve`"
            ),
            CallError::RetryExhausted { .. } => format!(
                "The model `{model}` kept answering with something other than a JSON list of operations. Try a larger vision model."
            ),
        }
    }
}

enum AttemptFailure {
    Fatal(ModelError),
    Transient(String),
}

struct Exchange {
    operations: Vec<Operation>,
    cleaned: String,
}

/// Sends history plus a fresh screenshot to the model and returns validated operations.
pub struct ModelClient {
    backend: Arc<dyn VisionModel>,
    screen: Arc<dyn ScreenCapture>,
    annotator: Option<Arc<dyn ScreenAnnotator>>,
    cfg: Arc<OperateConfig>,
}

impl ModelClient {
    pub fn new(
        backend: Arc<dyn VisionModel>,
        screen: Arc<dyn ScreenCapture>,
        cfg: Arc<OperateConfig>,
    ) -> Self {
        Self { backend, screen, annotator: None, cfg }
    }

    pub fn with_annotator(mut self, annotator: Arc<dyn ScreenAnnotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    pub async fn health(&self) -> Result<(), ModelError> {
        self.backend.health().await
    }

    /// One logical model call, retried on unusable answers up to the configured attempt count.
    pub async fn next_operations(
        &self,
        model: &str,
        objective: &str,
        conversation: &mut Conversation,
    ) -> Result<Vec<Operation>, CallError> {
        let retry = &self.cfg.retry;
        let max_attempts = retry.attempts();
        let mut last = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                sleep(retry.backoff_for(attempt)).await;
                conversation.replace_system(prompts::system_prompt(model, objective));
            }
            sleep(self.cfg.call_delay).await;

            let mark = conversation.len();
            match self.exchange(model, conversation).await {
                Ok(Exchange { operations, cleaned }) => {
                    if attempt > 1 {
                        info!(model, attempt, "model recovered after retries");
                    }
                    conversation.push(Message::assistant(cleaned));
                    return Ok(operations);
                }
                Err(AttemptFailure::Fatal(err)) => {
                    conversation.rollback(mark);
                    warn!(model, error = %err, "model service unavailable");
                    return Err(CallError::Connection(err));
                }
                Err(AttemptFailure::Transient(reason)) => {
                    conversation.rollback(mark);
                    warn!(model, attempt, max_attempts, %reason, "model answer unusable, trying again");
                    last = reason;
                }
            }
        }

        Err(CallError::RetryExhausted { attempts: max_attempts, last })
    }

    async fn exchange(
        &self,
        model: &str,
        conversation: &mut Conversation,
    ) -> Result<Exchange, AttemptFailure> {
        let (screenshot, labels) = self.capture().await?;

        let mut content = prompts::user_prompt(conversation.is_fresh()).to_string();
        if !labels.is_empty() {
            content.push_str("\n\nLabelled elements (label: x, y, width, height):\n");
            for l in &labels {
                content.push_str(&format!("- {}: {}, {}, {}, {}\n", l.label, l.x, l.y, l.width, l.height));
            }
        }
        let pending =
            conversation.attach(Message::user(content).with_image(ImageAttachment::from(&screenshot)));

        let reply = self.backend.chat(model, conversation.messages()).await;
        conversation.strip(pending);

        let raw = match reply {
            Ok(raw) => raw,
            Err(err) if err.is_fatal() => return Err(AttemptFailure::Fatal(err)),
            Err(err) => return Err(AttemptFailure::Transient(err.to_string())),
        };
        if self.cfg.verbose {
            debug!(model, raw = %raw, "model response before cleaning");
        }
        let cleaned = protocol::clean_response(&raw);
        if self.cfg.verbose {
            debug!(model, cleaned = %cleaned, "model response after cleaning");
        }
        let operations = protocol::parse_cleaned(&cleaned)
            .map_err(|e| AttemptFailure::Transient(e.to_string()))?;
        Ok(Exchange { operations, cleaned })
    }

    async fn capture(&self) -> Result<(Screenshot, Vec<ScreenLabel>), AttemptFailure> {
        let shot = self
            .screen
            .capture()
            .await
            .map_err(|e| AttemptFailure::Transient(e.to_string()))?;
        if !self.cfg.use_labeling {
            return Ok((shot, Vec::new()));
        }
        let Some(annotator) = &self.annotator else {
            return Ok((shot, Vec::new()));
        };
        match annotator.annotate(&shot).await {
            Ok(annotated) => Ok((annotated.screenshot, annotated.labels)),
            Err(err) => {
                warn!(error = %err, "labelling failed, falling back to the plain screenshot");
                Ok((shot, Vec::new()))
            }
        }
    }
}
