#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use self_operate::computer::{
    ActionExecutor, AnnotatedScreenshot, ComputerError, ScreenAnnotator, ScreenCapture,
    ScreenLabel, Screenshot,
};
use self_operate::events::OperatorEvent;
use self_operate::model::{Message, ModelError, VisionModel};
use self_operate::{ModelClient, OperateConfig, Operator};
use tokio::sync::broadcast;

pub const CLICK_REPLY: &str = "```json\n[{\"operation\":\"click\",\"x\":100,\"y\":200}]\n```";
pub const DONE_REPLY: &str = r#"[{"operation":"done","summary":"typed hello"}]"#;
pub const PRESS_REPLY: &str = r#"[{"operation":"press","keys":["tab"]}]"#;
pub const MALFORMED_REPLY: &str = r#"[{"operation":"done","summary":"typed hello"}"#;

/// Replies from a script, then repeats `fallback` (or a parse failure when there is none).
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ModelError>>>,
    fallback: Option<String>,
    delay: Duration,
    healthy: bool,
    pub calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, ModelError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            delay: Duration::ZERO,
            healthy: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn repeating(reply: &str) -> Self {
        Self::new(Vec::new()).with_fallback(reply)
    }

    pub fn with_fallback(mut self, reply: &str) -> Self {
        self.fallback = Some(reply.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call(&self, i: usize) -> Vec<Message> {
        self.calls.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl VisionModel for ScriptedModel {
    async fn chat(&self, _model: &str, messages: &[Message]) -> Result<String, ModelError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => Ok(self.fallback.clone().unwrap_or_else(|| "not json".to_string())),
        }
    }

    async fn health(&self) -> Result<(), ModelError> {
        if self.healthy {
            Ok(())
        } else {
            Err(ModelError::Connection {
                host: "http://localhost:11434".into(),
                reason: "connection refused".into(),
            })
        }
    }
}

pub fn unreachable() -> ModelError {
    ModelError::Connection {
        host: "http://localhost:11434".into(),
        reason: "connection refused".into(),
    }
}

#[derive(Default)]
pub struct FakeScreen {
    pub captures: AtomicUsize,
}

#[async_trait]
impl ScreenCapture for FakeScreen {
    async fn capture(&self) -> Result<Screenshot, ComputerError> {
        let n = self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(Screenshot::new(format!("png-{n}")))
    }
}

/// Records every primitive call; optionally fails the n-th one (0-based).
#[derive(Default)]
pub struct RecordingExecutor {
    pub calls: Mutex<Vec<String>>,
    pub fail_on: Option<usize>,
}

impl RecordingExecutor {
    pub fn failing_on(n: usize) -> Self {
        Self { calls: Mutex::new(Vec::new()), fail_on: Some(n) }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), ComputerError> {
        let mut calls = self.calls.lock().unwrap();
        let n = calls.len();
        calls.push(call);
        if self.fail_on == Some(n) {
            return Err(ComputerError::Input("display went away".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn press(&self, keys: &[String]) -> Result<(), ComputerError> {
        self.record(format!("press {}", keys.join("+")))
    }

    async fn write(&self, text: &str) -> Result<(), ComputerError> {
        self.record(format!("write {text}"))
    }

    async fn point_and_click(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.record(format!("click {x},{y}"))
    }
}

pub struct FixedAnnotator {
    pub fail: bool,
}

#[async_trait]
impl ScreenAnnotator for FixedAnnotator {
    async fn annotate(&self, screenshot: &Screenshot) -> Result<AnnotatedScreenshot, ComputerError> {
        if self.fail {
            return Err(ComputerError::Annotate("detector weights missing".into()));
        }
        let mut labelled = screenshot.clone();
        labelled.png_base64 = format!("{}-labelled", screenshot.png_base64);
        Ok(AnnotatedScreenshot {
            screenshot: labelled,
            labels: vec![ScreenLabel { label: "~1".into(), x: 10, y: 20, width: 30, height: 40 }],
        })
    }
}

pub fn test_config() -> OperateConfig {
    let mut cfg = OperateConfig::default().without_delays();
    cfg.retry.max_attempts = 3;
    cfg
}

pub struct Harness {
    pub model: Arc<ScriptedModel>,
    pub screen: Arc<FakeScreen>,
    pub executor: Arc<RecordingExecutor>,
    pub operator: Arc<Operator>,
}

pub fn harness(model: ScriptedModel, executor: RecordingExecutor, cfg: OperateConfig) -> Harness {
    let cfg = Arc::new(cfg);
    let model = Arc::new(model);
    let screen = Arc::new(FakeScreen::default());
    let executor = Arc::new(executor);
    let client = ModelClient::new(model.clone(), screen.clone(), cfg.clone());
    let operator = Arc::new(Operator::new(client, executor.clone(), cfg));
    Harness { model, screen, executor, operator }
}

pub fn drain(rx: &mut broadcast::Receiver<OperatorEvent>) -> Vec<OperatorEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

pub fn count(events: &[OperatorEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}
