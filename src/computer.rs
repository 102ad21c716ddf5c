use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::browser::{Browser, BrowserConfig};
use crate::protocol::Operation;

// ========================= Capture Types =========================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Screenshot {
    pub id: String,
    pub png_base64: String,
    pub captured_at: DateTime<Utc>,
}

impl Screenshot {
    pub fn new(png_base64: impl Into<String>) -> Self {
        Self {
            id: nanoid!(),
            png_base64: png_base64.into(),
            captured_at: Utc::now(),
        }
    }
}

/// A detected UI element on an annotated screenshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScreenLabel {
    pub label: String,
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

#[derive(Clone, Debug)]
pub struct AnnotatedScreenshot {
    pub screenshot: Screenshot,
    pub labels: Vec<ScreenLabel>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComputerError {
    #[error("screen capture failed: {0}")]
    Capture(String),
    #[error("input simulation failed: {0}")]
    Input(String),
    #[error("screen annotation failed: {0}")]
    Annotate(String),
}

// ========================= Capabilities =========================

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<Screenshot, ComputerError>;
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn press(&self, keys: &[String]) -> Result<(), ComputerError>;
    async fn write(&self, text: &str) -> Result<(), ComputerError>;
    async fn point_and_click(&self, x: i64, y: i64) -> Result<(), ComputerError>;
}

/// Optional object-detection pass that draws labelled boxes onto a capture.
#[async_trait]
pub trait ScreenAnnotator: Send + Sync {
    async fn annotate(&self, screenshot: &Screenshot) -> Result<AnnotatedScreenshot, ComputerError>;
}

// ========================= Dispatch =========================

#[derive(Clone, Debug, PartialEq)]
pub enum Dispatch {
    /// The executor ran the operation.
    Executed,
    /// A `done` operation; nothing reaches the executor.
    Finished { summary: String },
}

/// Routes a validated operation to the matching executor primitive.
pub async fn dispatch(
    executor: &dyn ActionExecutor,
    op: &Operation,
) -> Result<Dispatch, ComputerError> {
    match op {
        Operation::Done { summary, .. } => Ok(Dispatch::Finished { summary: summary.clone() }),
        Operation::Press { keys, .. } => executor.press(keys).await.map(|_| Dispatch::Executed),
        Operation::Write { content, .. } => {
            executor.write(content).await.map(|_| Dispatch::Executed)
        }
        Operation::Click { x, y, .. } => executor
            .point_and_click(*x, *y)
            .await
            .map(|_| Dispatch::Executed),
    }
}

// ========================= Noop Desktop =========================

// 1x1 transparent PNG.
const BLANK_PNG_B64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// Dry-run desktop: blank captures, input is only traced.
#[derive(Clone, Copy, Default)]
pub struct NoopDesktop;

#[async_trait]
impl ScreenCapture for NoopDesktop {
    async fn capture(&self) -> Result<Screenshot, ComputerError> {
        Ok(Screenshot::new(BLANK_PNG_B64))
    }
}

#[async_trait]
impl ActionExecutor for NoopDesktop {
    async fn press(&self, keys: &[String]) -> Result<(), ComputerError> {
        debug!(?keys, "noop press");
        Ok(())
    }

    async fn write(&self, text: &str) -> Result<(), ComputerError> {
        debug!(len = text.len(), "noop write");
        Ok(())
    }

    async fn point_and_click(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        debug!(x, y, "noop click");
        Ok(())
    }
}

// ========================= Chromium Desktop =========================

/// A Chromium page standing in for the operated screen.
pub struct ChromiumDesktop {
    browser: Browser,
}

impl ChromiumDesktop {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self, ComputerError> {
        let browser = Browser::launch(cfg)
            .await
            .map_err(|e| ComputerError::Capture(e.to_string()))?;
        Ok(Self { browser })
    }

    pub async fn connect(ws_url: &str, viewport: (u32, u32)) -> Result<Self, ComputerError> {
        let browser = Browser::connect(ws_url, viewport)
            .await
            .map_err(|e| ComputerError::Capture(e.to_string()))?;
        Ok(Self { browser })
    }

    pub async fn open(&self, url: &str) -> Result<(), ComputerError> {
        self.browser
            .goto(url)
            .await
            .map_err(|e| ComputerError::Input(e.to_string()))
    }
}

#[async_trait]
impl ScreenCapture for ChromiumDesktop {
    async fn capture(&self) -> Result<Screenshot, ComputerError> {
        let b64 = self
            .browser
            .screenshot_b64()
            .await
            .map_err(|e| ComputerError::Capture(e.to_string()))?;
        Ok(Screenshot::new(b64))
    }
}

#[async_trait]
impl ActionExecutor for ChromiumDesktop {
    async fn press(&self, keys: &[String]) -> Result<(), ComputerError> {
        self.browser
            .press_keys(keys)
            .await
            .map_err(|e| ComputerError::Input(e.to_string()))
    }

    async fn write(&self, text: &str) -> Result<(), ComputerError> {
        self.browser
            .type_text(text)
            .await
            .map_err(|e| ComputerError::Input(e.to_string()))
    }

    async fn point_and_click(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.browser
            .click(x, y)
            .await
            .map_err(|e| ComputerError::Input(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ActionExecutor for Recorder {
        async fn press(&self, keys: &[String]) -> Result<(), ComputerError> {
            self.calls.lock().unwrap().push(format!("press {}", keys.join("+")));
            Ok(())
        }

        async fn write(&self, text: &str) -> Result<(), ComputerError> {
            self.calls.lock().unwrap().push(format!("write {text}"));
            Ok(())
        }

        async fn point_and_click(&self, x: i64, y: i64) -> Result<(), ComputerError> {
            self.calls.lock().unwrap().push(format!("click {x},{y}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_variant() {
        let rec = Recorder::default();
        let ops = [
            Operation::Click { x: 100, y: 200, thought: None },
            Operation::Write { content: "hello".into(), thought: None },
            Operation::Press { keys: vec!["ctrl".into(), "s".into()], thought: None },
        ];
        for op in &ops {
            assert_eq!(dispatch(&rec, op).await.unwrap(), Dispatch::Executed);
        }
        assert_eq!(
            *rec.calls.lock().unwrap(),
            vec!["click 100,200", "write hello", "press ctrl+s"]
        );
    }

    #[tokio::test]
    async fn done_never_reaches_executor() {
        let rec = Recorder::default();
        let op = Operation::Done { summary: "typed hello".into(), thought: None };
        assert_eq!(
            dispatch(&rec, &op).await.unwrap(),
            Dispatch::Finished { summary: "typed hello".into() }
        );
        assert!(rec.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn noop_desktop_captures_blank_png() {
        let shot = NoopDesktop.capture().await.unwrap();
        assert!(shot.png_base64.starts_with("iVBOR"));
        assert!(!shot.id.is_empty());
    }
}
