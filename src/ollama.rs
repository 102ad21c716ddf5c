use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{normalize_host, OperateConfig};
use crate::model::{Message, ModelError, Role, VisionModel};

/// Ollama `/api/chat` client.
#[derive(Clone)]
pub struct OllamaClient {
    http: Client,
    host: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

impl OllamaClient {
    pub fn new(cfg: &OperateConfig) -> Result<Self, ModelError> {
        let http = Client::builder()
            .timeout(cfg.request_timeout)
            .connect_timeout(cfg.connect_timeout)
            .build()
            .map_err(|e| ModelError::Client(e.to_string()))?;
        Ok(Self { host: normalize_host(&cfg.ollama_host), http })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Names of the models pulled on the server.
    pub async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let url = format!("{}/api/tags", self.host);
        let resp = self.http.get(url).send().await.map_err(|e| self.transport(e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport(e))?;
        if !status.is_success() {
            return Err(ModelError::Rejected { status: status.as_u16(), body: text });
        }
        let tags: TagsResponse = serde_json::from_str(&text)
            .map_err(|e| ModelError::Exchange(format!("failed to parse Ollama tags: {e}")))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn build_request<'a>(model: &'a str, messages: &'a [Message]) -> ChatRequest<'a> {
        ChatRequest {
            model,
            stream: false,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role,
                    content: &m.content,
                    images: m.image.iter().map(|i| i.png_base64.as_str()).collect(),
                })
                .collect(),
        }
    }

    fn transport(&self, err: reqwest::Error) -> ModelError {
        if err.is_timeout() {
            ModelError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ModelError::Connection { host: self.host.clone(), reason: err.to_string() }
        } else {
            ModelError::Exchange(err.to_string())
        }
    }
}

#[async_trait]
impl VisionModel for OllamaClient {
    async fn chat(&self, model: &str, messages: &[Message]) -> Result<String, ModelError> {
        let url = format!("{}/api/chat", self.host);
        let resp = self
            .http
            .post(url)
            .json(&Self::build_request(model, messages))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport(e))?;
        if !status.is_success() {
            return Err(ModelError::Rejected { status: status.as_u16(), body: text });
        }
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| ModelError::Exchange(format!("failed to parse Ollama response JSON: {e}")))?;
        Ok(parsed.message.content.trim().to_string())
    }

    async fn health(&self) -> Result<(), ModelError> {
        self.list_models().await.map(|_| ())
    }
}
