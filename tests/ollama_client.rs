mod common;

use common::{FakeScreen, DONE_REPLY};
use self_operate::model::{Conversation, ImageAttachment, Message, ModelError, VisionModel};
use self_operate::{ModelClient, OllamaClient, OperateConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> OllamaClient {
    let cfg = OperateConfig { ollama_host: server.uri(), ..OperateConfig::default() };
    OllamaClient::new(&cfg).unwrap()
}

fn chat_body(content: &str) -> serde_json::Value {
    json!({
        "model": "llava",
        "created_at": "2024-01-01T00:00:00Z",
        "message": { "role": "assistant", "content": content },
        "done": true
    })
}

#[tokio::test]
async fn chat_posts_history_with_images_and_returns_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({
            "model": "llava",
            "stream": false,
            "messages": [
                { "role": "system", "content": "sys" },
                { "role": "user", "content": "look", "images": ["iVBOR"] }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("  [] \n")))
        .expect(1)
        .mount(&server)
        .await;

    let messages = vec![
        Message::system("sys"),
        Message::user("look").with_image(ImageAttachment {
            capture_id: "c1".into(),
            png_base64: "iVBOR".into(),
        }),
    ];
    let reply = client_for(&server).chat("llava", &messages).await.unwrap();

    assert_eq!(reply, "[]");
}

#[tokio::test]
async fn missing_model_is_a_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "model 'llava' not found" })))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .chat("llava", &[Message::system("sys")])
        .await
        .unwrap_err();

    match &err {
        ModelError::Rejected { status, body } => {
            assert_eq!(*status, 404);
            assert!(body.contains("not found"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.is_fatal());
}

#[tokio::test]
async fn undecodable_body_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .chat("llava", &[Message::system("sys")])
        .await
        .unwrap_err();

    assert!(matches!(err, ModelError::Exchange(_)));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn configured_request_timeout_is_applied() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_body("[]"))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    let cfg = OperateConfig {
        ollama_host: server.uri(),
        request_timeout: Duration::from_millis(200),
        ..OperateConfig::default()
    };

    let err = OllamaClient::new(&cfg)
        .unwrap()
        .chat("llava", &[Message::system("sys")])
        .await
        .unwrap_err();

    assert!(matches!(err, ModelError::Timeout(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn unreachable_host_is_a_connection_error() {
    let cfg = OperateConfig {
        ollama_host: "127.0.0.1:1".into(),
        connect_timeout: Duration::from_secs(2),
        ..OperateConfig::default()
    };
    let client = OllamaClient::new(&cfg).unwrap();
    assert_eq!(client.host(), "http://127.0.0.1:1");

    let err = client.chat("llava", &[Message::system("sys")]).await.unwrap_err();

    assert!(matches!(err, ModelError::Connection { .. }));
    assert!(client.health().await.is_err());
}

#[tokio::test]
async fn tags_listing_backs_the_health_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                { "name": "llava:latest", "size": 4733363377u64 },
                { "name": "bakllava:latest", "size": 4733363377u64 }
            ]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);

    assert_eq!(client.list_models().await.unwrap(), vec!["llava:latest", "bakllava:latest"]);
    assert!(client.health().await.is_ok());
}

#[tokio::test]
async fn adapter_recovers_from_a_malformed_answer_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("Sure! I'll click the button.")))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(&format!("```json\n{DONE_REPLY}\n```"))))
        .expect(1)
        .mount(&server)
        .await;

    let cfg = Arc::new(OperateConfig { ollama_host: server.uri(), ..OperateConfig::default() }.without_delays());
    let adapter = ModelClient::new(
        Arc::new(OllamaClient::new(&cfg).unwrap()),
        Arc::new(FakeScreen::default()),
        cfg.clone(),
    );
    let mut conversation = Conversation::new("sys");

    let ops = adapter.next_operations("llava", "type hello", &mut conversation).await.unwrap();

    assert_eq!(ops.len(), 1);
    assert!(ops[0].is_done());
    assert_eq!(conversation.len(), 3);
    assert_eq!(conversation.attachment_count(), 0);
}
