//! Integration tests for the streaming reply engine
//!
//! These tests drive the controller against a fake backend over real HTTP.
//! Tests cover:
//! - Chunked replies with fenced code, persisted once
//! - SSE push replies (open, send, named events)
//! - Backend error envelopes surfacing as annotated errors
//! - History restore followed by a new reply
//! - Configuration and identity feeding a session

use std::io::Write;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::mpsc;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chatflow_core::config::{load_config_from_path, ClientConfig, ConfigOverrides, TransportKind};
use chatflow_core::identity::{self, FileIdentityStore};
use chatflow_core::messages::STOP_MARKER;
use chatflow_core::transport::create_transport;
use chatflow_core::{
    HttpBackend, LifecycleState, ReplyController, SegmentKind, Sender, Session, UserId,
};

const REPLY: &str = "Here:\n```js\nconsole.log(1)\n```\ndone";

fn controller_for(config: &ClientConfig) -> ReplyController {
    let client = reqwest::Client::new();
    ReplyController::new(
        create_transport(config, client.clone()),
        Arc::new(HttpBackend::with_client(client, &config.base_url)),
    )
    .with_config(config.controller_config())
}

fn config_for(server: &MockServer, transport: TransportKind) -> ClientConfig {
    let mut config = ClientConfig::default();
    ConfigOverrides::new()
        .with_base_url(server.uri())
        .with_transport(transport)
        .apply(&mut config);
    config
}

async fn expect_save(server: &MockServer, content: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path("/api/ai/save-msg"))
        .and(body_json(serde_json::json!({"chatId": "5", "content": content})))
        .respond_with(ResponseTemplate::new(200))
        .expect(times)
        .mount(server)
        .await;
}

// =============================================================================
// Chunked transport
// =============================================================================

#[tokio::test]
async fn test_chunked_reply_is_segmented_and_persisted_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ai/chat-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_string(REPLY))
        .expect(1)
        .mount(&server)
        .await;
    expect_save(&server, REPLY, 1).await;

    let controller = controller_for(&config_for(&server, TransportKind::Chunked));
    let mut session = Session::new("118", "5", UserId(1));

    let outcome = controller.send(&mut session, "show me js").await.unwrap();
    assert_eq!(outcome.state, LifecycleState::Finalized);
    assert_eq!(outcome.text, REPLY);
    outcome.persistence.unwrap().await.unwrap().unwrap();

    let message = session.log().get(&outcome.message_id).unwrap();
    let kinds: Vec<SegmentKind> = message.segments.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![SegmentKind::Prose, SegmentKind::Code, SegmentKind::Prose]
    );
    let rebuilt: String = message.segments.iter().map(|s| s.raw()).collect();
    assert_eq!(rebuilt, REPLY);
}

#[tokio::test]
async fn test_error_envelope_becomes_annotated_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ai/chat-stream"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"code":500,"msg":"quota exceeded"}"#),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/ai/save-msg"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let controller = controller_for(&config_for(&server, TransportKind::Chunked));
    let mut session = Session::new("118", "5", UserId(1));

    let outcome = controller.send(&mut session, "q").await.unwrap();
    assert_eq!(outcome.state, LifecycleState::Errored);
    assert_eq!(outcome.text, "Sorry, something went wrong:\nquota exceeded");
    assert!(!session.is_busy());
}

#[tokio::test]
async fn test_stop_during_slow_open_shows_marker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ai/chat-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("too late")
                .set_delay(std::time::Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let controller = controller_for(&config_for(&server, TransportKind::Chunked));
    let mut session = Session::new("118", "5", UserId(1));

    let reply = controller.submit(&mut session, "q").await.unwrap();
    let stop = reply.token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stop.cancel();
    });

    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        controller.drive(&mut session, reply),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(outcome.state, LifecycleState::Cancelled);
    assert_eq!(outcome.text, STOP_MARKER);
}

// =============================================================================
// Push transport
// =============================================================================

#[tokio::test]
async fn test_push_reply_with_progress_updates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sse/connect"))
        .and(query_param("userId", "4242"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "event: add\ndata: Hello\n\nevent: add\ndata:  world\n\nevent: finish\ndata: end\n\n",
            "text/event-stream",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/ai/chat-stream-v2"))
        .and(body_json(serde_json::json!({
            "projectId": "118",
            "chatId": "5",
            "userId": 4242,
            "language": "en",
            "msg": "greet me",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    expect_save(&server, "Hello world", 1).await;

    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    let controller =
        controller_for(&config_for(&server, TransportKind::Push)).with_updates(updates_tx);
    let mut session = Session::new("118", "5", UserId(4242));

    let outcome = controller.send(&mut session, "greet me").await.unwrap();
    assert_eq!(outcome.text, "Hello world");
    outcome.persistence.unwrap().await.unwrap().unwrap();

    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push((update.state, update.text));
    }
    assert_eq!(
        seen,
        vec![
            (LifecycleState::Thinking, "Thinking, please wait...".to_string()),
            (LifecycleState::Streaming, "Hello".to_string()),
            (LifecycleState::Streaming, "Hello world".to_string()),
            (LifecycleState::Finalized, "Hello world".to_string()),
        ]
    );
}

// =============================================================================
// History, configuration and identity
// =============================================================================

#[tokio::test]
async fn test_restored_session_continues_conversation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/ai/list-msg"))
        .and(query_param("chatId", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"content": "hi", "type": 0},
                {"content": "hello!", "type": 1},
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/ai/chat-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_string("again"))
        .mount(&server)
        .await;
    expect_save(&server, "again", 1).await;

    // Config file points at the fake backend
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        "[server]\nbase_url = \"{}\"\nproject_id = \"118\"\nchat_id = \"5\"\n",
        server.uri()
    )
    .unwrap();
    let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
    config.validate().unwrap();

    // Identity is stable across stores pointing at the same file
    let dir = TempDir::new().unwrap();
    let id_path = dir.path().join("user_id");
    let user_id = identity::load_or_create(&FileIdentityStore::new(&id_path))
        .await
        .unwrap();
    assert_eq!(
        identity::load_or_create(&FileIdentityStore::new(&id_path))
            .await
            .unwrap(),
        user_id
    );

    let chat_id = config.chat_id.clone().unwrap();
    let history = HttpBackend::new(&config.base_url)
        .list_messages(&chat_id)
        .await
        .unwrap();
    let mut session = Session::new(config.project_id.clone().unwrap(), chat_id, user_id);
    session.restore_history(history).unwrap();

    let outcome = controller_for(&config)
        .send(&mut session, "once more")
        .await
        .unwrap();
    outcome.persistence.unwrap().await.unwrap().unwrap();

    let log: Vec<(Sender, &str)> = session
        .log()
        .messages()
        .iter()
        .map(|m| (m.sender, m.text.as_str()))
        .collect();
    assert_eq!(
        log,
        vec![
            (Sender::User, "hi"),
            (Sender::Assistant, "hello!"),
            (Sender::User, "once more"),
            (Sender::Assistant, "again"),
        ]
    );
}
