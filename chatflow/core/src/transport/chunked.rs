//! Chunked HTTP Transport
//!
//! `POST /api/ai/chat-stream` whose response body is the reply itself,
//! delivered in arbitrary chunks.
//!
//! The body passes through three stages before it becomes [`StreamEvent`]s:
//!
//! 1. UTF-8 decoding that holds back a multi-byte character split across
//!    reads
//! 2. an error-envelope peek: a body that starts with `{` is buffered until
//!    it parses, so `{"code": 500, "msg": "..."}` surfaces as an application
//!    failure instead of reply text
//! 3. framing: raw text, or OpenAI-style `data:` lines

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EventStream, StreamEvent, StreamGuard, StreamRequest, TransportAdapter};
use crate::cancel::CancelToken;
use crate::error::StreamFailure;

/// Send endpoint, relative to the base URL
pub const CHAT_STREAM_PATH: &str = "/api/ai/chat-stream";

/// Maximum bytes buffered while deciding whether the body is an error envelope
pub const DEFAULT_PEEK_LIMIT: usize = 4096;

/// How the response body encodes reply text
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkFraming {
    /// The body is the reply text
    #[default]
    Raw,
    /// Newline-delimited `data: {...}` lines with `choices[0].delta.content`
    DataLines,
}

/// Chunked-stream adapter
#[derive(Clone, Debug)]
pub struct ChunkedTransport {
    client: reqwest::Client,
    base_url: String,
    framing: ChunkFraming,
    peek_limit: usize,
}

impl ChunkedTransport {
    /// Create an adapter for the backend at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create an adapter sharing an existing HTTP client
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            framing: ChunkFraming::Raw,
            peek_limit: DEFAULT_PEEK_LIMIT,
        }
    }

    /// Set the body framing
    #[must_use]
    pub fn with_framing(mut self, framing: ChunkFraming) -> Self {
        self.framing = framing;
        self
    }

    /// Set the error-envelope peek limit
    #[must_use]
    pub fn with_peek_limit(mut self, limit: usize) -> Self {
        self.peek_limit = limit;
        self
    }

    /// Full send endpoint URL
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, CHAT_STREAM_PATH)
    }
}

impl TransportAdapter for ChunkedTransport {
    fn name(&self) -> &'static str {
        "chunked"
    }

    fn open(&self, request: StreamRequest, token: CancelToken) -> EventStream {
        let client = self.client.clone();
        let url = self.endpoint();
        let mut decoder = BodyDecoder::new(self.framing, self.peek_limit);

        Box::pin(async_stream::stream! {
            let mut guard = StreamGuard::new("chunked");

            let sent = token
                .run_until_cancelled(client.post(&url).json(&request).send())
                .await;
            let response = match sent {
                None => return,
                Some(Ok(response)) => response,
                Some(Err(e)) => {
                    guard.complete();
                    yield StreamEvent::Failed(StreamFailure::Open(e.to_string()));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let Some(body) = token.run_until_cancelled(response.text()).await else {
                    return;
                };
                let body = body.unwrap_or_default();
                guard.complete();
                yield StreamEvent::Failed(StreamFailure::Open(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    body.trim()
                )));
                return;
            }

            tracing::debug!(url = %url, "Chunked reply stream opened");
            yield StreamEvent::Opened;

            let mut body = response.bytes_stream();
            loop {
                let Some(next) = token.run_until_cancelled(body.next()).await else {
                    return;
                };
                let events = match next {
                    Some(Ok(bytes)) => decoder.push(&bytes),
                    Some(Err(e)) => vec![StreamEvent::Failed(StreamFailure::MidStream(
                        e.to_string(),
                    ))],
                    None => decoder.finish(),
                };
                for event in events {
                    let terminal = event.is_terminal();
                    if terminal {
                        guard.complete();
                    }
                    yield event;
                    if terminal {
                        return;
                    }
                }
            }
        })
    }
}

// ============================================================================
// Body decoding
// ============================================================================

/// Turns raw body bytes into stream events
#[derive(Debug)]
struct BodyDecoder {
    utf8: Utf8Decoder,
    peek: EnvelopePeek,
    framing: ChunkFraming,
    /// Incomplete `data:` line
    line: String,
    done: bool,
}

impl BodyDecoder {
    fn new(framing: ChunkFraming, peek_limit: usize) -> Self {
        Self {
            utf8: Utf8Decoder::default(),
            peek: EnvelopePeek::new(peek_limit),
            framing,
            line: String::new(),
            done: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        let text = match self.utf8.push(bytes) {
            Ok(text) => text,
            Err(reason) => return self.fail(StreamFailure::MidStream(reason)),
        };
        match self.peek.push(&text) {
            Ok(Some(text)) => self.frame(&text),
            Ok(None) => Vec::new(),
            Err(failure) => self.fail(failure),
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        if let Err(reason) = self.utf8.finish() {
            return self.fail(StreamFailure::MidStream(reason));
        }

        let mut events = match self.peek.finish() {
            Ok(Some(text)) => self.frame(&text),
            Ok(None) => Vec::new(),
            Err(failure) => return self.fail(failure),
        };
        if self.done {
            return events;
        }

        if self.framing == ChunkFraming::DataLines && !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            if let Some(event) = self.data_line(&line) {
                events.push(event);
            }
        }
        if !self.done {
            self.done = true;
            events.push(StreamEvent::Finished);
        }
        events
    }

    fn fail(&mut self, failure: StreamFailure) -> Vec<StreamEvent> {
        self.done = true;
        vec![StreamEvent::Failed(failure)]
    }

    fn frame(&mut self, text: &str) -> Vec<StreamEvent> {
        match self.framing {
            ChunkFraming::Raw if text.is_empty() => Vec::new(),
            ChunkFraming::Raw => vec![StreamEvent::Chunk(text.to_string())],
            ChunkFraming::DataLines => {
                self.line.push_str(text);
                let mut events = Vec::new();
                while let Some(pos) = self.line.find('\n') {
                    let line: String = self.line.drain(..=pos).collect();
                    if let Some(event) = self.data_line(&line) {
                        events.push(event);
                    }
                    if self.done {
                        break;
                    }
                }
                events
            }
        }
    }

    fn data_line(&mut self, line: &str) -> Option<StreamEvent> {
        let payload = line
            .trim_end_matches(['\r', '\n'])
            .strip_prefix("data:")?
            .trim();
        if payload == "[DONE]" {
            self.done = true;
            return Some(StreamEvent::Finished);
        }
        if payload.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => value
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .filter(|content| !content.is_empty())
                .map(|content| StreamEvent::Chunk(content.to_string())),
            Err(_) => Some(StreamEvent::Chunk(payload.to_string())),
        }
    }
}

/// Incremental UTF-8 decoder
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode as much as possible, holding back an incomplete trailing sequence
    fn push(&mut self, bytes: &[u8]) -> Result<String, String> {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                Ok(text)
            }
            Err(e) if e.error_len().is_some() => Err(format!(
                "invalid UTF-8 in reply body after {} bytes",
                e.valid_up_to()
            )),
            Err(e) => {
                let valid: Vec<u8> = self.pending.drain(..e.valid_up_to()).collect();
                Ok(String::from_utf8_lossy(&valid).into_owned())
            }
        }
    }

    fn finish(&self) -> Result<(), String> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err("reply body ended inside a UTF-8 sequence".to_string())
        }
    }
}

/// Holds back a leading `{...}` until it is known not to be an error envelope
#[derive(Debug)]
struct EnvelopePeek {
    buffer: String,
    limit: usize,
    released: bool,
}

impl EnvelopePeek {
    fn new(limit: usize) -> Self {
        Self {
            buffer: String::new(),
            limit,
            released: false,
        }
    }

    fn push(&mut self, text: &str) -> Result<Option<String>, StreamFailure> {
        if self.released {
            return Ok(Some(text.to_string()));
        }
        self.buffer.push_str(text);

        let trimmed = self.buffer.trim_start();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if !trimmed.starts_with('{') {
            return Ok(Some(self.release()));
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => match envelope_error(&value) {
                Some(msg) => Err(StreamFailure::Application(msg)),
                None => Ok(Some(self.release())),
            },
            Err(e) if e.is_eof() && self.buffer.len() < self.limit => Ok(None),
            Err(_) => Ok(Some(self.release())),
        }
    }

    fn finish(&mut self) -> Result<Option<String>, StreamFailure> {
        if self.released || self.buffer.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.release()))
    }

    fn release(&mut self) -> String {
        self.released = true;
        std::mem::take(&mut self.buffer)
    }
}

/// Extract the message of a `{"code": >=400, "msg": ...}` envelope
fn envelope_error(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    let code = match object.get("code")? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse::<i64>().ok()?,
        _ => return None,
    };
    if code < 400 {
        return None;
    }
    let msg = object
        .get("msg")
        .or_else(|| object.get("message"))
        .and_then(Value::as_str)
        .filter(|msg| !msg.trim().is_empty())
        .unwrap_or("internal server error");
    tracing::debug!(code, msg, "Reply body is an error envelope");
    Some(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UserId;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chunks(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn request() -> StreamRequest {
        StreamRequest {
            project_id: "118".to_string(),
            chat_id: "5".to_string(),
            user_id: UserId(4242),
            language: "en".to_string(),
            msg: "hello".to_string(),
        }
    }

    #[test]
    fn test_split_utf8_sequence_is_held_back() {
        let mut decoder = BodyDecoder::new(ChunkFraming::Raw, DEFAULT_PEEK_LIMIT);
        let bytes = "héllo 🌍".as_bytes();

        let mut events = Vec::new();
        for byte in bytes {
            events.extend(decoder.push(std::slice::from_ref(byte)));
        }
        events.extend(decoder.finish());

        assert_eq!(chunks(&events), "héllo 🌍");
        assert_eq!(events.last(), Some(&StreamEvent::Finished));
    }

    #[test]
    fn test_invalid_utf8_is_mid_stream_failure() {
        let mut decoder = BodyDecoder::new(ChunkFraming::Raw, DEFAULT_PEEK_LIMIT);
        let events = decoder.push(&[b'o', b'k', 0xff, b'x']);
        assert!(matches!(
            events.as_slice(),
            [StreamEvent::Failed(StreamFailure::MidStream(_))]
        ));
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_truncated_utf8_at_end_fails() {
        let mut decoder = BodyDecoder::new(ChunkFraming::Raw, DEFAULT_PEEK_LIMIT);
        let euro = "€".as_bytes();
        assert!(decoder.push(&euro[..2]).is_empty());
        assert!(matches!(
            decoder.finish().as_slice(),
            [StreamEvent::Failed(StreamFailure::MidStream(_))]
        ));
    }

    #[test]
    fn test_error_envelope_split_across_chunks() {
        let mut decoder = BodyDecoder::new(ChunkFraming::Raw, DEFAULT_PEEK_LIMIT);
        assert!(decoder.push(br#"{"code": 5"#).is_empty());
        let events = decoder.push(br#"00, "msg": "model overloaded"}"#);
        assert_eq!(
            events,
            vec![StreamEvent::Failed(StreamFailure::Application(
                "model overloaded".to_string()
            ))]
        );
    }

    #[test]
    fn test_json_reply_without_error_code_is_content() {
        let mut decoder = BodyDecoder::new(ChunkFraming::Raw, DEFAULT_PEEK_LIMIT);
        let mut events = decoder.push(br#"{"code": 200, "#);
        events.extend(decoder.push(br#""msg": "ok"} and more"#));
        events.extend(decoder.finish());
        assert_eq!(chunks(&events), r#"{"code": 200, "msg": "ok"} and more"#);
    }

    #[test]
    fn test_brace_prose_released_at_end() {
        let mut decoder = BodyDecoder::new(ChunkFraming::Raw, DEFAULT_PEEK_LIMIT);
        let mut events = decoder.push(br#"{"unfinished"#);
        assert!(events.is_empty());
        events.extend(decoder.finish());
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk(r#"{"unfinished"#.to_string()),
                StreamEvent::Finished
            ]
        );
    }

    #[test]
    fn test_peek_limit_releases_buffer() {
        let mut decoder = BodyDecoder::new(ChunkFraming::Raw, 8);
        let events = decoder.push(b"{\"a\": \"long value");
        assert_eq!(chunks(&events), "{\"a\": \"long value");
    }

    #[test]
    fn test_data_lines_framing() {
        let mut decoder = BodyDecoder::new(ChunkFraming::DataLines, DEFAULT_PEEK_LIMIT);
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\r\n",
            "data: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
        );
        let (first, second) = body.split_at(30);

        let mut events = decoder.push(first.as_bytes());
        events.extend(decoder.push(second.as_bytes()));
        events.extend(decoder.finish());

        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk("Hel".to_string()),
                StreamEvent::Chunk("lo".to_string()),
                StreamEvent::Finished,
            ]
        );
    }

    #[test]
    fn test_data_lines_passes_plain_payload_through() {
        let mut decoder = BodyDecoder::new(ChunkFraming::DataLines, DEFAULT_PEEK_LIMIT);
        let mut events = decoder.push(b"data: plain text\ndata: tail");
        events.extend(decoder.finish());
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk("plain text".to_string()),
                StreamEvent::Chunk("tail".to_string()),
                StreamEvent::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn test_streams_reply_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT_STREAM_PATH))
            .and(body_json(serde_json::json!({
                "projectId": "118",
                "chatId": "5",
                "userId": 4242,
                "language": "en",
                "msg": "hello",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("Hello world"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ChunkedTransport::new(server.uri());
        let events: Vec<StreamEvent> = transport
            .open(request(), CancelToken::new())
            .collect()
            .await;

        assert_eq!(events.first(), Some(&StreamEvent::Opened));
        assert_eq!(chunks(&events), "Hello world");
        assert_eq!(events.last(), Some(&StreamEvent::Finished));
    }

    #[tokio::test]
    async fn test_error_status_is_open_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT_STREAM_PATH))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let events: Vec<StreamEvent> = ChunkedTransport::new(server.uri())
            .open(request(), CancelToken::new())
            .collect()
            .await;

        assert_eq!(
            events,
            vec![StreamEvent::Failed(StreamFailure::Open(
                "HTTP 502: bad gateway".to_string()
            ))]
        );
    }

    #[tokio::test]
    async fn test_error_envelope_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT_STREAM_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"code":500,"msg":"quota exceeded"}"#),
            )
            .mount(&server)
            .await;

        let events: Vec<StreamEvent> = ChunkedTransport::new(server.uri())
            .open(request(), CancelToken::new())
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Opened,
                StreamEvent::Failed(StreamFailure::Application("quota exceeded".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_open_failure() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let events: Vec<StreamEvent> = ChunkedTransport::new(uri)
            .open(request(), CancelToken::new())
            .collect()
            .await;

        assert!(matches!(
            events.as_slice(),
            [StreamEvent::Failed(StreamFailure::Open(_))]
        ));
    }

    #[tokio::test]
    async fn test_cancelled_token_ends_without_terminal_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(std::time::Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let token = CancelToken::new();
        let mut stream = ChunkedTransport::new(server.uri()).open(request(), token.clone());

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let next = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .unwrap();
        assert_eq!(next, None);
    }
}
