//! OpenAI-style HTTP transport with SSE streaming.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::{ChunkSink, SendOutcome, Transport, TransportError};

pub struct SseTransport {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl SseTransport {
    pub fn new(url: &str, api_key: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
            api_key: api_key.map(|k| k.to_string()),
        }
    }

    fn request(&self, payload: &Value, stream: bool) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(payload);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        if stream {
            req = req.header("Accept", "text/event-stream");
        }
        req
    }

    async fn send_once(&self, payload: &Value) -> Result<SendOutcome, TransportError> {
        let response = self
            .request(payload, false)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&self.url, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::from_reqwest(&self.url, e))?;
        if !status.is_success() {
            return Err(TransportError::http_status(status.as_u16(), &self.url, &body));
        }

        let parsed: Value =
            serde_json::from_str(&body).map_err(|e| TransportError::BadResponse {
                url: self.url.clone(),
                detail: format!("non-JSON body: {e}"),
            })?;

        let text = parsed["choices"]
            .get(0)
            .and_then(extract_choice_text)
            .map(|s| s.to_string());
        Ok(SendOutcome {
            text,
            meta: Some(parsed),
        })
    }

    async fn send_streaming(
        &self,
        payload: &Value,
        mut on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<SendOutcome, TransportError> {
        let response = self
            .request(payload, true)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&self.url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::http_status(status.as_u16(), &self.url, &body));
        }

        let mut byte_stream = response.bytes_stream();
        let mut line_buffer: Vec<u8> = Vec::new();
        let mut parser = SseParser::default();
        let mut acc = String::new();
        let mut finished = false;

        'read: while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.map_err(|e| TransportError::Unreachable {
                target: self.url.clone(),
                detail: format!("stream error: {e}"),
            })?;
            line_buffer.extend_from_slice(&bytes);

            while let Some(newline) = line_buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = line_buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&raw);
                match parser.feed_line(line.trim_end_matches(['\r', '\n'])) {
                    SseEvent::None => {}
                    SseEvent::Done => {
                        finished = true;
                        break 'read;
                    }
                    SseEvent::Piece(piece) => {
                        if !piece.is_empty() {
                            if let Some(cb) = on_chunk.as_deref_mut() {
                                cb(&piece);
                            }
                            acc.push_str(&piece);
                        }
                    }
                }
            }
        }

        // Flush a final event that was not terminated by a blank line.
        if !finished {
            if !line_buffer.is_empty() {
                let line = String::from_utf8_lossy(&line_buffer).to_string();
                parser.feed_line(line.trim_end_matches(['\r', '\n']));
            }
            if let SseEvent::Piece(piece) = parser.flush()
                && !piece.is_empty()
            {
                if let Some(cb) = on_chunk.as_deref_mut() {
                    cb(&piece);
                }
                acc.push_str(&piece);
            }
        }

        debug!(chars = acc.len(), "SSE stream complete");
        Ok(SendOutcome {
            text: Some(acc),
            meta: None,
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn send(
        &self,
        payload: &Value,
        stream: bool,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<SendOutcome, TransportError> {
        if stream {
            self.send_streaming(payload, on_chunk).await
        } else {
            self.send_once(payload).await
        }
    }
}

enum SseEvent {
    None,
    Done,
    Piece(String),
}

/// Line-level SSE framing: `data:` lines accumulate until a blank line
/// terminates the event; `:` comments and unknown field names are ignored.
#[derive(Default)]
struct SseParser {
    data_lines: Vec<String>,
}

impl SseParser {
    fn feed_line(&mut self, line: &str) -> SseEvent {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return SseEvent::None;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        SseEvent::None
    }

    fn flush(&mut self) -> SseEvent {
        if self.data_lines.is_empty() {
            return SseEvent::None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        let data = data.trim();
        if data.is_empty() {
            return SseEvent::None;
        }
        if data == "[DONE]" {
            return SseEvent::Done;
        }
        match extract_sse_piece(data) {
            Some(piece) => SseEvent::Piece(piece),
            None => SseEvent::None,
        }
    }
}

/// Content of one SSE event: `choices[0].delta.content`, then
/// `choices[0].message.content`, then `choices[0].text`. Plain non-JSON data
/// passes through as-is (some proxies emit raw text events).
fn extract_sse_piece(data: &str) -> Option<String> {
    let event: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => {
            if !data.starts_with('{') {
                return Some(data.to_string());
            }
            return None;
        }
    };
    event["choices"]
        .get(0)
        .and_then(extract_choice_text)
        .map(|s| s.to_string())
}

fn extract_choice_text(choice: &Value) -> Option<&str> {
    choice["delta"]["content"]
        .as_str()
        .or_else(|| choice["message"]["content"].as_str())
        .or_else(|| choice["text"].as_str())
}
