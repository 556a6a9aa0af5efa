//! Ollama HTTP transport (`/api/generate` and `/api/chat`), NDJSON framed.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::{ChunkSink, SendOutcome, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Generate,
    Chat,
}

pub struct NdjsonTransport {
    client: Client,
    url: String,
    api_key: Option<String>,
    mode: Mode,
}

impl NdjsonTransport {
    pub fn new(url: &str, api_key: Option<&str>) -> Self {
        let mode = if url.contains("/api/generate") {
            Mode::Generate
        } else {
            Mode::Chat
        };
        Self {
            client: Client::new(),
            url: url.to_string(),
            api_key: api_key.map(|k| k.to_string()),
            mode,
        }
    }

    /// The canonical payload carries both chat messages and a rendered
    /// prompt; each endpoint accepts only its own shape.
    fn shape_payload(&self, payload: &Value) -> Value {
        let mut shaped = payload.clone();
        if let Some(object) = shaped.as_object_mut() {
            match self.mode {
                Mode::Generate => {
                    object.remove("messages");
                }
                Mode::Chat => {
                    object.remove("prompt");
                    object.remove("system");
                }
            }
        }
        shaped
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, TransportError> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(payload);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let response = req
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&self.url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::http_status(status.as_u16(), &self.url, &body));
        }
        Ok(response)
    }

    async fn send_once(&self, payload: &Value) -> Result<SendOutcome, TransportError> {
        let response = self.post(payload).await?;
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::from_reqwest(&self.url, e))?;

        let parsed: Value =
            serde_json::from_str(&body).map_err(|e| TransportError::BadResponse {
                url: self.url.clone(),
                detail: format!("non-JSON body: {e}"),
            })?;

        check_upstream_error(&parsed)?;
        let text = extract_line_text(&parsed).map(|s| s.to_string());
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
        let response = self.post(payload).await?;
        let mut byte_stream = response.bytes_stream();
        let mut line_buffer: Vec<u8> = Vec::new();
        let mut acc = String::new();
        let mut done = false;

        'read: while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.map_err(|e| TransportError::Unreachable {
                target: self.url.clone(),
                detail: format!("stream error: {e}"),
            })?;
            line_buffer.extend_from_slice(&bytes);

            while let Some(newline) = line_buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = line_buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&raw);
                if consume_line(line.trim(), &mut acc, &mut on_chunk)? {
                    done = true;
                    break 'read;
                }
            }
        }

        if !done && !line_buffer.is_empty() {
            let line = String::from_utf8_lossy(&line_buffer).to_string();
            consume_line(line.trim(), &mut acc, &mut on_chunk)?;
        }

        debug!(chars = acc.len(), "NDJSON stream complete");
        Ok(SendOutcome {
            text: Some(acc),
            meta: None,
        })
    }
}

#[async_trait]
impl Transport for NdjsonTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn send(
        &self,
        payload: &Value,
        stream: bool,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<SendOutcome, TransportError> {
        let shaped = self.shape_payload(payload);
        if stream {
            self.send_streaming(&shaped, on_chunk).await
        } else {
            self.send_once(&shaped).await
        }
    }
}

/// Process one NDJSON line; returns `Ok(true)` once the object carries
/// `done=true`. Unparseable lines are skipped.
fn consume_line(
    line: &str,
    acc: &mut String,
    on_chunk: &mut Option<ChunkSink<'_>>,
) -> Result<bool, TransportError> {
    if line.is_empty() {
        return Ok(false);
    }
    let Ok(object) = serde_json::from_str::<Value>(line) else {
        return Ok(false);
    };
    check_upstream_error(&object)?;
    if let Some(text) = extract_line_text(&object)
        && !text.is_empty()
    {
        if let Some(cb) = on_chunk.as_deref_mut() {
            cb(text);
        }
        acc.push_str(text);
    }
    Ok(object["done"].as_bool().unwrap_or(false))
}

fn check_upstream_error(object: &Value) -> Result<(), TransportError> {
    match object.get("error") {
        None | Some(Value::Null) => Ok(()),
        Some(Value::String(message)) => Err(TransportError::Upstream {
            message: message.clone(),
        }),
        Some(other) => Err(TransportError::Upstream {
            message: other.to_string(),
        }),
    }
}

/// `message.content` (chat endpoint) or `response` (generate endpoint).
fn extract_line_text(object: &Value) -> Option<&str> {
    object["message"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .or_else(|| object["response"].as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mode_follows_url_path() {
        let generate = NdjsonTransport::new("http://127.0.0.1:11434/api/generate", None);
        assert_eq!(generate.mode, Mode::Generate);
        let chat = NdjsonTransport::new("http://127.0.0.1:11434/api/chat", None);
        assert_eq!(chat.mode, Mode::Chat);
    }

    #[test]
    fn generate_payload_drops_messages() {
        let transport = NdjsonTransport::new("http://127.0.0.1:11434/api/generate", None);
        let payload = json!({
            "model": "m",
            "prompt": "p",
            "system": "s",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let shaped = transport.shape_payload(&payload);
        assert!(shaped.get("messages").is_none());
        assert_eq!(shaped["prompt"], "p");
        assert_eq!(shaped["system"], "s");
    }

    #[test]
    fn chat_payload_drops_prompt_and_system() {
        let transport = NdjsonTransport::new("http://127.0.0.1:11434/api/chat", None);
        let payload = json!({
            "model": "m",
            "prompt": "p",
            "system": "s",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let shaped = transport.shape_payload(&payload);
        assert!(shaped.get("prompt").is_none());
        assert!(shaped.get("system").is_none());
        assert_eq!(shaped["messages"][0]["content"], "hi");
    }

    #[test]
    fn streaming_lines_accumulate_until_done() {
        let mut acc = String::new();
        let mut chunks: Vec<String> = Vec::new();
        let mut cb = |piece: &str| chunks.push(piece.to_string());
        let mut sink: Option<ChunkSink<'_>> = Some(&mut cb);

        let lines = [
            r#"{"message":{"content":"Hel"},"done":false}"#,
            r#"{"message":{"content":"lo"},"done":false}"#,
            "not json",
            r#"{"message":{"content":""},"done":true}"#,
        ];
        let mut finished = false;
        for line in lines {
            if consume_line(line, &mut acc, &mut sink).unwrap() {
                finished = true;
                break;
            }
        }
        assert!(finished);
        assert_eq!(acc, "Hello");
        assert_eq!(chunks, vec!["Hel", "lo"]);
    }

    #[test]
    fn generate_response_field_is_read() {
        let mut acc = String::new();
        let mut sink: Option<ChunkSink<'_>> = None;
        consume_line(r#"{"response":"ok","done":true}"#, &mut acc, &mut sink).unwrap();
        assert_eq!(acc, "ok");
    }

    #[test]
    fn error_field_aborts_with_upstream_error() {
        let mut acc = String::new();
        let mut sink: Option<ChunkSink<'_>> = None;
        let err =
            consume_line(r#"{"error":"model not loaded"}"#, &mut acc, &mut sink).unwrap_err();
        assert!(matches!(err, TransportError::Upstream { .. }));
        assert!(err.to_string().contains("model not loaded"));
    }

    #[test]
    fn non_streaming_extraction_prefers_message_content() {
        let object = json!({"message":{"role":"assistant","content":"hi"},"done":true});
        assert_eq!(extract_line_text(&object), Some("hi"));

        let object = json!({"response":"gen","done":true});
        assert_eq!(extract_line_text(&object), Some("gen"));
    }
}
