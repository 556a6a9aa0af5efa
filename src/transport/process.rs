//! Local runner transport: a child process fed a chat-template prompt on
//! stdin, streaming raw tokens on stdout.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{ChunkSink, SendOutcome, Transport, TransportError};

const DEFAULT_MAX_TOKENS: u64 = 256;
const DEFAULT_CTX: u64 = 1024;
const DEFAULT_BATCH: u64 = 32;

pub struct ProcessTransport {
    binary: PathBuf,
    model_path: Option<PathBuf>,
    url: String,
}

impl ProcessTransport {
    pub fn new(binary: PathBuf, model_path: Option<PathBuf>) -> Self {
        Self {
            binary,
            model_path,
            url: "process://runner".to_string(),
        }
    }

    fn build_args(&self, options: &Value) -> Vec<String> {
        let max_tokens = positive_or(options.get("num_predict"), DEFAULT_MAX_TOKENS);
        let ctx = positive_or(options.get("num_ctx"), DEFAULT_CTX);
        let batch = positive_or(options.get("num_batch"), DEFAULT_BATCH);

        let mut args = vec![
            "-raw".to_string(),
            "-max-tokens".to_string(),
            max_tokens.to_string(),
            "-ctx".to_string(),
            ctx.to_string(),
            "-batch".to_string(),
            batch.to_string(),
        ];
        if let Some(temperature) = options.get("temperature").and_then(Value::as_f64) {
            args.push("-temp".to_string());
            args.push(temperature.to_string());
        }
        if let Some(ref model) = self.model_path {
            args.push("-model".to_string());
            args.push(model.display().to_string());
        }
        args
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn send(
        &self,
        payload: &Value,
        stream: bool,
        mut on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<SendOutcome, TransportError> {
        let prompt = payload_to_prompt(payload);
        if prompt.is_empty() {
            return Err(TransportError::BadResponse {
                url: self.url.clone(),
                detail: "no prompt content for the local runner".to_string(),
            });
        }

        let empty = Value::Null;
        let options = payload.get("options").unwrap_or(&empty);
        let args = self.build_args(options);
        debug!(binary = %self.binary.display(), ?args, "spawning local runner");

        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(threads) = options.get("num_thread").and_then(Value::as_u64) {
            command.env("NOX_NUM_THREADS", threads.to_string());
        }

        let mut child = command.spawn().map_err(|e| TransportError::Subprocess {
            detail: format!("failed to launch {}: {e}", self.binary.display()),
        })?;

        let mut stdin = child.stdin.take().ok_or_else(|| TransportError::Subprocess {
            detail: "runner stdin unavailable".to_string(),
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| TransportError::Subprocess {
            detail: "runner stdout unavailable".to_string(),
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| TransportError::Subprocess {
            detail: "runner stderr unavailable".to_string(),
        })?;

        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(|e| TransportError::Subprocess {
                detail: format!("failed to write prompt: {e}"),
            })?;
        drop(stdin);

        // Drain stderr concurrently so a chatty runner cannot deadlock on a
        // full pipe; stdout chunks stay on the calling task.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut acc = String::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut read_buf = [0u8; 4096];
        loop {
            let n = stdout
                .read(&mut read_buf)
                .await
                .map_err(|e| TransportError::Subprocess {
                    detail: format!("failed to read runner output: {e}"),
                })?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&read_buf[..n]);
            let consumed = decodable_utf8_prefix(&pending);
            if consumed == 0 {
                continue;
            }
            let piece: String = String::from_utf8_lossy(&pending[..consumed]).into_owned();
            pending.drain(..consumed);
            if stream
                && let Some(cb) = on_chunk.as_deref_mut()
            {
                cb(&piece);
            }
            acc.push_str(&piece);
        }
        if !pending.is_empty() {
            let piece = String::from_utf8_lossy(&pending).into_owned();
            if stream
                && let Some(cb) = on_chunk.as_deref_mut()
            {
                cb(&piece);
            }
            acc.push_str(&piece);
        }

        let stderr_text = stderr_task.await.unwrap_or_default();
        let status = child.wait().await.map_err(|e| TransportError::Subprocess {
            detail: format!("failed to wait for runner: {e}"),
        })?;
        if !status.success() {
            let detail = if stderr_text.trim().is_empty() {
                acc.clone()
            } else {
                stderr_text.trim().to_string()
            };
            return Err(TransportError::Subprocess {
                detail: format!("exit {}: {detail}", status.code().unwrap_or(-1)),
            });
        }

        Ok(SendOutcome {
            text: Some(acc),
            meta: Some(serde_json::json!({ "stderr": stderr_text })),
        })
    }
}

/// Locate the runner binary: `NOX_LOCAL_RUNNER`, then `bin/runner` next to
/// the working directory.
pub fn discover_runner() -> Option<PathBuf> {
    if let Ok(raw) = std::env::var("NOX_LOCAL_RUNNER") {
        let candidate = PathBuf::from(shellexpand::tilde(&raw).into_owned());
        if candidate.exists() {
            return Some(candidate);
        }
    }
    let local = PathBuf::from("bin/runner");
    if local.exists() {
        return Some(local);
    }
    None
}

/// Locate the model weights: `NOX_MODEL_PATH`, then the packaged default.
pub fn discover_model_path() -> Option<PathBuf> {
    if let Ok(raw) = std::env::var("NOX_MODEL_PATH") {
        let candidate = PathBuf::from(shellexpand::tilde(&raw).into_owned());
        if candidate.exists() {
            return Some(candidate);
        }
    }
    let default = PathBuf::from("assets/models/central.gguf");
    if default.exists() {
        return Some(default);
    }
    None
}

/// Render a payload into the runner's prompt: chat-template blocks from
/// `messages` when present, else the `prompt`/`system` pair.
fn payload_to_prompt(payload: &Value) -> String {
    if let Some(messages) = payload["messages"].as_array()
        && !messages.is_empty()
    {
        let mut blocks: Vec<String> = Vec::new();
        for message in messages {
            let role = message["role"].as_str().unwrap_or("user").trim();
            let role = if role.is_empty() { "user" } else { role };
            let content = flatten_content(&message["content"]);
            let content = content.trim();
            if content.is_empty() {
                continue;
            }
            blocks.push(format!("<|im_start|>{role}\n{content}\n<|im_end|>"));
        }
        if blocks.is_empty() {
            return String::new();
        }
        blocks.push("<|im_start|>assistant\n".to_string());
        return blocks.join("\n");
    }

    let prompt = payload["prompt"].as_str().unwrap_or("").trim();
    if prompt.is_empty() {
        return String::new();
    }
    let system = payload["system"].as_str().unwrap_or("").trim();
    if system.is_empty() {
        return prompt.to_string();
    }
    format!(
        "<|im_start|>system\n{system}\n<|im_end|>\n<|im_start|>user\n{prompt}\n<|im_end|>\n<|im_start|>assistant\n"
    )
}

/// List-typed content (OpenAI parts) flattens to its text fields.
fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(map) => map
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| item.to_string()),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Longest prefix of `bytes` safe to decode now. A trailing incomplete
/// multi-byte sequence is carried until more bytes arrive; an outright
/// invalid sequence is consumed (and replaced lossily) so the stream never
/// stalls on it.
fn decodable_utf8_prefix(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) => match e.error_len() {
            Some(bad) => e.valid_up_to() + bad,
            None => e.valid_up_to(),
        },
    }
}

fn positive_or(value: Option<&Value>, default: u64) -> u64 {
    value
        .and_then(Value::as_i64)
        .filter(|v| *v > 0)
        .map(|v| v as u64)
        .unwrap_or(default)
}
