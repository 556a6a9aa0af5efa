//! Wire transports for Central.
//!
//! Three runtimes are normalised behind one contract: an OpenAI-compatible
//! `chat/completions` endpoint speaking SSE, an Ollama daemon speaking
//! newline-delimited JSON on `/api/generate` and `/api/chat`, and a local
//! child-process runner fed a chat-template prompt on stdin. The transport
//! is picked from the URL shape at client construction time.

mod ndjson;
mod process;
mod sse;

pub use ndjson::NdjsonTransport;
pub use process::{ProcessTransport, discover_model_path, discover_runner};
pub use sse::SseTransport;

use async_trait::async_trait;
use serde_json::Value;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

/// Streaming sink: invoked synchronously, in wire order, with non-empty
/// chunks. No chunk is delivered after `send` returns.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Result of one request: the assistant text (None when the provider
/// produced no content) and the raw provider metadata, when available.
#[derive(Debug, Default)]
pub struct SendOutcome {
    pub text: Option<String>,
    pub meta: Option<Value>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unable to reach Central runtime at {target}: {detail}")]
    Unreachable { target: String, detail: String },

    #[error("HTTP {status} from {url}{hint}")]
    HttpStatus {
        status: u16,
        url: String,
        hint: String,
    },

    #[error("runtime at {url} returned a malformed response: {detail}")]
    BadResponse { url: String, detail: String },

    #[error("runtime error: {message}")]
    Upstream { message: String },

    #[error("local runner failed: {detail}")]
    Subprocess { detail: String },

    #[error("invalid runtime URL {url}: {detail}")]
    InvalidUrl { url: String, detail: String },
}

impl TransportError {
    pub(crate) fn http_status(status: u16, url: &str, body: &str) -> Self {
        let mut hint = match status {
            401 => ": unauthorized (set CENTRAL_LLM_API_KEY or OPENAI_API_KEY?)".to_string(),
            404 => ": endpoint not found (URL path invalid?)".to_string(),
            _ => String::new(),
        };
        let body = body.trim();
        if !body.is_empty() {
            let mut snippet: String = body.chars().take(512).collect();
            if snippet.len() < body.len() {
                snippet.push('…');
            }
            hint.push_str(&format!("\n{snippet}"));
        }
        Self::HttpStatus {
            status,
            url: url.to_string(),
            hint,
        }
    }

    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        Self::Unreachable {
            target: url.to_string(),
            detail: err.to_string(),
        }
    }
}

/// One provider-shaped request executor. Implementations block the calling
/// task for the duration of the exchange and drive `on_chunk` from it.
#[async_trait]
pub trait Transport: Send + Sync {
    fn url(&self) -> &str;

    async fn send(
        &self,
        payload: &Value,
        stream: bool,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<SendOutcome, TransportError>;
}

/// Pick a transport for `url`.
///
/// `process://` URLs (and only those) resolve the local runner binary; any
/// Ollama-style path gets the NDJSON codec; everything else is treated as an
/// OpenAI-compatible endpoint.
pub fn for_url(url: &str, api_key: Option<&str>) -> Result<Box<dyn Transport>, TransportError> {
    if url.starts_with("process://") {
        let runner = discover_runner().ok_or_else(|| TransportError::InvalidUrl {
            url: url.to_string(),
            detail: "local runner not found (build it or set NOX_LOCAL_RUNNER)".to_string(),
        })?;
        return Ok(Box::new(ProcessTransport::new(runner, discover_model_path())));
    }
    if url.contains("/api/generate") || url.contains("/api/chat") {
        return Ok(Box::new(NdjsonTransport::new(url, api_key)));
    }
    Ok(Box::new(SseTransport::new(url, api_key)))
}

/// TCP pre-flight against the endpoint's host and port.
///
/// Distinguishes "nothing listening" from any protocol-level failure; no
/// bytes are exchanged. Process URLs are trivially reachable.
pub fn probe_endpoint(url: &str, timeout: Duration) -> Result<(), TransportError> {
    if url.starts_with("process://") {
        return Ok(());
    }

    let parsed = reqwest::Url::parse(url).map_err(|e| TransportError::InvalidUrl {
        url: url.to_string(),
        detail: e.to_string(),
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl {
            url: url.to_string(),
            detail: "no host".to_string(),
        })?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .unwrap_or(if parsed.scheme() == "https" { 443 } else { 80 });

    let target = format!("{host}:{port}");
    let addrs: Vec<_> = target
        .to_socket_addrs()
        .map_err(|e| TransportError::Unreachable {
            target: target.clone(),
            detail: e.to_string(),
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(e) => last_error = Some(e),
        }
    }
    Err(TransportError::Unreachable {
        target,
        detail: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses resolved".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_hints_for_auth_and_path_errors() {
        let unauthorized = TransportError::http_status(401, "http://x/v1", "");
        assert!(unauthorized.to_string().contains("unauthorized"));
        assert!(unauthorized.to_string().contains("OPENAI_API_KEY"));

        let missing = TransportError::http_status(404, "http://x/v1", "");
        assert!(missing.to_string().contains("endpoint not found"));

        let server = TransportError::http_status(500, "http://x/v1", "boom");
        assert!(server.to_string().contains("500"));
        assert!(server.to_string().contains("boom"));
    }

    #[test]
    fn probe_rejects_url_without_host() {
        let err = probe_endpoint("http://", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
    }

    #[test]
    fn probe_reports_closed_port_as_unreachable() {
        // Port 1 on localhost is essentially never bound.
        let err = probe_endpoint("http://127.0.0.1:1/api/chat", Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[test]
    fn probe_accepts_process_urls_without_network() {
        probe_endpoint("process://runner", Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn selection_follows_url_shape() {
        let ndjson = for_url("http://127.0.0.1:11434/api/chat", None).unwrap();
        assert_eq!(ndjson.url(), "http://127.0.0.1:11434/api/chat");

        let sse = for_url("https://api.openai.com/v1/chat/completions", Some("sk-test")).unwrap();
        assert_eq!(sse.url(), "https://api.openai.com/v1/chat/completions");
    }
}
