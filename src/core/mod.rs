//! The Central chat client.
//!
//! A [`ChatClient`] owns the in-memory conversation, shapes provider
//! payloads, runs turns over its transport, strips hidden reasoning from
//! what comes back, and records finished turns through its session logger.
//! One client is driven by one caller; nothing here spawns background work.

pub mod instrument;
pub mod payload;
pub mod persona;
pub mod reasoning;

pub use instrument::{
    Instrument, InstrumentReply, load_instrument_prompt, reload_instrument_prompt,
};
pub use persona::{Persona, resolve_persona};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::{self, SessionLogger, SessionMeta};
use crate::transport::{self, ChunkSink, Transport};
use reasoning::{ReasoningFilter, clean_public_reply, strip_chain_of_thought};

/// Default endpoint when nothing is configured.
pub const DEFAULT_URL: &str = "http://127.0.0.1:11434/api/chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One entry of the runtime fallback ladder.
#[derive(Debug, Clone)]
pub struct RuntimeCandidate {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub label: String,
}

/// Raised when every candidate in the fallback ladder failed its probe.
/// The CLI maps this to exit code 2.
#[derive(Debug, Error)]
#[error("no Central runtime reachable (tried {tried} candidate(s))")]
pub struct NoRuntimeError {
    pub tried: usize,
}

/// Construction-time settings for a [`ChatClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: i64,
    pub stream: bool,
    pub sanitize: bool,
    pub strip_reasoning: bool,
    pub enable_logging: bool,
    pub session_root: PathBuf,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            model: "centi-nox".to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: -1,
            stream: false,
            sanitize: false,
            strip_reasoning: true,
            enable_logging: true,
            session_root: PathBuf::from(session::SESSION_ROOT),
        }
    }
}

type OutboundSanitizer = Box<dyn Fn(&str) -> String + Send + Sync>;

pub struct ChatClient {
    url: String,
    model: String,
    target_model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: i64,
    stream: bool,
    sanitize: bool,
    strip_reasoning: bool,
    messages: Vec<ChatMessage>,
    transport: Box<dyn Transport>,
    logger: Option<SessionLogger>,
    instrument: Option<Box<dyn Instrument>>,
    sanitizer: Option<OutboundSanitizer>,
    persona: &'static Persona,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("target_model", &self.target_model)
            .field("stream", &self.stream)
            .field("sanitize", &self.sanitize)
            .field("strip_reasoning", &self.strip_reasoning)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    /// Build a client with a transport selected from the URL shape.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let transport = transport::for_url(&options.url, options.api_key.as_deref())?;
        Self::with_transport(options, transport)
    }

    /// Build a client over an explicit transport (tests, embeddings).
    pub fn with_transport(options: ClientOptions, transport: Box<dyn Transport>) -> Result<Self> {
        let target_model = select_target_model(&options.url, &options.model);
        let persona = resolve_persona(&options.model);

        let logger = if options.enable_logging {
            let mut logger =
                SessionLogger::new(&options.model, options.sanitize, &options.session_root);
            logger.start()?;
            Some(logger)
        } else {
            None
        };

        Ok(Self {
            url: options.url,
            model: options.model,
            target_model,
            api_key: options.api_key,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: options.stream,
            sanitize: options.sanitize,
            strip_reasoning: options.strip_reasoning,
            messages: Vec::new(),
            transport,
            logger,
            instrument: None,
            sanitizer: None,
            persona,
        })
    }

    /// Probe each candidate in order and keep the first whose endpoint
    /// answers a TCP connect. A failed candidate's freshly created empty
    /// session is removed before moving on.
    pub fn connect_first_reachable(
        candidates: &[RuntimeCandidate],
        base: &ClientOptions,
        probe_timeout: Duration,
    ) -> Result<Self> {
        for candidate in candidates {
            let mut options = base.clone();
            options.url = candidate.url.clone();
            options.model = candidate.model.clone();
            options.api_key = candidate.api_key.clone();

            let client = match Self::new(options) {
                Ok(client) => client,
                Err(error) => {
                    warn!(label = %candidate.label, %error, "candidate rejected at construction");
                    continue;
                }
            };
            match client.check_connectivity(probe_timeout) {
                Ok(()) => {
                    info!(label = %candidate.label, url = %candidate.url, "runtime selected");
                    return Ok(client);
                }
                Err(error) => {
                    warn!(label = %candidate.label, url = %candidate.url, %error, "runtime unreachable");
                    if let Err(cleanup) = client.maybe_delete_empty_session() {
                        debug!(%cleanup, "failed to remove empty session");
                    }
                }
            }
        }
        Err(NoRuntimeError {
            tried: candidates.len(),
        }
        .into())
    }

    // -----------------
    // Accessors & state
    // -----------------

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn target_model(&self) -> &str {
        &self.target_model
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn persona(&self) -> &'static Persona {
        self.persona
    }

    pub fn reset_messages(&mut self, system: Option<&str>) {
        self.messages.clear();
        if let Some(system) = system {
            self.messages.push(ChatMessage::system(system));
        }
    }

    pub fn set_messages(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    /// Attach the external instrument adapter. The client holds at most one.
    pub fn set_instrument(&mut self, instrument: Box<dyn Instrument>) {
        self.instrument = Some(instrument);
    }

    /// Attach the outbound-text redactor applied when `sanitize` is on.
    pub fn set_sanitizer(&mut self, sanitizer: OutboundSanitizer) {
        self.sanitizer = Some(sanitizer);
    }

    /// Sanitized snapshot of the configured target, for diagnostics.
    pub fn describe_target(&self) -> Value {
        json!({
            "url": self.url,
            "model": self.model,
            "central_name": self.persona.central_name,
            "central_scale": self.persona.scale,
            "variant_name": self.persona.variant_name,
            "model_target": self.persona.model_target,
            "stream": self.stream,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "sanitize": self.sanitize,
            "strip_reasoning": self.strip_reasoning,
            "logging_enabled": self.logger.is_some(),
            "target_model": self.target_model,
            "has_api_key": self.api_key.is_some(),
            "instrument": self.instrument.as_ref().map(|i| i.name().to_string()),
        })
    }

    // ---------------------
    // Connectivity
    // ---------------------

    /// TCP pre-flight against the configured endpoint.
    pub fn check_connectivity(&self, timeout: Duration) -> Result<()> {
        transport::probe_endpoint(&self.url, timeout)?;
        Ok(())
    }

    // ---------------------
    // Titles
    // ---------------------

    pub fn get_session_title(&self) -> Option<String> {
        self.logger.as_ref().and_then(|l| l.get_meta().title)
    }

    pub fn set_session_title(&mut self, title: &str, custom: bool) -> Result<()> {
        if let Some(ref mut logger) = self.logger {
            logger.set_title(Some(title), custom)?;
        }
        Ok(())
    }

    /// Make sure the session carries a title: a custom one is returned
    /// untouched, otherwise one is inferred from the history and stored
    /// with `custom = false`.
    pub fn ensure_auto_title(&mut self) -> Result<Option<String>> {
        let Some(ref mut logger) = self.logger else {
            return Ok(None);
        };
        let meta = logger.get_meta();
        if meta.custom && meta.title.is_some() {
            return Ok(meta.title);
        }
        let title = session::compute_title_from_messages(&self.messages).or(meta.title);
        if let Some(ref title) = title {
            logger.set_title(Some(title), false)?;
        }
        Ok(title)
    }

    // ----------------------
    // Instrument detection
    // ----------------------

    /// Does this assistant text ask for an external instrument?
    pub fn wants_instrument(text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let lowered = text.to_lowercase();
        lowered.contains("[instrument query]")
            || (lowered.contains("requires an instrument")
                && lowered.contains("paste a helper response"))
    }

    // -------------
    // Turns
    // -------------

    /// Run one conversational turn.
    ///
    /// Returns the cleaned assistant reply, or `None` when the provider
    /// produced no content (errors are raised, not returned). The history
    /// and session log are only touched after the reply is complete.
    pub async fn one_turn(
        &mut self,
        user_text: &str,
        mut on_delta: Option<ChunkSink<'_>>,
    ) -> Result<Option<String>> {
        let outbound = self.sanitize_outbound(user_text);
        let mut turn_messages = self.messages.clone();
        turn_messages.push(ChatMessage::user(&outbound));

        let Some(cleaned) = self.run_filtered_turn(&turn_messages, &mut on_delta).await? else {
            return Ok(None);
        };

        self.messages.push(ChatMessage::user(&outbound));
        self.messages.push(ChatMessage::assistant(&cleaned));
        self.log_turn_pair(&outbound, &cleaned)?;
        Ok(Some(cleaned))
    }

    /// Record a reply produced outside any transport (e.g. a local command
    /// substituted for a model call).
    pub fn record_turn(&mut self, user_text: &str, assistant_text: &str) -> Result<()> {
        let outbound = self.sanitize_outbound(user_text);
        let mut cleaned = if self.strip_reasoning {
            strip_chain_of_thought(assistant_text)
        } else {
            assistant_text.to_string()
        };
        cleaned = clean_public_reply(&cleaned);

        self.messages.push(ChatMessage::user(&outbound));
        self.messages.push(ChatMessage::assistant(&cleaned));
        self.log_turn_pair(&outbound, &cleaned)
    }

    /// Feed an instrument's output back to the model: the text is wrapped
    /// in result markers, the packaged stitching prompt is appended as a
    /// system message for this exchange only, and a standard turn runs.
    pub async fn process_instrument_result(
        &mut self,
        instrument_text: &str,
        mut on_delta: Option<ChunkSink<'_>>,
    ) -> Result<Option<String>> {
        if instrument_text.is_empty() {
            return Ok(None);
        }
        let wrapped = format!("[INSTRUMENT RESULT]\n{instrument_text}\n[/INSTRUMENT RESULT]");
        let mut turn_messages = self.messages.clone();
        turn_messages.push(ChatMessage::system(load_instrument_prompt()));
        turn_messages.push(ChatMessage::user(&wrapped));

        let Some(cleaned) = self.run_filtered_turn(&turn_messages, &mut on_delta).await? else {
            return Ok(None);
        };

        self.messages.push(ChatMessage::user(&wrapped));
        self.messages.push(ChatMessage::assistant(&cleaned));
        self.log_turn_pair(&wrapped, &cleaned)?;
        Ok(Some(cleaned))
    }

    // -----------------
    // Session lifecycle
    // -----------------

    pub fn log_path(&self) -> Option<&Path> {
        self.logger.as_ref().and_then(|l| l.log_path())
    }

    /// Remove this client's session if it never recorded a user or
    /// assistant message. Returns whether a deletion happened.
    pub fn maybe_delete_empty_session(&self) -> Result<bool> {
        let Some(ref logger) = self.logger else {
            return Ok(false);
        };
        let Some(path) = logger.log_path() else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }
        session::delete_session_if_empty(path, logger.meta_path())
    }

    /// Fold the finished session into its date directory's day log.
    pub fn append_session_to_day_log(&self) -> Result<Option<PathBuf>> {
        let Some(ref logger) = self.logger else {
            return Ok(None);
        };
        let Some(path) = logger.log_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let meta = logger.get_meta();
        session::append_session_to_day_log(path, &meta)
    }

    /// Continue an existing session instead of the freshly created one.
    pub fn adopt_session_log(&mut self, path: &Path) -> Result<()> {
        if let Some(ref mut logger) = self.logger {
            logger.load_existing(path)?;
        }
        Ok(())
    }

    pub fn session_meta(&self) -> Option<SessionMeta> {
        self.logger.as_ref().map(|l| l.get_meta())
    }

    // -----------------
    // Internals
    // -----------------

    /// Dispatch one exchange and clean the reply.
    ///
    /// When streaming with reasoning-stripping on, the delta sink is fed
    /// through a [`ReasoningFilter`]; once the reply is complete, whatever
    /// the filter still withheld (an unclosed tag, a held fragment) is
    /// flushed so the live output matches the returned string.
    async fn run_filtered_turn(
        &self,
        turn_messages: &[ChatMessage],
        on_delta: &mut Option<ChunkSink<'_>>,
    ) -> Result<Option<String>> {
        let mut filter = ReasoningFilter::new();
        let use_filter = self.stream && self.strip_reasoning && on_delta.is_some();

        let raw = if use_filter {
            let sink = on_delta.take().expect("delta sink present");
            let mut wrapped = |piece: &str| {
                let fresh = filter.push(piece);
                if !fresh.is_empty() {
                    sink(&fresh);
                }
            };
            let raw = self.dispatch(turn_messages, Some(&mut wrapped)).await?;
            *on_delta = Some(sink);
            raw
        } else {
            self.dispatch(turn_messages, on_delta.take()).await?
        };

        let Some(raw) = raw else {
            return Ok(None);
        };

        let mut cleaned = if self.strip_reasoning {
            strip_chain_of_thought(&raw)
        } else {
            raw
        };
        cleaned = clean_public_reply(&cleaned);

        if use_filter
            && let Some(sink) = on_delta.as_deref_mut()
            && let Some(rest) = cleaned.strip_prefix(filter.emitted())
            && !rest.is_empty()
        {
            sink(rest);
        }

        Ok(Some(cleaned))
    }

    async fn dispatch(
        &self,
        messages: &[ChatMessage],
        on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<Option<String>> {
        if let Some(ref instrument) = self.instrument {
            let max_tokens = (self.max_tokens > 0).then_some(self.max_tokens);
            let reply = instrument
                .send_chat(messages, self.temperature, max_tokens, self.stream, on_chunk)
                .await?;
            return Ok(reply.text);
        }

        let request = if self.url.to_lowercase().contains("openai.com") {
            self.openai_payload(messages, self.stream)
        } else {
            payload::build_payload(
                &self.target_model,
                messages,
                self.temperature,
                self.max_tokens,
                self.stream,
            )
        };

        let outcome = self.transport.send(&request, self.stream, on_chunk).await?;
        Ok(outcome.text)
    }

    /// OpenAI-shaped request body: list-typed content parts, `max_tokens`
    /// only when positive, `stream` only when streaming.
    fn openai_payload(&self, messages: &[ChatMessage], stream: bool) -> Value {
        let mut shaped: Vec<Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.as_str(),
                    "content": [{"type": "text", "text": m.content}],
                })
            })
            .collect();
        if shaped.is_empty() {
            shaped.push(json!({
                "role": "user",
                "content": [{"type": "text", "text": ""}],
            }));
        }

        let mut request = json!({
            "model": self.target_model,
            "messages": shaped,
            "temperature": self.temperature,
        });
        if self.max_tokens > 0 {
            request["max_tokens"] = json!(self.max_tokens);
        }
        if stream {
            request["stream"] = json!(true);
        }
        request
    }

    fn sanitize_outbound(&self, text: &str) -> String {
        if self.sanitize
            && let Some(ref sanitizer) = self.sanitizer
        {
            return sanitizer(text);
        }
        text.to_string()
    }

    /// Persist one finished turn: the active system preamble (if any) plus
    /// the user/assistant pair.
    fn log_turn_pair(&mut self, user_text: &str, assistant_text: &str) -> Result<()> {
        let Some(ref mut logger) = self.logger else {
            return Ok(());
        };
        let mut to_log: Vec<ChatMessage> = Vec::with_capacity(3);
        if let Some(system) = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::System)
        {
            to_log.push(system.clone());
        }
        to_log.push(ChatMessage::user(user_text));
        to_log.push(ChatMessage::assistant(assistant_text));
        logger.log_turn(&to_log)
    }
}

/// Pick the model actually sent to the provider.
fn select_target_model(url: &str, model: &str) -> String {
    let override_model = std::env::var("CENTRAL_TARGET_MODEL").ok();
    select_target_model_with(override_model.as_deref(), url, model)
}

fn select_target_model_with(override_model: Option<&str>, url: &str, model: &str) -> String {
    if let Some(forced) = override_model
        && !forced.trim().is_empty()
    {
        return forced.trim().to_string();
    }

    let url_lower = url.to_lowercase();
    let model_lower = model.to_lowercase();
    if url_lower.contains("api.openai.com")
        && matches!(
            model_lower.as_str(),
            "centi-nox" | "milli-nox" | "micro-nox" | "nano-nox" | "gpt-5"
        )
    {
        return std::env::var("CENTRAL_OPENAI_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
    }
    model.to_string()
}
