//! External instrument adapter.
//!
//! An instrument is another model the primary model may ask for. Central
//! holds at most one, behind this trait; building one is the host
//! application's business.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::sync::Mutex;

use super::ChatMessage;
use crate::transport::ChunkSink;

/// Reply from an instrument exchange.
#[derive(Debug, Default)]
pub struct InstrumentReply {
    pub text: Option<String>,
}

#[async_trait]
pub trait Instrument: Send + Sync {
    fn name(&self) -> &str;

    async fn send_chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<i64>,
        stream: bool,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<InstrumentReply>;
}

const DEFAULT_PROMPT: &str = include_str!("../../templates/instrument_prompt.txt");

/// On-disk override for the packaged stitching prompt.
const PROMPT_OVERRIDE_PATH: &str = "memory/instrument_prompt.txt";

static PROMPT_CACHE: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// The system prompt appended before an instrument result is replayed to
/// the model. Read once per process; `reload_instrument_prompt` drops the
/// cache.
pub fn load_instrument_prompt() -> String {
    let mut cache = PROMPT_CACHE.lock().expect("prompt cache lock");
    if let Some(ref cached) = *cache {
        return cached.clone();
    }
    let prompt = std::fs::read_to_string(PROMPT_OVERRIDE_PATH)
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| DEFAULT_PROMPT.trim().to_string());
    *cache = Some(prompt.clone());
    prompt
}

/// Forget the cached prompt so the next load re-reads the override file.
pub fn reload_instrument_prompt() {
    *PROMPT_CACHE.lock().expect("prompt cache lock") = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packaged_prompt_loads_and_caches() {
        reload_instrument_prompt();
        let first = load_instrument_prompt();
        assert!(first.contains("[INSTRUMENT RESULT]"));
        assert_eq!(load_instrument_prompt(), first);
        reload_instrument_prompt();
    }
}
