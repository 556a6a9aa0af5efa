//! Environment-derived settings.
//!
//! Central is configured through environment variables (the CLI flags that
//! mirror them are declared with clap's `env` attribute). This module owns
//! the pieces that are not simple flag twins: API-key resolution and the
//! runtime fallback ladder.

use crate::core::{DEFAULT_URL, RuntimeCandidate};

/// Default model alias when nothing is configured.
pub const DEFAULT_MODEL: &str = "centi-nox";

/// Bearer token: `CENTRAL_LLM_API_KEY`, else `OPENAI_API_KEY`.
pub fn resolve_api_key(explicit: Option<&str>) -> Option<String> {
    if let Some(key) = explicit
        && !key.trim().is_empty()
    {
        return Some(key.trim().to_string());
    }
    for name in ["CENTRAL_LLM_API_KEY", "OPENAI_API_KEY"] {
        if let Ok(key) = std::env::var(name)
            && !key.trim().is_empty()
        {
            return Some(key.trim().to_string());
        }
    }
    None
}

/// The ordered runtime ladder: the configured primary, fallbacks from the
/// `CENTRAL_LLM_FALLBACK_*` CSV lists, then the final local candidate from
/// `CENTRAL_LOCAL_LLM_URL`.
pub fn runtime_candidates(primary: RuntimeCandidate) -> Vec<RuntimeCandidate> {
    let primary_model = primary.model.clone();
    let mut candidates = vec![primary];

    let urls = csv_env("CENTRAL_LLM_FALLBACK_URLS");
    let models = csv_env("CENTRAL_LLM_FALLBACK_MODELS");
    let api_keys = csv_env("CENTRAL_LLM_FALLBACK_API_KEYS");
    for (index, url) in urls.iter().enumerate() {
        candidates.push(RuntimeCandidate {
            url: url.clone(),
            model: models
                .get(index)
                .cloned()
                .unwrap_or_else(|| primary_model.clone()),
            api_key: api_keys.get(index).cloned().filter(|k| !k.is_empty()),
            label: format!("fallback-{}", index + 1),
        });
    }

    if let Ok(local_url) = std::env::var("CENTRAL_LOCAL_LLM_URL")
        && !local_url.trim().is_empty()
    {
        let local_model = std::env::var("CENTRAL_LOCAL_LLM_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| primary_model.clone());
        candidates.push(RuntimeCandidate {
            url: local_url.trim().to_string(),
            model: local_model,
            api_key: None,
            label: "local".to_string(),
        });
    }

    candidates
}

/// Endpoint URL default: `CENTRAL_LLM_URL`, else the stock local daemon.
pub fn default_url() -> String {
    std::env::var("CENTRAL_LLM_URL")
        .ok()
        .filter(|u| !u.trim().is_empty())
        .map(|u| u.trim().to_string())
        .unwrap_or_else(|| DEFAULT_URL.to_string())
}

/// Model default: `CENTRAL_LLM_MODEL`, else the stock alias.
pub fn default_model() -> String {
    std::env::var("CENTRAL_LLM_MODEL")
        .ok()
        .filter(|m| !m.trim().is_empty())
        .map(|m| m.trim().to_string())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

fn csv_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_api_key_wins_over_environment() {
        assert_eq!(
            resolve_api_key(Some("  sk-explicit  ")).as_deref(),
            Some("sk-explicit")
        );
    }

    #[test]
    fn primary_is_always_the_first_candidate() {
        let primary = RuntimeCandidate {
            url: "http://primary/api/chat".to_string(),
            model: "m".to_string(),
            api_key: None,
            label: "primary".to_string(),
        };
        let candidates = runtime_candidates(primary);
        assert_eq!(candidates[0].label, "primary");
        assert_eq!(candidates[0].url, "http://primary/api/chat");
    }
}
