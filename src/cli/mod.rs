pub mod ask;
pub mod chat;
pub mod sessions;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "central")]
#[command(author, version, about = "A local personal intelligence kernel")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive chat session
    Chat(chat::ChatArgs),

    /// Ask a single question
    Ask(ask::AskArgs),

    /// Browse, title, merge, and archive stored sessions
    Sessions(sessions::SessionsArgs),
}

/// Connection flags shared by `chat` and `ask`.
#[derive(clap::Args, Clone)]
pub struct RuntimeArgs {
    /// Endpoint URL
    #[arg(long, env = "CENTRAL_LLM_URL")]
    pub url: Option<String>,

    /// Model to use
    #[arg(short, long, env = "CENTRAL_LLM_MODEL")]
    pub model: Option<String>,

    /// Bearer token for the endpoint
    #[arg(long, env = "CENTRAL_LLM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.7)]
    pub temperature: f32,

    /// Response token budget (non-positive means provider default)
    #[arg(long, default_value_t = -1)]
    pub max_tokens: i64,

    /// Redact outgoing text before it leaves the machine
    #[arg(long)]
    pub sanitize: bool,

    /// Keep hidden <think> spans in the output
    #[arg(long)]
    pub keep_reasoning: bool,

    /// Session storage root
    #[arg(long, default_value = crate::session::SESSION_ROOT)]
    pub session_root: std::path::PathBuf,
}

impl RuntimeArgs {
    pub fn client_options(&self, stream: bool, enable_logging: bool) -> crate::core::ClientOptions {
        crate::core::ClientOptions {
            url: self.url.clone().unwrap_or_else(crate::config::default_url),
            model: self
                .model
                .clone()
                .unwrap_or_else(crate::config::default_model),
            api_key: crate::config::resolve_api_key(self.api_key.as_deref()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
            sanitize: self.sanitize,
            strip_reasoning: !self.keep_reasoning,
            enable_logging,
            session_root: self.session_root.clone(),
        }
    }

    pub fn candidates(
        &self,
        options: &crate::core::ClientOptions,
    ) -> Vec<crate::core::RuntimeCandidate> {
        crate::config::runtime_candidates(crate::core::RuntimeCandidate {
            url: options.url.clone(),
            model: options.model.clone(),
            api_key: options.api_key.clone(),
            label: "primary".to_string(),
        })
    }
}
