//! Central - a local personal intelligence kernel.
//!
//! This crate provides the core of Central:
//! - A provider-polymorphic transport layer (OpenAI SSE, Ollama NDJSON,
//!   local child-process runner) behind one streaming contract
//! - The chat client state machine: history, payload shaping, runtime
//!   fallback, reasoning redaction, instrument detection
//! - The durable session store: archives, sidecars, day logs, merges

pub mod cli;
pub mod config;
pub mod core;
pub mod session;
pub mod transport;

pub use crate::core::{
    ChatClient, ChatMessage, ClientOptions, NoRuntimeError, Role, RuntimeCandidate,
};
pub use crate::transport::{SendOutcome, Transport, TransportError};
