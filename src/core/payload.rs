//! Request payload assembly.
//!
//! One canonical payload is built per turn and then trimmed per provider at
//! the call site: the NDJSON transport drops `messages` for `/api/generate`
//! and `prompt`/`system` for `/api/chat`, while the chat client rebuilds an
//! OpenAI-shaped body for `openai.com` endpoints.

use serde_json::{Value, json};

use super::{ChatMessage, Role};

/// Number of trailing user/assistant messages kept in a generate-style
/// prompt. Small local models drown in longer context.
const GENERATE_HISTORY_LIMIT: usize = 6;

/// Thread cap applied on constrained mobile environments when no explicit
/// cap is configured.
const MOBILE_THREAD_CAP: usize = 6;

/// Build the canonical request payload shared by the Ollama-style endpoints
/// and the local runner.
pub fn build_payload(
    model: &str,
    messages: &[ChatMessage],
    temperature: f32,
    max_tokens: i64,
    stream: bool,
) -> Value {
    let mut options = json!({ "temperature": temperature });

    if let Some(threads) = resolve_thread_count() {
        options["num_thread"] = json!(threads);
    }
    if let Some(num_ctx) = read_positive_int_env(&["NOX_NUM_CTX", "OLLAMA_CONTEXT_LENGTH"]) {
        options["num_ctx"] = json!(num_ctx);
    }
    if let Some(num_batch) = read_positive_int_env(&["NOX_NUM_BATCH"]) {
        options["num_batch"] = json!(num_batch);
    }
    if max_tokens > 0 {
        options["num_predict"] = json!(max_tokens);
    }

    let mut payload = json!({
        "model": model,
        "stream": stream,
        "options": options,
    });

    if let Ok(keep_alive) = std::env::var("NOX_KEEP_ALIVE")
        && !keep_alive.trim().is_empty()
    {
        payload["keep_alive"] = json!(keep_alive.trim());
    }

    let system = collect_system_text(messages);
    if !system.is_empty() {
        payload["system"] = json!(system);
    }
    payload["prompt"] = json!(render_generate_prompt(messages));
    payload["messages"] = json!(messages);

    payload
}

/// Render the whole message list through the chat template, for runtimes
/// that take a single prompt string (the local runner).
pub fn render_chat_template(messages: &[ChatMessage]) -> String {
    let mut blocks: Vec<String> = Vec::new();
    for message in messages {
        let content = message.content.trim();
        if content.is_empty() {
            continue;
        }
        blocks.push(format!(
            "<|im_start|>{}\n{}\n<|im_end|>",
            message.role.as_str(),
            content
        ));
    }
    if blocks.is_empty() {
        return String::new();
    }
    blocks.push("<|im_start|>assistant\n".to_string());
    blocks.join("\n")
}

/// Generate-style prompt: the most recent dialogue only, system text kept
/// out (it travels in the payload's `system` field).
fn render_generate_prompt(messages: &[ChatMessage]) -> String {
    let dialogue: Vec<&ChatMessage> = messages
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .collect();
    let recent = if dialogue.len() > GENERATE_HISTORY_LIMIT {
        &dialogue[dialogue.len() - GENERATE_HISTORY_LIMIT..]
    } else {
        &dialogue[..]
    };

    let mut blocks: Vec<String> = Vec::new();
    for message in recent {
        let content = message.content.trim();
        if content.is_empty() {
            continue;
        }
        blocks.push(format!(
            "<|im_start|>{}\n{}\n<|im_end|>",
            message.role.as_str(),
            content
        ));
    }
    blocks.push("<|im_start|>assistant\n".to_string());
    blocks.join("\n")
}

fn collect_system_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| matches!(m.role, Role::System))
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// `NOX_NUM_THREADS` wins outright; otherwise detected CPUs, capped by
/// `NOX_NUM_THREADS_CAP` or a fixed cap on Termux/Android.
fn resolve_thread_count() -> Option<usize> {
    if let Some(threads) = read_positive_int_env(&["NOX_NUM_THREADS"]) {
        return Some(threads);
    }
    let detected = std::thread::available_parallelism().map(|n| n.get()).ok()?;
    let cap = read_positive_int_env(&["NOX_NUM_THREADS_CAP"]).unwrap_or_else(|| {
        if std::env::var_os("TERMUX_VERSION").is_some()
            || std::env::var_os("ANDROID_ROOT").is_some()
        {
            MOBILE_THREAD_CAP
        } else {
            0
        }
    });
    if cap > 0 {
        Some(detected.min(cap))
    } else {
        Some(detected)
    }
}

fn read_positive_int_env(names: &[&str]) -> Option<usize> {
    for name in names {
        if let Ok(raw) = std::env::var(name)
            && let Ok(value) = raw.trim().parse::<usize>()
            && value > 0
        {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn payload_carries_model_stream_and_options() {
        let messages = vec![msg(Role::User, "hello")];
        let payload = build_payload("centi-nox", &messages, 0.7, 128, true);

        assert_eq!(payload["model"], "centi-nox");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["options"]["num_predict"], 128);
        assert!(payload["options"]["temperature"].is_number());
    }

    #[test]
    fn non_positive_max_tokens_is_omitted() {
        let payload = build_payload("m", &[msg(Role::User, "hi")], 0.7, -1, false);
        assert!(payload["options"].get("num_predict").is_none());
    }

    #[test]
    fn generate_prompt_ends_with_assistant_cue() {
        let messages = vec![
            msg(Role::System, "be brief"),
            msg(Role::User, "hello"),
            msg(Role::Assistant, "hi"),
            msg(Role::User, "bye"),
        ];
        let payload = build_payload("m", &messages, 0.7, -1, false);

        let prompt = payload["prompt"].as_str().unwrap();
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
        assert!(prompt.contains("<|im_start|>user\nhello\n<|im_end|>"));
        // System text travels separately, never inside the prompt.
        assert!(!prompt.contains("be brief"));
        assert_eq!(payload["system"], "be brief");
    }

    #[test]
    fn generate_prompt_keeps_only_recent_dialogue() {
        let mut messages = Vec::new();
        for turn in 0..5 {
            messages.push(msg(Role::User, &format!("question {turn}")));
            messages.push(msg(Role::Assistant, &format!("answer {turn}")));
        }
        let payload = build_payload("m", &messages, 0.7, -1, false);
        let prompt = payload["prompt"].as_str().unwrap();

        assert!(!prompt.contains("question 0"));
        assert!(!prompt.contains("answer 1"));
        assert!(prompt.contains("question 2"));
        assert!(prompt.contains("answer 4"));
    }

    #[test]
    fn chat_template_renders_all_roles_in_order() {
        let messages = vec![
            msg(Role::System, "sys"),
            msg(Role::User, "u"),
            msg(Role::Assistant, "a"),
        ];
        let rendered = render_chat_template(&messages);
        assert_eq!(
            rendered,
            "<|im_start|>system\nsys\n<|im_end|>\n\
             <|im_start|>user\nu\n<|im_end|>\n\
             <|im_start|>assistant\na\n<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn chat_template_is_empty_without_content() {
        assert_eq!(render_chat_template(&[]), "");
        assert_eq!(render_chat_template(&[msg(Role::User, "   ")]), "");
    }
}
