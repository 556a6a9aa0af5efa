//! Hidden-reasoning sanitisation.
//!
//! Models served through Central may interleave `<think>...</think>` spans
//! with their visible reply. Nothing inside a think span is ever rendered or
//! persisted: [`strip_chain_of_thought`] removes complete spans from final
//! text, while [`ReasoningFilter`] suppresses them incrementally as deltas
//! arrive on a stream.

use once_cell::sync::Lazy;
use regex::Regex;

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<think>.*?</think>\s*").expect("valid think pattern"));

/// Chat-template sentinels that some runtimes leak into the final reply.
const SCAFFOLD_MARKERS: &[&str] = &[
    "<|im_start|>assistant",
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
];

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// Remove every complete `<think>...</think>` span (plus the whitespace that
/// trails it) and trim the result.
pub fn strip_chain_of_thought(text: &str) -> String {
    THINK_RE.replace_all(text, "").trim().to_string()
}

/// Strip known scaffolding markers from a finalised reply.
pub fn clean_public_reply(text: &str) -> String {
    let mut cleaned = text.to_string();
    for marker in SCAFFOLD_MARKERS {
        if cleaned.contains(marker) {
            cleaned = cleaned.replace(marker, "");
        }
    }
    cleaned.trim().to_string()
}

/// Split `buffer` into `(public, remainder)`.
///
/// `public` is everything outside think spans. A span whose opening tag has
/// no matching close yet stays in `remainder`, as does a closed span that is
/// followed only by whitespace: the whitespace run may still be growing and
/// belongs to the span, the same way [`strip_chain_of_thought`] consumes it.
pub fn extract_public_segments(buffer: &str) -> (String, String) {
    let bytes = buffer.as_bytes();
    let len = bytes.len();
    let mut public = String::new();
    let mut pos = 0;

    while pos < len {
        let Some(open) = find_ascii_ci(buffer, OPEN_TAG, pos) else {
            public.push_str(&buffer[pos..]);
            return (public, String::new());
        };
        public.push_str(&buffer[pos..open]);

        let Some(close) = find_ascii_ci(buffer, CLOSE_TAG, open + OPEN_TAG.len()) else {
            return (public, buffer[open..].to_string());
        };

        let mut next = close + CLOSE_TAG.len();
        while next < len && bytes[next].is_ascii_whitespace() {
            next += 1;
        }
        if next >= len {
            return (public, buffer[open..].to_string());
        }
        pos = next;
    }

    (public, String::new())
}

/// Streaming companion to [`strip_chain_of_thought`].
///
/// Feed raw deltas through [`push`](Self::push) and forward whatever it
/// returns. The rolling buffer only ever holds un-emitted text, so every
/// public segment it yields is new. A trailing fragment that could still
/// grow into `<think>` is withheld until the next delta decides it.
#[derive(Debug, Default)]
pub struct ReasoningFilter {
    buffer: String,
    emitted: String,
}

impl ReasoningFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one raw delta and return the newly visible public text.
    pub fn push(&mut self, piece: &str) -> String {
        self.buffer.push_str(piece);
        let (mut public, mut remainder) = extract_public_segments(&self.buffer);
        if remainder.is_empty()
            && let Some(held) = trailing_open_fragment(&public)
        {
            remainder = public.split_off(public.len() - held);
        }
        self.buffer = remainder;
        self.emitted.push_str(&public);
        public
    }

    /// Public text emitted so far, concatenated.
    pub fn emitted(&self) -> &str {
        &self.emitted
    }
}

/// Length of a suffix of `public` that is a proper prefix of `<think>`.
///
/// Such a suffix must not be emitted yet: the next delta may complete the
/// tag. Returns `None` when the text cannot be the start of an opening tag.
fn trailing_open_fragment(public: &str) -> Option<usize> {
    let bytes = public.as_bytes();
    let max = OPEN_TAG.len().min(bytes.len());
    for keep in (1..=max).rev() {
        let tail = &bytes[bytes.len() - keep..];
        if tail
            .iter()
            .zip(OPEN_TAG.as_bytes())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
        {
            return Some(keep);
        }
    }
    None
}

fn find_ascii_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || from >= haystack.len() || haystack.len() - from < needle.len() {
        return None;
    }
    let last = haystack.len() - needle.len();
    'outer: for start in from..=last {
        for (offset, expected) in needle.iter().enumerate() {
            if !haystack[start + offset].eq_ignore_ascii_case(expected) {
                continue 'outer;
            }
        }
        return Some(start);
    }
    None
}
