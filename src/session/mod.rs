//! Durable conversation archives.
//!
//! Sessions live under a date-sharded root (default `memory/sessions`): one
//! pretty-printed JSON array of turn records per session, with a
//! `.meta.json` sidecar describing it. Legacy `.jsonl` session files remain
//! readable. Everything here is a pure function over the filesystem; the
//! only stateful writer is [`logger::SessionLogger`].
//!
//! Failure policy: a record or sidecar that fails to parse contributes
//! whatever minimal information can be synthesised; I/O errors bubble up.

pub mod logger;

pub use logger::SessionLogger;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

use crate::core::{ChatMessage, Role};

/// Default session root, relative to the working directory.
pub const SESSION_ROOT: &str = "memory/sessions";
/// Default root for early-archive merges.
pub const ARCHIVE_ROOT: &str = "memory/early-archives";

/// Title prefixes that mark a user message as machine-generated; such
/// messages never become a session title.
const TITLE_SKIP_PREFIXES: &[&str] = &["[helper result]", "[instrument result]"];

const TITLE_MAX_WORDS: usize = 8;
const TITLE_MAX_CHARS: usize = 80;

/// Sidecar metadata for one session file. Unknown keys survive a
/// read-modify-write cycle via `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub sanitized: Option<bool>,

    #[serde(default)]
    pub turns: Option<u64>,

    #[serde(default)]
    pub created: Option<String>,

    #[serde(default)]
    pub updated: Option<String>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub custom: bool,

    #[serde(default)]
    pub file_name: Option<String>,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveMeta>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SessionMeta {
    pub fn turn_count(&self) -> u64 {
        self.turns.unwrap_or(0)
    }
}

/// Provenance block attached to an early-archive sidecar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveMeta {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub latest_excluded_id: Option<String>,

    #[serde(default)]
    pub latest_excluded_display_name: Option<String>,

    #[serde(default)]
    pub source_count: u64,

    #[serde(default)]
    pub generated: Option<String>,
}

// ---------------------------------------------------------------------------
// Enumeration and resolution
// ---------------------------------------------------------------------------

/// All sessions under `root`, newest first.
///
/// Day directories are scanned in reverse lexicographic order; within a day,
/// a `.json` file shadows a legacy `.jsonl` with the same stem. Sorting is
/// by sidecar `updated` (epoch), with file mtime breaking ties and standing
/// in when the sidecar has no timestamp.
pub fn list_sessions(root: &Path) -> Result<Vec<SessionMeta>> {
    let mut items = Vec::new();
    if !root.is_dir() {
        return Ok(items);
    }

    let mut day_dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    day_dirs.sort();
    day_dirs.reverse();

    for day_dir in day_dirs {
        for path in session_files_for_day(&day_dir)? {
            items.push(load_meta(&path));
        }
    }

    items.sort_by_key(|meta| std::cmp::Reverse(sort_key(meta)));
    Ok(items)
}

/// Resolve a session by explicit path, exact stem, or stem suffix.
///
/// Numeric list indices are the caller's business; resolution only matches
/// file identities.
pub fn resolve_session(identifier: &str, root: &Path) -> Option<PathBuf> {
    let candidate = PathBuf::from(identifier);
    if candidate.exists() {
        return Some(candidate);
    }

    let mut day_dirs: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    day_dirs.sort();
    day_dirs.reverse();

    for day_dir in day_dirs {
        let files = session_files_for_day(&day_dir).ok()?;
        for path in files {
            let stem = file_stem(&path);
            if stem == identifier || stem.ends_with(identifier) {
                return Some(path);
            }
        }
    }
    None
}

/// Session files in one day directory, `.json` shadowing `.jsonl` per stem,
/// newest stem first.
fn session_files_for_day(day_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut by_stem: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(day_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with("session-") || name.ends_with(".meta.json") {
            continue;
        }
        let is_json = name.ends_with(".json");
        let is_jsonl = name.ends_with(".jsonl");
        if !is_json && !is_jsonl {
            continue;
        }
        let stem = file_stem(&path);
        match by_stem.iter_mut().find(|(s, _)| *s == stem) {
            Some((_, existing)) => {
                if is_json {
                    *existing = path;
                }
            }
            None => by_stem.push((stem, path)),
        }
    }
    by_stem.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(by_stem.into_iter().map(|(_, path)| path).collect())
}

fn sort_key(meta: &SessionMeta) -> (i64, i64) {
    let mtime = fs::metadata(&meta.path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let updated = meta
        .updated
        .as_deref()
        .and_then(parse_epoch)
        .unwrap_or(mtime);
    (updated, mtime)
}

fn parse_epoch(timestamp: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|dt| dt.timestamp())
}

// ---------------------------------------------------------------------------
// Record and message loading
// ---------------------------------------------------------------------------

/// Raw turn records from a session file (JSON array or JSONL). Malformed
/// content yields an empty list rather than an error.
pub fn load_records(path: &Path) -> Vec<Value> {
    let Ok(body) = fs::read_to_string(path) else {
        return Vec::new();
    };
    if path.extension().is_some_and(|ext| ext == "jsonl") {
        return body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
    }
    match serde_json::from_str::<Value>(&body) {
        Ok(Value::Array(records)) => records,
        _ => Vec::new(),
    }
}

/// Reconstruct the ordered message list of a session.
///
/// The first system message across all records appears once, at the head;
/// each record then contributes its user/assistant messages in order.
/// A missing file is an empty conversation, not an error.
pub fn load_session_messages(path: &Path) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut system_seen = false;

    for record in load_records(path) {
        let Some(turn_msgs) = record["messages"].as_array() else {
            continue;
        };
        if !system_seen {
            for raw in turn_msgs {
                if let Some(message) = message_from_value(raw)
                    && message.role == Role::System
                {
                    messages.push(message);
                    system_seen = true;
                    break;
                }
            }
        }
        for raw in turn_msgs {
            if let Some(message) = message_from_value(raw)
                && matches!(message.role, Role::User | Role::Assistant)
            {
                messages.push(message);
            }
        }
    }
    messages
}

fn message_from_value(raw: &Value) -> Option<ChatMessage> {
    let role = match raw["role"].as_str()? {
        "system" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => return None,
    };
    Some(ChatMessage {
        role,
        content: raw["content"].as_str().unwrap_or("").to_string(),
    })
}

// ---------------------------------------------------------------------------
// Titles
// ---------------------------------------------------------------------------

/// Derive a short title from the first meaningful user message: whitespace
/// normalised, first eight words, at most eighty characters.
pub fn compute_title_from_messages(messages: &[ChatMessage]) -> Option<String> {
    let source = messages.iter().find(|m| {
        if m.role != Role::User {
            return false;
        }
        let trimmed = m.content.trim().to_lowercase();
        !TITLE_SKIP_PREFIXES
            .iter()
            .any(|prefix| trimmed.starts_with(prefix))
    })?;

    let normalised = source
        .content
        .split_whitespace()
        .take(TITLE_MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    if normalised.is_empty() {
        return None;
    }
    Some(normalised.chars().take(TITLE_MAX_CHARS).collect())
}

/// Update a session's sidecar title without touching the session file.
/// `title = None` clears it.
pub fn set_session_title(path: &Path, title: Option<&str>, custom: bool) -> Result<()> {
    let mut meta = load_meta(path);
    meta.title = title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
    meta.custom = custom;
    meta.updated = Some(now_iso());
    write_sidecar(path, &meta)
}

// ---------------------------------------------------------------------------
// Sidecars
// ---------------------------------------------------------------------------

pub fn meta_path_for(path: &Path) -> PathBuf {
    path.with_file_name(format!("{}.meta.json", file_stem(path)))
}

/// Sidecar contents, or a synthesised minimum when the sidecar is missing
/// or unreadable.
pub fn load_meta(path: &Path) -> SessionMeta {
    let meta_path = meta_path_for(path);
    let mut meta = fs::read_to_string(&meta_path)
        .ok()
        .and_then(|body| serde_json::from_str::<SessionMeta>(&body).ok())
        .unwrap_or_default();

    let stem = file_stem(path);
    if meta.id.is_empty() {
        meta.id = stem.clone();
    }
    if meta.path.is_empty() {
        meta.path = path.display().to_string();
    }
    if meta.file_name.is_none() {
        meta.file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
    }
    if meta.display_name.is_none() {
        meta.display_name = Some(format_session_display_name(&stem));
    }
    if meta.turns.is_none() {
        let records = load_records(path);
        meta.turns = Some(records.len() as u64);
        if meta.title.is_none()
            && let Some(first) = records.first()
        {
            let msgs: Vec<ChatMessage> = first["messages"]
                .as_array()
                .map(|arr| arr.iter().filter_map(message_from_value).collect())
                .unwrap_or_default();
            meta.title = compute_title_from_messages(&msgs);
        }
    }
    meta
}

fn write_sidecar(path: &Path, meta: &SessionMeta) -> Result<()> {
    write_json_pretty(&meta_path_for(path), &serde_json::to_value(meta)?)
}

// ---------------------------------------------------------------------------
// Merging and archival
// ---------------------------------------------------------------------------

/// Merge session logs, in argument order, into one new session under
/// `<root>/merged-<date>/`.
///
/// The first system preamble found across the sources is carried once;
/// user/assistant messages are regrouped into consecutive pairs (unpaired
/// tails drop) and renumbered from turn 1 under `model = "merged"`.
pub fn merge_sessions(paths: &[PathBuf], title: Option<&str>, root: &Path) -> Result<PathBuf> {
    let mut combined: Vec<ChatMessage> = Vec::new();
    let mut system_seen = false;
    let mut source_ids: Vec<String> = Vec::new();

    for path in paths {
        source_ids.push(file_stem(path));
        let messages = load_session_messages(path);
        if messages.is_empty() {
            continue;
        }
        if !system_seen
            && let Some(system) = messages.iter().find(|m| m.role == Role::System)
        {
            combined.push(system.clone());
            system_seen = true;
        }
        combined.extend(
            messages
                .into_iter()
                .filter(|m| matches!(m.role, Role::User | Role::Assistant)),
        );
    }

    let now = Utc::now();
    let out_dir = root.join(format!("merged-{}", now.format("%Y-%m-%d")));
    fs::create_dir_all(&out_dir)?;
    let stem = format!("session-merged-{}", now.format("%Y%m%d-%H%M%S"));
    let out_path = out_dir.join(format!("{stem}.json"));
    let display_name = format_session_display_name(&stem);
    let file_name = format!("{stem}.json");

    let system = combined.iter().find(|m| m.role == Role::System).cloned();
    let pairs = group_user_assistant_pairs(&combined);
    let mut records: Vec<Value> = Vec::new();
    for (turn, (user, assistant)) in pairs.iter().enumerate() {
        let mut messages: Vec<&ChatMessage> = Vec::new();
        if let Some(ref sys) = system {
            messages.push(sys);
        }
        messages.push(user);
        messages.push(assistant);
        records.push(json!({
            "messages": messages,
            "meta": {
                "model": "merged",
                "sanitized": false,
                "turn": turn + 1,
                "ts": now_iso(),
                "file_name": file_name,
                "display_name": display_name,
            },
        }));
    }
    write_json_pretty(&out_path, &Value::Array(records))?;

    let title = match title {
        Some(t) => t.to_string(),
        None => {
            let parts: Vec<String> = paths
                .iter()
                .take(3)
                .map(|path| {
                    load_meta(path)
                        .title
                        .unwrap_or_else(|| file_stem(path))
                })
                .collect();
            format!("Merged: {}", parts.join(" | "))
        }
    };

    let now_stamp = now_iso();
    let meta = SessionMeta {
        id: stem.clone(),
        path: out_path.display().to_string(),
        model: Some("merged".to_string()),
        sanitized: Some(false),
        turns: Some(pairs.len() as u64),
        created: Some(now_stamp.clone()),
        updated: Some(now_stamp),
        title: Some(title),
        custom: false,
        file_name: Some(file_name),
        display_name: Some(display_name),
        sources: Some(source_ids),
        archive: None,
        extra: serde_json::Map::new(),
    };
    write_sidecar(&out_path, &meta)?;
    debug!(path = %out_path.display(), turns = pairs.len(), "merged sessions");
    Ok(out_path)
}

fn group_user_assistant_pairs(messages: &[ChatMessage]) -> Vec<(ChatMessage, ChatMessage)> {
    let mut pairs = Vec::new();
    let mut current_user: Option<ChatMessage> = None;
    for message in messages {
        match message.role {
            Role::System => {}
            Role::User => current_user = Some(message.clone()),
            Role::Assistant => {
                if let Some(user) = current_user.take() {
                    pairs.push((user, message.clone()));
                }
            }
        }
    }
    pairs
}

/// Merge every session except the newest into a single early archive under
/// `archive_root`. Returns `None` when there is nothing to archive.
pub fn archive_early_sessions(
    root: &Path,
    archive_root: &Path,
    delete_sources: bool,
) -> Result<Option<PathBuf>> {
    let infos = list_sessions(root)?;
    if infos.len() <= 1 {
        return Ok(None);
    }

    let latest = &infos[0];
    let paths: Vec<PathBuf> = infos[1..]
        .iter()
        .map(|info| PathBuf::from(&info.path))
        .filter(|path| path.exists())
        .collect();
    if paths.is_empty() {
        return Ok(None);
    }

    let latest_display = latest
        .display_name
        .clone()
        .unwrap_or_else(|| format_session_display_name(&latest.id));
    let title = format!("Early archive (before {latest_display})");
    let merged_path = merge_sessions(&paths, Some(&title), archive_root)?;

    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let archive_stem = format!("session-early-archive-{stamp}");
    let archive_path = merged_path.with_file_name(format!("{archive_stem}.json"));
    fs::rename(&merged_path, &archive_path)?;

    let merged_sidecar = meta_path_for(&merged_path);
    let archive_sidecar = meta_path_for(&archive_path);
    if merged_sidecar.exists() {
        fs::rename(&merged_sidecar, &archive_sidecar)?;
    }

    let mut meta = load_meta(&archive_path);
    meta.id = archive_stem.clone();
    meta.path = archive_path.display().to_string();
    meta.file_name = Some(format!("{archive_stem}.json"));
    meta.display_name = Some(format_session_display_name(&archive_stem));
    meta.sources = Some(paths.iter().map(|p| file_stem(p)).collect());
    meta.archive = Some(ArchiveMeta {
        kind: "early".to_string(),
        latest_excluded_id: Some(latest.id.clone()),
        latest_excluded_display_name: Some(latest_display),
        source_count: paths.len() as u64,
        generated: Some(now_iso()),
    });
    write_sidecar(&archive_path, &meta)?;

    if delete_sources {
        delete_source_sessions(&paths, root, archive_root)?;
    }

    Ok(Some(archive_path))
}

fn delete_source_sessions(paths: &[PathBuf], root: &Path, archive_root: &Path) -> Result<()> {
    for path in paths {
        if path.exists() {
            fs::remove_file(path)?;
        }
        let sidecar = meta_path_for(path);
        if sidecar.exists() {
            fs::remove_file(&sidecar)?;
        }
        if let Some(parent) = path.parent()
            && parent != root
            && parent != archive_root
        {
            let _ = fs::remove_dir(parent);
        }
    }

    // Sweep day directories the sources left empty.
    if root.is_dir() {
        for entry in fs::read_dir(root)? {
            let day_dir = entry?.path();
            if day_dir.is_dir() && fs::read_dir(&day_dir)?.next().is_none() {
                let _ = fs::remove_dir(&day_dir);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Day log and finalisation
// ---------------------------------------------------------------------------

/// Append a finished session to its date directory's `day.json`. An entry
/// with the same id is replaced, so re-finalising is idempotent. Sessions
/// with no records contribute nothing.
pub fn append_session_to_day_log(path: &Path, meta: &SessionMeta) -> Result<Option<PathBuf>> {
    let records = load_records(path);
    if records.is_empty() {
        return Ok(None);
    }
    let Some(day_dir) = path.parent() else {
        return Ok(None);
    };
    let day_log = day_dir.join("day.json");

    let mut entries: Vec<Value> = fs::read_to_string(&day_log)
        .ok()
        .and_then(|body| serde_json::from_str::<Value>(&body).ok())
        .and_then(|value| match value {
            Value::Array(list) => Some(list),
            _ => None,
        })
        .unwrap_or_default();

    let session_id = file_stem(path);
    entries.retain(|entry| entry["id"].as_str() != Some(session_id.as_str()));
    entries.push(json!({
        "id": session_id,
        "title": meta.title,
        "custom": meta.custom,
        "path": path.display().to_string(),
        "records": records,
        "meta": serde_json::to_value(meta)?,
    }));

    write_json_pretty(&day_log, &Value::Array(entries))?;
    Ok(Some(day_log))
}

/// Remove a session that never recorded a user or assistant message: the
/// file, its sidecar, and the date directory when that leaves it empty.
pub fn delete_session_if_empty(path: &Path, meta_path: Option<&Path>) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }

    if let Some(meta_path) = meta_path
        && meta_path.exists()
        && let Ok(body) = fs::read_to_string(meta_path)
        && let Ok(meta) = serde_json::from_str::<SessionMeta>(&body)
        && meta.turn_count() > 0
    {
        return Ok(false);
    }

    for record in load_records(path) {
        if let Some(messages) = record["messages"].as_array()
            && messages.iter().any(|m| {
                matches!(m["role"].as_str(), Some("user") | Some("assistant"))
            })
        {
            return Ok(false);
        }
    }

    fs::remove_file(path)?;
    if let Some(meta_path) = meta_path
        && meta_path.exists()
    {
        fs::remove_file(meta_path)?;
    }
    if let Some(parent) = path.parent() {
        let _ = fs::remove_dir(parent);
    }
    debug!(path = %path.display(), "deleted empty session");
    Ok(true)
}

// ---------------------------------------------------------------------------
// Naming and shared helpers
// ---------------------------------------------------------------------------

/// Human-readable label for a session stem.
///
/// `session-20250913-123456` becomes `Session 2025-09-13 12:34:56 UTC`;
/// merged stems get a `Merged session` label; anything else is title-cased
/// with dashes replaced by spaces.
pub fn format_session_display_name(stem: &str) -> String {
    for (prefix, label) in [("session-merged-", "Merged session"), ("session-", "Session")] {
        if let Some(suffix) = stem.strip_prefix(prefix) {
            match NaiveDateTime::parse_from_str(suffix, "%Y%m%d-%H%M%S") {
                Ok(dt) => return format!("{label} {} UTC", dt.format("%Y-%m-%d %H:%M:%S")),
                Err(_) => break,
            }
        }
    }
    let pretty = stem.replace('-', " ");
    let pretty = pretty.trim();
    if pretty.is_empty() {
        return "Session".to_string();
    }
    pretty
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// RFC3339 UTC timestamp with second precision and a literal `Z`.
pub(crate) fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Full-file rewrite through a temp file so readers never observe a torn
/// JSON document.
pub(crate) fn write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn msg(role: Role, content: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: content.to_string(),
        }
    }

    fn write_session(root: &Path, day: &str, stem: &str, records: Value) -> PathBuf {
        let dir = root.join(day);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{stem}.json"));
        fs::write(&path, serde_json::to_string_pretty(&records).unwrap()).unwrap();
        path
    }

    fn record(turn: u64, user: &str, assistant: &str) -> Value {
        json!({
            "messages": [
                {"role": "user", "content": user},
                {"role": "assistant", "content": assistant},
            ],
            "meta": {
                "model": "m", "sanitized": false, "turn": turn,
                "ts": "2025-09-13T12:00:00Z",
                "file_name": "f.json", "display_name": "d",
            },
        })
    }

    #[test]
    fn title_uses_first_meaningful_user_message() {
        let messages = vec![
            msg(Role::System, "sys"),
            msg(Role::User, "[INSTRUMENT RESULT]\nmachine text"),
            msg(Role::User, "please   explain\nthe  borrow checker in detail for me today ok"),
        ];
        assert_eq!(
            compute_title_from_messages(&messages).unwrap(),
            "please explain the borrow checker in detail for"
        );
    }

    #[test]
    fn title_is_none_for_empty_or_machine_only_input() {
        assert!(compute_title_from_messages(&[]).is_none());
        assert!(
            compute_title_from_messages(&[msg(Role::User, "[helper result] x")]).is_none()
        );
        assert!(compute_title_from_messages(&[msg(Role::User, "   ")]).is_none());
    }

    #[test]
    fn title_truncates_to_eighty_chars() {
        let long_word = "x".repeat(200);
        let title = compute_title_from_messages(&[msg(Role::User, &long_word)]).unwrap();
        assert_eq!(title.chars().count(), 80);
    }

    #[test]
    fn display_names_follow_stem_shape() {
        assert_eq!(
            format_session_display_name("session-20250913-123456"),
            "Session 2025-09-13 12:34:56 UTC"
        );
        assert_eq!(
            format_session_display_name("session-merged-20250913-123456"),
            "Merged session 2025-09-13 12:34:56 UTC"
        );
        assert_eq!(
            format_session_display_name("session-early-archive-20250913-123456"),
            "Session Early Archive 20250913 123456"
        );
    }

    #[test]
    fn load_messages_keeps_one_system_and_ordered_pairs() {
        let tmp = tempdir().unwrap();
        let path = write_session(
            tmp.path(),
            "2025-09-13",
            "session-20250913-000001",
            json!([
                {"messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "one"},
                    {"role": "assistant", "content": "1"},
                ], "meta": {"turn": 1}},
                {"messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "two"},
                    {"role": "assistant", "content": "2"},
                ], "meta": {"turn": 2}},
                {"messages": [], "meta": {"turn": 3}},
            ]),
        );
        let messages = load_session_messages(&path);
        let rendered: Vec<(Role, &str)> = messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            rendered,
            vec![
                (Role::System, "sys"),
                (Role::User, "one"),
                (Role::Assistant, "1"),
                (Role::User, "two"),
                (Role::Assistant, "2"),
            ]
        );
    }

    #[test]
    fn missing_file_loads_as_empty_conversation() {
        assert!(load_session_messages(Path::new("/nonexistent/session.json")).is_empty());
    }

    #[test]
    fn legacy_jsonl_records_are_read_line_by_line() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("2025-09-13");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session-20250913-000002.jsonl");
        let mut body = serde_json::to_string(&record(1, "a", "b")).unwrap();
        body.push('\n');
        body.push_str("not json\n");
        body.push_str(&serde_json::to_string(&record(2, "c", "d")).unwrap());
        fs::write(&path, body).unwrap();

        let messages = load_session_messages(&path);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].content, "c");
    }

    #[test]
    fn list_prefers_json_over_jsonl_twin_and_sorts_newest_first() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();

        let old = write_session(
            root,
            "2025-09-12",
            "session-20250912-010101",
            json!([record(1, "old", "o")]),
        );
        set_session_title(&old, Some("old"), false).unwrap();
        let mut meta = load_meta(&old);
        meta.updated = Some("2025-09-12T01:01:01Z".to_string());
        write_json_pretty(&meta_path_for(&old), &serde_json::to_value(&meta).unwrap()).unwrap();

        let new = write_session(
            root,
            "2025-09-13",
            "session-20250913-020202",
            json!([record(1, "new", "n")]),
        );
        // A stale jsonl twin of the new session must be shadowed.
        fs::write(
            new.with_extension("jsonl"),
            serde_json::to_string(&record(1, "stale", "s")).unwrap(),
        )
        .unwrap();
        let mut meta = load_meta(&new);
        meta.updated = Some("2025-09-13T02:02:02Z".to_string());
        write_json_pretty(&meta_path_for(&new), &serde_json::to_value(&meta).unwrap()).unwrap();

        let listed = list_sessions(root).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "session-20250913-020202");
        assert!(listed[0].path.ends_with(".json"));
        assert_eq!(listed[1].id, "session-20250912-010101");
    }

    #[test]
    fn list_synthesises_meta_when_sidecar_is_absent() {
        let tmp = tempdir().unwrap();
        let path = write_session(
            tmp.path(),
            "2025-09-13",
            "session-20250913-030303",
            json!([record(1, "what is rust", "a language")]),
        );
        let listed = list_sessions(tmp.path()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].turn_count(), 1);
        assert_eq!(listed[0].title.as_deref(), Some("what is rust"));
        assert_eq!(listed[0].path, path.display().to_string());
    }

    #[test]
    fn resolve_matches_path_stem_and_suffix() {
        let tmp = tempdir().unwrap();
        let path = write_session(
            tmp.path(),
            "2025-09-13",
            "session-20250913-040404",
            json!([record(1, "a", "b")]),
        );

        assert_eq!(
            resolve_session(path.to_str().unwrap(), tmp.path()).unwrap(),
            path
        );
        assert_eq!(
            resolve_session("session-20250913-040404", tmp.path()).unwrap(),
            path
        );
        assert_eq!(resolve_session("040404", tmp.path()).unwrap(), path);
        assert!(resolve_session("nope", tmp.path()).is_none());
    }

    #[test]
    fn set_title_preserves_unknown_sidecar_keys() {
        let tmp = tempdir().unwrap();
        let path = write_session(
            tmp.path(),
            "2025-09-13",
            "session-20250913-050505",
            json!([record(1, "a", "b")]),
        );
        let sidecar = meta_path_for(&path);
        fs::write(
            &sidecar,
            serde_json::to_string_pretty(&json!({
                "id": "session-20250913-050505",
                "turns": 1,
                "operator_note": "keep me",
            }))
            .unwrap(),
        )
        .unwrap();

        set_session_title(&path, Some("  My Title  "), true).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(&sidecar).unwrap()).unwrap();
        assert_eq!(raw["title"], "My Title");
        assert_eq!(raw["custom"], true);
        assert_eq!(raw["operator_note"], "keep me");
        assert!(raw["updated"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn merge_single_session_round_trips_messages() {
        let tmp = tempdir().unwrap();
        let source = write_session(
            tmp.path(),
            "2025-09-13",
            "session-20250913-060606",
            json!([
                {"messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "q"},
                    {"role": "assistant", "content": "a"},
                ], "meta": {"turn": 1}},
            ]),
        );
        let merged_root = tmp.path().join("merged-out");
        let merged = merge_sessions(&[source.clone()], None, &merged_root).unwrap();

        assert_eq!(load_session_messages(&merged), load_session_messages(&source));

        let meta = load_meta(&merged);
        assert_eq!(meta.model.as_deref(), Some("merged"));
        assert_eq!(meta.turns, Some(1));
        assert_eq!(
            meta.sources.as_deref(),
            Some(&["session-20250913-060606".to_string()][..])
        );
        assert!(meta.title.unwrap().starts_with("Merged: "));
    }

    #[test]
    fn merge_preserves_order_and_first_system_only() {
        let tmp = tempdir().unwrap();
        let first = write_session(
            tmp.path(),
            "2025-09-12",
            "session-20250912-070707",
            json!([
                {"messages": [
                    {"role": "system", "content": "first sys"},
                    {"role": "user", "content": "u1"},
                    {"role": "assistant", "content": "a1"},
                ], "meta": {"turn": 1}},
            ]),
        );
        let second = write_session(
            tmp.path(),
            "2025-09-13",
            "session-20250913-080808",
            json!([
                {"messages": [
                    {"role": "system", "content": "second sys"},
                    {"role": "user", "content": "u2"},
                    {"role": "assistant", "content": "a2"},
                ], "meta": {"turn": 1}},
            ]),
        );

        let merged =
            merge_sessions(&[first, second], Some("both"), &tmp.path().join("out")).unwrap();
        let messages = load_session_messages(&merged);

        let systems: Vec<_> = messages.iter().filter(|m| m.role == Role::System).collect();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].content, "first sys");

        let dialogue: Vec<&str> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(dialogue, vec!["u1", "a1", "u2", "a2"]);
    }

    #[test]
    fn merge_drops_unpaired_trailing_user() {
        let messages = vec![
            msg(Role::User, "u1"),
            msg(Role::Assistant, "a1"),
            msg(Role::User, "dangling"),
        ];
        let pairs = group_user_assistant_pairs(&messages);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.content, "u1");
    }

    #[test]
    fn archive_early_keeps_newest_and_merges_the_rest() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("sessions");
        let archive_root = tmp.path().join("archives");

        let stems = [
            ("2025-09-11", "session-20250911-000001", 2),
            ("2025-09-12", "session-20250912-000001", 1),
            ("2025-09-13", "session-20250913-000001", 3),
        ];
        for (index, (day, stem, turns)) in stems.iter().enumerate() {
            let records: Vec<Value> = (1..=*turns)
                .map(|t| record(t, &format!("u{index}-{t}"), &format!("a{index}-{t}")))
                .collect();
            let path = write_session(&root, day, stem, Value::Array(records));
            let mut meta = load_meta(&path);
            meta.updated = Some(format!("2025-09-1{}T00:00:01Z", index + 1));
            write_json_pretty(&meta_path_for(&path), &serde_json::to_value(&meta).unwrap())
                .unwrap();
        }

        let archive = archive_early_sessions(&root, &archive_root, true)
            .unwrap()
            .expect("two sessions should be archived");

        // Only the newest session remains listed.
        let remaining = list_sessions(&root).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "session-20250913-000001");

        // 2 + 1 turns from the two older sessions.
        let meta = load_meta(&archive);
        assert_eq!(meta.turns, Some(3));
        let archive_info = meta.archive.unwrap();
        assert_eq!(archive_info.kind, "early");
        assert_eq!(archive_info.source_count, 2);
        assert_eq!(
            archive_info.latest_excluded_id.as_deref(),
            Some("session-20250913-000001")
        );

        // Sources are gone, day directories cleaned up.
        assert!(!root.join("2025-09-11").exists());
        assert!(!root.join("2025-09-12").exists());
        assert!(meta.id.starts_with("session-early-archive-"));
    }

    #[test]
    fn archive_early_is_noop_for_single_session() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("sessions");
        write_session(
            &root,
            "2025-09-13",
            "session-20250913-000001",
            json!([record(1, "a", "b")]),
        );
        let result =
            archive_early_sessions(&root, &tmp.path().join("archives"), true).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn day_log_append_replaces_entries_by_id() {
        let tmp = tempdir().unwrap();
        let path = write_session(
            tmp.path(),
            "2025-09-13",
            "session-20250913-090909",
            json!([record(1, "q", "a")]),
        );
        let meta = load_meta(&path);

        let day_log = append_session_to_day_log(&path, &meta).unwrap().unwrap();
        append_session_to_day_log(&path, &meta).unwrap();

        let entries: Value =
            serde_json::from_str(&fs::read_to_string(&day_log).unwrap()).unwrap();
        let entries = entries.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["id"], "session-20250913-090909");
        assert_eq!(entries[0]["records"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn empty_session_is_deleted_with_sidecar_and_directory() {
        let tmp = tempdir().unwrap();
        let path = write_session(
            tmp.path(),
            "2025-09-13",
            "session-20250913-101010",
            json!([]),
        );
        let sidecar = meta_path_for(&path);
        fs::write(&sidecar, r#"{"id": "session-20250913-101010", "turns": 0}"#).unwrap();

        let deleted = delete_session_if_empty(&path, Some(&sidecar)).unwrap();
        assert!(deleted);
        assert!(!path.exists());
        assert!(!sidecar.exists());
        assert!(!tmp.path().join("2025-09-13").exists());
    }

    #[test]
    fn session_with_dialogue_is_never_deleted() {
        let tmp = tempdir().unwrap();
        let path = write_session(
            tmp.path(),
            "2025-09-13",
            "session-20250913-111111",
            json!([record(1, "hello", "hi")]),
        );
        assert!(!delete_session_if_empty(&path, None).unwrap());
        assert!(path.exists());
    }
}
