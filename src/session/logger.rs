//! Per-client session writer.
//!
//! One logger owns one session file and its sidecar. Each recorded turn
//! appends a record and rewrites both files (sessions are small; the
//! rewrite goes through a temp file, session file first, sidecar second).

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{
    SessionMeta, file_stem, format_session_display_name, load_records, meta_path_for, now_iso,
    write_json_pretty,
};
use crate::core::ChatMessage;

pub struct SessionLogger {
    model: String,
    sanitized: bool,
    root: PathBuf,
    file: Option<PathBuf>,
    meta_file: Option<PathBuf>,
    turn: u64,
    title: Option<String>,
    title_custom: bool,
    display_name: Option<String>,
    records: Vec<Value>,
}

impl SessionLogger {
    pub fn new(model: &str, sanitized: bool, root: &Path) -> Self {
        Self {
            model: model.to_string(),
            sanitized,
            root: root.to_path_buf(),
            file: None,
            meta_file: None,
            turn: 0,
            title: None,
            title_custom: false,
            display_name: None,
            records: Vec::new(),
        }
    }

    /// Create the dated directory, the (empty) session file, and its
    /// sidecar. Re-starting onto a file that already exists for this second
    /// continues it.
    pub fn start(&mut self) -> Result<()> {
        let now = Utc::now();
        let day_dir = self.root.join(now.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&day_dir)?;

        let file = day_dir.join(format!("session-{}.json", now.format("%Y%m%d-%H%M%S")));
        self.display_name = Some(format_session_display_name(&file_stem(&file)));
        self.records = if file.exists() {
            load_records(&file)
        } else {
            Vec::new()
        };
        self.turn = self.records.len() as u64;
        if !file.exists() {
            write_json_pretty(&file, &Value::Array(Vec::new()))?;
        }

        self.meta_file = Some(meta_path_for(&file));
        self.file = Some(file);
        self.write_meta(true)?;
        debug!(path = ?self.file, "session started");
        Ok(())
    }

    /// Append one turn record and refresh the sidecar.
    pub fn log_turn(&mut self, messages: &[ChatMessage]) -> Result<()> {
        if self.file.is_none() {
            self.start()?;
        }
        self.turn += 1;
        let file = self.file.as_ref().expect("logger started");
        self.records.push(json!({
            "messages": messages,
            "meta": {
                "model": self.model,
                "sanitized": self.sanitized,
                "turn": self.turn,
                "ts": now_iso(),
                "file_name": file.file_name().map(|n| n.to_string_lossy().into_owned()),
                "display_name": self.display_name,
            },
        }));
        write_json_pretty(file, &Value::Array(self.records.clone()))?;
        self.write_meta(false)
    }

    /// Set the session title. Inference passes `custom = false` and must
    /// never demote a title the operator set by hand.
    pub fn set_title(&mut self, title: Option<&str>, custom: bool) -> Result<()> {
        self.title = title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        self.title_custom = custom;
        self.write_meta(false)
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Current sidecar state, preferring on-disk content when present.
    pub fn get_meta(&self) -> SessionMeta {
        if let Some(ref meta_file) = self.meta_file
            && meta_file.exists()
            && let Ok(body) = fs::read_to_string(meta_file)
            && let Ok(meta) = serde_json::from_str::<SessionMeta>(&body)
        {
            return meta;
        }
        self.build_meta(None)
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn meta_path(&self) -> Option<&Path> {
        self.meta_file.as_deref()
    }

    /// Rebind this logger to an existing session so subsequent turns
    /// continue it.
    pub fn load_existing(&mut self, path: &Path) -> Result<()> {
        self.records = load_records(path);
        self.turn = self.records.len() as u64;
        self.display_name = Some(format_session_display_name(&file_stem(path)));
        self.meta_file = Some(meta_path_for(path));
        self.file = Some(path.to_path_buf());

        if let Some(ref meta_file) = self.meta_file
            && meta_file.exists()
            && let Ok(body) = fs::read_to_string(meta_file)
            && let Ok(meta) = serde_json::from_str::<SessionMeta>(&body)
        {
            self.turn = self.turn.max(meta.turn_count());
            self.title = meta.title;
            self.title_custom = meta.custom;
        }
        debug!(path = %path.display(), turns = self.turn, "session adopted");
        Ok(())
    }

    fn write_meta(&mut self, initial: bool) -> Result<()> {
        let Some(ref meta_file) = self.meta_file else {
            return Ok(());
        };

        let mut created = None;
        if !initial
            && meta_file.exists()
            && let Ok(body) = fs::read_to_string(meta_file)
            && let Ok(stored) = serde_json::from_str::<SessionMeta>(&body)
        {
            created = stored.created.clone();
            if self.title.is_none() {
                // Nothing set locally yet: adopt whatever is on disk.
                self.title = stored.title.clone();
                self.title_custom = stored.custom;
            } else if !self.title_custom && self.title == stored.title {
                // An inferred title equal to the stored one must not clear
                // a custom flag the operator set earlier.
                self.title_custom = stored.custom;
            }
            if self.display_name.is_none() {
                self.display_name = stored.display_name.clone();
            }
        }

        let meta = self.build_meta(created);
        write_json_pretty(meta_file, &serde_json::to_value(&meta)?)
    }

    fn build_meta(&self, created: Option<String>) -> SessionMeta {
        let now = now_iso();
        let stem = self.file.as_deref().map(file_stem).unwrap_or_default();
        SessionMeta {
            id: stem.clone(),
            path: self
                .file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            model: Some(self.model.clone()),
            sanitized: Some(self.sanitized),
            turns: Some(self.turn),
            created: Some(created.unwrap_or_else(|| now.clone())),
            updated: Some(now),
            title: self.title.clone(),
            custom: self.title_custom,
            file_name: self
                .file
                .as_ref()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned())),
            display_name: self
                .display_name
                .clone()
                .or_else(|| Some(format_session_display_name(&stem))),
            sources: None,
            archive: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;
    use tempfile::tempdir;

    fn msg(role: Role, content: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn start_creates_session_file_and_sidecar() {
        let tmp = tempdir().unwrap();
        let mut logger = SessionLogger::new("test-model", true, tmp.path());
        logger.start().unwrap();

        let path = logger.log_path().unwrap().to_path_buf();
        let sidecar = logger.meta_path().unwrap().to_path_buf();
        assert!(path.exists());
        assert!(sidecar.exists());

        let meta = logger.get_meta();
        assert_eq!(meta.turn_count(), 0);
        assert_eq!(meta.model.as_deref(), Some("test-model"));
        assert_eq!(meta.sanitized, Some(true));
        assert_eq!(
            meta.display_name.as_deref(),
            Some(format_session_display_name(&meta.id).as_str())
        );
    }

    #[test]
    fn log_turn_appends_records_and_updates_sidecar() {
        let tmp = tempdir().unwrap();
        let mut logger = SessionLogger::new("test-model", false, tmp.path());
        logger.start().unwrap();

        logger
            .log_turn(&[
                msg(Role::System, "sys"),
                msg(Role::User, "hi"),
                msg(Role::Assistant, "hello"),
            ])
            .unwrap();
        logger
            .log_turn(&[msg(Role::User, "again"), msg(Role::Assistant, "sure")])
            .unwrap();

        let meta = logger.get_meta();
        assert_eq!(meta.turn_count(), 2);

        let records = load_records(logger.log_path().unwrap());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["meta"]["turn"], 1);
        assert_eq!(records[1]["meta"]["turn"], 2);
        assert_eq!(
            records[0]["meta"]["file_name"].as_str().unwrap(),
            logger
                .log_path()
                .unwrap()
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
        );
    }

    #[test]
    fn session_round_trips_through_the_store() {
        let tmp = tempdir().unwrap();
        let mut logger = SessionLogger::new("m", false, tmp.path());
        logger.start().unwrap();

        let system = msg(Role::System, "preamble");
        for turn in 0..3 {
            logger
                .log_turn(&[
                    system.clone(),
                    msg(Role::User, &format!("u{turn}")),
                    msg(Role::Assistant, &format!("a{turn}")),
                ])
                .unwrap();
        }

        let messages = super::super::load_session_messages(logger.log_path().unwrap());
        assert_eq!(messages.len(), 7); // one preamble + three pairs
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "u0");
        assert_eq!(messages[6].content, "a2");
    }

    #[test]
    fn inference_never_demotes_a_custom_title() {
        let tmp = tempdir().unwrap();
        let mut logger = SessionLogger::new("m", false, tmp.path());
        logger.start().unwrap();

        logger.set_title(Some("Operator title"), true).unwrap();
        // Title inference re-submits the same title with custom = false.
        logger.set_title(Some("Operator title"), false).unwrap();

        let meta = logger.get_meta();
        assert_eq!(meta.title.as_deref(), Some("Operator title"));
        assert!(meta.custom);
    }

    #[test]
    fn a_different_inferred_title_replaces_a_plain_one() {
        let tmp = tempdir().unwrap();
        let mut logger = SessionLogger::new("m", false, tmp.path());
        logger.start().unwrap();

        logger.set_title(Some("first"), false).unwrap();
        logger.set_title(Some("second"), false).unwrap();

        let meta = logger.get_meta();
        assert_eq!(meta.title.as_deref(), Some("second"));
        assert!(!meta.custom);
    }

    #[test]
    fn load_existing_continues_turn_numbering() {
        let tmp = tempdir().unwrap();
        let mut first = SessionLogger::new("m", false, tmp.path());
        first.start().unwrap();
        first
            .log_turn(&[msg(Role::User, "one"), msg(Role::Assistant, "1")])
            .unwrap();
        first.set_title(Some("kept"), true).unwrap();
        let path = first.log_path().unwrap().to_path_buf();

        let mut second = SessionLogger::new("m", false, tmp.path());
        second.load_existing(&path).unwrap();
        assert_eq!(second.title(), Some("kept"));

        second
            .log_turn(&[msg(Role::User, "two"), msg(Role::Assistant, "2")])
            .unwrap();

        let records = load_records(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["meta"]["turn"], 2);
        let meta = second.get_meta();
        assert_eq!(meta.turn_count(), 2);
        assert!(meta.custom);
    }
}
