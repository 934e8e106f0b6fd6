//! Transcript persistence: one append-only log per conversation id

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::message::{InboundMessage, OutboundAction};

static CONVERSATION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,127}$").unwrap());

/// Check that a conversation id is usable as a file stem
pub fn validate_conversation_id(id: &str) -> Result<()> {
    if CONVERSATION_ID.is_match(id) {
        Ok(())
    } else {
        Err(Error::InvalidConversationId(id.to_string()))
    }
}

/// Which side of the chat an entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The simulated user (our outbound actions)
    User,
    /// The counterpart shown in the chat
    Chat,
}

impl Sender {
    fn label(&self) -> &'static str {
        match self {
            Sender::User => "🤖 User",
            Sender::Chat => "👩 Chat",
        }
    }
}

/// One persisted transcript record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub sender: Sender,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "send_star")]
    pub send_star: Option<bool>,
    pub timestamp: DateTime<Local>,
}

impl TranscriptEntry {
    /// Record of an action we delivered
    pub fn outbound(action: &OutboundAction) -> Self {
        Self {
            sender: Sender::User,
            text: action.delivered_text().map(str::to_string),
            image: None,
            send_star: Some(action.send_special),
            timestamp: Local::now(),
        }
    }

    /// Record of a message the detector accepted
    pub fn inbound(message: &InboundMessage) -> Self {
        Self {
            sender: Sender::Chat,
            text: message.text.clone(),
            image: message.reported_image().map(str::to_string),
            send_star: None,
            timestamp: Local::now(),
        }
    }

    /// Human-readable single line
    pub fn format_line(&self) -> String {
        let text = self
            .text
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or("*No text*");
        let image = if self.image.is_some() { "(PHOTO 📸)" } else { "" };
        let star = if self.send_star == Some(true) { "⭐" } else { "" };
        format!(
            "{}: {} {}{} ({})",
            self.sender.label(),
            text,
            image,
            star,
            self.timestamp.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Render a whole transcript, one line per entry
pub fn render_transcript(entries: &[TranscriptEntry]) -> String {
    entries
        .iter()
        .map(TranscriptEntry::format_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Conversation-scoped append-only log.
///
/// A single writer per conversation id is assumed.
pub trait TranscriptStore: Send + Sync {
    /// Append one entry to the conversation's log
    fn append(&self, conversation_id: &str, entry: &TranscriptEntry) -> Result<()>;

    /// Read back every entry; a missing or unreadable log is empty
    fn entries(&self, conversation_id: &str) -> Result<Vec<TranscriptEntry>>;

    /// Render the log to its human-readable form, persist it, and return it
    fn flush_formatted(&self, conversation_id: &str) -> Result<String>;

    /// Remove the log and its rendered form
    fn reset(&self, conversation_id: &str) -> Result<()>;
}

/// JSONL transcripts under a directory: `<id>.jsonl` plus rendered `<id>.log`
pub struct FileTranscriptStore {
    dir: PathBuf,
    writers: Mutex<HashMap<String, BufWriter<File>>>,
}

impl FileTranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", conversation_id))
    }

    pub fn formatted_path(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("{}.log", conversation_id))
    }

    fn corrupt_path(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl.corrupt", conversation_id))
    }

    /// Open the log for appending, moving a corrupt one out of the way first
    fn open_writer(&self, conversation_id: &str) -> Result<BufWriter<File>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.log_path(conversation_id);

        if path.exists() && !log_is_readable(&path) {
            let aside = self.corrupt_path(conversation_id);
            tracing::warn!(
                "Transcript {} is unreadable, moving it to {} and starting empty",
                path.display(),
                aside.display()
            );
            fs::rename(&path, &aside)?;
        }

        let file = File::options().create(true).append(true).open(&path)?;
        Ok(BufWriter::new(file))
    }
}

/// Every non-empty line parses as an entry
fn log_is_readable(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    BufReader::new(file).lines().all(|line| match line {
        Ok(line) if line.trim().is_empty() => true,
        Ok(line) => serde_json::from_str::<TranscriptEntry>(&line).is_ok(),
        Err(_) => false,
    })
}

impl TranscriptStore for FileTranscriptStore {
    fn append(&self, conversation_id: &str, entry: &TranscriptEntry) -> Result<()> {
        validate_conversation_id(conversation_id)?;
        let line = serde_json::to_string(entry)?;

        let mut writers = self.writers.lock();
        let writer = match writers.entry(conversation_id.to_string()) {
            std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(self.open_writer(conversation_id)?)
            }
        };
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }

    fn entries(&self, conversation_id: &str) -> Result<Vec<TranscriptEntry>> {
        validate_conversation_id(conversation_id)?;
        let path = self.log_path(conversation_id);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Transcript {} not found, treating as empty", path.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                tracing::warn!("Transcript {} unavailable: {}", path.display(), e);
                return Ok(Vec::new());
            }
        };

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let Ok(line) = line else {
                tracing::warn!("Transcript {} unreadable, treating as empty", path.display());
                return Ok(Vec::new());
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    "Skipping corrupt transcript line {} in {}: {}",
                    index + 1,
                    path.display(),
                    e
                ),
            }
        }
        Ok(entries)
    }

    fn flush_formatted(&self, conversation_id: &str) -> Result<String> {
        let rendered = render_transcript(&self.entries(conversation_id)?);
        fs::create_dir_all(&self.dir)?;
        fs::write(self.formatted_path(conversation_id), &rendered)?;
        Ok(rendered)
    }

    fn reset(&self, conversation_id: &str) -> Result<()> {
        validate_conversation_id(conversation_id)?;
        self.writers.lock().remove(conversation_id);
        for path in [
            self.log_path(conversation_id),
            self.formatted_path(conversation_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// In-memory transcripts, for tests and dry runs
#[derive(Default)]
pub struct MemoryTranscriptStore {
    logs: Mutex<HashMap<String, Vec<TranscriptEntry>>>,
    formatted: Mutex<HashMap<String, String>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last rendered form of a conversation, if flushed
    pub fn formatted(&self, conversation_id: &str) -> Option<String> {
        self.formatted.lock().get(conversation_id).cloned()
    }
}

impl TranscriptStore for MemoryTranscriptStore {
    fn append(&self, conversation_id: &str, entry: &TranscriptEntry) -> Result<()> {
        validate_conversation_id(conversation_id)?;
        self.logs
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn entries(&self, conversation_id: &str) -> Result<Vec<TranscriptEntry>> {
        Ok(self
            .logs
            .lock()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    fn flush_formatted(&self, conversation_id: &str) -> Result<String> {
        let rendered = render_transcript(&self.entries(conversation_id)?);
        self.formatted
            .lock()
            .insert(conversation_id.to_string(), rendered.clone());
        Ok(rendered)
    }

    fn reset(&self, conversation_id: &str) -> Result<()> {
        self.logs.lock().remove(conversation_id);
        self.formatted.lock().remove(conversation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static FORMATTED_LINE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(🤖 User|👩 Chat): .* \(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\)$").unwrap()
    });

    fn text_entry() -> TranscriptEntry {
        TranscriptEntry::outbound(&OutboundAction::text("hello there"))
    }

    fn image_entry() -> TranscriptEntry {
        TranscriptEntry::inbound(&InboundMessage {
            text: Some("look at this".into()),
            displayed_timestamp: Some("12:01".into()),
            has_image: true,
            image_url: Some("https://example.com/cat.png".into()),
        })
    }

    fn special_entry() -> TranscriptEntry {
        TranscriptEntry::outbound(&OutboundAction::special())
    }

    #[test]
    fn test_conversation_id_validation() {
        assert!(validate_conversation_id("50559917-2120-4259-a85f-beef22affe0d").is_ok());
        assert!(validate_conversation_id("c1").is_ok());
        assert!(validate_conversation_id("").is_err());
        assert!(validate_conversation_id("../etc/passwd").is_err());
        assert!(validate_conversation_id("a/b").is_err());
        assert!(validate_conversation_id("-leading").is_err());
    }

    #[test]
    fn test_entry_wire_format() {
        let json = serde_json::to_value(special_entry()).unwrap();
        assert_eq!(json["sender"], "user");
        assert_eq!(json["text"], serde_json::Value::Null);
        assert_eq!(json["sendStar"], true);
        assert!(json.get("image").is_none());

        let json = serde_json::to_value(image_entry()).unwrap();
        assert_eq!(json["sender"], "chat");
        assert_eq!(json["image"], "https://example.com/cat.png");
        assert!(json.get("sendStar").is_none());
    }

    #[test]
    fn test_entry_reads_snake_case_star_key() {
        let line = r#"{"sender": "user", "text": null, "send_star": true, "timestamp": "2024-05-01T10:00:00+02:00"}"#;
        let entry: TranscriptEntry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.sender, Sender::User);
        assert_eq!(entry.send_star, Some(true));
    }

    #[test]
    fn test_inbound_without_new_image_has_no_image_field() {
        let entry = TranscriptEntry::inbound(&InboundMessage {
            text: Some("same pic".into()),
            image_url: Some("https://example.com/cat.png".into()),
            has_image: false,
            ..Default::default()
        });
        assert_eq!(entry.image, None);
    }

    #[test]
    fn test_format_line_annotations() {
        let line = text_entry().format_line();
        assert!(line.starts_with("🤖 User: hello there "));
        assert!(!line.contains("📸"));
        assert!(!line.contains("⭐"));

        let line = image_entry().format_line();
        assert!(line.starts_with("👩 Chat: look at this (PHOTO 📸)"));

        let line = special_entry().format_line();
        assert!(line.starts_with("🤖 User: *No text* ⭐"));
    }

    #[test]
    fn test_file_store_flush_three_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path());

        store.append("c1", &text_entry()).unwrap();
        store.append("c1", &image_entry()).unwrap();
        store.append("c1", &special_entry()).unwrap();

        let rendered = store.flush_formatted("c1").unwrap();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            assert!(FORMATTED_LINE.is_match(line), "bad line: {}", line);
        }
        assert!(lines[0].starts_with("🤖 User: hello there"));
        assert!(lines[1].contains("(PHOTO 📸)"));
        assert!(lines[2].contains("⭐"));

        let on_disk = fs::read_to_string(store.formatted_path("c1")).unwrap();
        assert_eq!(on_disk, rendered);
    }

    #[test]
    fn test_file_store_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path().join("not-yet-created"));
        assert!(store.entries("c1").unwrap().is_empty());
        assert_eq!(store.flush_formatted("c1").unwrap(), "");
    }

    #[test]
    fn test_file_store_append_over_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path());
        store.append("c1", &text_entry()).unwrap();
        assert_eq!(store.entries("c1").unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_append_over_corrupt_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path());
        fs::write(store.log_path("c1"), "[{\"sender\": \"user\", \"text\": tru").unwrap();

        let entry = text_entry();
        store.append("c1", &entry).unwrap();

        let entries = store.entries("c1").unwrap();
        assert_eq!(entries, vec![entry]);
        assert!(store.corrupt_path("c1").exists());
    }

    #[test]
    fn test_file_store_keeps_corrupt_log_when_it_cannot_be_moved() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path());
        let corrupt = "[{\"sender\": \"user\", \"text\": tru";
        fs::write(store.log_path("c1"), corrupt).unwrap();
        // A non-empty directory in the way makes the rename fail
        fs::create_dir_all(store.corrupt_path("c1").join("occupied")).unwrap();

        let err = store.append("c1", &text_entry()).unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert_eq!(fs::read_to_string(store.log_path("c1")).unwrap(), corrupt);
    }

    #[test]
    fn test_file_store_reads_skip_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path());
        store.append("c1", &text_entry()).unwrap();

        let mut raw = fs::read_to_string(store.log_path("c1")).unwrap();
        raw.push_str("garbage\n");
        fs::write(store.log_path("c1"), raw).unwrap();

        assert_eq!(store.entries("c1").unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_isolates_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path());
        store.append("c1", &text_entry()).unwrap();
        store.append("c2", &image_entry()).unwrap();
        store.append("c2", &special_entry()).unwrap();

        assert_eq!(store.entries("c1").unwrap().len(), 1);
        assert_eq!(store.entries("c2").unwrap().len(), 2);
    }

    #[test]
    fn test_file_store_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        FileTranscriptStore::new(dir.path())
            .append("c1", &text_entry())
            .unwrap();
        let store = FileTranscriptStore::new(dir.path());
        store.append("c1", &image_entry()).unwrap();
        assert_eq!(store.entries("c1").unwrap().len(), 2);
    }

    #[test]
    fn test_file_store_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path());
        store.append("c1", &text_entry()).unwrap();
        store.flush_formatted("c1").unwrap();

        store.reset("c1").unwrap();
        assert!(!store.log_path("c1").exists());
        assert!(!store.formatted_path("c1").exists());

        store.append("c1", &special_entry()).unwrap();
        assert_eq!(store.entries("c1").unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_rejects_bad_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path());
        let err = store.append("../escape", &text_entry()).unwrap_err();
        assert!(matches!(err, Error::InvalidConversationId(_)));
    }

    #[test]
    fn test_memory_store_flush() {
        let store = MemoryTranscriptStore::new();
        store.append("c1", &text_entry()).unwrap();
        store.append("c1", &special_entry()).unwrap();
        let rendered = store.flush_formatted("c1").unwrap();
        assert_eq!(rendered.lines().count(), 2);
        assert_eq!(store.formatted("c1"), Some(rendered));
    }
}
