use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

pub const SESSION_STARTED: &str = "session_started";
pub const SAMPLE_ADDED: &str = "sample_added";
pub const SAMPLE_SKIPPED: &str = "sample_skipped";
pub const ANALYSIS_STARTED: &str = "analysis_started";
pub const ANALYSIS_FINISHED: &str = "analysis_finished";
pub const ANALYSIS_FAILED: &str = "analysis_failed";
pub const RESULT_SAVED: &str = "result_saved";
pub const SESSION_RESET: &str = "session_reset";
pub const SESSION_FINISHED: &str = "session_finished";

/// Append-only journal of inspection activity, one compact JSON object per line.
///
/// Every line carries `type`, `run_id` and `ts`; the caller payload is
/// merged last and may override them. Image bytes never go in here.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<JournalInner>,
}

#[derive(Debug)]
struct JournalInner {
    path: PathBuf,
    run_id: String,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(JournalInner {
                path: path.into(),
                run_id: run_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let event = self.compose(event_type, payload);
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut slot = self
            .inner
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event journal lock poisoned"))?;
        if slot.is_none() {
            *slot = Some(self.open_journal()?);
        }
        if let Some(file) = slot.as_mut() {
            file.write_all(line.as_bytes()).with_context(|| {
                format!("failed to append to {}", self.inner.path.display())
            })?;
        }
        Ok(Value::Object(event))
    }

    /// Every parsable event written so far, in append order.
    pub fn read_all(&self) -> anyhow::Result<Vec<Value>> {
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .collect())
    }

    pub fn types(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .read_all()?
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    fn compose(&self, event_type: &str, payload: EventPayload) -> EventPayload {
        let mut event = EventPayload::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert("run_id".to_string(), Value::String(self.inner.run_id.clone()));
        event.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        event.extend(payload);
        event
    }

    fn open_journal(&self) -> anyhow::Result<File> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .with_context(|| format!("failed to open {}", self.inner.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        let mut payload = EventPayload::new();
        payload.insert("label".to_string(), Value::String("good".to_string()));
        let emitted = writer.emit(SAMPLE_ADDED, payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String(SAMPLE_ADDED.to_string()));
        assert_eq!(parsed["run_id"], Value::String("run-123".to_string()));
        assert_eq!(parsed["label"], Value::String("good".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-123");

        let mut payload = EventPayload::new();
        payload.insert("run_id".to_string(), Value::String("override".to_string()));
        let emitted = writer.emit(SESSION_STARTED, payload)?;
        assert_eq!(emitted["run_id"], Value::String("override".to_string()));
        Ok(())
    }

    #[test]
    fn types_reads_back_in_append_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("nested/events.jsonl"), "run-123");
        assert!(writer.types()?.is_empty());

        writer.emit(SESSION_STARTED, EventPayload::new())?;
        writer.emit(ANALYSIS_STARTED, EventPayload::new())?;
        writer.emit(ANALYSIS_FAILED, EventPayload::new())?;

        assert_eq!(
            writer.types()?,
            vec![SESSION_STARTED, ANALYSIS_STARTED, ANALYSIS_FAILED]
        );
        Ok(())
    }
}
