use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type EventPayload = Map<String, Value>;

/// Diagnostics log for one chat session, one compact JSON object per line.
///
/// Every event carries `type`, `session_id` and `ts`; payload keys are merged
/// after those and win on conflict. A writer built without a path returns the
/// event but never touches disk. Clones share one file lock, so the UI thread
/// and generation workers can log concurrently.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<SessionLog>,
}

#[derive(Debug)]
struct SessionLog {
    path: Option<PathBuf>,
    session_id: String,
    append_lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self::with_target(Some(path.into()), session_id.into())
    }

    pub fn disabled() -> Self {
        Self::with_target(None, Uuid::new_v4().to_string())
    }

    /// Logs to `path` when given; a fresh session id either way.
    pub fn for_session(path: Option<PathBuf>) -> Self {
        Self::with_target(path, Uuid::new_v4().to_string())
    }

    fn with_target(path: Option<PathBuf>, session_id: String) -> Self {
        Self {
            shared: Arc::new(SessionLog {
                path,
                session_id,
                append_lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.path.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let event = self.envelope(event_type, payload);
        if let Some(path) = self.shared.path.as_deref() {
            self.append(path, &event)
                .with_context(|| format!("failed to append event to {}", path.display()))?;
        }
        Ok(Value::Object(event))
    }

    fn envelope(&self, event_type: &str, payload: EventPayload) -> EventPayload {
        let mut event = EventPayload::new();
        event.insert("type".into(), Value::from(event_type));
        event.insert("session_id".into(), Value::from(self.session_id()));
        event.insert(
            "ts".into(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        event.extend(payload);
        event
    }

    fn append(&self, path: &Path, event: &EventPayload) -> anyhow::Result<()> {
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir)?,
            _ => {}
        }
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let _guard = self
            .shared
            .append_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?
            .write_all(&line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    fn read_rows(path: &Path) -> anyhow::Result<Vec<Value>> {
        fs::read_to_string(path)?
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).map_err(anyhow::Error::from))
            .collect()
    }

    #[test]
    fn event_carries_envelope_and_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-a");

        let mut payload = EventPayload::new();
        payload.insert("backend".into(), json!("dryrun"));
        let emitted = writer.emit("session_started", payload)?;

        let rows = read_rows(&path)?;
        assert_eq!(rows, vec![emitted]);
        assert_eq!(rows[0]["type"], json!("session_started"));
        assert_eq!(rows[0]["session_id"], json!("session-a"));
        assert_eq!(rows[0]["backend"], json!("dryrun"));
        DateTime::parse_from_rfc3339(rows[0]["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn payload_wins_over_envelope_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "session-a");
        let mut payload = EventPayload::new();
        payload.insert("type".into(), json!("renamed"));
        let emitted = writer.emit("model_ready", payload)?;
        assert_eq!(emitted["type"], json!("renamed"));
        assert_eq!(emitted["session_id"], json!("session-a"));
        Ok(())
    }

    #[test]
    fn concurrent_workers_each_get_a_whole_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let writer = EventWriter::new(&path, "session-a");

        let workers: Vec<_> = (0..4)
            .map(|n| {
                let writer = writer.clone();
                thread::spawn(move || {
                    let mut payload = EventPayload::new();
                    payload.insert("request_id".into(), json!(n));
                    writer.emit("generation_finished", payload)
                })
            })
            .collect();
        for worker in workers {
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("worker panicked"))??;
        }

        let mut ids: Vec<i64> = read_rows(&path)?
            .iter()
            .filter_map(|row| row["request_id"].as_i64())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn disabled_writer_only_builds_events() -> anyhow::Result<()> {
        let writer = EventWriter::disabled();
        assert_eq!(writer.path(), None);
        assert!(!writer.session_id().is_empty());
        let emitted = writer.emit("request_rejected", EventPayload::new())?;
        assert_eq!(emitted["type"], json!("request_rejected"));

        let logged = EventWriter::for_session(None);
        assert_ne!(logged.session_id(), writer.session_id());
        Ok(())
    }
}
