use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for the workflow's `events.jsonl` stream.
///
/// The engine emits one event per pipeline stage; a host (the CLI, or any
/// chat frontend embedding the engine) consumes the stream instead of the
/// engine touching presentation directly. Default fields are `type`,
/// `workflow_id` and `ts`; the caller payload is merged last and can
/// override them. One compact JSON object per line.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    workflow_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, workflow_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                workflow_id: workflow_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert(
            "type".to_string(),
            Value::String(event_type.to_string()),
        );
        event.insert(
            "workflow_id".to_string(),
            Value::String(self.inner.workflow_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(event_timestamp()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event stream lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

/// Build an [`EventPayload`] from literal key/value pairs.
pub fn payload_of<const N: usize>(entries: [(&str, Value); N]) -> EventPayload {
    let mut payload = EventPayload::new();
    for (key, value) in entries {
        payload.insert(key.to_string(), value);
    }
    payload
}

fn event_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
