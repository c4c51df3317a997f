use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub fn orchestrator_log_path(state_root: &Path) -> PathBuf {
    state_root.join("logs/orchestrator.log")
}

pub fn append_event_line(
    path: &Path,
    timestamp_ms: i64,
    event: &str,
    fields: &[(&str, Value)],
) -> std::io::Result<()> {
    let mut payload = Map::new();
    payload.insert("timestamp".to_string(), Value::from(timestamp_ms));
    payload.insert("event".to_string(), Value::String(event.to_string()));
    for (key, value) in fields {
        payload.insert((*key).to_string(), value.clone());
    }

    let line = serde_json::to_string(&payload)
        .map_err(|source| std::io::Error::other(source.to_string()))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}

/// Append-only JSON-lines audit log shared by concurrent workflow executions.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn for_state_root(state_root: &Path) -> Self {
        Self::new(orchestrator_log_path(state_root))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Audit logging never fails the workflow; write errors surface as tracing warnings.
    pub fn record(&self, timestamp_ms: i64, event: &str, fields: &[(&str, Value)]) {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = append_event_line(&self.path, timestamp_ms, event, fields) {
            tracing::warn!(
                path = %self.path.display(),
                event,
                error = %err,
                "failed to append orchestrator event log line"
            );
        }
    }

    pub fn read_events(&self) -> std::io::Result<Vec<Value>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|source| std::io::Error::other(source.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn event_log_appends_json_lines_under_state_root() {
        let dir = tempdir().expect("tempdir");
        let log = EventLog::for_state_root(dir.path());
        log.record(10, "step_succeeded", &[("threadId", Value::from("t-1"))]);
        log.record(11, "workflow_completed", &[]);

        let events = log.read_events().expect("read events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "step_succeeded");
        assert_eq!(events[0]["threadId"], "t-1");
        assert_eq!(events[1]["timestamp"], 11);
        assert!(log.path().ends_with("logs/orchestrator.log"));
    }
}
