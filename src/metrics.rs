//! Structured crawl events as JSON lines. Shipping them anywhere is the
//! consumer's problem; this just appends one object per line to a file or
//! stdout.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use crate::error::Result;

enum Sink {
    File(File),
    Stdout,
    Disabled,
}

/// Appends `{event, ts, ...}` lines. Safe for concurrent use; writes are
/// serialized and flushed per event so a crash never leaves a torn line
/// buffered.
pub struct MetricsEmitter {
    sink: Mutex<Sink>,
}

impl MetricsEmitter {
    /// `path` of `-` means stdout; `None` disables emission.
    pub fn from_path(path: Option<&str>) -> Result<Self> {
        let sink = match path {
            None => Sink::Disabled,
            Some("-") => Sink::Stdout,
            Some(p) => {
                if let Some(parent) = Path::new(p).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let file = OpenOptions::new().create(true).append(true).open(p)?;
                Sink::File(file)
            }
        };
        Ok(Self {
            sink: Mutex::new(sink),
        })
    }

    pub fn disabled() -> Self {
        Self {
            sink: Mutex::new(Sink::Disabled),
        }
    }

    pub fn emit(&self, event: &str, fields: Value) {
        let mut record = Map::new();
        record.insert(
            "ts".to_string(),
            json!(chrono::Utc::now()
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        );
        record.insert("event".to_string(), json!(event));
        if let Value::Object(extra) = fields {
            record.extend(extra);
        }

        let line = Value::Object(record).to_string();
        let mut sink = self.sink.lock();
        let result = match &mut *sink {
            Sink::File(file) => writeln!(file, "{line}").and_then(|_| file.flush()),
            Sink::Stdout => {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                writeln!(handle, "{line}").and_then(|_| handle.flush())
            }
            Sink::Disabled => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, event, "failed to emit metrics event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_events_are_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let emitter = MetricsEmitter::from_path(Some(path.to_str().unwrap())).unwrap();

        emitter.emit("run_start", json!({"iteration": 0, "seeds": 2}));
        emitter.emit("iteration_complete", json!({"iteration": 0}));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "run_start");
        assert_eq!(first["seeds"], 2);
        assert!(first["ts"].is_string());

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "iteration_complete");
    }

    #[test]
    fn test_disabled_emitter_is_silent() {
        let emitter = MetricsEmitter::disabled();
        emitter.emit("run_start", json!({}));
    }

    #[test]
    fn test_append_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.jsonl");
        {
            let emitter = MetricsEmitter::from_path(Some(path.to_str().unwrap())).unwrap();
            emitter.emit("run_start", json!({}));
        }
        {
            let emitter = MetricsEmitter::from_path(Some(path.to_str().unwrap())).unwrap();
            emitter.emit("run_complete", json!({}));
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
