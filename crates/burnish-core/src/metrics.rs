use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

const FLUSH_EVERY: usize = 50;

/// Append-only NDJSON metrics stream owned by the session.
///
/// Events buffer in memory and flush every 50 events and on drop; the file
/// is opened in append mode on each flush so a crashed session loses at most
/// one buffer.
pub struct MetricsSink {
    path: PathBuf,
    buf: Mutex<Vec<String>>,
}

impl MetricsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buf: Mutex::new(Vec::new()),
        }
    }

    pub fn emit(&self, system: &str, event: &str, data: Option<Value>) {
        let mut line = json!({
            "ts": Utc::now().timestamp_millis(),
            "system": system,
            "event": event,
        });
        if let Some(d) = data {
            line["data"] = d;
        }
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.push(line.to_string());
        if buf.len() >= FLUSH_EVERY {
            Self::write_lines(&self.path, &mut buf);
        }
    }

    pub fn flush(&self) {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        Self::write_lines(&self.path, &mut buf);
    }

    fn write_lines(path: &PathBuf, buf: &mut Vec<String>) {
        if buf.is_empty() {
            return;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| {
                for line in buf.iter() {
                    writeln!(f, "{line}")?;
                }
                Ok(())
            });
        match result {
            Ok(()) => buf.clear(),
            Err(e) => warn!("metrics flush to {}: {e}", path.display()),
        }
    }
}

impl Drop for MetricsSink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_flush_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.ndjson");
        {
            let sink = MetricsSink::new(&path);
            sink.emit("cycle", "started", Some(json!({"cycle": 1})));
            sink.emit("cycle", "finished", None);
        }
        let contents = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).expect("parse");
        assert_eq!(first["system"], "cycle");
        assert_eq!(first["data"]["cycle"], 1);
        assert!(lines[1].contains("finished"));
    }

    #[test]
    fn buffer_auto_flushes_at_threshold() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.ndjson");
        let sink = MetricsSink::new(&path);
        for i in 0..FLUSH_EVERY {
            sink.emit("qa", "run", Some(json!({"i": i})));
        }
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents.lines().count(), FLUSH_EVERY);
        sink.flush();
    }
}
