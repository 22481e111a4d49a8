// =============================================================================
// Audit Log — append-only NDJSON records, rotated daily by file name
// =============================================================================
//
// Every adjustment cycle, exploration transition, and reload writes one
// newline-delimited JSON record with the fixed schema
// `{timestamp, category, action, data}`. Files are named
// `audit-YYYY-MM-DD.ndjson`; rotation happens implicitly when the UTC date
// changes. Audit writes are best-effort: a failure is logged and the engine
// carries on.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

#[derive(Serialize)]
struct AuditRecord<'a> {
    timestamp: String,
    category: &'a str,
    action: &'a str,
    data: serde_json::Value,
}

/// Append-only audit sink. Cheap to share behind an `Arc`.
pub struct AuditLog {
    dir: PathBuf,
    current: Mutex<Option<(NaiveDate, File)>>,
}

impl AuditLog {
    /// Create the sink, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create audit dir {}", dir.display()))?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    /// Append one record. Never fails the caller; I/O errors are logged.
    pub fn record(&self, category: &str, action: &str, data: serde_json::Value) {
        if let Err(e) = self.try_record(category, action, data) {
            warn!(error = %e, category, action, "audit write failed");
        }
    }

    fn try_record(&self, category: &str, action: &str, data: serde_json::Value) -> Result<()> {
        let now = Utc::now();
        let today = now.date_naive();

        let record = AuditRecord {
            timestamp: now.to_rfc3339(),
            category,
            action,
            data,
        };
        let mut line = serde_json::to_string(&record).context("failed to serialise audit record")?;
        line.push('\n');

        let mut guard = self.current.lock();

        // Rotate when the date rolls over (or on first write).
        let needs_open = match guard.as_ref() {
            Some((date, _)) => *date != today,
            None => true,
        };
        if needs_open {
            let path = self.dir.join(format!("audit-{today}.ndjson"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open audit file {}", path.display()))?;
            *guard = Some((today, file));
        }

        let (_, file) = guard.as_mut().expect("file opened above");
        file.write_all(line.as_bytes()).context("audit append failed")?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "meridian-audit-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn records_append_as_ndjson() {
        let dir = scratch_dir("append");
        let log = AuditLog::new(&dir).unwrap();
        log.record("adjustment", "tighten_moderate", serde_json::json!({"key": "MGC/long"}));
        log.record("exploration", "enter", serde_json::json!({"reason": "3 losses"}));

        let today = Utc::now().date_naive();
        let content =
            std::fs::read_to_string(dir.join(format!("audit-{today}.ndjson"))).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["category"], "adjustment");
        assert_eq!(first["action"], "tighten_moderate");
        assert_eq!(first["data"]["key"], "MGC/long");
        assert!(first["timestamp"].is_string());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn write_failure_does_not_panic() {
        // A directory that cannot be created as a file sink: point the log
        // at a path whose parent is an existing *file*.
        let dir = scratch_dir("badpath");
        std::fs::create_dir_all(&dir).unwrap();
        let blocker = dir.join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        assert!(AuditLog::new(blocker.join("nested")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
