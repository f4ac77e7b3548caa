//! Append-only JSON-lines audit log (§4.16).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One JSON object per line, opened in append mode, serialized across
/// writers through a mutex — mirrors C4's persistence discipline. Write
/// failures are logged to stderr and never propagate (§7): a broken audit
/// log must never fail the request that triggered it.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = open(&path);
        if file.is_none() {
            tracing::warn!(path = %path.display(), "could not open audit log, entries will be dropped");
        }
        Self {
            path,
            file: Mutex::new(file),
        }
    }

    /// Append one record. Best-effort: failures are logged, never returned.
    pub fn append(&self, record: serde_json::Value) {
        let mut line = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit record");
                return;
            }
        };
        line.push(b'\n');

        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = open(&self.path);
        }
        let Some(file) = guard.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(&line) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write audit record");
            *guard = None;
        }
    }
}

fn open(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return None;
        }
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}
