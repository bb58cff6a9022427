use std::collections::HashSet;
use std::path::PathBuf;

use serde::Deserialize;

/// Sidecar ack file: `{"delivery_id": "...", "status": "received"}` dropped
/// into the configured directory by a cooperating agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileAck {
    pub delivery_id: String,
    pub status: String,
}

impl FileAck {
    pub fn is_received(&self) -> bool {
        self.status == "received"
    }
}

/// Polls a directory for ack files. Parsed files are deleted; files that
/// cannot be deleted are remembered so they are reported once.
#[derive(Debug)]
pub struct AckWatcher {
    dir: PathBuf,
    seen: HashSet<PathBuf>,
}

impl AckWatcher {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            seen: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// One sweep over the directory. Small and bounded; safe to call from
    /// the session loop's poll tick.
    pub fn poll(&mut self) -> Vec<FileAck> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::debug!(
                    target = "courier::ack",
                    dir = %self.dir.display(),
                    %error,
                    "ack directory not readable"
                );
                return Vec::new();
            }
        };

        let mut acks = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if self.seen.contains(&path) {
                continue;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(_) => continue, // mid-write; retry next sweep
            };
            match serde_json::from_str::<FileAck>(&raw) {
                Ok(ack) => {
                    if std::fs::remove_file(&path).is_err() {
                        self.seen.insert(path);
                    }
                    acks.push(ack);
                }
                Err(error) => {
                    tracing::warn!(
                        target = "courier::ack",
                        file = %path.display(),
                        %error,
                        "malformed ack file"
                    );
                    self.seen.insert(path);
                }
            }
        }
        acks
    }
}
