//! Append-only run log with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy debugging/inspection:
//! `<runs dir>/<run id>/events.jsonl`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::Event;

/// File-based event store using JSONL format
pub struct EventStore {
    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl EventStore {
    /// Create or open the log of a run under `runs_dir`
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self { events_path })
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// List all run IDs under `runs_dir`
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

/// Generate the idempotency key of a workflow trigger
pub fn generate_idempotency_key(run_id: Uuid, workflow: &str, argument: &str) -> String {
    let argument_hash = hash_input(argument);
    format!("{}:{}:{}", run_id, workflow, argument_hash)
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8]) // First 16 hex chars (8 bytes)
}
