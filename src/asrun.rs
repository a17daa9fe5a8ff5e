//! As-run log
//!
//! Append-only broadcast compliance record: one JSON object per line, one
//! file per calendar day under the per-user state directory. Writes enqueue
//! and return; a writer task drains the queue, stamps each entry with the
//! UTC time and rotates lazily when the day changes. Log I/O failures are
//! logged and never block playout.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::template::TemplatePayload;

/// The closed set of as-run event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AsRunEvent {
    #[serde(rename = "load")]
    Load,
    #[serde(rename = "take")]
    Take,
    #[serde(rename = "clear")]
    Clear,
    #[serde(rename = "freeze")]
    Freeze,
    #[serde(rename = "unfreeze")]
    Unfreeze,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "updatePgm")]
    UpdatePgm,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "crash-recovery")]
    CrashRecovery,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AsRunEntry {
    /// Stamped by the writer immediately before the append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub event: AsRunEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, String>>,
    #[serde(rename = "duration", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AsRunEntry {
    pub fn new(event: AsRunEvent) -> Self {
        Self {
            timestamp: None,
            event,
            template_id: None,
            template_name: None,
            variables: None,
            duration_ms: None,
            details: None,
        }
    }

    pub fn with_template(mut self, template: &TemplatePayload) -> Self {
        self.template_id = template.template_id.clone();
        self.template_name = template.display_name();
        if !template.variables.is_empty() {
            self.variables = Some(template.variables.clone());
        }
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Handle to the as-run writer. Cheap to clone the sender side via
/// [`write`](Self::write); dropping the handle stops the writer after the
/// queue drains.
pub struct AsRunLog {
    tx: mpsc::UnboundedSender<AsRunEntry>,
    task: JoinHandle<()>,
}

impl AsRunLog {
    pub fn open(dir: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(writer_loop(dir, rx));
        Self { tx, task }
    }

    /// Enqueue one record and return immediately.
    pub fn write(&self, entry: AsRunEntry) {
        let _ = self.tx.send(entry);
    }

    /// Drain the queue and stop the writer.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

async fn writer_loop(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<AsRunEntry>) {
    let mut current: Option<(NaiveDate, File)> = None;

    while let Some(mut entry) = rx.recv().await {
        let now = Utc::now();
        entry.timestamp = Some(now);
        let day = now.date_naive();

        // Rotation is triggered lazily by writes, never by a timer.
        if current.as_ref().map(|(d, _)| *d != day).unwrap_or(true) {
            current = match open_day_file(&dir, day) {
                Ok(file) => Some((day, file)),
                Err(err) => {
                    error!(error = %err, "cannot open as-run log file");
                    None
                }
            };
        }

        let Some((_, file)) = current.as_mut() else {
            continue;
        };
        match serde_json::to_string(&entry) {
            Ok(line) => {
                if let Err(err) = writeln!(file, "{line}") {
                    warn!(error = %err, "as-run append failed");
                }
            }
            Err(err) => warn!(error = %err, "unserializable as-run entry"),
        }
    }
}

fn open_day_file(dir: &Path, day: NaiveDate) -> std::io::Result<File> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("as-run-{}.jsonl", day.format("%Y-%m-%d")));
    OpenOptions::new().create(true).append(true).open(path)
}

/// Per-user state directory for as-run files.
pub fn default_asrun_dir() -> anyhow::Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("tv", "keyline", "keyline")
        .context("Failed to determine project directories for the as-run log")?;
    let base = dirs
        .state_dir()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dirs.data_local_dir().to_path_buf());
    Ok(base.join("as-run"))
}
