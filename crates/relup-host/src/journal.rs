use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    RunStarted,
    PreconditionFailed,
    StageFailed,
    StageSucceeded,
    StateAdvanced,
    RebootScheduled,
    Completed,
}

impl JournalEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::PreconditionFailed => "precondition_failed",
            Self::StageFailed => "stage_failed",
            Self::StageSucceeded => "stage_succeeded",
            Self::StateAdvanced => "state_advanced",
            Self::RebootScheduled => "reboot_scheduled",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at_unix: u64,
    pub state: String,
    pub event: JournalEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl JournalEntry {
    pub fn now(state: &str, event: JournalEvent, detail: Option<String>) -> Self {
        Self {
            at_unix: current_unix_timestamp(),
            state: state.to_string(),
            event,
            detail,
        }
    }
}

/// Append-only history of orchestrator runs, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunJournal {
    path: PathBuf,
}

impl RunJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("failed to serialize journal entry")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open run journal: {}", self.path.display()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .with_context(|| format!("failed to append run journal: {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush run journal: {}", self.path.display()))?;
        Ok(())
    }

    /// Last `limit` entries, oldest first.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read run journal: {}", self.path.display())
                });
            }
        };

        let mut entries = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str::<JournalEntry>(line).with_context(|| {
                format!(
                    "failed parsing run journal line {}: {}",
                    index + 1,
                    self.path.display()
                )
            })?;
            entries.push(entry);
        }

        let start = entries.len().saturating_sub(limit);
        Ok(entries.split_off(start))
    }
}

pub fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
