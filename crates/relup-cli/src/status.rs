use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use relup_core::UpgradeConfig;
use relup_host::{
    process_is_alive, read_lock_owner, BootScheduler, FileStateStore, HostLayout, JournalEntry,
    RunJournal, StateStore, SystemCommandRunner, SystemdBootScheduler,
};

use crate::render::{render_field, render_journal_entry, OutputStyle};

const RECENT_JOURNAL_ENTRIES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOwner {
    Free,
    Live(i32),
    Stale(Option<i32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Rendered state token, or the read error.
    pub state: Result<String, String>,
    pub lock: LockOwner,
    pub hook_armed: bool,
    pub recent: Vec<JournalEntry>,
}

/// Gathers status without taking the lock.
pub fn collect_status(config: &UpgradeConfig) -> Result<StatusReport> {
    let layout = HostLayout::new(&config.base_dir);

    let state = FileStateStore::new(layout.state_path())
        .read()
        .map(|state| state.as_str().to_string())
        .map_err(|err| err.to_string());

    let lock_path = layout.lock_path();
    let lock = match read_lock_owner(&lock_path) {
        Ok(Some(pid)) if process_is_alive(pid) => LockOwner::Live(pid),
        Ok(owner) => LockOwner::Stale(owner),
        Err(err) if err.kind() == io::ErrorKind::NotFound => LockOwner::Free,
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read lock record: {}", lock_path.display()));
        }
    };

    let hook_armed = SystemdBootScheduler::new(
        config.unit_path(),
        &config.base_dir,
        config.boot_start_timeout(),
        config.command_timeout(),
        Arc::new(SystemCommandRunner),
    )
    .is_armed();

    let recent = RunJournal::new(layout.journal_path()).read_recent(RECENT_JOURNAL_ENTRIES)?;

    Ok(StatusReport {
        state,
        lock,
        hook_armed,
        recent,
    })
}

pub fn status_lines(style: OutputStyle, report: &StatusReport) -> Vec<String> {
    let state = match &report.state {
        Ok(token) => token.clone(),
        Err(err) => format!("unreadable ({err})"),
    };
    let lock = match report.lock {
        LockOwner::Free => "free".to_string(),
        LockOwner::Live(pid) => format!("held by pid {pid}"),
        LockOwner::Stale(Some(pid)) => format!("stale record for dead pid {pid}"),
        LockOwner::Stale(None) => "stale record with no pid".to_string(),
    };
    let hook = if report.hook_armed { "armed" } else { "not armed" };

    let mut lines = vec![
        render_field(style, "state", &state),
        render_field(style, "lock", &lock),
        render_field(style, "boot hook", hook),
    ];
    if report.recent.is_empty() {
        lines.push(render_field(style, "journal", "no runs recorded"));
    } else {
        lines.push(render_field(style, "journal", "recent entries"));
        lines.extend(report.recent.iter().map(render_journal_entry));
    }
    lines
}
