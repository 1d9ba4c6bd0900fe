use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state record {} is corrupt (value='{value}')", path.display())]
    Corrupt { path: PathBuf, value: String },
    #[error("state record {} could not be accessed", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock is held by live process {owner_pid}")]
    Held { owner_pid: i32 },
    #[error("lock record {} names no owner and is too recent to reclaim", path.display())]
    Unowned { path: PathBuf },
    #[error("lock record {} could not be claimed", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionKind {
    Disk,
    Network,
    PackageSystem,
    PackageManagerBusy,
}

impl PreconditionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Network => "network",
            Self::PackageSystem => "package-system",
            Self::PackageManagerBusy => "package-manager-busy",
        }
    }
}

impl fmt::Display for PreconditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("precondition '{kind}' failed: {detail}")]
pub struct PreconditionFailure {
    pub kind: PreconditionKind,
    pub detail: String,
}

impl PreconditionFailure {
    pub fn new(kind: PreconditionKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Reported by a stage executor; the orchestrator attaches the stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{cause}")]
pub struct StageFailure {
    pub cause: String,
    pub diagnostic_tail: String,
}

impl StageFailure {
    pub fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            diagnostic_tail: String::new(),
        }
    }

    pub fn with_tail(cause: impl Into<String>, diagnostic_tail: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            diagnostic_tail: diagnostic_tail.into(),
        }
    }
}
