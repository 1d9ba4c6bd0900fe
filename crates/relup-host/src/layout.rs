use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    base: PathBuf,
}

impl HostLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn state_path(&self) -> PathBuf {
        self.base.join("state")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base.join("relup.lock")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.base.join("journal.jsonl")
    }

    pub fn log_path(&self) -> PathBuf {
        self.base.join("relup.log")
    }

    /// Creates the base directory restricted to the owning account.
    pub fn ensure_base_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.base)
            .with_context(|| format!("failed to create {}", self.base.display()))?;
        fs::set_permissions(&self.base, fs::Permissions::from_mode(0o700)).with_context(|| {
            format!("failed to restrict permissions on {}", self.base.display())
        })?;
        Ok(())
    }
}
