use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use relup_core::LockError;
use tracing::warn;

use crate::fs_utils::{remove_file_if_exists, sync_parent_dir};

/// A record without a parseable pid is only abandoned once it is this old.
pub const OWNERLESS_RECORD_GRACE: Duration = Duration::from_secs(60);

const CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquired {
    Fresh,
    /// A dead owner's record was removed; `previous_pid` is `None` when the
    /// record held no parseable pid.
    ReclaimedStale { previous_pid: Option<i32> },
}

pub trait LockManager {
    fn acquire(&self) -> Result<LockAcquired, LockError>;
    fn release(&self) -> Result<(), LockError>;
}

/// Pid-file lock. The record is published with a hard link so it is never
/// visible without its owner pid.
#[derive(Debug, Clone)]
pub struct PidFileLock {
    path: PathBuf,
    pid: i32,
    is_alive: fn(i32) -> bool,
}

impl PidFileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pid: current_pid(),
            is_alive: process_is_alive,
        }
    }

    pub fn with_owner(mut self, pid: i32) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_liveness_probe(mut self, is_alive: fn(i32) -> bool) -> Self {
        self.is_alive = is_alive;
        self
    }

    fn io_error(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn sibling(&self, tag: &str) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lock".to_string());
        self.path.with_file_name(format!(".{file_name}.{tag}-{}", self.pid))
    }

    fn try_claim(&self) -> io::Result<()> {
        let staging = self.sibling("claim");
        let result = write_pid_record(&staging, self.pid)
            .and_then(|()| fs::hard_link(&staging, &self.path));
        let _ = remove_file_if_exists(&staging);
        result?;
        sync_parent_dir(&self.path)
    }

    fn owner_is_live(&self, owner: Option<i32>, age: Duration) -> bool {
        match owner {
            // our own pid in the record can only be a leftover from before a reboot
            Some(pid) => pid != self.pid && (self.is_alive)(pid),
            None => age < OWNERLESS_RECORD_GRACE,
        }
    }

    /// Moves the record aside and deletes it only if it still names `expected`.
    /// Returns `false` when the record changed hands in the meantime.
    pub(crate) fn evict_stale(&self, expected: Option<i32>) -> io::Result<bool> {
        let aside = self.sibling("stale");
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        }

        let moved = read_lock_owner(&aside);
        if matches!(moved, Ok(owner) if owner == expected) {
            remove_file_if_exists(&aside)?;
            sync_parent_dir(&self.path)?;
            return Ok(true);
        }

        // a fresh claim landed between our read and the rename; put it back
        let restored = match fs::hard_link(&aside, &self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err),
        };
        let _ = remove_file_if_exists(&aside);
        restored.map(|()| false)
    }
}

impl LockManager for PidFileLock {
    fn acquire(&self) -> Result<LockAcquired, LockError> {
        let mut outcome = LockAcquired::Fresh;

        for _ in 0..CLAIM_ATTEMPTS {
            match self.try_claim() {
                Ok(()) => return Ok(outcome),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(self.io_error(err)),
            }

            let (owner, age) = match read_lock_record(&self.path) {
                Ok(record) => record,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(self.io_error(err)),
            };
            if self.owner_is_live(owner, age) {
                return Err(match owner {
                    Some(owner_pid) => LockError::Held { owner_pid },
                    None => LockError::Unowned {
                        path: self.path.clone(),
                    },
                });
            }

            warn!(
                target: "relup::lock",
                path = %self.path.display(),
                previous_pid = ?owner,
                "reclaiming stale lock"
            );
            if self.evict_stale(owner).map_err(|err| self.io_error(err))? {
                outcome = LockAcquired::ReclaimedStale {
                    previous_pid: owner,
                };
            }
        }

        // lost every race against other claimants
        match read_lock_owner(&self.path) {
            Ok(Some(owner_pid)) => Err(LockError::Held { owner_pid }),
            Ok(None) => Err(LockError::Unowned {
                path: self.path.clone(),
            }),
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn release(&self) -> Result<(), LockError> {
        let owner = match read_lock_owner(&self.path) {
            Ok(owner) => owner,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(self.io_error(err)),
        };

        if owner != Some(self.pid) {
            warn!(
                target: "relup::lock",
                path = %self.path.display(),
                owner = ?owner,
                pid = self.pid,
                "not releasing lock owned by another process"
            );
            return Ok(());
        }

        remove_file_if_exists(&self.path).map_err(|err| self.io_error(err))?;
        Ok(())
    }
}

/// Releases the lock when dropped, covering early returns and panics.
pub struct LockGuard<'a> {
    lock: &'a dyn LockManager,
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub fn new(lock: &'a dyn LockManager) -> Self {
        Self {
            lock,
            released: false,
        }
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.lock.release()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.lock.release() {
            warn!(target: "relup::lock", error = %err, "failed to release lock");
        }
    }
}

/// Owner pid recorded in the lock file; `Ok(None)` for empty or garbage content.
pub fn read_lock_owner(path: &Path) -> io::Result<Option<i32>> {
    let raw = fs::read_to_string(path)?;
    Ok(raw.trim().parse::<i32>().ok().filter(|pid| *pid > 0))
}

fn read_lock_record(path: &Path) -> io::Result<(Option<i32>, Duration)> {
    let modified = fs::metadata(path)?.modified()?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok((read_lock_owner(path)?, age))
}

fn write_pid_record(path: &Path, pid: i32) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(format!("{pid}\n").as_bytes())?;
    file.sync_all()?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

pub fn current_pid() -> i32 {
    i32::try_from(std::process::id()).unwrap_or(i32::MAX)
}

pub fn process_is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: exists but owned by someone else
        Err(_) => true,
    }
}
