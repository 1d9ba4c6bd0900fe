use std::fs;
use std::io;
use std::path::PathBuf;

use relup_core::{StateError, UpgradeState};
use tracing::info;

use crate::fs_utils::{remove_file_if_exists, write_atomic};

const STATE_FILE_MODE: u32 = 0o600;

pub trait StateStore {
    fn read(&self) -> Result<UpgradeState, StateError>;
    fn write(&self, state: UpgradeState) -> Result<(), StateError>;
    fn clear(&self) -> Result<(), StateError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, source: io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StateStore for FileStateStore {
    fn read(&self) -> Result<UpgradeState, StateError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(UpgradeState::Initial),
            Err(err) => return Err(self.io_error(err)),
        };

        let token = raw.trim();
        token.parse().map_err(|_| StateError::Corrupt {
            path: self.path.clone(),
            value: token.to_string(),
        })
    }

    fn write(&self, state: UpgradeState) -> Result<(), StateError> {
        write_atomic(
            &self.path,
            format!("{}\n", state.as_str()).as_bytes(),
            STATE_FILE_MODE,
        )
        .map_err(|err| self.io_error(err))?;
        info!(target: "relup::state", state = %state, "persisted upgrade state");
        Ok(())
    }

    fn clear(&self) -> Result<(), StateError> {
        if remove_file_if_exists(&self.path).map_err(|err| self.io_error(err))? {
            info!(target: "relup::state", path = %self.path.display(), "cleared upgrade state");
        }
        Ok(())
    }
}
