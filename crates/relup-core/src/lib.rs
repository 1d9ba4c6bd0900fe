mod config;
mod error;
mod state;

pub use config::{
    CleanupConfig, DiskConfig, MonitorConfig, NetworkConfig, PackageLockConfig, PostSetupConfig,
    RebootConfig, RetryConfig, TimeoutConfig, UpgradeConfig, BOOT_START_COMMAND_MARGIN,
    DEFAULT_CONFIG_PATH,
};
pub use error::{LockError, PreconditionFailure, PreconditionKind, StageFailure, StateError};
pub use state::{ReleaseVersion, Stage, Transition, UnknownStateToken, UpgradeState};
