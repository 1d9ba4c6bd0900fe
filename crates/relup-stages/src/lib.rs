mod apt;
mod cleanup;
mod monitor;
mod os_release;
mod post_setup;
mod preconditions;
mod release_upgrade;
mod retry;
mod services;

use std::sync::Arc;

use relup_core::{ReleaseVersion, Stage, StageFailure, UpgradeConfig};
use relup_host::{CommandError, CommandRunner};

pub use apt::Apt;
pub use cleanup::CleanupStage;
pub use monitor::{
    parse_loadavg, parse_mem_available_kb, HealthMonitor, MonitorHandle, ServiceWatchdog,
};
pub use os_release::{force_lts_prompt, parse_version_id, read_version_id, with_lts_prompt};
pub use post_setup::PostSetupStage;
pub use preconditions::{
    ensure_free_space, free_space_bytes, http_probe, human_bytes, HostPreconditions,
    PreconditionChecker,
};
pub use release_upgrade::ReleaseUpgradeStage;
pub use retry::{retry_with_healing, RetryPolicy};
pub use services::{unit_name, Systemctl};

/// One bounded unit of upgrade work. Must be safe to run again after a
/// partial failure.
pub trait StageExecutor {
    fn execute(&self) -> Result<(), StageFailure>;
}

/// Maps a stage to the executor that performs it.
pub trait StageSet {
    fn executor_for(&self, stage: Stage) -> &dyn StageExecutor;
}

/// The executors wired against the real host.
pub struct HostStages {
    cleanup: CleanupStage,
    to_jammy: ReleaseUpgradeStage,
    to_noble: ReleaseUpgradeStage,
    post_setup: PostSetupStage,
}

impl HostStages {
    pub fn from_config(config: &UpgradeConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let apt = Apt::new(
            Arc::clone(&runner),
            config.command_timeout(),
            RetryPolicy::from_config(&config.retry),
            config.package_locks.clone(),
        );
        let systemctl = Systemctl::new(runner, config.command_timeout());
        let release_stage = |release| {
            ReleaseUpgradeStage::new(
                release,
                apt.clone(),
                &config.os_release_path,
                &config.release_upgrades_path,
                config.release_upgrade_timeout(),
            )
        };

        Self {
            cleanup: CleanupStage::new(apt.clone(), systemctl.clone(), config.cleanup.clone()),
            to_jammy: release_stage(ReleaseVersion::Jammy),
            to_noble: release_stage(ReleaseVersion::Noble),
            post_setup: PostSetupStage::new(apt.clone(), systemctl, config.post_setup.clone()),
        }
    }
}

impl StageSet for HostStages {
    fn executor_for(&self, stage: Stage) -> &dyn StageExecutor {
        match stage {
            Stage::Cleanup => &self.cleanup,
            Stage::ReleaseUpgrade(ReleaseVersion::Jammy) => &self.to_jammy,
            Stage::ReleaseUpgrade(ReleaseVersion::Noble) => &self.to_noble,
            Stage::PostSetup => &self.post_setup,
        }
    }
}

pub(crate) fn command_failure(err: CommandError) -> StageFailure {
    StageFailure::with_tail(err.to_string(), err.tail())
}

#[cfg(test)]
mod tests;
