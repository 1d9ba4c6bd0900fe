use relup_core::{CleanupConfig, StageFailure};
use relup_host::CommandSpec;
use tracing::info;

use crate::apt::Apt;
use crate::services::Systemctl;
use crate::{command_failure, StageExecutor};

/// Pre-upgrade cleanup: database backup, service shutdown, package purge.
///
/// Every step tolerates having run before, so a failed cleanup can simply be
/// re-invoked.
pub struct CleanupStage {
    apt: Apt,
    systemctl: Systemctl,
    config: CleanupConfig,
}

impl CleanupStage {
    pub fn new(apt: Apt, systemctl: Systemctl, config: CleanupConfig) -> Self {
        Self {
            apt,
            systemctl,
            config,
        }
    }

    fn backup_databases(&self) -> Result<(), StageFailure> {
        let Some(spec) = CommandSpec::from_argv(&self.config.backup_command) else {
            return Ok(());
        };
        let spec = spec.timeout(self.apt.command_timeout());
        self.apt.runner().run(&spec).map_err(|err| {
            StageFailure::with_tail(format!("database backup failed: {err}"), err.tail())
        })?;
        info!(target: "relup::stage", command = %spec, "database backup completed");
        Ok(())
    }

    fn stop_services(&self) -> Result<(), StageFailure> {
        for service in &self.config.stop_services {
            if !self.systemctl.unit_exists(service).map_err(command_failure)? {
                info!(target: "relup::stage", service = %service, "service not present; skipping stop");
                continue;
            }
            self.systemctl
                .disable_now(service)
                .map_err(command_failure)?;
            info!(target: "relup::stage", service = %service, "stopped and disabled service");
        }
        Ok(())
    }

    fn purge_packages(&self) -> Result<(), StageFailure> {
        let mut installed = Vec::new();
        for package in &self.config.remove_packages {
            if self.apt.is_installed(package).map_err(command_failure)? {
                installed.push(package.clone());
            }
        }
        if installed.is_empty() {
            info!(target: "relup::stage", "no configured packages left to purge");
        }
        self.apt.purge(&installed).map_err(command_failure)?;
        self.apt.autoremove().map_err(command_failure)
    }
}

impl StageExecutor for CleanupStage {
    fn execute(&self) -> Result<(), StageFailure> {
        self.backup_databases()?;
        self.stop_services()?;
        self.purge_packages()
    }
}
