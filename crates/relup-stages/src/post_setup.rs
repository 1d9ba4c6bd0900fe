use relup_core::{PostSetupConfig, StageFailure};
use relup_host::CommandSpec;
use tracing::info;

use crate::apt::Apt;
use crate::services::Systemctl;
use crate::{command_failure, StageExecutor};

pub struct PostSetupStage {
    apt: Apt,
    systemctl: Systemctl,
    config: PostSetupConfig,
}

impl PostSetupStage {
    pub fn new(apt: Apt, systemctl: Systemctl, config: PostSetupConfig) -> Self {
        Self {
            apt,
            systemctl,
            config,
        }
    }

    fn restore_databases(&self) -> Result<(), StageFailure> {
        let Some(spec) = CommandSpec::from_argv(&self.config.restore_command) else {
            return Ok(());
        };
        let spec = spec.timeout(self.apt.command_timeout());
        self.apt.runner().run(&spec).map_err(|err| {
            StageFailure::with_tail(format!("database restore failed: {err}"), err.tail())
        })?;
        info!(target: "relup::stage", command = %spec, "database restore completed");
        Ok(())
    }
}

impl StageExecutor for PostSetupStage {
    fn execute(&self) -> Result<(), StageFailure> {
        self.apt.update_with_retry()?;
        self.apt
            .install(&self.config.install_packages)
            .map_err(command_failure)?;
        self.restore_databases()?;
        for service in &self.config.enable_services {
            self.systemctl
                .enable_now(service)
                .map_err(command_failure)?;
            info!(target: "relup::stage", service = %service, "enabled service");
        }
        Ok(())
    }
}
