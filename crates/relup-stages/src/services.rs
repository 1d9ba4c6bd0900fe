use std::sync::Arc;
use std::time::Duration;

use relup_host::{CommandError, CommandRunner, CommandSpec};

/// Thin wrapper over `systemctl` for the services named in the config.
#[derive(Clone)]
pub struct Systemctl {
    runner: Arc<dyn CommandRunner>,
    command_timeout: Duration,
}

impl Systemctl {
    pub fn new(runner: Arc<dyn CommandRunner>, command_timeout: Duration) -> Self {
        Self {
            runner,
            command_timeout,
        }
    }

    fn spec<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> CommandSpec {
        CommandSpec::new("systemctl")
            .args(args)
            .timeout(self.command_timeout)
    }

    pub fn unit_exists(&self, service: &str) -> Result<bool, CommandError> {
        let unit = unit_name(service);
        let output = self.runner.output(&self.spec([
            "list-unit-files",
            "--no-legend",
            "--no-pager",
            unit.as_str(),
        ]))?;
        Ok(output.success() && !output.stdout.trim().is_empty())
    }

    pub fn is_active(&self, service: &str) -> Result<bool, CommandError> {
        let unit = unit_name(service);
        let output = self
            .runner
            .output(&self.spec(["is-active", "--quiet", unit.as_str()]))?;
        Ok(output.success())
    }

    pub fn disable_now(&self, service: &str) -> Result<(), CommandError> {
        let unit = unit_name(service);
        self.runner
            .run(&self.spec(["disable", "--now", unit.as_str()]))?;
        Ok(())
    }

    pub fn enable_now(&self, service: &str) -> Result<(), CommandError> {
        let unit = unit_name(service);
        self.runner
            .run(&self.spec(["enable", "--now", unit.as_str()]))?;
        Ok(())
    }

    pub fn restart(&self, service: &str) -> Result<(), CommandError> {
        let unit = unit_name(service);
        self.runner.run(&self.spec(["restart", unit.as_str()]))?;
        Ok(())
    }
}

/// `postgresql` -> `postgresql.service`; names with a unit suffix pass through.
pub fn unit_name(service: &str) -> String {
    if service.contains('.') {
        service.to_string()
    } else {
        format!("{service}.service")
    }
}
