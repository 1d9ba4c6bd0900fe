use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::command::{CommandError, CommandRunner, CommandSpec};

pub trait Rebooter {
    fn schedule_reboot(&self, delay_minutes: u32, message: &str) -> Result<(), CommandError>;
}

/// Schedules the reboot with `shutdown -r +N` so the invoking session can
/// still observe the outcome.
pub struct ShutdownRebooter {
    runner: Arc<dyn CommandRunner>,
    command_timeout: Duration,
}

impl ShutdownRebooter {
    pub fn new(runner: Arc<dyn CommandRunner>, command_timeout: Duration) -> Self {
        Self {
            runner,
            command_timeout,
        }
    }
}

impl Rebooter for ShutdownRebooter {
    fn schedule_reboot(&self, delay_minutes: u32, message: &str) -> Result<(), CommandError> {
        let spec = CommandSpec::new("shutdown")
            .arg("-r")
            .arg(format!("+{delay_minutes}"))
            .arg(message)
            .timeout(self.command_timeout);
        self.runner.run(&spec)?;
        info!(target: "relup::orchestrator", delay_minutes, "reboot scheduled");
        Ok(())
    }
}
