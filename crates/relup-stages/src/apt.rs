use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use relup_core::{PackageLockConfig, StageFailure};
use relup_host::{remove_file_if_exists, CommandError, CommandRunner, CommandSpec};
use tracing::{info, warn};

use crate::command_failure;
use crate::retry::{retry_with_healing, RetryPolicy};

const BLOCKER_EXIT_POLL: Duration = Duration::from_millis(250);

const KEEP_CONFIG_OPTIONS: [&str; 4] = [
    "-o",
    "Dpkg::Options::=--force-confdef",
    "-o",
    "Dpkg::Options::=--force-confold",
];

/// apt/dpkg operations shared by the stage executors.
#[derive(Clone)]
pub struct Apt {
    runner: Arc<dyn CommandRunner>,
    command_timeout: Duration,
    retry: RetryPolicy,
    blockers: PackageLockConfig,
}

impl Apt {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        command_timeout: Duration,
        retry: RetryPolicy,
        blockers: PackageLockConfig,
    ) -> Self {
        Self {
            runner,
            command_timeout,
            retry,
            blockers,
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    fn apt_get<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> CommandSpec {
        CommandSpec::new("apt-get")
            .args(args)
            .noninteractive()
            .timeout(self.command_timeout)
    }

    /// Kills left-over package-manager processes and, once they have exited,
    /// removes their lock files.
    pub fn clear_blockers(&self) {
        let signalled = self.signal_blockers(&self.blockers.processes, None);
        let mut survivors = self.wait_for_exit(signalled);
        if !survivors.is_empty() {
            warn!(target: "relup::stage", processes = ?survivors, "package manager processes ignored SIGTERM; sending SIGKILL");
            let signalled = self.signal_blockers(&survivors, Some("-KILL"));
            survivors = self.wait_for_exit(signalled);
        }
        if !survivors.is_empty() {
            warn!(target: "relup::stage", processes = ?survivors, "package manager processes still running; leaving lock files in place");
            return;
        }

        for lock_file in &self.blockers.lock_files {
            match remove_file_if_exists(lock_file) {
                Ok(true) => {
                    warn!(target: "relup::stage", path = %lock_file.display(), "removed stale package manager lock");
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(target: "relup::stage", path = %lock_file.display(), error = %err, "could not remove package manager lock");
                }
            }
        }
    }

    /// Returns the processes `pkill` matched.
    fn signal_blockers(&self, processes: &[String], signal: Option<&str>) -> Vec<String> {
        let mut signalled = Vec::new();
        for process in processes {
            let spec = CommandSpec::new("pkill")
                .args(signal)
                .args(["-x", process.as_str()])
                .timeout(self.command_timeout);
            match self.runner.output(&spec) {
                Ok(output) if output.success() => {
                    warn!(target: "relup::stage", process = %process, "signalled left-over package manager process");
                    signalled.push(process.clone());
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "relup::stage", process = %process, error = %err, "could not signal package manager process");
                }
            }
        }
        signalled
    }

    /// Polls until none of `processes` is running or the exit wait runs out;
    /// returns the ones still running.
    fn wait_for_exit(&self, mut processes: Vec<String>) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(self.blockers.exit_wait_secs);
        loop {
            processes.retain(|process| self.is_running(process));
            if processes.is_empty() || Instant::now() >= deadline {
                return processes;
            }
            thread::sleep(BLOCKER_EXIT_POLL);
        }
    }

    fn is_running(&self, process: &str) -> bool {
        let spec = CommandSpec::new("pgrep")
            .args(["-x", process])
            .timeout(self.command_timeout);
        // pgrep exits 1 when nothing matches
        match self.runner.output(&spec) {
            Ok(output) => output.success(),
            Err(_) => true,
        }
    }

    pub fn update(&self) -> Result<(), CommandError> {
        self.runner.run(&self.apt_get(["update"]))?;
        Ok(())
    }

    pub fn repair(&self) -> Result<(), CommandError> {
        self.runner.run(
            &CommandSpec::new("dpkg")
                .args(["--configure", "-a"])
                .noninteractive()
                .timeout(self.command_timeout),
        )?;
        self.runner
            .run(&self.apt_get(KEEP_CONFIG_OPTIONS).args(["-f", "install", "-y"]))?;
        Ok(())
    }

    pub fn update_with_retry(&self) -> Result<(), StageFailure> {
        retry_with_healing(
            &self.retry,
            "apt-get update",
            || self.clear_blockers(),
            || self.update(),
        )
        .map_err(command_failure)
    }

    pub fn repair_with_retry(&self) -> Result<(), StageFailure> {
        retry_with_healing(
            &self.retry,
            "broken package repair",
            || self.clear_blockers(),
            || self.repair(),
        )
        .map_err(command_failure)
    }

    pub fn dist_upgrade(&self) -> Result<(), CommandError> {
        self.runner
            .run(&self.apt_get(KEEP_CONFIG_OPTIONS).args(["dist-upgrade", "-y"]))?;
        Ok(())
    }

    pub fn is_installed(&self, package: &str) -> Result<bool, CommandError> {
        let output = self.runner.output(
            &CommandSpec::new("dpkg-query")
                .args(["-W", "-f=${Status}", package])
                .timeout(self.command_timeout),
        )?;
        Ok(output.success() && output.stdout.contains("install ok installed"))
    }

    pub fn install(&self, packages: &[String]) -> Result<(), CommandError> {
        if packages.is_empty() {
            return Ok(());
        }
        self.runner.run(
            &self
                .apt_get(KEEP_CONFIG_OPTIONS)
                .args(["install", "-y"])
                .args(packages.iter().cloned()),
        )?;
        info!(target: "relup::stage", packages = ?packages, "installed packages");
        Ok(())
    }

    pub fn purge(&self, packages: &[String]) -> Result<(), CommandError> {
        if packages.is_empty() {
            return Ok(());
        }
        self.runner.run(
            &self
                .apt_get(["purge", "-y"])
                .args(packages.iter().cloned()),
        )?;
        info!(target: "relup::stage", packages = ?packages, "purged packages");
        Ok(())
    }

    pub fn autoremove(&self) -> Result<(), CommandError> {
        self.runner.run(&self.apt_get(["autoremove", "--purge", "-y"]))?;
        Ok(())
    }
}
