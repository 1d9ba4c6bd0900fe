use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::statvfs::statvfs;
use relup_core::{NetworkConfig, PreconditionFailure, PreconditionKind, UpgradeConfig};
use relup_host::{CommandRunner, CommandSpec};
use tracing::info;

pub trait PreconditionChecker {
    fn check(&self) -> Result<(), PreconditionFailure>;
}

/// Host-health checks run before every stage.
pub struct HostPreconditions {
    runner: Arc<dyn CommandRunner>,
    command_timeout: Duration,
    package_processes: Vec<String>,
    mount_point: PathBuf,
    min_free_bytes: u64,
    network: NetworkConfig,
    free_space: fn(&Path) -> io::Result<u64>,
    network_probe: fn(&NetworkConfig) -> Result<(), String>,
}

impl HostPreconditions {
    pub fn from_config(config: &UpgradeConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            command_timeout: config.command_timeout(),
            package_processes: config.package_locks.processes.clone(),
            mount_point: config.disk.mount_point.clone(),
            min_free_bytes: config.disk.min_free_bytes,
            network: config.network.clone(),
            free_space: free_space_bytes,
            network_probe: http_probe,
        }
    }

    pub fn with_free_space(mut self, free_space: fn(&Path) -> io::Result<u64>) -> Self {
        self.free_space = free_space;
        self
    }

    pub fn with_network_probe(
        mut self,
        network_probe: fn(&NetworkConfig) -> Result<(), String>,
    ) -> Self {
        self.network_probe = network_probe;
        self
    }

    fn package_system_failure(&self, detail: String) -> PreconditionFailure {
        PreconditionFailure::new(PreconditionKind::PackageSystem, detail)
    }

    fn check_package_system(&self) -> Result<(), PreconditionFailure> {
        let audit = self
            .runner
            .output(&CommandSpec::new("dpkg").arg("--audit").timeout(self.command_timeout))
            .map_err(|err| self.package_system_failure(err.to_string()))?;
        if !audit.success() || !audit.stdout.trim().is_empty() {
            return Err(self.package_system_failure(format!(
                "dpkg --audit reports broken packages: {}",
                audit.tail()
            )));
        }

        let holds = self
            .runner
            .output(
                &CommandSpec::new("apt-mark")
                    .arg("showhold")
                    .timeout(self.command_timeout),
            )
            .map_err(|err| self.package_system_failure(err.to_string()))?;
        if !holds.success() {
            return Err(self.package_system_failure(format!(
                "apt-mark showhold failed: {}",
                holds.tail()
            )));
        }
        let held = holds
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();
        if !held.is_empty() {
            return Err(self.package_system_failure(format!(
                "held packages block the upgrade: {}",
                held.join(", ")
            )));
        }
        Ok(())
    }

    fn check_package_manager_idle(&self) -> Result<(), PreconditionFailure> {
        for process in &self.package_processes {
            let output = self
                .runner
                .output(
                    &CommandSpec::new("pgrep")
                        .args(["-x", process.as_str()])
                        .timeout(self.command_timeout),
                )
                .map_err(|err| {
                    PreconditionFailure::new(PreconditionKind::PackageManagerBusy, err.to_string())
                })?;
            match output.code {
                Some(0) => {
                    return Err(PreconditionFailure::new(
                        PreconditionKind::PackageManagerBusy,
                        format!(
                            "package manager process '{process}' is running (pids: {})",
                            output.stdout.split_whitespace().collect::<Vec<_>>().join(",")
                        ),
                    ));
                }
                Some(1) => {}
                _ => {
                    return Err(PreconditionFailure::new(
                        PreconditionKind::PackageManagerBusy,
                        format!("pgrep -x {process} failed: {}", output.tail()),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_disk_space(&self) -> Result<(), PreconditionFailure> {
        let available = (self.free_space)(&self.mount_point).map_err(|err| {
            PreconditionFailure::new(
                PreconditionKind::Disk,
                format!(
                    "failed to query free space on {}: {err}",
                    self.mount_point.display()
                ),
            )
        })?;
        ensure_free_space(&self.mount_point, available, self.min_free_bytes)
    }

    fn check_network(&self) -> Result<(), PreconditionFailure> {
        (self.network_probe)(&self.network).map_err(|detail| {
            PreconditionFailure::new(
                PreconditionKind::Network,
                format!("{} unreachable: {detail}", self.network.probe_url),
            )
        })
    }
}

impl PreconditionChecker for HostPreconditions {
    fn check(&self) -> Result<(), PreconditionFailure> {
        self.check_package_system()?;
        self.check_package_manager_idle()?;
        self.check_disk_space()?;
        self.check_network()?;
        info!(target: "relup::orchestrator", "preconditions satisfied");
        Ok(())
    }
}

pub fn ensure_free_space(
    mount_point: &Path,
    available: u64,
    required: u64,
) -> Result<(), PreconditionFailure> {
    if available >= required {
        return Ok(());
    }
    Err(PreconditionFailure::new(
        PreconditionKind::Disk,
        format!(
            "{} has {} free, need at least {}",
            mount_point.display(),
            human_bytes(available),
            human_bytes(required)
        ),
    ))
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn free_space_bytes(path: &Path) -> io::Result<u64> {
    let stat = statvfs(path).map_err(io::Error::from)?;
    // field widths differ between libc targets
    #[allow(clippy::unnecessary_cast)]
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    Ok(available)
}

/// Any HTTP response counts as reachable; only transport failures fail.
pub fn http_probe(network: &NetworkConfig) -> Result<(), String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(network.timeout_secs))
        .build()
        .map_err(|err| err.to_string())?;
    client
        .head(&network.probe_url)
        .send()
        .map(|_| ())
        .map_err(|err| err.to_string())
}
