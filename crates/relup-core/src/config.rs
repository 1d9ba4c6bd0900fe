use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/relup/relup.toml";

/// Command timeouts the boot start window must leave room for beyond the
/// release upgrade itself (package repair before, cleanup after).
pub const BOOT_START_COMMAND_MARGIN: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpgradeConfig {
    /// Holds the state record, lock record, journal and log file.
    pub base_dir: PathBuf,
    pub unit_dir: PathBuf,
    pub unit_name: String,
    pub os_release_path: PathBuf,
    pub release_upgrades_path: PathBuf,
    /// Command the boot hook runs; defaults to the running executable.
    pub resume_command: Option<PathBuf>,
    pub timeouts: TimeoutConfig,
    pub disk: DiskConfig,
    pub network: NetworkConfig,
    pub retry: RetryConfig,
    pub reboot: RebootConfig,
    pub package_locks: PackageLockConfig,
    pub cleanup: CleanupConfig,
    pub post_setup: PostSetupConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub command_secs: u64,
    pub release_upgrade_secs: u64,
    pub boot_start_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiskConfig {
    pub mount_point: PathBuf,
    pub min_free_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub probe_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RebootConfig {
    pub delay_minutes: u32,
}

/// Transient blockers cleared before each retried package-manager operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageLockConfig {
    pub lock_files: Vec<PathBuf>,
    pub processes: Vec<String>,
    /// How long signalled processes get to exit before the locks are touched.
    pub exit_wait_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupConfig {
    pub backup_command: Vec<String>,
    pub stop_services: Vec<String>,
    pub remove_packages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostSetupConfig {
    pub install_packages: Vec<String>,
    pub restore_command: Vec<String>,
    pub enable_services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub watch_services: Vec<String>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/relup"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            unit_name: "relup-resume.service".to_string(),
            os_release_path: PathBuf::from("/etc/os-release"),
            release_upgrades_path: PathBuf::from("/etc/update-manager/release-upgrades"),
            resume_command: None,
            timeouts: TimeoutConfig::default(),
            disk: DiskConfig::default(),
            network: NetworkConfig::default(),
            retry: RetryConfig::default(),
            reboot: RebootConfig::default(),
            package_locks: PackageLockConfig::default(),
            cleanup: CleanupConfig::default(),
            post_setup: PostSetupConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: 30 * 60,
            release_upgrade_secs: 6 * 60 * 60,
            boot_start_secs: 8 * 60 * 60,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/"),
            min_free_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_url: "http://archive.ubuntu.com/ubuntu/".to_string(),
            timeout_secs: 15,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff_secs: 10,
            max_backoff_secs: 300,
        }
    }
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self { delay_minutes: 1 }
    }
}

impl Default for PackageLockConfig {
    fn default() -> Self {
        Self {
            lock_files: [
                "/var/lib/dpkg/lock-frontend",
                "/var/lib/dpkg/lock",
                "/var/lib/apt/lists/lock",
                "/var/cache/apt/archives/lock",
            ]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
            processes: ["apt", "apt-get", "aptitude", "dpkg", "unattended-upgr"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            exit_wait_secs: 10,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            watch_services: Vec::new(),
        }
    }
}

impl UpgradeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse relup config")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config: {}", path.display()));
            }
        };
        Self::from_toml_str(&raw).with_context(|| format!("invalid config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        for (field, path) in [
            ("base_dir", &self.base_dir),
            ("unit_dir", &self.unit_dir),
            ("os_release_path", &self.os_release_path),
            ("release_upgrades_path", &self.release_upgrades_path),
            ("disk.mount_point", &self.disk.mount_point),
        ] {
            if !path.is_absolute() {
                return Err(anyhow!(
                    "{field} must be an absolute path: {}",
                    path.display()
                ));
            }
        }
        if let Some(command) = &self.resume_command {
            if !command.is_absolute() {
                return Err(anyhow!(
                    "resume_command must be an absolute path: {}",
                    command.display()
                ));
            }
        }
        if !self.unit_name.ends_with(".service") || self.unit_name.contains('/') {
            return Err(anyhow!(
                "unit_name must be a bare systemd service name: {}",
                self.unit_name
            ));
        }
        if self.retry.attempts == 0 {
            return Err(anyhow!("retry.attempts must be at least 1"));
        }
        if self.timeouts.release_upgrade_secs == 0 || self.timeouts.command_secs == 0 {
            return Err(anyhow!("timeouts must be greater than zero"));
        }
        // systemd reads TimeoutStartSec=0 as no limit at all
        if self.timeouts.boot_start_secs == 0 {
            return Err(anyhow!("timeouts.boot_start_secs must be greater than zero"));
        }
        let boot_floor = self.timeouts.release_upgrade_secs.saturating_add(
            self.timeouts
                .command_secs
                .saturating_mul(BOOT_START_COMMAND_MARGIN),
        );
        if self.timeouts.boot_start_secs <= boot_floor {
            return Err(anyhow!(
                "timeouts.boot_start_secs ({}) must exceed release_upgrade_secs plus {} command \
                 timeouts ({boot_floor})",
                self.timeouts.boot_start_secs,
                BOOT_START_COMMAND_MARGIN
            ));
        }
        if self.network.probe_url.trim().is_empty() {
            return Err(anyhow!("network.probe_url must not be empty"));
        }
        if self.monitor.enabled && self.monitor.interval_secs == 0 {
            return Err(anyhow!("monitor.interval_secs must be greater than zero"));
        }
        Ok(())
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(&self.unit_name)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.command_secs)
    }

    pub fn release_upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.release_upgrade_secs)
    }

    pub fn boot_start_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.boot_start_secs)
    }
}
