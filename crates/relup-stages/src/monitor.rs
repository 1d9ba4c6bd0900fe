use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use relup_core::UpgradeConfig;
use relup_host::CommandRunner;
use tracing::{info, warn};

use crate::preconditions::free_space_bytes;
use crate::services::Systemctl;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub trait HealthMonitor {
    /// Starts sampling in the background; sampling ends when the handle drops.
    fn start(&self) -> MonitorHandle;
}

pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn inert() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(true)),
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(target: "relup::monitor", "health monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Samples load, memory and disk, and restarts watched services that stop.
pub struct ServiceWatchdog {
    enabled: bool,
    interval: Duration,
    services: Vec<String>,
    mount_point: PathBuf,
    systemctl: Systemctl,
}

impl ServiceWatchdog {
    pub fn from_config(config: &UpgradeConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            enabled: config.monitor.enabled,
            interval: Duration::from_secs(config.monitor.interval_secs),
            services: config.monitor.watch_services.clone(),
            mount_point: config.disk.mount_point.clone(),
            systemctl: Systemctl::new(runner, config.command_timeout()),
        }
    }
}

impl HealthMonitor for ServiceWatchdog {
    fn start(&self) -> MonitorHandle {
        if !self.enabled {
            return MonitorHandle::inert();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let interval = self.interval;
        let services = self.services.clone();
        let mount_point = self.mount_point.clone();
        let systemctl = self.systemctl.clone();

        let worker = thread::Builder::new()
            .name("relup-monitor".to_string())
            .spawn(move || {
                while !worker_stop.load(Ordering::SeqCst) {
                    sample_health(&mount_point);
                    recover_services(&systemctl, &services);
                    if !sleep_unless_stopped(&worker_stop, interval) {
                        break;
                    }
                }
            });

        match worker {
            Ok(worker) => MonitorHandle {
                stop,
                worker: Some(worker),
            },
            Err(err) => {
                warn!(target: "relup::monitor", error = %err, "could not start health monitor");
                MonitorHandle::inert()
            }
        }
    }
}

/// Returns `false` once `stop` is raised.
fn sleep_unless_stopped(stop: &AtomicBool, interval: Duration) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
    }
}

fn sample_health(mount_point: &std::path::Path) {
    let load = fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|raw| parse_loadavg(&raw));
    let mem_available_kb = fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|raw| parse_mem_available_kb(&raw));
    let disk_free_bytes = free_space_bytes(mount_point).ok();

    info!(
        target: "relup::stat",
        load1 = load.map(|l| l.0),
        load5 = load.map(|l| l.1),
        load15 = load.map(|l| l.2),
        mem_available_kb,
        disk_free_bytes,
        "health sample"
    );
}

fn recover_services(systemctl: &Systemctl, services: &[String]) {
    for service in services {
        match systemctl.is_active(service) {
            Ok(true) => {}
            Ok(false) => {
                warn!(target: "relup::monitor", service = %service, "watched service inactive; restarting");
                if let Err(err) = systemctl.restart(service) {
                    warn!(target: "relup::monitor", service = %service, error = %err, "service restart failed");
                }
            }
            Err(err) => {
                warn!(target: "relup::monitor", service = %service, error = %err, "could not query service");
            }
        }
    }
}

pub fn parse_loadavg(raw: &str) -> Option<(f64, f64, f64)> {
    let mut fields = raw.split_whitespace().map(str::parse::<f64>);
    match (fields.next(), fields.next(), fields.next()) {
        (Some(Ok(one)), Some(Ok(five)), Some(Ok(fifteen))) => Some((one, five, fifteen)),
        _ => None,
    }
}

pub fn parse_mem_available_kb(raw: &str) -> Option<u64> {
    raw.lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}
