use std::cell::Cell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relup_core::{
    CleanupConfig, MonitorConfig, NetworkConfig, PackageLockConfig, PostSetupConfig,
    PreconditionKind, ReleaseVersion, Stage, UpgradeConfig,
};
use relup_host::{CommandError, CommandOutput, CommandRunner, CommandSpec};

use super::*;

enum Reply {
    Exit { code: i32, stdout: String },
    TimedOut,
}

struct Rule {
    prefix: String,
    reply: Reply,
    remaining: Option<usize>,
    writes: Option<(PathBuf, String)>,
}

/// Answers commands by prefix; anything unmatched exits 0 with no output.
#[derive(Default)]
struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    rules: Mutex<Vec<Rule>>,
}

impl ScriptedRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, rule: Rule) {
        self.rules.lock().expect("rules lock").push(rule);
    }

    fn exit(&self, prefix: &str, code: i32, stdout: &str) {
        self.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Exit {
                code,
                stdout: stdout.to_string(),
            },
            remaining: None,
            writes: None,
        });
    }

    fn fail_times(&self, prefix: &str, times: usize) {
        self.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Exit {
                code: 100,
                stdout: String::new(),
            },
            remaining: Some(times),
            writes: None,
        });
    }

    fn time_out(&self, prefix: &str) {
        self.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::TimedOut,
            remaining: None,
            writes: None,
        });
    }

    fn exit_times(&self, prefix: &str, code: i32, times: usize) {
        self.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Exit {
                code,
                stdout: String::new(),
            },
            remaining: Some(times),
            writes: None,
        });
    }

    fn write_on(&self, prefix: &str, path: &Path, contents: &str) {
        self.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Exit {
                code: 0,
                stdout: String::new(),
            },
            remaining: None,
            writes: Some((path.to_path_buf(), contents.to_string())),
        });
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let rendered = spec.to_string();
        self.calls.lock().expect("calls lock").push(rendered.clone());

        let mut rules = self.rules.lock().expect("rules lock");
        let Some(rule) = rules
            .iter_mut()
            .find(|rule| rendered.starts_with(&rule.prefix) && rule.remaining != Some(0))
        else {
            return Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            });
        };
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        if let Some((path, contents)) = &rule.writes {
            fs::write(path, contents).expect("must write scripted file");
        }
        match &rule.reply {
            Reply::Exit { code, stdout } => Ok(CommandOutput {
                code: Some(*code),
                stdout: stdout.clone(),
                stderr: if *code == 0 {
                    String::new()
                } else {
                    "E: scripted failure".to_string()
                },
            }),
            Reply::TimedOut => Err(CommandError::TimedOut {
                command: rendered,
                after: spec.timeout.unwrap_or_default(),
                tail: "Calculating the changes".to_string(),
            }),
        }
    }
}

fn test_dir(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "relup-stages-{label}-{}-{}",
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn quick_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        attempts,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    }
}

fn test_apt(runner: &Arc<ScriptedRunner>, attempts: u32) -> Apt {
    Apt::new(
        runner.clone(),
        Duration::from_secs(60),
        quick_retry(attempts),
        PackageLockConfig {
            lock_files: Vec::new(),
            processes: Vec::new(),
            exit_wait_secs: 0,
        },
    )
}

fn test_systemctl(runner: &Arc<ScriptedRunner>) -> Systemctl {
    Systemctl::new(runner.clone(), Duration::from_secs(60))
}

fn write_os_release(dir: &Path, version: &str) -> PathBuf {
    let path = dir.join("os-release");
    fs::write(
        &path,
        format!("NAME=\"Ubuntu\"\nVERSION_ID=\"{version}\"\nID=ubuntu\n"),
    )
    .expect("must write os-release");
    path
}

fn release_stage(
    runner: &Arc<ScriptedRunner>,
    dir: &Path,
    release: ReleaseVersion,
) -> ReleaseUpgradeStage {
    ReleaseUpgradeStage::new(
        release,
        test_apt(runner, 2),
        dir.join("os-release"),
        dir.join("release-upgrades"),
        Duration::from_secs(3600),
    )
}

const KEEP_CONFIG: &str =
    "apt-get -o Dpkg::Options::=--force-confdef -o Dpkg::Options::=--force-confold";

#[test]
fn backoff_doubles_and_caps() {
    let policy = RetryPolicy {
        attempts: 5,
        initial_backoff: Duration::from_secs(10),
        max_backoff: Duration::from_secs(300),
    };
    assert_eq!(policy.backoff_for(1), Duration::from_secs(10));
    assert_eq!(policy.backoff_for(2), Duration::from_secs(20));
    assert_eq!(policy.backoff_for(3), Duration::from_secs(40));
    assert_eq!(policy.backoff_for(6), Duration::from_secs(300));
    assert_eq!(policy.backoff_for(40), Duration::from_secs(300));
}

#[test]
fn retry_policy_from_config_never_drops_below_one_attempt() {
    let policy = RetryPolicy::from_config(&relup_core::RetryConfig {
        attempts: 0,
        initial_backoff_secs: 1,
        max_backoff_secs: 2,
    });
    assert_eq!(policy.attempts, 1);
}

#[test]
fn retry_heals_before_every_attempt_and_returns_last_error() {
    let heals = Cell::new(0);
    let attempts = Cell::new(0);
    let result: Result<(), String> = retry_with_healing(
        &quick_retry(3),
        "flaky",
        || heals.set(heals.get() + 1),
        || {
            attempts.set(attempts.get() + 1);
            Err(format!("failure {}", attempts.get()))
        },
    );
    assert_eq!(result, Err("failure 3".to_string()));
    assert_eq!(attempts.get(), 3);
    assert_eq!(heals.get(), 3);
}

#[test]
fn retry_stops_after_first_success() {
    let attempts = Cell::new(0);
    let result = retry_with_healing(
        &quick_retry(5),
        "flaky",
        || {},
        || {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 2 {
                Err("not yet")
            } else {
                Ok(attempts.get())
            }
        },
    );
    assert_eq!(result, Ok(2));
    assert_eq!(attempts.get(), 2);
}

fn blocker_apt(runner: &Arc<ScriptedRunner>, lock_file: &Path, exit_wait_secs: u64) -> Apt {
    Apt::new(
        runner.clone(),
        Duration::from_secs(60),
        quick_retry(3),
        PackageLockConfig {
            lock_files: vec![lock_file.to_path_buf()],
            processes: vec!["apt-get".to_string()],
            exit_wait_secs,
        },
    )
}

#[test]
fn clear_blockers_waits_for_exit_before_removing_locks() {
    let dir = test_dir("blocker-exit");
    let lock_file = dir.join("lock-frontend");
    fs::write(&lock_file, "").expect("must write lock file");

    let runner = ScriptedRunner::new();
    runner.exit_times("pgrep -x apt-get", 0, 1);
    runner.exit("pgrep -x apt-get", 1, "");
    blocker_apt(&runner, &lock_file, 5).clear_blockers();

    assert_eq!(
        runner.calls(),
        vec!["pkill -x apt-get", "pgrep -x apt-get", "pgrep -x apt-get"]
    );
    assert!(!lock_file.exists());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn clear_blockers_escalates_and_keeps_locks_of_survivors() {
    let dir = test_dir("blocker-survivor");
    let lock_file = dir.join("lock-frontend");
    fs::write(&lock_file, "").expect("must write lock file");

    // unmatched commands exit 0, so pgrep keeps reporting apt-get alive
    let runner = ScriptedRunner::new();
    blocker_apt(&runner, &lock_file, 0).clear_blockers();

    assert_eq!(
        runner.calls(),
        vec![
            "pkill -x apt-get",
            "pgrep -x apt-get",
            "pkill -KILL -x apt-get",
            "pgrep -x apt-get",
        ]
    );
    assert!(lock_file.exists());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn clear_blockers_skips_wait_when_nothing_matched() {
    let dir = test_dir("blocker-idle");
    let lock_file = dir.join("lock-frontend");
    fs::write(&lock_file, "").expect("must write lock file");

    let runner = ScriptedRunner::new();
    runner.exit("pkill", 1, "");
    blocker_apt(&runner, &lock_file, 5).clear_blockers();

    assert_eq!(runner.calls(), vec!["pkill -x apt-get"]);
    assert!(!lock_file.exists());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn apt_update_retries_after_clearing_blockers() {
    let dir = test_dir("blockers");
    let lock_file = dir.join("lock-frontend");
    fs::write(&lock_file, "").expect("must write lock file");

    let runner = ScriptedRunner::new();
    runner.fail_times("apt-get update", 2);
    runner.exit("pgrep", 1, "");
    let apt = blocker_apt(&runner, &lock_file, 5);

    apt.update_with_retry().expect("third attempt must succeed");
    assert_eq!(runner.count("apt-get update"), 3);
    assert_eq!(runner.count("pkill -x apt-get"), 3);
    assert!(!lock_file.exists());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn apt_update_reports_failure_once_attempts_are_exhausted() {
    let runner = ScriptedRunner::new();
    runner.fail_times("apt-get update", 10);
    let apt = test_apt(&runner, 2);

    let failure = apt.update_with_retry().expect_err("must fail");
    assert!(failure.cause.contains("apt-get update"));
    assert!(failure.diagnostic_tail.contains("scripted failure"));
    assert_eq!(runner.count("apt-get update"), 2);
}

#[test]
fn apt_repair_configures_then_fixes_dependencies() {
    let runner = ScriptedRunner::new();
    let apt = test_apt(&runner, 1);

    apt.repair().expect("must repair");
    assert_eq!(
        runner.calls(),
        vec![
            "dpkg --configure -a".to_string(),
            format!("{KEEP_CONFIG} -f install -y"),
        ]
    );
}

#[test]
fn apt_skips_empty_install_and_purge() {
    let runner = ScriptedRunner::new();
    let apt = test_apt(&runner, 1);

    apt.install(&[]).expect("must accept empty install");
    apt.purge(&[]).expect("must accept empty purge");
    assert!(runner.calls().is_empty());
}

#[test]
fn is_installed_reads_dpkg_status() {
    let runner = ScriptedRunner::new();
    runner.exit("dpkg-query -W -f=${Status} postgresql", 0, "install ok installed");
    runner.exit("dpkg-query -W -f=${Status} mysql-server", 1, "");
    let apt = test_apt(&runner, 1);

    assert!(apt.is_installed("postgresql").expect("must query"));
    assert!(!apt.is_installed("mysql-server").expect("must query"));
}

#[test]
fn unit_name_appends_service_suffix() {
    assert_eq!(unit_name("postgresql"), "postgresql.service");
    assert_eq!(unit_name("backup.timer"), "backup.timer");
}

#[test]
fn cleanup_skips_missing_units_and_uninstalled_packages() {
    let runner = ScriptedRunner::new();
    runner.exit(
        "systemctl list-unit-files --no-legend --no-pager postgresql.service",
        0,
        "postgresql.service enabled enabled\n",
    );
    runner.exit("dpkg-query -W -f=${Status} pkg-a", 0, "install ok installed");
    runner.exit("dpkg-query -W -f=${Status} pkg-b", 1, "");

    let stage = CleanupStage::new(
        test_apt(&runner, 1),
        test_systemctl(&runner),
        CleanupConfig {
            backup_command: vec!["pg-backup".to_string(), "--all".to_string()],
            stop_services: vec!["postgresql".to_string(), "ghost".to_string()],
            remove_packages: vec!["pkg-a".to_string(), "pkg-b".to_string()],
        },
    );

    stage.execute().expect("cleanup must succeed");
    assert_eq!(
        runner.calls(),
        vec![
            "pg-backup --all".to_string(),
            "systemctl list-unit-files --no-legend --no-pager postgresql.service".to_string(),
            "systemctl disable --now postgresql.service".to_string(),
            "systemctl list-unit-files --no-legend --no-pager ghost.service".to_string(),
            "dpkg-query -W -f=${Status} pkg-a".to_string(),
            "dpkg-query -W -f=${Status} pkg-b".to_string(),
            "apt-get purge -y pkg-a".to_string(),
            "apt-get autoremove --purge -y".to_string(),
        ]
    );
}

#[test]
fn cleanup_stops_at_failed_backup() {
    let runner = ScriptedRunner::new();
    runner.exit("pg-backup", 2, "");
    let stage = CleanupStage::new(
        test_apt(&runner, 1),
        test_systemctl(&runner),
        CleanupConfig {
            backup_command: vec!["pg-backup".to_string()],
            stop_services: vec!["postgresql".to_string()],
            remove_packages: Vec::new(),
        },
    );

    let failure = stage.execute().expect_err("must fail");
    assert!(failure.cause.starts_with("database backup failed"));
    assert!(failure.diagnostic_tail.contains("scripted failure"));
    assert_eq!(runner.calls(), vec!["pg-backup".to_string()]);
}

#[test]
fn cleanup_can_run_twice() {
    let runner = ScriptedRunner::new();
    let stage = CleanupStage::new(
        test_apt(&runner, 1),
        test_systemctl(&runner),
        CleanupConfig::default(),
    );

    stage.execute().expect("first run");
    stage.execute().expect("second run");
    assert_eq!(runner.count("apt-get autoremove --purge -y"), 2);
}

#[test]
fn release_upgrade_skips_when_host_already_on_target() {
    let dir = test_dir("at-target");
    write_os_release(&dir, "22.04");
    let runner = ScriptedRunner::new();

    release_stage(&runner, &dir, ReleaseVersion::Jammy)
        .execute()
        .expect("must treat as done");
    assert!(runner.calls().is_empty());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn release_upgrade_rejects_unexpected_source_release() {
    let dir = test_dir("wrong-source");
    write_os_release(&dir, "18.04");
    let runner = ScriptedRunner::new();

    let failure = release_stage(&runner, &dir, ReleaseVersion::Jammy)
        .execute()
        .expect_err("must refuse");
    assert!(failure.cause.contains("18.04"));
    assert!(failure.cause.contains("20.04"));
    assert!(runner.calls().is_empty());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn release_upgrade_runs_full_sequence_and_verifies_target() {
    let dir = test_dir("full");
    let os_release = write_os_release(&dir, "20.04");
    let runner = ScriptedRunner::new();
    runner.write_on(
        "do-release-upgrade",
        &os_release,
        "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\n",
    );

    release_stage(&runner, &dir, ReleaseVersion::Jammy)
        .execute()
        .expect("upgrade must succeed");

    assert_eq!(
        runner.calls(),
        vec![
            "apt-get update".to_string(),
            "dpkg --configure -a".to_string(),
            format!("{KEEP_CONFIG} -f install -y"),
            format!("{KEEP_CONFIG} dist-upgrade -y"),
            "do-release-upgrade -f DistUpgradeViewNonInteractive".to_string(),
        ]
    );
    let policy = fs::read_to_string(dir.join("release-upgrades")).expect("must read policy");
    assert!(policy.contains("Prompt=lts"));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn release_upgrade_timeout_fails_without_retry() {
    let dir = test_dir("timeout");
    write_os_release(&dir, "22.04");
    let runner = ScriptedRunner::new();
    runner.time_out("do-release-upgrade");

    let failure = release_stage(&runner, &dir, ReleaseVersion::Noble)
        .execute()
        .expect_err("timeout must fail the stage");
    assert!(failure.cause.contains("ceiling"));
    assert_eq!(failure.diagnostic_tail, "Calculating the changes");
    assert_eq!(runner.count("do-release-upgrade"), 1);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn release_upgrade_fails_when_release_did_not_change() {
    let dir = test_dir("unchanged");
    write_os_release(&dir, "20.04");
    let runner = ScriptedRunner::new();

    let failure = release_stage(&runner, &dir, ReleaseVersion::Jammy)
        .execute()
        .expect_err("must detect unchanged release");
    assert!(failure.cause.contains("host reports 20.04"));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn lts_prompt_replaces_existing_setting() {
    assert_eq!(
        with_lts_prompt("[DEFAULT]\nPrompt=normal\n"),
        "[DEFAULT]\nPrompt=lts\n"
    );
    assert_eq!(
        with_lts_prompt("[DEFAULT]\nPrompt=lts\n"),
        "[DEFAULT]\nPrompt=lts\n"
    );
}

#[test]
fn lts_prompt_is_added_when_missing() {
    assert_eq!(with_lts_prompt(""), "[DEFAULT]\nPrompt=lts\n");
    assert_eq!(
        with_lts_prompt("# comment\n[DEFAULT]\n"),
        "# comment\n[DEFAULT]\nPrompt=lts\n"
    );
}

#[test]
fn force_lts_prompt_reports_whether_file_changed() {
    let dir = test_dir("prompt");
    let path = dir.join("update-manager").join("release-upgrades");

    assert!(force_lts_prompt(&path).expect("must create policy"));
    assert!(!force_lts_prompt(&path).expect("must leave policy alone"));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn version_id_parsing() {
    assert_eq!(
        parse_version_id("NAME=\"Ubuntu\"\nVERSION_ID=\"20.04\"\n"),
        Some("20.04".to_string())
    );
    assert_eq!(
        parse_version_id("VERSION_ID=24.04"),
        Some("24.04".to_string())
    );
    assert_eq!(parse_version_id("NAME=Ubuntu\n"), None);
    assert_eq!(parse_version_id("VERSION_ID=\"\"\n"), None);
}

fn plenty_of_space(_path: &Path) -> io::Result<u64> {
    Ok(100 * 1024 * 1024 * 1024)
}

fn no_space(_path: &Path) -> io::Result<u64> {
    Ok(512 * 1024 * 1024)
}

fn reachable(_network: &NetworkConfig) -> Result<(), String> {
    Ok(())
}

fn unreachable(_network: &NetworkConfig) -> Result<(), String> {
    Err("connection refused".to_string())
}

fn idle_host() -> Arc<ScriptedRunner> {
    let runner = ScriptedRunner::new();
    runner.exit("pgrep", 1, "");
    runner
}

fn preconditions(runner: &Arc<ScriptedRunner>) -> HostPreconditions {
    HostPreconditions::from_config(&UpgradeConfig::default(), runner.clone())
        .with_free_space(plenty_of_space)
        .with_network_probe(reachable)
}

#[test]
fn preconditions_pass_on_healthy_host() {
    let runner = idle_host();
    preconditions(&runner).check().expect("must pass");
    let calls = runner.calls();
    assert_eq!(calls[0], "dpkg --audit");
    assert_eq!(calls[1], "apt-mark showhold");
    assert!(calls[2..].iter().all(|call| call.starts_with("pgrep -x ")));
}

#[test]
fn preconditions_fail_on_held_packages() {
    let runner = idle_host();
    runner.exit("apt-mark showhold", 0, "linux-image-generic\n");

    let failure = preconditions(&runner).check().expect_err("must fail");
    assert_eq!(failure.kind, PreconditionKind::PackageSystem);
    assert!(failure.detail.contains("linux-image-generic"));
}

#[test]
fn preconditions_fail_on_dpkg_audit_findings() {
    let runner = idle_host();
    runner.exit("dpkg --audit", 0, "The following packages are only half configured\n");

    let failure = preconditions(&runner).check().expect_err("must fail");
    assert_eq!(failure.kind, PreconditionKind::PackageSystem);
}

#[test]
fn preconditions_fail_when_package_manager_running() {
    let runner = ScriptedRunner::new();
    runner.exit("pgrep -x apt-get", 0, "4242\n");
    runner.exit("pgrep", 1, "");

    let failure = preconditions(&runner).check().expect_err("must fail");
    assert_eq!(failure.kind, PreconditionKind::PackageManagerBusy);
    assert!(failure.detail.contains("4242"));
}

#[test]
fn preconditions_fail_on_low_disk() {
    let runner = idle_host();
    let failure = preconditions(&runner)
        .with_free_space(no_space)
        .check()
        .expect_err("must fail");
    assert_eq!(failure.kind, PreconditionKind::Disk);
    assert!(failure.detail.contains("512.0 MiB"));
}

#[test]
fn preconditions_fail_on_unreachable_mirror() {
    let runner = idle_host();
    let failure = preconditions(&runner)
        .with_network_probe(unreachable)
        .check()
        .expect_err("must fail");
    assert_eq!(failure.kind, PreconditionKind::Network);
    assert!(failure.detail.contains("connection refused"));
}

#[test]
fn human_bytes_picks_readable_unit() {
    assert_eq!(human_bytes(512), "512 B");
    assert_eq!(human_bytes(10 * 1024 * 1024 * 1024), "10.0 GiB");
}

#[test]
fn post_setup_installs_restores_then_enables() {
    let runner = ScriptedRunner::new();
    let stage = PostSetupStage::new(
        test_apt(&runner, 1),
        test_systemctl(&runner),
        PostSetupConfig {
            install_packages: vec!["postgresql".to_string()],
            restore_command: vec!["pg-restore".to_string(), "--all".to_string()],
            enable_services: vec!["postgresql".to_string()],
        },
    );

    stage.execute().expect("post-setup must succeed");
    assert_eq!(
        runner.calls(),
        vec![
            "apt-get update".to_string(),
            format!("{KEEP_CONFIG} install -y postgresql"),
            "pg-restore --all".to_string(),
            "systemctl enable --now postgresql.service".to_string(),
        ]
    );
}

#[test]
fn post_setup_reports_failed_restore() {
    let runner = ScriptedRunner::new();
    runner.exit("pg-restore", 1, "");
    let stage = PostSetupStage::new(
        test_apt(&runner, 1),
        test_systemctl(&runner),
        PostSetupConfig {
            install_packages: Vec::new(),
            restore_command: vec!["pg-restore".to_string()],
            enable_services: vec!["postgresql".to_string()],
        },
    );

    let failure = stage.execute().expect_err("must fail");
    assert!(failure.cause.starts_with("database restore failed"));
    assert_eq!(runner.count("systemctl"), 0);
}

#[test]
fn host_stages_dispatch_release_upgrades_by_target() {
    let dir = test_dir("dispatch");
    let os_release = write_os_release(&dir, "24.04");
    let runner = ScriptedRunner::new();
    let config = UpgradeConfig {
        os_release_path: os_release,
        release_upgrades_path: dir.join("release-upgrades"),
        ..UpgradeConfig::default()
    };
    let stages = HostStages::from_config(&config, runner.clone());

    stages
        .executor_for(Stage::ReleaseUpgrade(ReleaseVersion::Noble))
        .execute()
        .expect("noble stage must see host already upgraded");
    stages
        .executor_for(Stage::ReleaseUpgrade(ReleaseVersion::Jammy))
        .execute()
        .expect_err("jammy stage must refuse a 24.04 host");
    assert!(runner.calls().is_empty());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn loadavg_parsing() {
    assert_eq!(
        parse_loadavg("0.52 0.58 0.59 1/467 12345\n"),
        Some((0.52, 0.58, 0.59))
    );
    assert_eq!(parse_loadavg("garbage"), None);
}

#[test]
fn meminfo_parsing() {
    let raw = "MemTotal:       16314312 kB\nMemFree:         1234567 kB\nMemAvailable:    8123456 kB\n";
    assert_eq!(parse_mem_available_kb(raw), Some(8_123_456));
    assert_eq!(parse_mem_available_kb("MemTotal: 1 kB\n"), None);
}

#[test]
fn disabled_watchdog_starts_nothing() {
    let runner = ScriptedRunner::new();
    let config = UpgradeConfig {
        monitor: MonitorConfig {
            enabled: false,
            interval_secs: 1,
            watch_services: vec!["postgresql".to_string()],
        },
        ..UpgradeConfig::default()
    };

    let handle = ServiceWatchdog::from_config(&config, runner.clone()).start();
    assert!(!handle.is_running());
    handle.stop();
    assert!(runner.calls().is_empty());
}

#[test]
fn watchdog_restarts_inactive_service_and_stops_promptly() {
    let runner = ScriptedRunner::new();
    runner.exit("systemctl is-active --quiet postgresql.service", 3, "");
    let config = UpgradeConfig {
        monitor: MonitorConfig {
            enabled: true,
            interval_secs: 3600,
            watch_services: vec!["postgresql".to_string()],
        },
        ..UpgradeConfig::default()
    };

    let handle = ServiceWatchdog::from_config(&config, runner.clone()).start();
    let deadline = Instant::now() + Duration::from_secs(10);
    while runner.count("systemctl restart") == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(handle.is_running());

    let stopping = Instant::now();
    handle.stop();
    assert!(stopping.elapsed() < Duration::from_secs(5));
    assert_eq!(runner.count("systemctl restart postgresql.service"), 1);
}
