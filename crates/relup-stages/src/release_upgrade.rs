use std::path::PathBuf;
use std::time::Duration;

use relup_core::{ReleaseVersion, StageFailure};
use relup_host::{CommandError, CommandSpec};
use tracing::{info, warn};

use crate::apt::Apt;
use crate::os_release::{force_lts_prompt, read_version_id};
use crate::{command_failure, StageExecutor};

/// Moves the host one LTS release forward.
///
/// Index refresh and package repair are retried with healing; the
/// `do-release-upgrade` call itself runs exactly once under a hard
/// wall-clock ceiling. A host that already reports the target release is
/// treated as done, which covers a crash between the upgrade and the state
/// write.
pub struct ReleaseUpgradeStage {
    release: ReleaseVersion,
    apt: Apt,
    os_release_path: PathBuf,
    release_upgrades_path: PathBuf,
    upgrade_timeout: Duration,
}

impl ReleaseUpgradeStage {
    pub fn new(
        release: ReleaseVersion,
        apt: Apt,
        os_release_path: impl Into<PathBuf>,
        release_upgrades_path: impl Into<PathBuf>,
        upgrade_timeout: Duration,
    ) -> Self {
        Self {
            release,
            apt,
            os_release_path: os_release_path.into(),
            release_upgrades_path: release_upgrades_path.into(),
            upgrade_timeout,
        }
    }

    fn current_version(&self) -> Result<String, StageFailure> {
        read_version_id(&self.os_release_path)
            .map_err(|err| StageFailure::new(format!("cannot determine host release: {err:#}")))
    }

    fn run_release_upgrade(&self) -> Result<(), StageFailure> {
        let spec = CommandSpec::new("do-release-upgrade")
            .args(["-f", "DistUpgradeViewNonInteractive"])
            .noninteractive()
            .timeout(self.upgrade_timeout);

        info!(
            target: "relup::stage",
            target_release = %self.release,
            timeout_secs = self.upgrade_timeout.as_secs(),
            "starting release upgrade"
        );
        match self.apt.runner().run(&spec) {
            Ok(_) => Ok(()),
            Err(CommandError::TimedOut { after, tail, .. }) => Err(StageFailure::with_tail(
                format!(
                    "do-release-upgrade to {} exceeded its {}s ceiling",
                    self.release,
                    after.as_secs()
                ),
                tail,
            )),
            Err(err) => Err(command_failure(err)),
        }
    }
}

impl StageExecutor for ReleaseUpgradeStage {
    fn execute(&self) -> Result<(), StageFailure> {
        let current = self.current_version()?;
        if current == self.release.as_str() {
            info!(
                target: "relup::stage",
                release = %self.release,
                "host already reports target release; nothing to upgrade"
            );
            return Ok(());
        }
        if current != self.release.upgrades_from() {
            return Err(StageFailure::new(format!(
                "host reports release {current}, expected {} before upgrading to {}",
                self.release.upgrades_from(),
                self.release
            )));
        }

        match force_lts_prompt(&self.release_upgrades_path) {
            Ok(true) => info!(target: "relup::stage", "set release-upgrades Prompt=lts"),
            Ok(false) => {}
            Err(err) => {
                return Err(StageFailure::new(format!(
                    "cannot pin release-upgrades to LTS: {err:#}"
                )));
            }
        }

        self.apt.update_with_retry()?;
        self.apt.repair_with_retry()?;
        self.apt.dist_upgrade().map_err(command_failure)?;
        self.run_release_upgrade()?;

        let reported = self.current_version()?;
        if reported != self.release.as_str() {
            warn!(
                target: "relup::stage",
                reported = %reported,
                expected = %self.release,
                "release upgrade finished without changing the host release"
            );
            return Err(StageFailure::new(format!(
                "do-release-upgrade completed but host reports {reported}, expected {}",
                self.release
            )));
        }

        info!(target: "relup::stage", release = %self.release, "release upgrade applied");
        Ok(())
    }
}
