use relup_core::{
    LockError, PreconditionFailure, Stage, StateError, Transition, UpgradeState,
};
use relup_host::{
    BootScheduler, CommandError, JournalEntry, JournalEvent, LockAcquired, LockGuard,
    LockManager, Rebooter, RunJournal, SchedulingError, StateStore,
};
use relup_stages::{HealthMonitor, PreconditionChecker, StageSet};
use thiserror::Error;
use tracing::{error, info, warn};

pub const EXIT_GENERIC: u8 = 1;
pub const EXIT_STATE_CORRUPT: u8 = 65;
pub const EXIT_PRECONDITION: u8 = 69;
pub const EXIT_STAGE_FAILED: u8 = 70;
pub const EXIT_SCHEDULING: u8 = 71;
pub const EXIT_LOCK_HELD: u8 = 75;
pub const EXIT_NOT_PRIVILEGED: u8 = 77;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("relup must run as root (effective uid {euid})")]
    NotPrivileged { euid: u32 },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    PreconditionFailed(#[from] PreconditionFailure),
    #[error("stage '{stage}' failed: {cause}")]
    StageFailed {
        stage: Stage,
        cause: String,
        diagnostic_tail: String,
    },
    #[error("failed to schedule boot hook")]
    SchedulingFailed(#[from] SchedulingError),
    #[error("failed to schedule reboot")]
    RebootFailed(#[source] CommandError),
}

impl RunError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotPrivileged { .. } => EXIT_NOT_PRIVILEGED,
            Self::Lock(LockError::Held { .. } | LockError::Unowned { .. }) => EXIT_LOCK_HELD,
            Self::Lock(LockError::Io { .. }) => EXIT_GENERIC,
            Self::State(StateError::Corrupt { .. }) => EXIT_STATE_CORRUPT,
            Self::State(StateError::Io { .. }) => EXIT_GENERIC,
            Self::PreconditionFailed(_) => EXIT_PRECONDITION,
            Self::StageFailed { .. } => EXIT_STAGE_FAILED,
            Self::SchedulingFailed(_) | Self::RebootFailed(_) => EXIT_SCHEDULING,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Next state persisted and a reboot scheduled.
    Advanced {
        from: UpgradeState,
        to: UpgradeState,
    },
    /// Pipeline finished; state cleared and boot hook removed.
    Completed,
}

pub struct Collaborators {
    pub lock: Box<dyn LockManager>,
    pub state: Box<dyn StateStore>,
    pub preconditions: Box<dyn PreconditionChecker>,
    pub stages: Box<dyn StageSet>,
    pub monitor: Box<dyn HealthMonitor>,
    pub boot: Box<dyn BootScheduler>,
    pub rebooter: Box<dyn Rebooter>,
    pub journal: Option<RunJournal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    /// Argv the boot hook re-invokes after the reboot.
    pub resume_command: Vec<String>,
    pub reboot_delay_minutes: u32,
}

pub struct Orchestrator {
    settings: RunSettings,
    parts: Collaborators,
}

impl Orchestrator {
    pub fn new(settings: RunSettings, parts: Collaborators) -> Self {
        Self { settings, parts }
    }

    /// Runs the stage for the persisted state and applies its transition.
    pub fn run(&self) -> Result<RunOutcome, RunError> {
        match self.parts.lock.acquire()? {
            LockAcquired::Fresh => {}
            LockAcquired::ReclaimedStale { previous_pid } => {
                info!(
                    target: "relup::audit",
                    previous_pid = ?previous_pid,
                    "took over lock from dead process"
                );
            }
        }
        let guard = LockGuard::new(self.parts.lock.as_ref());

        let outcome = self.run_locked();
        if let Err(err) = &outcome {
            error!(target: "relup::orchestrator", error = %err, "run aborted");
        }

        if let Err(err) = guard.release() {
            warn!(target: "relup::lock", error = %err, "failed to release lock");
        }
        outcome
    }

    fn run_locked(&self) -> Result<RunOutcome, RunError> {
        let state = self.parts.state.read()?;
        info!(target: "relup::orchestrator", state = %state, "resuming upgrade pipeline");
        self.record(state, JournalEvent::RunStarted, None);

        if let Err(failure) = self.parts.preconditions.check() {
            self.record(state, JournalEvent::PreconditionFailed, Some(failure.to_string()));
            return Err(failure.into());
        }

        let stage = state.stage();
        self.dispatch(state, stage)?;
        self.record(state, JournalEvent::StageSucceeded, Some(stage.to_string()));

        match state.transition() {
            Transition::Advance { next } => self.advance(state, next),
            Transition::Finish => self.finish(state),
        }
    }

    fn dispatch(&self, state: UpgradeState, stage: Stage) -> Result<(), RunError> {
        info!(target: "relup::orchestrator", state = %state, stage = %stage, "dispatching stage");
        let monitor = self.parts.monitor.start();
        let result = self.parts.stages.executor_for(stage).execute();
        monitor.stop();

        result.map_err(|failure| {
            error!(
                target: "relup::stage",
                stage = %stage,
                state = %state,
                cause = %failure.cause,
                diagnostic_tail = %failure.diagnostic_tail,
                "stage failed; state left unchanged"
            );
            self.record(state, JournalEvent::StageFailed, Some(failure.cause.clone()));
            RunError::StageFailed {
                stage,
                cause: failure.cause,
                diagnostic_tail: failure.diagnostic_tail,
            }
        })
    }

    fn advance(&self, from: UpgradeState, to: UpgradeState) -> Result<RunOutcome, RunError> {
        self.parts.boot.arm(&self.settings.resume_command)?;
        self.parts.state.write(to)?;
        info!(target: "relup::audit", from = %from, to = %to, "upgrade state advanced");
        self.record(to, JournalEvent::StateAdvanced, Some(format!("{from} -> {to}")));

        let message = format!("relup: rebooting to continue with stage {}", to.stage());
        self.parts
            .rebooter
            .schedule_reboot(self.settings.reboot_delay_minutes, &message)
            .map_err(RunError::RebootFailed)?;
        self.record(
            to,
            JournalEvent::RebootScheduled,
            Some(format!("+{} min", self.settings.reboot_delay_minutes)),
        );
        Ok(RunOutcome::Advanced { from, to })
    }

    fn finish(&self, from: UpgradeState) -> Result<RunOutcome, RunError> {
        self.parts.boot.disarm()?;
        self.parts.state.clear()?;
        info!(target: "relup::audit", from = %from, "upgrade pipeline completed");
        self.record(from, JournalEvent::Completed, None);
        Ok(RunOutcome::Completed)
    }

    fn record(&self, state: UpgradeState, event: JournalEvent, detail: Option<String>) {
        let Some(journal) = &self.parts.journal else {
            return;
        };
        if let Err(err) = journal.append(&JournalEntry::now(state.as_str(), event, detail)) {
            warn!(target: "relup::orchestrator", error = %format!("{err:#}"), "failed to append run journal");
        }
    }
}
