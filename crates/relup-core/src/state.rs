use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// LTS releases the pipeline moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReleaseVersion {
    Jammy,
    Noble,
}

impl ReleaseVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jammy => "22.04",
            Self::Noble => "24.04",
        }
    }

    /// The `VERSION_ID` a host must report before upgrading to this release.
    pub fn upgrades_from(self) -> &'static str {
        match self {
            Self::Jammy => "20.04",
            Self::Noble => "22.04",
        }
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted progress of the upgrade pipeline.
///
/// The on-disk form is a single token (`initial`, `22.04`, `24.04`, `setup`).
/// Anything else is corruption and must never be coerced into a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeState {
    Initial,
    PendingRelease(ReleaseVersion),
    PostSetup,
}

impl UpgradeState {
    pub const ALL: [UpgradeState; 4] = [
        UpgradeState::Initial,
        UpgradeState::PendingRelease(ReleaseVersion::Jammy),
        UpgradeState::PendingRelease(ReleaseVersion::Noble),
        UpgradeState::PostSetup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::PendingRelease(release) => release.as_str(),
            Self::PostSetup => "setup",
        }
    }

    pub fn stage(self) -> Stage {
        match self {
            Self::Initial => Stage::Cleanup,
            Self::PendingRelease(release) => Stage::ReleaseUpgrade(release),
            Self::PostSetup => Stage::PostSetup,
        }
    }

    /// What the orchestrator does once this state's stage has succeeded.
    pub fn transition(self) -> Transition {
        match self {
            Self::Initial => Transition::Advance {
                next: Self::PendingRelease(ReleaseVersion::Jammy),
            },
            Self::PendingRelease(ReleaseVersion::Jammy) => Transition::Advance {
                next: Self::PendingRelease(ReleaseVersion::Noble),
            },
            Self::PendingRelease(ReleaseVersion::Noble) => Transition::Advance {
                next: Self::PostSetup,
            },
            Self::PostSetup => Transition::Finish,
        }
    }

    fn ordinal(self) -> u8 {
        match self {
            Self::Initial => 0,
            Self::PendingRelease(ReleaseVersion::Jammy) => 1,
            Self::PendingRelease(ReleaseVersion::Noble) => 2,
            Self::PostSetup => 3,
        }
    }

    pub fn precedes(self, other: Self) -> bool {
        self.ordinal() < other.ordinal()
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized upgrade state token: '{0}'")]
pub struct UnknownStateToken(pub String);

impl FromStr for UpgradeState {
    type Err = UnknownStateToken;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "initial" => Ok(Self::Initial),
            "22.04" => Ok(Self::PendingRelease(ReleaseVersion::Jammy)),
            "24.04" => Ok(Self::PendingRelease(ReleaseVersion::Noble)),
            "setup" => Ok(Self::PostSetup),
            other => Err(UnknownStateToken(other.to_string())),
        }
    }
}

/// Bounded unit of work dispatched for one persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Cleanup,
    ReleaseUpgrade(ReleaseVersion),
    PostSetup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cleanup => f.write_str("cleanup"),
            Self::ReleaseUpgrade(release) => write!(f, "upgrade-to-{release}"),
            Self::PostSetup => f.write_str("post-setup"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Persist `next` and hand over to the next boot.
    Advance { next: UpgradeState },
    /// Terminal: clear the state record and remove the boot hook.
    Finish,
}
