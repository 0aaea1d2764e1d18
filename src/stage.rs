//! Stage model: the unit of work the pipeline runner executes.
//!
//! A stage bundles an idempotency check, a mutating action and an
//! independent verification under one name. The runner owns the life
//! cycle; stages themselves are stateless between runs, so a stage list
//! can be rebuilt and re-run against the same host at any time.

use strum::{Display, EnumString, IntoStaticStr};

use crate::config::Config;
use crate::error::StageError;
use crate::session::{CommandChannel, SessionParams};
use crate::vault::CredentialVault;

/// The three stage groups, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum StageGroup {
    Hardening,
    Dependencies,
    Bootstrap,
}

impl StageGroup {
    /// All groups in execution order.
    pub fn all() -> [StageGroup; 3] {
        [Self::Hardening, Self::Dependencies, Self::Bootstrap]
    }
}

/// Whether a stage failure aborts the run or only records a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Criticality {
    Critical,
    Advisory,
}

/// Life cycle of one stage within one run.
///
/// ```text
/// Pending ──► Skipped                 (already satisfied)
/// Pending ──► Running ──► Verified    (acted, re-queried state matches)
/// Pending ──► Running ──► Failed     (action or verification failed)
/// Pending ──► Failed                 (the idempotency probe itself failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StageState {
    Pending,
    Skipped,
    Running,
    Verified,
    Failed,
}

impl StageState {
    /// Terminal states appear in the run report; no further transition is
    /// allowed out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Verified | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal life-cycle step.
    pub fn can_transition_to(&self, next: StageState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Skipped)
                | (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Verified)
                | (Self::Running, Self::Failed)
        )
    }
}

/// One provisioning stage.
///
/// The check must be read-only. The verification must re-query remote
/// state rather than trust the action's exit status; a stage whose action
/// exits zero but whose verification disagrees is a failed stage.
pub trait Stage {
    /// Stable kebab-case identifier used in logs and the run report.
    fn name(&self) -> &'static str;

    fn group(&self) -> StageGroup;

    fn criticality(&self) -> Criticality {
        Criticality::Critical
    }

    /// Read-only probe: is the desired state already in place?
    fn is_satisfied(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        vault: &mut CredentialVault,
    ) -> Result<bool, StageError>;

    /// Mutate the host toward the desired state.
    fn apply(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        vault: &mut CredentialVault,
    ) -> Result<(), StageError>;

    /// Re-query remote state and compare against the desired state.
    fn verify(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        vault: &mut CredentialVault,
    ) -> Result<(), StageError>;

    /// Connection parameters to reconnect with after this stage verified,
    /// when the stage changed how the host is reached.
    fn session_update(&self, _config: &Config) -> Option<SessionParams> {
        None
    }
}
