//! Pipeline runner: drives an ordered list of stages over one channel.
//!
//! The algorithm per stage is fixed: run the read-only idempotency check;
//! skip if satisfied; otherwise apply the action and then verify by
//! re-querying remote state. Verification runs whenever the action
//! reported success and its result alone decides whether the stage
//! passed. A failed critical stage halts the pipeline with the remainder
//! unattempted; a failed advisory stage is recorded as a warning and the
//! pipeline continues. A dead channel halts the pipeline no matter whose
//! turn it was.

use std::fmt;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{SessionError, StageError};
use crate::session::{probe, ChannelOpener, CommandChannel, SessionParams};
use crate::stage::{Criticality, Stage, StageGroup, StageState};
use crate::vault::CredentialVault;

/// Terminal record of one stage within a run.
#[derive(Debug)]
pub struct StageReport {
    pub name: &'static str,
    pub group: StageGroup,
    pub criticality: Criticality,
    pub state: StageState,
    pub error: Option<StageError>,
}

/// Why a run stopped before the end of the stage list.
#[derive(Debug)]
pub enum Halt {
    /// The named stage failed and was critical (or took the channel down
    /// with it). Its report row carries the error.
    Stage { name: &'static str },
    /// A stage changed the connection parameters and the channel could
    /// not be reopened afterwards. The stage itself verified.
    Connectivity {
        after: &'static str,
        error: SessionError,
    },
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage { name } => write!(f, "stage {name} failed"),
            Self::Connectivity { after, error } => {
                write!(f, "connection lost after stage {after}: {error}")
            }
        }
    }
}

/// Ordered outcome of one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineRun {
    reports: Vec<StageReport>,
    halt: Option<Halt>,
}

impl PipelineRun {
    fn record(&mut self, report: StageReport) {
        debug_assert!(
            report.state.is_terminal(),
            "only terminal stage states are reportable"
        );
        self.reports.push(report);
    }

    pub fn reports(&self) -> &[StageReport] {
        &self.reports
    }

    pub fn halt(&self) -> Option<&Halt> {
        self.halt.as_ref()
    }

    /// True when every critical stage ended Skipped or Verified. Advisory
    /// failures do not count against success.
    pub fn succeeded(&self) -> bool {
        self.halt.is_none()
    }

    /// Number of advisory stages that failed.
    pub fn warnings(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| {
                r.state == StageState::Failed && r.criticality == Criticality::Advisory
            })
            .count()
    }
}

/// Executes stage lists against one host. The stage order is the
/// caller's; the runner never reorders or infers dependencies.
pub struct PipelineRunner<'a> {
    config: &'a Config,
    opener: &'a mut dyn ChannelOpener,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(config: &'a Config, opener: &'a mut dyn ChannelOpener) -> Self {
        Self { config, opener }
    }

    /// Open and probe the channel, then drive every stage in order.
    ///
    /// `Err` means the channel never became usable and no remote state
    /// was touched. Once the pipeline starts, failures are recorded in
    /// the returned [`PipelineRun`] instead.
    pub fn run(&mut self, stages: &[Box<dyn Stage>]) -> Result<PipelineRun, SessionError> {
        let params = SessionParams::from_config(self.config);
        let mut chan = self.opener.open(&params)?;
        probe(chan.as_mut())?;
        info!(endpoint = %params.endpoint(), stages = stages.len(), "channel probed, pipeline starting");

        let mut vault = CredentialVault::new();
        let mut run = PipelineRun::default();

        for stage in stages {
            let name = stage.name();
            let (state, stage_error) =
                execute_stage(stage.as_ref(), self.config, chan.as_mut(), &mut vault);

            let connectivity_lost = stage_error
                .as_ref()
                .is_some_and(StageError::is_connectivity);
            run.record(StageReport {
                name,
                group: stage.group(),
                criticality: stage.criticality(),
                state,
                error: stage_error,
            });

            match state {
                StageState::Failed if connectivity_lost => {
                    error!(stage = name, "channel lost, aborting run");
                    run.halt = Some(Halt::Stage { name });
                    break;
                }
                StageState::Failed if stage.criticality() == Criticality::Critical => {
                    error!(stage = name, "critical stage failed, aborting run");
                    run.halt = Some(Halt::Stage { name });
                    break;
                }
                StageState::Failed => {
                    warn!(stage = name, "advisory stage failed, continuing");
                }
                StageState::Skipped => {
                    info!(stage = name, "already satisfied, skipped");
                }
                StageState::Verified => {
                    info!(stage = name, "verified");
                    if let Some(new_params) = stage.session_update(self.config) {
                        match self.reopen(chan, name, &new_params) {
                            Ok(fresh) => chan = fresh,
                            Err(halt) => {
                                run.halt = Some(halt);
                                return Ok(run);
                            }
                        }
                    }
                }
                StageState::Pending | StageState::Running => {}
            }
        }

        if let Err(err) = chan.close() {
            warn!(error = %err, "closing channel failed");
        }
        Ok(run)
    }

    /// Close the superseded channel and open a fresh, probed one on the
    /// stage's new parameters.
    fn reopen(
        &mut self,
        mut old: Box<dyn CommandChannel>,
        after: &'static str,
        params: &SessionParams,
    ) -> Result<Box<dyn CommandChannel>, Halt> {
        info!(
            stage = after,
            endpoint = %params.endpoint(),
            "stage changed connection parameters, reopening channel"
        );
        if let Err(err) = old.close() {
            warn!(error = %err, "closing superseded channel failed");
        }
        let attempt = self.opener.open(params).and_then(|mut fresh| {
            probe(fresh.as_mut())?;
            Ok(fresh)
        });
        attempt.map_err(|error| Halt::Connectivity { after, error })
    }
}

fn execute_stage(
    stage: &dyn Stage,
    config: &Config,
    chan: &mut dyn CommandChannel,
    vault: &mut CredentialVault,
) -> (StageState, Option<StageError>) {
    let name = stage.name();
    let mut state = StageState::Pending;

    info!(stage = name, "checking current state");
    match stage.is_satisfied(config, chan, vault) {
        Ok(true) => return (step(state, StageState::Skipped), None),
        Ok(false) => state = step(state, StageState::Running),
        Err(err) => return (step(state, StageState::Failed), Some(err)),
    }

    info!(stage = name, "applying");
    if let Err(err) = stage.apply(config, chan, vault) {
        return (step(state, StageState::Failed), Some(err));
    }

    info!(stage = name, "verifying");
    match stage.verify(config, chan, vault) {
        Ok(()) => (step(state, StageState::Verified), None),
        Err(err) => (step(state, StageState::Failed), Some(err)),
    }
}

/// Advance the life cycle by one legal move.
fn step(from: StageState, to: StageState) -> StageState {
    debug_assert!(
        from.can_transition_to(to),
        "illegal stage transition {from} -> {to}"
    );
    to
}
