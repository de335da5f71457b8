//! Martingale stake progression for a single signal run.
//!
//! A run starts at the base stake. Each loss doubles the stake for the next
//! attempt while martingale is enabled; a win resolves the run and the stake
//! falls back to base.

use broker_core::types::{AttemptResult, ErrorClass, LossPolicy, RejectReason};
use risk_manager::StopKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MartingaleStatus {
    Idle,
    AwaitingResult,
    Progressing,
    Resolved,
}

/// How a signal run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Won,
    /// A loss with martingale off.
    Lost,
    StopConditionHit { stop: StopKind },
    Failed { reason: RejectReason },
    /// The attempt window elapsed with no result.
    TimedOut,
    /// Doubling the stake overflowed.
    StakeOverflow,
    /// Trading was stopped before the run could continue.
    Stopped,
}

impl RunOutcome {
    /// Taxonomy entry of a run that did not end in a win or loss.
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            RunOutcome::StopConditionHit { .. } => Some(ErrorClass::StopConditionHit),
            RunOutcome::Failed { reason } => Some(reason.class()),
            RunOutcome::TimedOut => Some(ErrorClass::AttemptTimeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Won => write!(f, "won"),
            RunOutcome::Lost => write!(f, "lost"),
            RunOutcome::StopConditionHit { stop } => write!(f, "stopped by {stop}"),
            RunOutcome::Failed { reason } => write!(f, "failed: {reason}"),
            RunOutcome::TimedOut => write!(f, "timed out"),
            RunOutcome::StakeOverflow => write!(f, "stake overflow"),
            RunOutcome::Stopped => write!(f, "stopped"),
        }
    }
}

/// What the run does after a finalized attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Continue { next_stake: Decimal },
    Resolved(RunOutcome),
}

/// Snapshot of a run's stake progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MartingaleState {
    pub base_stake: Decimal,
    pub current_stake: Decimal,
    pub consecutive_losses: u32,
    /// Stake of every attempt that reached a win or loss.
    pub cumulative_staked: Decimal,
    pub status: MartingaleStatus,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MartingaleError {
    #[error("an attempt is already awaiting its result")]
    AttemptOutstanding,

    #[error("run has already resolved")]
    Resolved,

    #[error("no attempt is awaiting a result")]
    NotAwaiting,

    #[error("attempt result is not final")]
    NotFinal,
}

/// Per-signal state machine:
/// Idle -> AwaitingResult -> (Progressing -> AwaitingResult)* -> Resolved.
#[derive(Debug, Clone)]
pub struct MartingaleController {
    state: MartingaleState,
    loss_policy: LossPolicy,
}

impl MartingaleController {
    pub fn new(base_stake: Decimal, loss_policy: LossPolicy) -> Self {
        Self {
            state: MartingaleState {
                base_stake,
                current_stake: base_stake,
                consecutive_losses: 0,
                cumulative_staked: Decimal::ZERO,
                status: MartingaleStatus::Idle,
            },
            loss_policy,
        }
    }

    pub fn state(&self) -> MartingaleState {
        self.state
    }

    pub fn status(&self) -> MartingaleStatus {
        self.state.status
    }

    pub fn current_stake(&self) -> Decimal {
        self.state.current_stake
    }

    pub fn is_resolved(&self) -> bool {
        self.state.status == MartingaleStatus::Resolved
    }

    /// Re-base an idle run. Ignored once the run has submitted.
    pub fn rebase(&mut self, base_stake: Decimal) -> bool {
        if self.state.status != MartingaleStatus::Idle {
            return false;
        }
        self.state.base_stake = base_stake;
        self.state.current_stake = base_stake;
        true
    }

    /// Stake for the next attempt. Moves the run to `AwaitingResult`.
    pub fn begin_attempt(&mut self) -> Result<Decimal, MartingaleError> {
        match self.state.status {
            MartingaleStatus::Idle | MartingaleStatus::Progressing => {
                self.state.status = MartingaleStatus::AwaitingResult;
                Ok(self.state.current_stake)
            }
            MartingaleStatus::AwaitingResult => Err(MartingaleError::AttemptOutstanding),
            MartingaleStatus::Resolved => Err(MartingaleError::Resolved),
        }
    }

    /// Apply the finalized result of the outstanding attempt.
    pub fn on_result(
        &mut self,
        result: &AttemptResult,
        martingale_enabled: bool,
    ) -> Result<Transition, MartingaleError> {
        if self.state.status != MartingaleStatus::AwaitingResult {
            return Err(MartingaleError::NotAwaiting);
        }

        let transition = match result {
            AttemptResult::Pending => return Err(MartingaleError::NotFinal),
            AttemptResult::Won => {
                self.state.cumulative_staked += self.state.current_stake;
                self.finish(RunOutcome::Won)
            }
            AttemptResult::Lost => {
                self.state.cumulative_staked += self.state.current_stake;
                self.state.consecutive_losses += 1;
                if martingale_enabled {
                    match self.state.current_stake.checked_mul(Decimal::TWO) {
                        Some(next_stake) => self.proceed(next_stake),
                        None => self.finish(RunOutcome::StakeOverflow),
                    }
                } else {
                    match self.loss_policy {
                        LossPolicy::ResolveLost => self.finish(RunOutcome::Lost),
                        LossPolicy::RetryAtBase => self.proceed(self.state.base_stake),
                    }
                }
            }
            AttemptResult::Rejected(RejectReason::Timeout) => self.finish(RunOutcome::TimedOut),
            AttemptResult::Rejected(reason) => self.finish(RunOutcome::Failed {
                reason: reason.clone(),
            }),
        };
        Ok(transition)
    }

    /// End the run between attempts, e.g. on a stop veto or a halt.
    pub fn resolve(&mut self, outcome: RunOutcome) -> Result<(), MartingaleError> {
        match self.state.status {
            MartingaleStatus::AwaitingResult => Err(MartingaleError::AttemptOutstanding),
            MartingaleStatus::Resolved => Err(MartingaleError::Resolved),
            _ => {
                self.finish(outcome);
                Ok(())
            }
        }
    }

    /// Back to `Idle` at base stake with counters cleared.
    pub fn reset(&mut self) {
        self.state = MartingaleState {
            current_stake: self.state.base_stake,
            consecutive_losses: 0,
            cumulative_staked: Decimal::ZERO,
            status: MartingaleStatus::Idle,
            ..self.state
        };
    }

    fn proceed(&mut self, next_stake: Decimal) -> Transition {
        self.state.current_stake = next_stake;
        self.state.status = MartingaleStatus::Progressing;
        Transition::Continue { next_stake }
    }

    fn finish(&mut self, outcome: RunOutcome) -> Transition {
        self.state.current_stake = self.state.base_stake;
        self.state.status = MartingaleStatus::Resolved;
        Transition::Resolved(outcome)
    }
}
