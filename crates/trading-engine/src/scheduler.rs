//! Signal scheduling.
//!
//! The scheduler walks the run book in load order, dispatches every signal
//! that is due and idle, and reacts to finalized attempts, stop requests and
//! session authentication failures. Signals run concurrently with each other;
//! each signal has at most one attempt in flight.

use broker_core::api::SessionHandle;
use broker_core::config::TradingSettings;
use broker_core::types::{EffectiveParams, GlobalDefaults, RejectReason, Signal, StakeMode};
use chrono::Utc;
use risk_manager::{LedgerEntry, StopConditionMonitor, StopDecision, StopKind, StopThresholds};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{AttemptCompletion, AttemptOrder, TradeExecutor};
use crate::martingale::{RunOutcome, Transition};
use crate::run_book::RunBook;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long before `scheduled_at` a signal becomes eligible.
    pub entry_lead: Duration,
    pub stake_mode: StakeMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            entry_lead: Duration::ZERO,
            stake_mode: StakeMode::Fixed,
        }
    }
}

impl From<&TradingSettings> for SchedulerConfig {
    fn from(settings: &TradingSettings) -> Self {
        Self {
            entry_lead: Duration::from_secs(settings.entry_lead_secs),
            stake_mode: settings.stake_mode,
        }
    }
}

/// Why the scheduler stopped dispatching new attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    StopRequested,
    GlobalStop { stop: StopKind },
    AuthenticationFailed { message: String },
}

impl HaltReason {
    /// Outcome given to runs that never got to continue.
    fn idle_outcome(&self) -> RunOutcome {
        match self {
            HaltReason::StopRequested => RunOutcome::Stopped,
            HaltReason::GlobalStop { stop } => RunOutcome::StopConditionHit { stop: *stop },
            HaltReason::AuthenticationFailed { message } => RunOutcome::Failed {
                reason: RejectReason::Unauthorized {
                    message: message.clone(),
                },
            },
        }
    }
}

/// Final summary of a scheduler run.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerReport {
    pub dispatched: u32,
    pub outcomes: Vec<(Uuid, Option<RunOutcome>)>,
    pub halt: Option<HaltReason>,
    pub global: LedgerEntry,
}

pub struct SignalScheduler {
    runs: Arc<RunBook>,
    executor: Arc<TradeExecutor>,
    monitor: Arc<StopConditionMonitor>,
    globals: Arc<RwLock<GlobalDefaults>>,
    session: SessionHandle,
    config: SchedulerConfig,
    stop: watch::Receiver<bool>,
    halt: watch::Sender<Option<HaltReason>>,
    completions_tx: mpsc::Sender<AttemptCompletion>,
    completions_rx: mpsc::Receiver<AttemptCompletion>,
    dispatched: u32,
}

impl SignalScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runs: Arc<RunBook>,
        executor: Arc<TradeExecutor>,
        monitor: Arc<StopConditionMonitor>,
        globals: Arc<RwLock<GlobalDefaults>>,
        session: SessionHandle,
        config: SchedulerConfig,
        stop: watch::Receiver<bool>,
        halt: watch::Sender<Option<HaltReason>>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::channel(runs.len().max(1) * 2);
        Self {
            runs,
            executor,
            monitor,
            globals,
            session,
            config,
            stop,
            halt,
            completions_tx,
            completions_rx,
            dispatched: 0,
        }
    }

    /// Drive every signal to resolution, or until a halt has let in-flight
    /// attempts finish.
    pub async fn run(mut self) -> SchedulerReport {
        info!(signals = self.runs.len(), "Signal scheduler started");
        let mut session_status = self.session.status_receiver();
        let mut session_open = true;
        let mut stop_seen = false;

        loop {
            if self.halt_reason().is_none() {
                let auth_error = session_status.borrow().auth_error.clone();
                if *self.stop.borrow() {
                    self.set_halt(HaltReason::StopRequested);
                } else if let Some(message) = auth_error {
                    self.set_halt(HaltReason::AuthenticationFailed { message });
                } else if let Some(stop) = self.monitor.check_global().await {
                    self.set_halt(HaltReason::GlobalStop { stop });
                } else {
                    self.dispatch_ready().await;
                }
            }

            if let Some(reason) = self.halt_reason() {
                self.resolve_idle(&reason);
                if self.runs.in_flight() == 0 {
                    break;
                }
            }
            if self.runs.all_resolved() {
                break;
            }

            let wake = self.next_wake();
            tokio::select! {
                Some(completion) = self.completions_rx.recv() => {
                    self.on_completion(completion);
                }
                changed = self.stop.changed(), if !stop_seen => {
                    // A dropped control channel is a stop request too
                    if changed.is_err() || *self.stop.borrow() {
                        stop_seen = true;
                        if self.halt_reason().is_none() {
                            self.set_halt(HaltReason::StopRequested);
                        }
                    }
                }
                changed = session_status.changed(), if session_open => {
                    if changed.is_err() {
                        session_open = false;
                    }
                }
                _ = sleep_until_wake(wake), if wake.is_some() => {}
            }
        }

        let report = SchedulerReport {
            dispatched: self.dispatched,
            outcomes: self
                .runs
                .ids()
                .iter()
                .map(|id| (*id, self.runs.outcome(*id)))
                .collect(),
            halt: self.halt_reason(),
            global: self.monitor.global_entry().await,
        };
        info!(
            dispatched = report.dispatched,
            net = %report.global.net(),
            halt = ?report.halt,
            "Signal scheduler finished"
        );
        report
    }

    async fn dispatch_ready(&mut self) {
        let globals = self.globals.read().await.clone();
        for signal_id in self.runs.ids().to_vec() {
            if self.halt_reason().is_some() {
                return;
            }
            if !self.runs.is_dispatchable(signal_id) {
                continue;
            }
            let Some(signal) = self.runs.signal(signal_id) else {
                continue;
            };
            if !self.is_due(&signal) {
                continue;
            }

            let params = EffectiveParams::resolve(&signal, &globals);
            let Some(base_stake) = self.base_stake(&params) else {
                warn!(signal_id = %signal_id, "Balance unknown, cannot size a percent stake");
                self.runs.resolve(
                    signal_id,
                    RunOutcome::Failed {
                        reason: RejectReason::Order {
                            code: "BalanceUnavailable".to_string(),
                            message: "account balance unknown for percent stake".to_string(),
                        },
                    },
                );
                continue;
            };

            let (next_stake, cumulative) = self
                .runs
                .exposure_preview(signal_id, base_stake)
                .unwrap_or((base_stake, Decimal::ZERO));
            let decision = self
                .monitor
                .check_before_submit(
                    signal_id,
                    &StopThresholds::from_params(&params),
                    next_stake,
                    cumulative,
                )
                .await;

            match decision {
                StopDecision::Veto {
                    kind,
                    projected_exposure,
                } => {
                    self.runs.record_check(signal_id, params, projected_exposure);
                    if kind.is_global() {
                        self.set_halt(HaltReason::GlobalStop { stop: kind });
                        return;
                    }
                    self.runs
                        .resolve(signal_id, RunOutcome::StopConditionHit { stop: kind });
                }
                StopDecision::Proceed { projected_exposure } => {
                    self.runs.record_check(signal_id, params, projected_exposure);
                    debug!(
                        signal_id = %signal_id,
                        stake = %next_stake,
                        projected_exposure = %projected_exposure,
                        from_globals = params.from_globals,
                        "Dispatching attempt"
                    );
                    let order = AttemptOrder::new(signal, params, base_stake);
                    match self.executor.dispatch(order, self.completions_tx.clone()) {
                        Ok(_) => self.dispatched += 1,
                        Err(e) => debug!(signal_id = %signal_id, error = %e, "Dispatch refused"),
                    }
                }
            }
        }
    }

    fn on_completion(&mut self, completion: AttemptCompletion) {
        match &completion.transition {
            Transition::Continue { next_stake } => debug!(
                signal_id = %completion.signal_id,
                next_stake = %next_stake,
                "Run continues"
            ),
            Transition::Resolved(outcome) => info!(
                signal_id = %completion.signal_id,
                attempts = completion.attempt.sequence,
                outcome = %outcome,
                "Signal run resolved"
            ),
        }
        if let Some(stop) = completion.global_stop {
            if self.halt_reason().is_none() {
                self.set_halt(HaltReason::GlobalStop { stop });
            }
        }
    }

    fn resolve_idle(&self, reason: &HaltReason) {
        let outcome = reason.idle_outcome();
        for signal_id in self.runs.idle_unresolved() {
            if self.runs.resolve(signal_id, outcome.clone()) {
                debug!(signal_id = %signal_id, outcome = %outcome, "Idle run resolved by halt");
            }
        }
    }

    fn is_due(&self, signal: &Signal) -> bool {
        match signal.scheduled_at {
            Some(at) => Utc::now() + lead(self.config.entry_lead) >= at,
            None => true,
        }
    }

    /// Earliest instant a not-yet-due idle signal becomes eligible.
    fn next_wake(&self) -> Option<Instant> {
        let now = Utc::now();
        self.runs
            .idle_unresolved()
            .into_iter()
            .filter_map(|id| self.runs.signal(id)?.scheduled_at)
            .map(|at| at - lead(self.config.entry_lead))
            .filter(|eligible| *eligible > now)
            .min()
            .map(|eligible| Instant::now() + (eligible - now).to_std().unwrap_or_default())
    }

    fn base_stake(&self, params: &EffectiveParams) -> Option<Decimal> {
        match self.config.stake_mode {
            StakeMode::Fixed => Some(params.stake),
            StakeMode::PercentOfBalance => self
                .session
                .status()
                .balance
                .map(|balance| (balance * params.stake / Decimal::ONE_HUNDRED).round_dp(2))
                .filter(|stake| *stake > Decimal::ZERO),
        }
    }

    fn halt_reason(&self) -> Option<HaltReason> {
        self.halt.borrow().clone()
    }

    fn set_halt(&self, reason: HaltReason) {
        match &reason {
            HaltReason::StopRequested => info!(
                in_flight = self.runs.in_flight(),
                "Stop requested, letting in-flight attempts finish"
            ),
            HaltReason::GlobalStop { stop } => warn!(stop = %stop, "Global stop reached, halting"),
            HaltReason::AuthenticationFailed { message } => {
                warn!(error = %message, "Session unauthorized, halting")
            }
        }
        self.halt.send_replace(Some(reason));
    }
}

fn lead(entry_lead: Duration) -> chrono::Duration {
    chrono::Duration::from_std(entry_lead).unwrap_or_else(|_| chrono::Duration::zero())
}

async fn sleep_until_wake(wake: Option<Instant>) {
    match wake {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_outcome_per_halt_reason() {
        assert_eq!(HaltReason::StopRequested.idle_outcome(), RunOutcome::Stopped);
        assert_eq!(
            HaltReason::GlobalStop {
                stop: StopKind::GlobalStopLoss
            }
            .idle_outcome(),
            RunOutcome::StopConditionHit {
                stop: StopKind::GlobalStopLoss
            }
        );
        assert!(matches!(
            HaltReason::AuthenticationFailed {
                message: "InvalidToken".to_string()
            }
            .idle_outcome(),
            RunOutcome::Failed {
                reason: RejectReason::Unauthorized { .. }
            }
        ));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = TradingSettings {
            entry_lead_secs: 5,
            stake_mode: StakeMode::PercentOfBalance,
            ..TradingSettings::default()
        };
        let config = SchedulerConfig::from(&settings);
        assert_eq!(config.entry_lead, Duration::from_secs(5));
        assert_eq!(config.stake_mode, StakeMode::PercentOfBalance);
    }

    #[test]
    fn test_entry_lead_conversion() {
        assert_eq!(lead(Duration::from_secs(90)), chrono::Duration::seconds(90));
        assert_eq!(lead(Duration::ZERO), chrono::Duration::zero());
    }

    #[test]
    fn test_halt_reason_serializes_tagged() {
        let json = serde_json::to_value(HaltReason::GlobalStop {
            stop: StopKind::GlobalStopWin,
        })
        .unwrap();
        assert_eq!(json["reason"], "global_stop");
    }
}
