//! Stop conditions for signal runs.
//!
//! The monitor owns the [`StopLedger`] of realized profit and loss. Executors
//! record every finalized attempt into it; the scheduler asks it before each
//! submission whether the signal, or the plan as a whole, must stop.

use broker_core::types::{active_threshold, EffectiveParams, GlobalDefaults, TradeAttempt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Which threshold ended trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    SignalStopWin,
    SignalStopLoss,
    GlobalStopWin,
    GlobalStopLoss,
}

impl StopKind {
    pub fn is_global(&self) -> bool {
        matches!(self, StopKind::GlobalStopWin | StopKind::GlobalStopLoss)
    }
}

impl std::fmt::Display for StopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StopKind::SignalStopWin => "signal stop win",
            StopKind::SignalStopLoss => "signal stop loss",
            StopKind::GlobalStopWin => "global stop win",
            StopKind::GlobalStopLoss => "global stop loss",
        };
        f.write_str(name)
    }
}

/// Stop-win and stop-loss amounts. `None` disables a threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopThresholds {
    pub stop_win: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
}

impl StopThresholds {
    /// Zero and negative amounts are treated as disabled.
    pub fn new(stop_win: Option<Decimal>, stop_loss: Option<Decimal>) -> Self {
        Self {
            stop_win: active_threshold(stop_win),
            stop_loss: active_threshold(stop_loss),
        }
    }

    pub fn from_params(params: &EffectiveParams) -> Self {
        Self::new(params.stop_win, params.stop_loss)
    }

    pub fn from_globals(globals: &GlobalDefaults) -> Self {
        Self::new(globals.stop_win, globals.stop_loss)
    }

    pub fn is_disabled(&self) -> bool {
        self.stop_win.is_none() && self.stop_loss.is_none()
    }

    /// Returns `(loss_hit, win_hit)` for an entry.
    fn breached(&self, entry: &LedgerEntry) -> (bool, bool) {
        let loss_hit = self
            .stop_loss
            .map(|limit| entry.realized_loss >= limit)
            .unwrap_or(false);
        let win_hit = self
            .stop_win
            .map(|target| entry.realized_profit >= target)
            .unwrap_or(false);
        (loss_hit, win_hit)
    }
}

/// Cumulative realized results. Profit and loss are tracked gross.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub realized_profit: Decimal,
    pub realized_loss: Decimal,
    pub wins: u32,
    pub losses: u32,
    /// Finalized attempts kept out of P/L (timeouts, rejections).
    pub excluded: u32,
}

impl LedgerEntry {
    pub fn net(&self) -> Decimal {
        self.realized_profit - self.realized_loss
    }

    fn apply(&mut self, attempt: &TradeAttempt) {
        match attempt.realized_pnl() {
            Some(pnl) if pnl > Decimal::ZERO => {
                self.realized_profit += pnl;
                self.wins += 1;
            }
            Some(pnl) => {
                self.realized_loss += -pnl;
                self.losses += 1;
            }
            None => self.excluded += 1,
        }
    }
}

/// Per-signal and global realized profit and loss.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StopLedger {
    per_signal: HashMap<Uuid, LedgerEntry>,
    global: LedgerEntry,
}

impl StopLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account a finalized attempt. Pending attempts are ignored.
    pub fn record(&mut self, attempt: &TradeAttempt) -> bool {
        if attempt.is_pending() {
            return false;
        }
        self.per_signal
            .entry(attempt.signal_id)
            .or_default()
            .apply(attempt);
        self.global.apply(attempt);
        true
    }

    pub fn signal(&self, signal_id: Uuid) -> LedgerEntry {
        self.per_signal.get(&signal_id).copied().unwrap_or_default()
    }

    pub fn global(&self) -> LedgerEntry {
        self.global
    }

    /// Which of the signal's own thresholds, if any, has been reached.
    pub fn evaluate_signal(&self, signal_id: Uuid, thresholds: &StopThresholds) -> Option<StopKind> {
        match thresholds.breached(&self.signal(signal_id)) {
            (true, _) => Some(StopKind::SignalStopLoss),
            (false, true) => Some(StopKind::SignalStopWin),
            _ => None,
        }
    }

    /// Which global threshold, if any, has been reached.
    pub fn evaluate_global(&self, thresholds: &StopThresholds) -> Option<StopKind> {
        match thresholds.breached(&self.global) {
            (true, _) => Some(StopKind::GlobalStopLoss),
            (false, true) => Some(StopKind::GlobalStopWin),
            _ => None,
        }
    }
}

/// Outcome of the pre-submission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum StopDecision {
    Proceed {
        /// Stake of the next attempt plus everything already staked in the run.
        projected_exposure: Decimal,
    },
    Veto {
        kind: StopKind,
        projected_exposure: Decimal,
    },
}

impl StopDecision {
    pub fn is_veto(&self) -> bool {
        matches!(self, StopDecision::Veto { .. })
    }
}

/// Tracks realized results and decides when trading must halt.
pub struct StopConditionMonitor {
    ledger: RwLock<StopLedger>,
    global_thresholds: RwLock<StopThresholds>,
    global_trip: RwLock<Option<StopKind>>,
    /// Fast path flag for checking the global halt.
    halted: AtomicBool,
}

impl StopConditionMonitor {
    pub fn new(global_thresholds: StopThresholds) -> Self {
        Self {
            ledger: RwLock::new(StopLedger::new()),
            global_thresholds: RwLock::new(global_thresholds),
            global_trip: RwLock::new(None),
            halted: AtomicBool::new(false),
        }
    }

    /// Replace the global thresholds. Takes effect on the next check.
    pub async fn set_global_thresholds(&self, thresholds: StopThresholds) {
        *self.global_thresholds.write().await = thresholds;
    }

    pub async fn global_thresholds(&self) -> StopThresholds {
        *self.global_thresholds.read().await
    }

    /// Check whether the signal may submit its next attempt.
    ///
    /// `thresholds` are the signal's effective thresholds after override
    /// resolution. A breached global threshold also trips the global halt.
    pub async fn check_before_submit(
        &self,
        signal_id: Uuid,
        thresholds: &StopThresholds,
        next_stake: Decimal,
        cumulative_staked: Decimal,
    ) -> StopDecision {
        let projected_exposure = next_stake + cumulative_staked;

        if let Some(kind) = self.check_global().await {
            return StopDecision::Veto {
                kind,
                projected_exposure,
            };
        }

        let ledger = self.ledger.read().await;
        match ledger.evaluate_signal(signal_id, thresholds) {
            Some(kind) => {
                let entry = ledger.signal(signal_id);
                info!(
                    signal_id = %signal_id,
                    stop = %kind,
                    realized_profit = %entry.realized_profit,
                    realized_loss = %entry.realized_loss,
                    "Stop condition reached, vetoing next attempt"
                );
                StopDecision::Veto {
                    kind,
                    projected_exposure,
                }
            }
            None => StopDecision::Proceed { projected_exposure },
        }
    }

    /// Which of the signal's own thresholds its realized results have reached.
    pub async fn signal_stop(&self, signal_id: Uuid, thresholds: &StopThresholds) -> Option<StopKind> {
        self.ledger.read().await.evaluate_signal(signal_id, thresholds)
    }

    /// Evaluate the global thresholds, tripping the halt when breached.
    pub async fn check_global(&self) -> Option<StopKind> {
        if self.is_halted() {
            return *self.global_trip.read().await;
        }
        let thresholds = *self.global_thresholds.read().await;
        let kind = self.ledger.read().await.evaluate_global(&thresholds)?;
        self.trip(kind).await;
        Some(kind)
    }

    /// Account a finalized attempt. Returns the global stop this attempt
    /// tripped, if any.
    pub async fn record(&self, attempt: &TradeAttempt) -> Option<StopKind> {
        let thresholds = *self.global_thresholds.read().await;
        let breach = {
            let mut ledger = self.ledger.write().await;
            if !ledger.record(attempt) {
                return None;
            }
            ledger.evaluate_global(&thresholds)
        };

        let kind = breach?;
        if self.trip(kind).await {
            Some(kind)
        } else {
            None
        }
    }

    /// Check if the global stop has tripped (fast path).
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub async fn halt_reason(&self) -> Option<StopKind> {
        *self.global_trip.read().await
    }

    pub async fn signal_entry(&self, signal_id: Uuid) -> LedgerEntry {
        self.ledger.read().await.signal(signal_id)
    }

    pub async fn global_entry(&self) -> LedgerEntry {
        self.ledger.read().await.global()
    }

    pub async fn snapshot(&self) -> StopLedger {
        self.ledger.read().await.clone()
    }

    /// Clear the ledger and the halt for a fresh trading plan.
    pub async fn reset(&self) {
        *self.ledger.write().await = StopLedger::new();
        *self.global_trip.write().await = None;
        self.halted.store(false, Ordering::SeqCst);
    }

    /// Returns true if this call tripped the halt.
    async fn trip(&self, kind: StopKind) -> bool {
        let mut trip = self.global_trip.write().await;
        if trip.is_some() {
            return false;
        }
        *trip = Some(kind);
        self.halted.store(true, Ordering::SeqCst);

        let global = self.ledger.read().await.global();
        warn!(
            stop = %kind,
            realized_profit = %global.realized_profit,
            realized_loss = %global.realized_loss,
            "Global stop condition reached, halting all signals"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::types::{ContractSettlement, RejectReason};
    use std::sync::Arc;

    fn settled(signal_id: Uuid, sequence: u32, stake: i64, profit: i64) -> TradeAttempt {
        let mut attempt = TradeAttempt::new(signal_id, sequence, Decimal::new(stake, 0));
        attempt.settle(&ContractSettlement {
            contract_id: u64::from(sequence),
            profit: Decimal::new(profit, 0),
            payout: Decimal::new((stake + profit).max(0), 0),
            buy_price: Some(Decimal::new(stake, 0)),
        });
        attempt
    }

    fn dec(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    #[tokio::test]
    async fn test_stop_loss_vetoes_after_cumulative_loss() {
        let monitor = StopConditionMonitor::new(StopThresholds::default());
        let signal = Uuid::new_v4();
        let thresholds = StopThresholds::new(None, Some(dec(70)));

        for (seq, stake) in [(1, 10), (2, 20)] {
            monitor.record(&settled(signal, seq, stake, -stake)).await;
        }
        let decision = monitor
            .check_before_submit(signal, &thresholds, dec(40), dec(30))
            .await;
        assert_eq!(
            decision,
            StopDecision::Proceed {
                projected_exposure: dec(70)
            }
        );

        monitor.record(&settled(signal, 3, 40, -40)).await;
        let decision = monitor
            .check_before_submit(signal, &thresholds, dec(80), dec(70))
            .await;
        assert_eq!(
            decision,
            StopDecision::Veto {
                kind: StopKind::SignalStopLoss,
                projected_exposure: dec(150)
            }
        );
        assert_eq!(monitor.signal_entry(signal).await.realized_loss, dec(70));
        assert!(!monitor.is_halted());
    }

    #[tokio::test]
    async fn test_stop_win_reached() {
        let monitor = StopConditionMonitor::new(StopThresholds::default());
        let signal = Uuid::new_v4();
        monitor.record(&settled(signal, 1, 5, 8)).await;

        let decision = monitor
            .check_before_submit(signal, &StopThresholds::new(Some(dec(8)), None), dec(5), dec(5))
            .await;
        assert!(matches!(
            decision,
            StopDecision::Veto {
                kind: StopKind::SignalStopWin,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_disabled_thresholds_never_veto() {
        let monitor = StopConditionMonitor::new(StopThresholds::new(Some(Decimal::ZERO), None));
        let signal = Uuid::new_v4();
        for seq in 1..=5 {
            monitor.record(&settled(signal, seq, 100, -100)).await;
        }
        let decision = monitor
            .check_before_submit(signal, &StopThresholds::new(Some(dec(0)), None), dec(1), dec(0))
            .await;
        assert!(!decision.is_veto());
    }

    #[tokio::test]
    async fn test_rejections_and_timeouts_excluded_from_pnl() {
        let monitor = StopConditionMonitor::new(StopThresholds::default());
        let signal = Uuid::new_v4();

        let mut timed_out = TradeAttempt::new(signal, 1, dec(10));
        timed_out.reject(RejectReason::Timeout);
        monitor.record(&timed_out).await;

        let pending = TradeAttempt::new(signal, 2, dec(10));
        assert_eq!(monitor.record(&pending).await, None);

        let entry = monitor.signal_entry(signal).await;
        assert_eq!(entry.realized_loss, Decimal::ZERO);
        assert_eq!(entry.realized_profit, Decimal::ZERO);
        assert_eq!(entry.excluded, 1);
    }

    #[tokio::test]
    async fn test_global_stop_trips_once_and_vetoes_everyone() {
        let monitor = StopConditionMonitor::new(StopThresholds::new(None, Some(dec(50))));
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(monitor.record(&settled(first, 1, 30, -30)).await, None);
        assert_eq!(
            monitor.record(&settled(second, 1, 30, -30)).await,
            Some(StopKind::GlobalStopLoss)
        );
        assert!(monitor.is_halted());
        // Later finalizations do not trip again.
        assert_eq!(monitor.record(&settled(first, 2, 60, -60)).await, None);

        let third = Uuid::new_v4();
        let decision = monitor
            .check_before_submit(third, &StopThresholds::default(), dec(1), dec(0))
            .await;
        assert!(matches!(
            decision,
            StopDecision::Veto {
                kind: StopKind::GlobalStopLoss,
                ..
            }
        ));
        assert_eq!(monitor.halt_reason().await, Some(StopKind::GlobalStopLoss));
    }

    #[tokio::test]
    async fn test_raised_global_threshold_applies_to_next_check() {
        let monitor = StopConditionMonitor::new(StopThresholds::new(Some(dec(100)), None));
        let signal = Uuid::new_v4();
        monitor.record(&settled(signal, 1, 10, 20)).await;
        assert!(!monitor.is_halted());

        monitor
            .set_global_thresholds(StopThresholds::new(Some(dec(15)), None))
            .await;
        assert_eq!(monitor.check_global().await, Some(StopKind::GlobalStopWin));
        assert!(monitor.is_halted());

        monitor.reset().await;
        assert!(!monitor.is_halted());
        assert_eq!(monitor.global_entry().await, LedgerEntry::default());
    }

    #[tokio::test]
    async fn test_concurrent_finalization_is_serialized() {
        let monitor = Arc::new(StopConditionMonitor::new(StopThresholds::default()));
        let mut handles = Vec::new();
        for i in 0..50u32 {
            let monitor = monitor.clone();
            handles.push(tokio::spawn(async move {
                let signal = Uuid::new_v4();
                monitor.record(&settled(signal, i + 1, 1, -1)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let global = monitor.global_entry().await;
        assert_eq!(global.realized_loss, dec(50));
        assert_eq!(global.losses, 50);
        assert_eq!(global.net(), dec(-50));
    }

    #[test]
    fn test_ledger_tracks_gross_amounts() {
        let mut ledger = StopLedger::new();
        let signal = Uuid::new_v4();
        ledger.record(&settled(signal, 1, 10, -10));
        ledger.record(&settled(signal, 2, 20, 18));

        let entry = ledger.signal(signal);
        assert_eq!(entry.realized_loss, dec(10));
        assert_eq!(entry.realized_profit, dec(18));
        assert_eq!(entry.net(), dec(8));
        assert_eq!(ledger.global(), entry);
    }
}
