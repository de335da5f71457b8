//! Shared state of every signal run in the active plan.
//!
//! The book is the single place that enforces at most one pending attempt per
//! signal: [`RunBook::reserve`] is atomic per entry, so two dispatchers racing
//! on the same signal cannot both submit.

use broker_core::types::{AttemptResult, EffectiveParams, ErrorClass, LossPolicy, Signal, TradeAttempt};
use risk_manager::StopKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineError;
use crate::martingale::{MartingaleController, MartingaleState, MartingaleStatus, RunOutcome, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Operator-facing note attached to a signal run.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub at: DateTime<Utc>,
    pub level: NoticeLevel,
    pub class: Option<ErrorClass>,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, class: Option<ErrorClass>, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            class,
            message: message.into(),
        }
    }

    /// Notice describing how a run ended.
    pub fn for_outcome(outcome: &RunOutcome) -> Self {
        let level = match outcome {
            RunOutcome::Won | RunOutcome::Lost | RunOutcome::StopConditionHit { .. } => {
                NoticeLevel::Info
            }
            RunOutcome::TimedOut | RunOutcome::Stopped => NoticeLevel::Warning,
            RunOutcome::Failed { reason } => match reason.class() {
                ErrorClass::ConnectionError => NoticeLevel::Warning,
                _ => NoticeLevel::Error,
            },
            RunOutcome::StakeOverflow => NoticeLevel::Error,
        };
        Self::new(level, outcome.error_class(), format!("run {outcome}"))
    }
}

/// Stake handed out for a reserved attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub sequence: u32,
    pub stake: Decimal,
}

#[derive(Debug, Clone)]
struct SignalRun {
    signal: Signal,
    martingale: MartingaleController,
    attempts: Vec<TradeAttempt>,
    pending: Option<u32>,
    outcome: Option<RunOutcome>,
    notices: Vec<Notice>,
    params: Option<EffectiveParams>,
    projected_exposure: Decimal,
}

/// Point-in-time copy of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub signal: Signal,
    pub martingale: MartingaleState,
    pub attempts: Vec<TradeAttempt>,
    pub pending: bool,
    pub outcome: Option<RunOutcome>,
    pub notices: Vec<Notice>,
    /// Parameters used for the most recent submission check.
    pub params: Option<EffectiveParams>,
    pub projected_exposure: Decimal,
}

/// Signal runs keyed by signal id, iterated in load order.
pub struct RunBook {
    runs: DashMap<Uuid, SignalRun>,
    order: Vec<Uuid>,
}

impl RunBook {
    pub fn new(signals: &[Signal], loss_policy: LossPolicy) -> Self {
        let runs = DashMap::with_capacity(signals.len());
        let mut order = Vec::with_capacity(signals.len());
        for signal in signals {
            order.push(signal.id);
            runs.insert(
                signal.id,
                SignalRun {
                    martingale: MartingaleController::new(
                        signal.stake.unwrap_or(Decimal::ZERO),
                        loss_policy,
                    ),
                    signal: signal.clone(),
                    attempts: Vec::new(),
                    pending: None,
                    outcome: None,
                    notices: Vec::new(),
                    params: None,
                    projected_exposure: Decimal::ZERO,
                },
            );
        }
        Self { runs, order }
    }

    /// Signal ids in load order.
    pub fn ids(&self) -> &[Uuid] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn signal(&self, signal_id: Uuid) -> Option<Signal> {
        self.runs.get(&signal_id).map(|run| run.signal.clone())
    }

    /// True when the run may submit: unresolved with nothing in flight.
    pub fn is_dispatchable(&self, signal_id: Uuid) -> bool {
        self.runs
            .get(&signal_id)
            .map(|run| run.outcome.is_none() && run.pending.is_none())
            .unwrap_or(false)
    }

    /// Stake the next attempt would use and the stake already committed.
    /// An idle run is previewed at `base_stake`.
    pub fn exposure_preview(&self, signal_id: Uuid, base_stake: Decimal) -> Option<(Decimal, Decimal)> {
        self.runs.get(&signal_id).map(|run| {
            let state = run.martingale.state();
            match state.status {
                MartingaleStatus::Idle => (base_stake, Decimal::ZERO),
                _ => (state.current_stake, state.cumulative_staked),
            }
        })
    }

    pub fn record_check(&self, signal_id: Uuid, params: EffectiveParams, projected_exposure: Decimal) {
        if let Some(mut run) = self.runs.get_mut(&signal_id) {
            run.params = Some(params);
            run.projected_exposure = projected_exposure;
        }
    }

    /// Claim the next attempt of a run. Fails if an attempt is already
    /// pending or the run has resolved.
    pub fn reserve(&self, signal_id: Uuid, base_stake: Decimal) -> Result<Reservation, EngineError> {
        let mut run = self
            .runs
            .get_mut(&signal_id)
            .ok_or(EngineError::UnknownSignal(signal_id))?;
        if run.outcome.is_some() {
            return Err(EngineError::RunResolved(signal_id));
        }
        if run.pending.is_some() {
            return Err(EngineError::AttemptOutstanding(signal_id));
        }

        run.martingale.rebase(base_stake);
        let stake = run.martingale.begin_attempt()?;
        let sequence = run.attempts.len() as u32 + 1;
        run.pending = Some(sequence);
        Ok(Reservation { sequence, stake })
    }

    /// Store a finalized attempt and advance the run.
    ///
    /// `loss_stop` is the signal stop this attempt's loss reached. A run that
    /// would end as `Lost` ends on that stop instead.
    pub fn complete(
        &self,
        attempt: TradeAttempt,
        martingale_enabled: bool,
        loss_stop: Option<StopKind>,
    ) -> Result<Transition, EngineError> {
        let signal_id = attempt.signal_id;
        let mut run = self
            .runs
            .get_mut(&signal_id)
            .ok_or(EngineError::UnknownSignal(signal_id))?;
        if run.pending != Some(attempt.sequence) {
            return Err(EngineError::UnexpectedAttempt {
                signal_id,
                sequence: attempt.sequence,
            });
        }

        let mut transition = run.martingale.on_result(&attempt.result, martingale_enabled)?;
        if let (Transition::Resolved(RunOutcome::Lost), Some(stop)) = (&transition, loss_stop) {
            transition = Transition::Resolved(RunOutcome::StopConditionHit { stop });
        }
        run.pending = None;

        if let AttemptResult::Rejected(reason) = &attempt.result {
            let message = format!("attempt {} at stake {}: {reason}", attempt.sequence, attempt.stake);
            let level = match reason.class() {
                ErrorClass::ConnectionError | ErrorClass::AttemptTimeout => NoticeLevel::Warning,
                _ => NoticeLevel::Error,
            };
            run.notices.push(Notice::new(level, Some(reason.class()), message));
        }
        run.attempts.push(attempt);

        if let Transition::Resolved(outcome) = &transition {
            run.notices.push(Notice::for_outcome(outcome));
            run.outcome = Some(outcome.clone());
        }
        Ok(transition)
    }

    /// Resolve a run that has nothing in flight. Returns false if the run is
    /// unknown, already resolved, or awaiting a result.
    pub fn resolve(&self, signal_id: Uuid, outcome: RunOutcome) -> bool {
        let Some(mut run) = self.runs.get_mut(&signal_id) else {
            return false;
        };
        if run.outcome.is_some() || run.pending.is_some() {
            return false;
        }
        if run.martingale.resolve(outcome.clone()).is_err() {
            return false;
        }
        run.notices.push(Notice::for_outcome(&outcome));
        run.outcome = Some(outcome);
        true
    }

    pub fn outcome(&self, signal_id: Uuid) -> Option<RunOutcome> {
        self.runs.get(&signal_id).and_then(|run| run.outcome.clone())
    }

    /// Unresolved runs with nothing in flight, in load order.
    pub fn idle_unresolved(&self) -> Vec<Uuid> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.is_dispatchable(*id))
            .collect()
    }

    /// Number of attempts currently awaiting a result.
    pub fn in_flight(&self) -> usize {
        self.runs.iter().filter(|run| run.pending.is_some()).count()
    }

    pub fn all_resolved(&self) -> bool {
        self.runs.iter().all(|run| run.outcome.is_some())
    }

    pub fn snapshot(&self, signal_id: Uuid) -> Option<RunSnapshot> {
        self.runs.get(&signal_id).map(|run| RunSnapshot {
            signal: run.signal.clone(),
            martingale: run.martingale.state(),
            attempts: run.attempts.clone(),
            pending: run.pending.is_some(),
            outcome: run.outcome.clone(),
            notices: run.notices.clone(),
            params: run.params,
            projected_exposure: run.projected_exposure,
        })
    }

    /// Snapshots of every run in load order.
    pub fn snapshots(&self) -> Vec<RunSnapshot> {
        self.order.iter().filter_map(|id| self.snapshot(*id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::types::{ContractSettlement, Direction, RejectReason};
    use std::sync::Arc;

    fn book_with(stake: i64) -> (RunBook, Uuid) {
        let signal = Signal::new("EURUSD", Direction::Call, Decimal::new(stake, 0));
        let id = signal.id;
        (RunBook::new(&[signal], LossPolicy::ResolveLost), id)
    }

    fn settle(attempt: &mut TradeAttempt, profit: i64) {
        attempt.settle(&ContractSettlement {
            contract_id: 1000,
            profit: Decimal::new(profit, 0),
            payout: Decimal::ZERO,
            buy_price: Some(attempt.stake),
        });
    }

    #[test]
    fn test_reserve_refuses_second_pending() {
        let (book, id) = book_with(10);
        let reservation = book.reserve(id, Decimal::new(10, 0)).unwrap();
        assert_eq!(reservation.sequence, 1);
        assert_eq!(reservation.stake, Decimal::new(10, 0));
        assert!(!book.is_dispatchable(id));
        assert_eq!(
            book.reserve(id, Decimal::new(10, 0)),
            Err(EngineError::AttemptOutstanding(id))
        );
        assert_eq!(book.in_flight(), 1);
    }

    #[test]
    fn test_concurrent_reservations_admit_one() {
        let (book, id) = book_with(10);
        let book = Arc::new(book);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let book = book.clone();
                std::thread::spawn(move || book.reserve(id, Decimal::new(10, 0)).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_complete_progresses_run() {
        let (book, id) = book_with(10);
        let reservation = book.reserve(id, Decimal::new(10, 0)).unwrap();
        let mut attempt = TradeAttempt::new(id, reservation.sequence, reservation.stake);
        settle(&mut attempt, -10);

        let transition = book.complete(attempt, true, None).unwrap();
        assert_eq!(
            transition,
            Transition::Continue {
                next_stake: Decimal::new(20, 0)
            }
        );
        assert!(book.is_dispatchable(id));
        assert_eq!(
            book.exposure_preview(id, Decimal::new(10, 0)),
            Some((Decimal::new(20, 0), Decimal::new(10, 0)))
        );

        let reservation = book.reserve(id, Decimal::new(99, 0)).unwrap();
        assert_eq!(reservation.sequence, 2);
        // Base is fixed once the run has started
        assert_eq!(reservation.stake, Decimal::new(20, 0));
    }

    #[test]
    fn test_loss_reaching_signal_stop_ends_on_stop() {
        let (book, id) = book_with(10);
        let reservation = book.reserve(id, Decimal::new(10, 0)).unwrap();
        let mut attempt = TradeAttempt::new(id, reservation.sequence, reservation.stake);
        settle(&mut attempt, -10);

        let transition = book
            .complete(attempt, false, Some(StopKind::SignalStopLoss))
            .unwrap();
        let stopped = RunOutcome::StopConditionHit {
            stop: StopKind::SignalStopLoss,
        };
        assert_eq!(transition, Transition::Resolved(stopped.clone()));
        assert_eq!(book.outcome(id), Some(stopped));
    }

    #[test]
    fn test_loss_stop_does_not_cut_progression() {
        let (book, id) = book_with(10);
        let reservation = book.reserve(id, Decimal::new(10, 0)).unwrap();
        let mut attempt = TradeAttempt::new(id, reservation.sequence, reservation.stake);
        settle(&mut attempt, -10);

        // With martingale on the next submission check vetoes instead.
        let transition = book
            .complete(attempt, true, Some(StopKind::SignalStopLoss))
            .unwrap();
        assert_eq!(
            transition,
            Transition::Continue {
                next_stake: Decimal::new(20, 0)
            }
        );
        assert!(book.outcome(id).is_none());
    }

    #[test]
    fn test_complete_rejects_unknown_sequence() {
        let (book, id) = book_with(10);
        book.reserve(id, Decimal::new(10, 0)).unwrap();
        let mut stray = TradeAttempt::new(id, 7, Decimal::new(10, 0));
        settle(&mut stray, 9);
        assert_eq!(
            book.complete(stray, true, None),
            Err(EngineError::UnexpectedAttempt {
                signal_id: id,
                sequence: 7
            })
        );
    }

    #[test]
    fn test_rejection_resolves_with_notice() {
        let (book, id) = book_with(10);
        let reservation = book.reserve(id, Decimal::new(10, 0)).unwrap();
        let mut attempt = TradeAttempt::new(id, reservation.sequence, reservation.stake);
        attempt.reject(RejectReason::Order {
            code: "MarketIsClosed".into(),
            message: "market closed".into(),
        });

        book.complete(attempt, true, None).unwrap();
        let snapshot = book.snapshot(id).unwrap();
        assert!(matches!(snapshot.outcome, Some(RunOutcome::Failed { .. })));
        assert!(snapshot
            .notices
            .iter()
            .any(|n| n.class == Some(ErrorClass::OrderRejected) && n.level == NoticeLevel::Error));
        assert!(book.all_resolved());
    }

    #[test]
    fn test_resolve_skips_in_flight() {
        let (book, id) = book_with(10);
        book.reserve(id, Decimal::new(10, 0)).unwrap();
        assert!(!book.resolve(id, RunOutcome::Stopped));
        assert!(book.idle_unresolved().is_empty());
    }

    #[test]
    fn test_resolve_idle_run() {
        let (book, id) = book_with(10);
        assert_eq!(book.idle_unresolved(), vec![id]);
        assert!(book.resolve(id, RunOutcome::Stopped));
        assert!(!book.resolve(id, RunOutcome::Won));
        assert_eq!(book.outcome(id), Some(RunOutcome::Stopped));
        assert_eq!(
            book.reserve(id, Decimal::new(10, 0)),
            Err(EngineError::RunResolved(id))
        );
    }
}
