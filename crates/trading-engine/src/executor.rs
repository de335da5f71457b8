//! Attempt execution against a broker session.
//!
//! One call to [`TradeExecutor::execute`] submits one attempt, waits for its
//! contract to settle within the attempt window, records the result with the
//! stop monitor and advances the signal's martingale run.

use broker_core::api::{Request, RequestFailure, SessionHandle};
use broker_core::api::protocol::{BuyParameters, BuyReply};
use broker_core::config::{BrokerConfig, TradingSettings};
use broker_core::types::{AttemptResult, ContractSettlement, EffectiveParams, RejectReason, Signal, TradeAttempt};
use broker_core::Error;
use risk_manager::{StopConditionMonitor, StopKind, StopThresholds};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::martingale::Transition;
use crate::run_book::{Reservation, RunBook};

/// Configuration for the trade executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Account currency sent with every buy.
    pub currency: String,
    /// Added to the contract duration to form the attempt window.
    pub result_grace: Duration,
    /// Resubmissions allowed when the connection drops before a buy reply.
    pub resubmit_limit: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            result_grace: Duration::from_secs(30),
            resubmit_limit: 1,
        }
    }
}

impl ExecutorConfig {
    pub fn from_settings(broker: &BrokerConfig, trading: &TradingSettings) -> Self {
        Self {
            currency: broker.currency.clone(),
            result_grace: Duration::from_secs(trading.result_grace_secs),
            resubmit_limit: trading.resubmit_limit,
        }
    }
}

/// Everything needed to place the next attempt of a signal.
#[derive(Debug, Clone)]
pub struct AttemptOrder {
    pub signal: Signal,
    pub params: EffectiveParams,
    /// Stake of the run's first attempt.
    pub base_stake: Decimal,
}

impl AttemptOrder {
    pub fn new(signal: Signal, params: EffectiveParams, base_stake: Decimal) -> Self {
        Self {
            signal,
            params,
            base_stake,
        }
    }

    fn buy_request(&self, stake: Decimal, currency: &str) -> Request {
        Request::Buy(BuyParameters {
            symbol: self.signal.broker_symbol(),
            direction: self.signal.direction,
            amount: stake,
            currency: currency.to_string(),
            duration: self.signal.duration,
            duration_unit: self.signal.duration_unit,
        })
    }

    /// Contract duration plus grace.
    pub fn attempt_window(&self, grace: Duration) -> Duration {
        self.signal.contract_duration() + grace
    }
}

/// A finalized attempt and what it did to its run.
#[derive(Debug, Clone)]
pub struct AttemptCompletion {
    pub signal_id: Uuid,
    pub attempt: TradeAttempt,
    pub transition: Transition,
    /// Global stop this attempt tripped, if any.
    pub global_stop: Option<StopKind>,
}

#[derive(Debug, Default)]
struct ExecutionMetrics {
    submitted: AtomicU64,
    won: AtomicU64,
    lost: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    resubmitted: AtomicU64,
}

/// Counters over every attempt this executor ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    pub submitted: u64,
    pub won: u64,
    pub lost: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub resubmitted: u64,
}

/// Places attempts through a session.
pub struct TradeExecutor {
    session: SessionHandle,
    monitor: Arc<StopConditionMonitor>,
    runs: Arc<RunBook>,
    config: ExecutorConfig,
    metrics: ExecutionMetrics,
}

impl TradeExecutor {
    pub fn new(
        session: SessionHandle,
        monitor: Arc<StopConditionMonitor>,
        runs: Arc<RunBook>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            session,
            monitor,
            runs,
            config,
            metrics: ExecutionMetrics::default(),
        }
    }

    /// Submit the next attempt of a signal and wait for it to finalize.
    ///
    /// Refused with [`EngineError::AttemptOutstanding`] if the signal already
    /// has an attempt awaiting its result.
    pub async fn execute(&self, order: &AttemptOrder) -> Result<AttemptCompletion, EngineError> {
        let reservation = self.runs.reserve(order.signal.id, order.base_stake)?;
        self.run_attempt(order, reservation).await
    }

    /// Reserve the attempt now and run it in the background. The completion
    /// is delivered on `notify`.
    pub fn dispatch(
        self: &Arc<Self>,
        order: AttemptOrder,
        notify: mpsc::Sender<AttemptCompletion>,
    ) -> Result<JoinHandle<()>, EngineError> {
        let reservation = self.runs.reserve(order.signal.id, order.base_stake)?;
        let executor = Arc::clone(self);
        Ok(tokio::spawn(async move {
            match executor.run_attempt(&order, reservation).await {
                Ok(completion) => {
                    if notify.send(completion).await.is_err() {
                        debug!(signal_id = %order.signal.id, "Completion receiver dropped");
                    }
                }
                Err(e) => {
                    error!(signal_id = %order.signal.id, error = %e, "Attempt could not be recorded");
                }
            }
        }))
    }

    pub fn stats(&self) -> ExecutionStats {
        ExecutionStats {
            submitted: self.metrics.submitted.load(Ordering::Relaxed),
            won: self.metrics.won.load(Ordering::Relaxed),
            lost: self.metrics.lost.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
            timed_out: self.metrics.timed_out.load(Ordering::Relaxed),
            resubmitted: self.metrics.resubmitted.load(Ordering::Relaxed),
        }
    }

    async fn run_attempt(
        &self,
        order: &AttemptOrder,
        reservation: Reservation,
    ) -> Result<AttemptCompletion, EngineError> {
        let signal = &order.signal;
        let mut attempt = TradeAttempt::new(signal.id, reservation.sequence, reservation.stake);
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);

        info!(
            signal_id = %signal.id,
            symbol = %signal.broker_symbol(),
            direction = %signal.direction,
            attempt = attempt.sequence,
            stake = %attempt.stake,
            "Submitting attempt"
        );

        let window = order.attempt_window(self.config.result_grace);
        let outcome = tokio::time::timeout(window, self.place_and_settle(order, &mut attempt)).await;
        match outcome {
            Ok(Ok(settlement)) => {
                attempt.settle(&settlement);
            }
            Ok(Err(reason)) => {
                attempt.reject(reason);
            }
            Err(_) => {
                warn!(
                    signal_id = %signal.id,
                    attempt = attempt.sequence,
                    window_secs = window.as_secs(),
                    "No result within the attempt window"
                );
                if let Some(contract_id) = attempt.contract_id {
                    if let Err(e) = self.session.forget_contract(contract_id).await {
                        debug!(contract_id, error = %e, "Could not drop contract watch");
                    }
                }
                attempt.reject(RejectReason::Timeout);
            }
        }
        self.log_result(&attempt);

        let global_stop = self.monitor.record(&attempt).await;
        let loss_stop = match attempt.result {
            AttemptResult::Lost => self
                .monitor
                .signal_stop(signal.id, &StopThresholds::from_params(&order.params))
                .await
                .filter(|stop| *stop == StopKind::SignalStopLoss),
            _ => None,
        };
        let transition = self
            .runs
            .complete(attempt.clone(), order.params.martingale_enabled, loss_stop)?;

        Ok(AttemptCompletion {
            signal_id: signal.id,
            attempt,
            transition,
            global_stop,
        })
    }

    async fn place_and_settle(
        &self,
        order: &AttemptOrder,
        attempt: &mut TradeAttempt,
    ) -> Result<ContractSettlement, RejectReason> {
        let purchase = self.place(order, attempt).await?;
        attempt.contract_id = Some(purchase.contract_id);
        info!(
            signal_id = %order.signal.id,
            attempt = attempt.sequence,
            contract_id = purchase.contract_id,
            buy_price = ?purchase.buy_price,
            "Attempt confirmed, awaiting result"
        );

        let settlement = self
            .session
            .watch_contract(purchase.contract_id)
            .await
            .map_err(|e| reject_reason(&e))?;
        settlement.await.map_err(|_| {
            warn!(contract_id = purchase.contract_id, "Contract watch dropped before settlement");
            RejectReason::Disconnected
        })
    }

    /// Send the buy, resubmitting the same stake if the connection drops
    /// before the reply.
    async fn place(&self, order: &AttemptOrder, attempt: &mut TradeAttempt) -> Result<BuyReply, RejectReason> {
        loop {
            let request = order.buy_request(attempt.stake, &self.config.currency);
            let reply = match self.session.send(request).await {
                Ok(pending) => pending.recv().await,
                Err(e) => return Err(reject_reason(&e)),
            };

            match reply {
                Ok(response) => {
                    return response.buy.ok_or_else(|| RejectReason::Order {
                        code: "MalformedReply".to_string(),
                        message: format!("{} reply carried no buy body", response.msg_type),
                    });
                }
                Err(RequestFailure::Disconnected) if attempt.resubmissions < self.config.resubmit_limit => {
                    attempt.resubmissions += 1;
                    self.metrics.resubmitted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        signal_id = %order.signal.id,
                        attempt = attempt.sequence,
                        stake = %attempt.stake,
                        resubmission = attempt.resubmissions,
                        "Connection dropped before buy reply, resubmitting"
                    );
                }
                Err(RequestFailure::Disconnected) | Err(RequestFailure::SessionClosed) => {
                    return Err(RejectReason::Disconnected);
                }
                Err(RequestFailure::AccountSwitched) => {
                    return Err(RejectReason::AccountSwitched);
                }
                Err(RequestFailure::Rejected { code, message }) => {
                    return Err(RejectReason::Order { code, message });
                }
                Err(RequestFailure::Unauthorized { message }) => {
                    return Err(RejectReason::Unauthorized { message });
                }
            }
        }
    }

    fn log_result(&self, attempt: &TradeAttempt) {
        match &attempt.result {
            AttemptResult::Won => {
                self.metrics.won.fetch_add(1, Ordering::Relaxed);
                info!(
                    signal_id = %attempt.signal_id,
                    attempt = attempt.sequence,
                    stake = %attempt.stake,
                    profit = %attempt.profit,
                    "Attempt won"
                );
            }
            AttemptResult::Lost => {
                self.metrics.lost.fetch_add(1, Ordering::Relaxed);
                info!(
                    signal_id = %attempt.signal_id,
                    attempt = attempt.sequence,
                    stake = %attempt.stake,
                    profit = %attempt.profit,
                    "Attempt lost"
                );
            }
            AttemptResult::Rejected(RejectReason::Timeout) => {
                self.metrics.timed_out.fetch_add(1, Ordering::Relaxed);
            }
            AttemptResult::Rejected(reason) => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    signal_id = %attempt.signal_id,
                    attempt = attempt.sequence,
                    class = ?reason.class(),
                    reason = %reason,
                    "Attempt rejected"
                );
            }
            AttemptResult::Pending => {}
        }
    }
}

fn reject_reason(error: &Error) -> RejectReason {
    match error {
        Error::Auth { message } => RejectReason::Unauthorized {
            message: message.clone(),
        },
        Error::OrderRejected { code, message } => RejectReason::Order {
            code: code.clone(),
            message: message.clone(),
        },
        Error::AccountSwitched => RejectReason::AccountSwitched,
        _ => RejectReason::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::api::{AccountSession, PaperBroker, PaperConfig, PaperOutcome, SessionConfig};
    use broker_core::types::{Account, Direction, DurationUnit, LossPolicy};
    use tokio_test::assert_ok;

    fn paper_config() -> PaperConfig {
        PaperConfig {
            settle_after: Duration::from_millis(20),
            ..PaperConfig::default()
        }
    }

    fn session_config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.backoff.base = Duration::from_millis(5);
        config.backoff.cap = Duration::from_millis(20);
        config.backoff.jitter = false;
        config
    }

    async fn setup(
        outcomes: Vec<PaperOutcome>,
        signal: Signal,
    ) -> (Arc<PaperBroker>, Arc<TradeExecutor>, Arc<RunBook>, AttemptOrder) {
        let (broker, _session, executor, runs, order) = setup_with_session(outcomes, signal).await;
        (broker, executor, runs, order)
    }

    async fn setup_with_session(
        outcomes: Vec<PaperOutcome>,
        signal: Signal,
    ) -> (Arc<PaperBroker>, SessionHandle, Arc<TradeExecutor>, Arc<RunBook>, AttemptOrder) {
        let broker = Arc::new(PaperBroker::scripted(paper_config(), outcomes));
        let session = AccountSession::connect(
            Account::new("demo", "token"),
            broker.clone(),
            session_config(),
        )
        .await
        .unwrap();
        let runs = Arc::new(RunBook::new(&[signal.clone()], LossPolicy::ResolveLost));
        let monitor = Arc::new(StopConditionMonitor::new(StopThresholds::default()));
        let executor = Arc::new(TradeExecutor::new(
            session.clone(),
            monitor,
            runs.clone(),
            ExecutorConfig::default(),
        ));
        let params = EffectiveParams::resolve(&signal, &Default::default());
        let order = AttemptOrder::new(signal, params, params.stake);
        (broker, session, executor, runs, order)
    }

    fn tick_signal() -> Signal {
        Signal::new("EURUSD", Direction::Call, Decimal::new(10, 0))
            .with_martingale(true)
            .with_duration(1, DurationUnit::Ticks)
    }

    #[tokio::test]
    async fn test_execute_win() {
        let (broker, executor, _runs, order) = setup(
            vec![PaperOutcome::Win {
                profit: Decimal::new(9, 0),
            }],
            tick_signal(),
        )
        .await;

        let completion = executor.execute(&order).await.unwrap();
        assert_eq!(completion.attempt.result, AttemptResult::Won);
        assert_eq!(completion.attempt.profit, Decimal::new(9, 0));
        assert!(completion.attempt.contract_id.is_some());
        assert!(matches!(completion.transition, Transition::Resolved(_)));

        let purchases = broker.purchases();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].symbol, "frxEURUSD");
        assert_eq!(purchases[0].contract_type, "CALL");
        assert_eq!(executor.stats().won, 1);
    }

    #[tokio::test]
    async fn test_execute_loss_continues() {
        let (_broker, executor, _runs, order) = setup(vec![PaperOutcome::Loss], tick_signal()).await;

        let completion = executor.execute(&order).await.unwrap();
        assert_eq!(completion.attempt.result, AttemptResult::Lost);
        assert_eq!(
            completion.transition,
            Transition::Continue {
                next_stake: Decimal::new(20, 0)
            }
        );
    }

    #[tokio::test]
    async fn test_second_concurrent_attempt_refused() {
        let (_broker, executor, _runs, order) = setup(vec![PaperOutcome::Loss], tick_signal()).await;
        let (tx, mut rx) = mpsc::channel(4);

        executor.dispatch(order.clone(), tx.clone()).unwrap();
        let second = executor.dispatch(order.clone(), tx);
        assert_eq!(
            second.err(),
            Some(EngineError::AttemptOutstanding(order.signal.id))
        );

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.attempt.sequence, 1);
    }

    #[tokio::test]
    async fn test_order_rejection() {
        let (_broker, executor, runs, order) = setup(
            vec![PaperOutcome::Reject {
                code: "InsufficientBalance".into(),
                message: "Your account balance is insufficient".into(),
            }],
            tick_signal(),
        )
        .await;

        let completion = executor.execute(&order).await.unwrap();
        assert!(matches!(
            completion.attempt.result,
            AttemptResult::Rejected(RejectReason::Order { ref code, .. }) if code == "InsufficientBalance"
        ));
        assert!(runs.all_resolved());
        assert_eq!(executor.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_drop_before_reply_resubmits_once() {
        let (broker, executor, _runs, order) = setup(
            vec![
                PaperOutcome::DropBeforeReply,
                PaperOutcome::Win {
                    profit: Decimal::new(9, 0),
                },
            ],
            tick_signal(),
        )
        .await;

        let completion = executor.execute(&order).await.unwrap();
        assert_eq!(completion.attempt.result, AttemptResult::Won);
        assert_eq!(completion.attempt.resubmissions, 1);
        assert_eq!(
            broker.submitted_stakes(),
            vec![Decimal::new(10, 0), Decimal::new(10, 0)]
        );
    }

    #[tokio::test]
    async fn test_resubmission_limit_exhausted() {
        let (broker, executor, _runs, order) = setup(
            vec![PaperOutcome::DropBeforeReply, PaperOutcome::DropBeforeReply],
            tick_signal(),
        )
        .await;

        let completion = executor.execute(&order).await.unwrap();
        assert_eq!(
            completion.attempt.result,
            AttemptResult::Rejected(RejectReason::Disconnected)
        );
        assert_eq!(broker.submitted_stakes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_contract_times_out() {
        let signal = Signal::new("R_100", Direction::Put, Decimal::new(5, 0))
            .with_duration(1, DurationUnit::Seconds);
        let (broker, session, executor, runs, order) =
            setup_with_session(vec![PaperOutcome::Unsettled], signal).await;

        let completion = executor.execute(&order).await.unwrap();
        assert_eq!(
            completion.attempt.result,
            AttemptResult::Rejected(RejectReason::Timeout)
        );
        assert!(completion.attempt.realized_pnl().is_none());
        assert!(runs.all_resolved());
        assert_eq!(executor.stats().timed_out, 1);

        // The abandoned contract is not watched again after a reconnect.
        let contract_id = completion.attempt.contract_id.unwrap();
        assert_ok!(session.request(Request::Ping, Duration::from_secs(2)).await);
        assert_eq!(broker.contract_subscriptions(contract_id), 1);
        broker.drop_connections();
        while broker.connections() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_ok!(session.connected().await);
        assert_ok!(session.request(Request::Ping, Duration::from_secs(2)).await);
        assert_eq!(broker.contract_subscriptions(contract_id), 1);
    }

    #[tokio::test]
    async fn test_account_switch_is_not_resubmitted() {
        let (broker, session, executor, runs, order) =
            setup_with_session(vec![PaperOutcome::NoReply], tick_signal()).await;

        let attempt = tokio::spawn({
            let executor = executor.clone();
            let order = order.clone();
            async move { executor.execute(&order).await }
        });
        while broker.purchases().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        session.switch_account(Account::new("other", "other-token"));

        let completion = assert_ok!(attempt.await.unwrap());
        assert_eq!(
            completion.attempt.result,
            AttemptResult::Rejected(RejectReason::AccountSwitched)
        );
        assert_eq!(completion.attempt.resubmissions, 0);
        assert_eq!(broker.submitted_stakes(), vec![Decimal::new(10, 0)]);
        assert!(runs.all_resolved());
    }
}
