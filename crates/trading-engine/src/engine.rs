//! Control surface for a trading plan.

use broker_core::api::{SessionHandle, SessionStatus};
use broker_core::config::Config;
use broker_core::types::{
    AccountStore, EffectiveParams, GlobalDefaults, LossPolicy, Signal, TradeAttempt,
};
use broker_core::{Error, Result};
use risk_manager::{LedgerEntry, StopConditionMonitor, StopThresholds};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::executor::{ExecutionStats, ExecutorConfig, TradeExecutor};
use crate::martingale::{MartingaleState, RunOutcome};
use crate::run_book::{Notice, RunBook};
use crate::scheduler::{HaltReason, SchedulerConfig, SchedulerReport, SignalScheduler};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub loss_policy: LossPolicy,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            executor: ExecutorConfig::from_settings(&config.broker, &config.trading),
            scheduler: SchedulerConfig::from(&config.trading),
            loss_policy: config.trading.loss_without_martingale,
        }
    }
}

/// Status of one signal.
#[derive(Debug, Clone, Serialize)]
pub struct SignalStatus {
    pub signal: Signal,
    /// Parameters the next dispatch would apply.
    pub params: EffectiveParams,
    pub martingale: MartingaleState,
    pub ledger: LedgerEntry,
    pub projected_exposure: Decimal,
    pub pending: bool,
    pub attempts: Vec<TradeAttempt>,
    pub outcome: Option<RunOutcome>,
    pub notices: Vec<Notice>,
}

/// Snapshot of the whole engine for display.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub halt: Option<HaltReason>,
    pub session: SessionStatus,
    pub globals: GlobalDefaults,
    pub global: LedgerEntry,
    pub execution: ExecutionStats,
    pub signals: Vec<SignalStatus>,
}

struct ActivePlan {
    runs: Arc<RunBook>,
    executor: Arc<TradeExecutor>,
    stop: watch::Sender<bool>,
    halt: watch::Receiver<Option<HaltReason>>,
    task: Option<JoinHandle<SchedulerReport>>,
    finished: Arc<AtomicBool>,
    report: Option<SchedulerReport>,
}

impl ActivePlan {
    fn is_running(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }
}

/// Runs a list of signals on one account session.
pub struct TradingEngine {
    session: SessionHandle,
    config: EngineConfig,
    monitor: Arc<StopConditionMonitor>,
    globals: Arc<RwLock<GlobalDefaults>>,
    plan: Mutex<Option<ActivePlan>>,
}

impl TradingEngine {
    pub fn new(session: SessionHandle, config: EngineConfig) -> Self {
        Self {
            session,
            config,
            monitor: Arc::new(StopConditionMonitor::new(StopThresholds::default())),
            globals: Arc::new(RwLock::new(GlobalDefaults::default())),
            plan: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn monitor(&self) -> Arc<StopConditionMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Start trading `signals`. The ledger and any previous halt are cleared.
    pub async fn start(&self, signals: Vec<Signal>, globals: GlobalDefaults) -> Result<()> {
        let mut plan = self.plan.lock().await;
        if plan.as_ref().map(ActivePlan::is_running).unwrap_or(false) {
            return Err(Error::AlreadyRunning);
        }
        if signals.is_empty() {
            return Err(Error::InvalidSignal {
                message: "no signals to trade".to_string(),
            });
        }
        let mut seen = HashSet::with_capacity(signals.len());
        for signal in &signals {
            signal.validate()?;
            if !seen.insert(signal.id) {
                return Err(Error::InvalidSignal {
                    message: format!("duplicate signal id {}", signal.id),
                });
            }
        }

        self.monitor.reset().await;
        self.monitor
            .set_global_thresholds(StopThresholds::from_globals(&globals))
            .await;
        *self.globals.write().await = globals;

        let runs = Arc::new(RunBook::new(&signals, self.config.loss_policy));
        let executor = Arc::new(TradeExecutor::new(
            self.session.clone(),
            Arc::clone(&self.monitor),
            Arc::clone(&runs),
            self.config.executor.clone(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (halt_tx, halt_rx) = watch::channel(None);
        let scheduler = SignalScheduler::new(
            Arc::clone(&runs),
            Arc::clone(&executor),
            Arc::clone(&self.monitor),
            Arc::clone(&self.globals),
            self.session.clone(),
            self.config.scheduler.clone(),
            stop_rx,
            halt_tx,
        );

        let finished = Arc::new(AtomicBool::new(false));
        let task = {
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                let report = scheduler.run().await;
                finished.store(true, Ordering::SeqCst);
                report
            })
        };

        info!(
            signals = signals.len(),
            account = %self.session.account_id(),
            loss_policy = self.config.loss_policy.name(),
            "Trading engine started"
        );
        *plan = Some(ActivePlan {
            runs,
            executor,
            stop: stop_tx,
            halt: halt_rx,
            task: Some(task),
            finished,
            report: None,
        });
        Ok(())
    }

    /// Halt new submissions. In-flight attempts still finalize.
    pub async fn stop(&self) -> Result<()> {
        let plan = self.plan.lock().await;
        match plan.as_ref() {
            Some(active) if active.is_running() => {
                active.stop.send_replace(true);
                Ok(())
            }
            _ => Err(Error::NotRunning),
        }
    }

    /// Wait for the current plan to finish and return its report.
    pub async fn wait(&self) -> Result<SchedulerReport> {
        let task = {
            let mut plan = self.plan.lock().await;
            let active = plan.as_mut().ok_or(Error::NotRunning)?;
            if let Some(report) = &active.report {
                return Ok(report.clone());
            }
            active.task.take().ok_or(Error::NotRunning)?
        };

        let report = task.await.map_err(|e| Error::Protocol {
            message: format!("scheduler task failed: {e}"),
        })?;
        if let Some(active) = self.plan.lock().await.as_mut() {
            active.report = Some(report.clone());
        }
        Ok(report)
    }

    pub async fn is_running(&self) -> bool {
        self.plan
            .lock()
            .await
            .as_ref()
            .map(ActivePlan::is_running)
            .unwrap_or(false)
    }

    /// Replace the global defaults. Applies from the next dispatch.
    pub async fn update_globals(&self, globals: GlobalDefaults) {
        self.monitor
            .set_global_thresholds(StopThresholds::from_globals(&globals))
            .await;
        info!(
            stake = %globals.stake,
            stop_win = ?globals.stop_win,
            stop_loss = ?globals.stop_loss,
            martingale = globals.martingale_enabled,
            "Global defaults updated"
        );
        *self.globals.write().await = globals;
    }

    /// Make `account_id` the active account and rebuild the session for it.
    pub async fn select_account(&self, store: &mut AccountStore, account_id: &str) -> Result<()> {
        let account = store.select(account_id)?.clone();
        if self.is_running().await {
            warn!(account = %account.id, "Switching account while trading; in-flight attempts may fail");
        }
        self.session.switch_account(account);
        Ok(())
    }

    pub async fn status(&self) -> EngineStatus {
        let globals = self.globals.read().await.clone();
        let global = self.monitor.global_entry().await;

        let plan = self.plan.lock().await;
        let (running, halt, execution, snapshots) = match plan.as_ref() {
            Some(active) => (
                active.is_running(),
                active.halt.borrow().clone(),
                active.executor.stats(),
                active.runs.snapshots(),
            ),
            None => (false, None, ExecutionStats::default(), Vec::new()),
        };
        drop(plan);

        let mut signals = Vec::with_capacity(snapshots.len());
        for run in snapshots {
            let params = EffectiveParams::resolve(&run.signal, &globals);
            signals.push(SignalStatus {
                ledger: self.monitor.signal_entry(run.signal.id).await,
                params,
                martingale: run.martingale,
                projected_exposure: run.projected_exposure,
                pending: run.pending,
                attempts: run.attempts,
                outcome: run.outcome,
                notices: run.notices,
                signal: run.signal,
            });
        }

        EngineStatus {
            running,
            halt,
            session: self.session.status(),
            globals,
            global,
            execution,
            signals,
        }
    }
}
