//! Signal Runner
//!
//! Trades a signal plan on one broker account with martingale progression.

mod cli;
mod loader;

use anyhow::{bail, Context, Result};
use broker_core::api::{AccountSession, Connector, PaperBroker, PaperConfig, SessionConfig, WsConnector};
use broker_core::config::Config;
use broker_core::types::AccountStore;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trading_engine::{EngineConfig, EngineStatus, TradingEngine};

use crate::cli::Args;

const DEFAULT_FILTER: &str =
    "signal_runner=info,trading_engine=info,broker_core=info,risk_manager=info,tungstenite=warn";

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn log_status(status: &EngineStatus) {
    let resolved = status.signals.iter().filter(|s| s.outcome.is_some()).count();
    let pending = status.signals.iter().filter(|s| s.pending).count();
    info!(
        running = status.running,
        session = ?status.session.state,
        balance = ?status.session.balance,
        signals = status.signals.len(),
        resolved,
        pending,
        realized_profit = %status.global.realized_profit,
        realized_loss = %status.global.realized_loss,
        "Status"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Signal Runner");

    let mut config = Config::load(args.config.as_deref())?;
    if args.live {
        config.broker.live_trading = true;
    }

    let mut accounts = match &args.accounts {
        Some(path) => loader::load_accounts(path)?,
        None if !config.broker.live_trading => AccountStore::from_pairs([("paper", "paper-token")])?,
        None => bail!("--accounts is required for live trading"),
    };
    if let Some(account) = &args.account {
        accounts.select(account)?;
    }
    let signals = loader::load_signals(&args.signals)?;

    let connector: Arc<dyn Connector> = if config.broker.live_trading {
        info!(endpoint = %config.broker.ws_url, "Live trading enabled");
        Arc::new(WsConnector::new(config.broker.endpoint()))
    } else {
        info!("Paper trading mode");
        Arc::new(PaperBroker::new(PaperConfig::from(&config.paper)))
    };

    let session = AccountSession::connect(
        accounts.active().clone(),
        connector,
        SessionConfig::from(&config.session),
    )
    .await
    .with_context(|| format!("failed to open session for account {}", accounts.active().id))?;

    let engine = TradingEngine::new(session.clone(), EngineConfig::from_config(&config));
    engine.start(signals, args.globals()).await?;

    let wait = engine.wait();
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_interval_secs.max(1)));
    ticker.tick().await;

    let report = loop {
        tokio::select! {
            report = &mut wait => break report?,
            _ = ticker.tick() => log_status(&engine.status().await),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, waiting for in-flight attempts");
                if let Err(e) = engine.stop().await {
                    warn!(error = %e, "Stop request ignored");
                }
            }
        }
    };

    info!(
        dispatched = report.dispatched,
        halt = ?report.halt,
        net = %report.global.net(),
        "Signal plan finished"
    );
    let status = engine.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    session.close();
    Ok(())
}
