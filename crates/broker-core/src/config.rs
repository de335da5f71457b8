//! Configuration management for the signal execution engine.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `SIGNAL_BOT__SECTION__KEY` environment variables (a `.env` file is honoured).

use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

use crate::types::{LossPolicy, StakeMode};
use crate::Result;

pub const DEFAULT_WS_URL: &str = "wss://ws.derivws.com/websockets/v3";
pub const DEFAULT_APP_ID: &str = "1089";
const ENV_PREFIX: &str = "SIGNAL_BOT";

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub session: SessionSettings,
    pub trading: TradingSettings,
    pub paper: PaperSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub ws_url: String,
    pub app_id: String,
    pub currency: String,
    /// False routes orders to the in-process paper broker.
    pub live_trading: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            app_id: DEFAULT_APP_ID.to_string(),
            currency: "USD".to_string(),
            live_trading: false,
        }
    }
}

impl BrokerConfig {
    /// Full streaming endpoint including the application id.
    pub fn endpoint(&self) -> String {
        let separator = if self.ws_url.contains('?') { '&' } else { '?' };
        format!("{}{}app_id={}", self.ws_url, separator, self.app_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: bool,
    pub handshake_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            backoff_jitter: true,
            handshake_timeout_secs: 15,
            ping_interval_secs: 60,
            read_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    /// Seconds before a signal's scheduled time at which it becomes eligible.
    pub entry_lead_secs: u64,
    /// Extra seconds beyond the contract duration to wait for a result.
    pub result_grace_secs: u64,
    /// Resubmissions allowed when the connection drops before the buy reply.
    pub resubmit_limit: u32,
    pub stake_mode: StakeMode,
    pub loss_without_martingale: LossPolicy,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            entry_lead_secs: 0,
            result_grace_secs: 30,
            resubmit_limit: 1,
            stake_mode: StakeMode::Fixed,
            loss_without_martingale: LossPolicy::ResolveLost,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaperSettings {
    pub win_rate: f64,
    pub payout_ratio: Decimal,
    pub starting_balance: Decimal,
    pub settle_after_ms: u64,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            win_rate: 0.5,
            payout_ratio: Decimal::new(95, 2),
            starting_balance: Decimal::new(10_000, 0),
            settle_after_ms: 1_000,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    fn validate(&self) -> Result<()> {
        if self.session.backoff_base_ms == 0 || self.session.backoff_cap_ms < self.session.backoff_base_ms {
            return Err(crate::Error::Config {
                message: "session backoff needs 0 < base <= cap".to_string(),
            });
        }
        for (name, secs) in [
            ("handshake_timeout_secs", self.session.handshake_timeout_secs),
            ("ping_interval_secs", self.session.ping_interval_secs),
            ("read_timeout_secs", self.session.read_timeout_secs),
        ] {
            if secs == 0 {
                return Err(crate::Error::Config {
                    message: format!("session {name} must be greater than zero"),
                });
            }
        }
        if !(0.0..=1.0).contains(&self.paper.win_rate) {
            return Err(crate::Error::Config {
                message: format!("paper win_rate {} is outside 0..=1", self.paper.win_rate),
            });
        }
        if self.broker.currency.trim().is_empty() {
            return Err(crate::Error::Config {
                message: "broker currency must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
