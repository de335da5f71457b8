//! Authored trade intents and the effective risk parameters applied to them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::{Error, Result};

/// Forex pairs the broker lists under the `frx` prefix.
const FOREX_PAIRS: &[&str] = &[
    "EURUSD", "GBPUSD", "GBPJPY", "AUDJPY", "EURGBP", "EURJPY", "USDJPY", "AUDUSD", "USDCAD",
    "USDCHF", "NZDUSD", "EURAUD", "EURCAD", "EURCHF", "GBPAUD", "AUDCAD",
];

/// Contract direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[serde(alias = "call", alias = "Call")]
    Call,
    #[serde(alias = "put", alias = "Put")]
    Put,
}

impl Direction {
    /// Contract type as the broker names it.
    pub fn contract_type(&self) -> &'static str {
        match self {
            Direction::Call => "CALL",
            Direction::Put => "PUT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.contract_type())
    }
}

/// Unit of a contract's duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurationUnit {
    #[serde(rename = "t", alias = "ticks")]
    Ticks,
    #[serde(rename = "s", alias = "seconds")]
    Seconds,
    #[default]
    #[serde(rename = "m", alias = "minutes")]
    Minutes,
    #[serde(rename = "h", alias = "hours")]
    Hours,
    #[serde(rename = "d", alias = "days")]
    Days,
}

impl DurationUnit {
    pub fn code(&self) -> &'static str {
        match self {
            DurationUnit::Ticks => "t",
            DurationUnit::Seconds => "s",
            DurationUnit::Minutes => "m",
            DurationUnit::Hours => "h",
            DurationUnit::Days => "d",
        }
    }

    /// Wall-clock length of `count` units. Ticks are estimated at two seconds each.
    pub fn wall_clock(&self, count: u32) -> Duration {
        let count = u64::from(count);
        match self {
            DurationUnit::Ticks => Duration::from_secs(count * 2),
            DurationUnit::Seconds => Duration::from_secs(count),
            DurationUnit::Minutes => Duration::from_secs(count * 60),
            DurationUnit::Hours => Duration::from_secs(count * 3_600),
            DurationUnit::Days => Duration::from_secs(count * 86_400),
        }
    }
}

/// Map a user-facing instrument name to the broker's symbol.
///
/// Plain forex pairs gain the `frx` prefix; broker-native symbols such as
/// `R_100` or `frxEURUSD` pass through.
pub fn broker_symbol(raw: &str) -> String {
    let trimmed = raw.trim();
    let upper = trimmed.to_uppercase();

    if let Some(pair) = upper.strip_prefix("FRX") {
        return format!("frx{}", pair);
    }
    if FOREX_PAIRS.contains(&upper.as_str()) {
        return format!("frx{}", upper);
    }
    upper
}

fn default_duration() -> u32 {
    1
}

/// One authored trade intent plus its risk parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    /// Base stake. Falls back to the global stake when absent.
    #[serde(default)]
    pub stake: Option<Decimal>,
    #[serde(default = "default_duration")]
    pub duration: u32,
    #[serde(default)]
    pub duration_unit: DurationUnit,
    /// When set, the signal is not dispatched before this instant (minus the entry lead).
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_win: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub martingale_enabled: bool,
    /// When ticked, the global defaults supersede this signal's own risk values.
    #[serde(default)]
    pub use_global_override: bool,
}

impl Signal {
    pub fn new(symbol: impl Into<String>, direction: Direction, stake: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            direction,
            stake: Some(stake),
            duration: default_duration(),
            duration_unit: DurationUnit::Minutes,
            scheduled_at: None,
            stop_win: None,
            stop_loss: None,
            martingale_enabled: false,
            use_global_override: false,
        }
    }

    pub fn with_stops(mut self, stop_win: Option<Decimal>, stop_loss: Option<Decimal>) -> Self {
        self.stop_win = stop_win;
        self.stop_loss = stop_loss;
        self
    }

    pub fn with_martingale(mut self, enabled: bool) -> Self {
        self.martingale_enabled = enabled;
        self
    }

    pub fn with_global_override(mut self, enabled: bool) -> Self {
        self.use_global_override = enabled;
        self
    }

    pub fn with_duration(mut self, duration: u32, unit: DurationUnit) -> Self {
        self.duration = duration;
        self.duration_unit = unit;
        self
    }

    pub fn scheduled(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Symbol in the form the broker expects.
    pub fn broker_symbol(&self) -> String {
        broker_symbol(&self.symbol)
    }

    /// Approximate wall-clock length of one contract.
    pub fn contract_duration(&self) -> Duration {
        self.duration_unit.wall_clock(self.duration)
    }

    /// Reject signals that can never be traded.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(Error::InvalidSignal {
                message: format!("signal {} has an empty symbol", self.id),
            });
        }
        if let Some(stake) = self.stake {
            if stake <= Decimal::ZERO {
                return Err(Error::InvalidSignal {
                    message: format!("signal {} has non-positive stake {}", self.id, stake),
                });
            }
        }
        if self.duration == 0 {
            return Err(Error::InvalidSignal {
                message: format!("signal {} has a zero duration", self.id),
            });
        }
        Ok(())
    }
}

/// The single pair of global risk defaults plus the default stake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDefaults {
    pub stake: Decimal,
    #[serde(default)]
    pub stop_win: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub martingale_enabled: bool,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            stake: Decimal::ONE,
            stop_win: None,
            stop_loss: None,
            martingale_enabled: false,
        }
    }
}

/// Normalize a threshold: absent, zero and negative values all mean disabled.
pub fn active_threshold(value: Option<Decimal>) -> Option<Decimal> {
    value.filter(|v| *v > Decimal::ZERO)
}

/// Parameters actually applied to a signal's next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveParams {
    pub stake: Decimal,
    pub stop_win: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub martingale_enabled: bool,
    /// Whether the risk values came from the global defaults.
    pub from_globals: bool,
}

impl EffectiveParams {
    /// Resolve a signal's effective parameters against the global defaults.
    ///
    /// The globals win when the signal's override flag is ticked; otherwise the
    /// signal's own stored values apply. The stake is never overridden, it only
    /// falls back to the global stake when the signal has none.
    pub fn resolve(signal: &Signal, globals: &GlobalDefaults) -> Self {
        let stake = signal.stake.unwrap_or(globals.stake);

        if signal.use_global_override {
            Self {
                stake,
                stop_win: active_threshold(globals.stop_win),
                stop_loss: active_threshold(globals.stop_loss),
                martingale_enabled: globals.martingale_enabled,
                from_globals: true,
            }
        } else {
            Self {
                stake,
                stop_win: active_threshold(signal.stop_win),
                stop_loss: active_threshold(signal.stop_loss),
                martingale_enabled: signal.martingale_enabled,
                from_globals: false,
            }
        }
    }
}
