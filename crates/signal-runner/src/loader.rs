//! Signal plan and account file loading.

use anyhow::{Context, Result};
use broker_core::types::{AccountStore, Signal};
use serde_json::{Map, Value};
use std::path::Path;

/// Load a JSON array of signals.
pub fn load_signals(path: &Path) -> Result<Vec<Signal>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read signals from {}", path.display()))?;
    parse_signals(&raw).with_context(|| format!("invalid signal file {}", path.display()))
}

pub fn parse_signals(raw: &str) -> Result<Vec<Signal>> {
    let signals: Vec<Signal> = serde_json::from_str(raw)?;
    for signal in &signals {
        signal.validate()?;
    }
    Ok(signals)
}

/// Load a `{"name": "token"}` object. Entry order is kept; the first
/// account is active.
pub fn load_accounts(path: &Path) -> Result<AccountStore> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read accounts from {}", path.display()))?;
    parse_accounts(&raw).with_context(|| format!("invalid account file {}", path.display()))
}

pub fn parse_accounts(raw: &str) -> Result<AccountStore> {
    let entries: Map<String, Value> = serde_json::from_str(raw)?;
    let mut pairs = Vec::with_capacity(entries.len());
    for (name, token) in entries {
        let token = token
            .as_str()
            .with_context(|| format!("token for account {name} is not a string"))?
            .to_string();
        pairs.push((name, token));
    }
    Ok(AccountStore::from_pairs(pairs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::types::{Direction, DurationUnit};
    use rust_decimal::Decimal;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_parse_signals() {
        let raw = r#"[
            {"symbol": "EURUSD", "direction": "CALL", "stake": 10, "stop_loss": 70,
             "martingale_enabled": true},
            {"symbol": "R_100", "direction": "PUT", "duration": 5, "duration_unit": "t",
             "use_global_override": true}
        ]"#;
        let signals = assert_ok!(parse_signals(raw));
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].direction, Direction::Call);
        assert_eq!(signals[0].stake, Some(Decimal::new(10, 0)));
        assert_eq!(signals[0].stop_loss, Some(Decimal::new(70, 0)));
        assert!(signals[0].martingale_enabled);
        assert_eq!(signals[1].stake, None);
        assert_eq!(signals[1].duration_unit, DurationUnit::Ticks);
        assert!(signals[1].use_global_override);
        assert_ne!(signals[0].id, signals[1].id);
    }

    #[test]
    fn test_parse_signals_rejects_invalid() {
        assert_err!(parse_signals(r#"[{"symbol": "", "direction": "CALL"}]"#));
        assert_err!(parse_signals(r#"[{"symbol": "EURUSD", "direction": "UP"}]"#));
    }

    #[test]
    fn test_accounts_keep_file_order() {
        let store = assert_ok!(parse_accounts(r#"{"zeta": "t1", "alpha": "t2", "mid": "t3"}"#));
        assert_eq!(store.ids(), vec!["zeta", "alpha", "mid"]);
        assert_eq!(store.active().id, "zeta");
    }

    #[test]
    fn test_accounts_reject_non_string_token() {
        assert_err!(parse_accounts(r#"{"demo": 42}"#));
        assert_err!(parse_accounts("{}"));
    }
}
