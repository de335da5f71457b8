//! Risk Manager
//!
//! Stop-win and stop-loss accounting per signal and across the whole plan.

pub mod stop_condition;

pub use stop_condition::{
    LedgerEntry, StopConditionMonitor, StopDecision, StopKind, StopLedger, StopThresholds,
};
