//! Signal-Bot: martingale signal execution for Deriv-style binary options
//!
//! This is the root crate that provides benchmark and end-to-end test access
//! to the internal crates:
//!
//! - `broker-core`: Signal and attempt types, configuration, wire protocol,
//!   account session and paper broker
//! - `risk-manager`: Stop-win / stop-loss ledger and monitor
//! - `trading-engine`: Martingale progression, execution and scheduling
//! - `signal-runner`: Command line runner

pub use broker_core as broker;
pub use risk_manager as risk;
pub use trading_engine as trading;
