//! Trading Engine
//!
//! Martingale progression, attempt execution and signal scheduling on top of
//! a broker session.

pub mod engine;
pub mod error;
pub mod executor;
pub mod martingale;
pub mod run_book;
pub mod scheduler;

pub use engine::{EngineConfig, EngineStatus, SignalStatus, TradingEngine};
pub use error::EngineError;
pub use executor::{AttemptCompletion, AttemptOrder, ExecutionStats, ExecutorConfig, TradeExecutor};
pub use martingale::{MartingaleController, MartingaleState, MartingaleStatus, RunOutcome, Transition};
pub use run_book::{Notice, NoticeLevel, Reservation, RunBook, RunSnapshot};
pub use scheduler::{HaltReason, SchedulerConfig, SchedulerReport, SignalScheduler};
