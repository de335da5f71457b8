//! Core domain types for the signal execution engine.

pub mod account;
pub mod attempt;
pub mod signal;
pub mod strategy;

pub use account::*;
pub use attempt::*;
pub use signal::*;
pub use strategy::*;
