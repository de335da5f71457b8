//! Broker Core Library
//!
//! Shared types, configuration, the broker wire protocol and the account
//! session used by the signal execution engine.

pub mod api;
pub mod config;
pub mod error;
pub mod types;

pub use error::{Error, Result};
