//! Error types for the signal execution engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transport-level failure. Retried by the session, never a trading failure.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The request was written on a connection that dropped before replying.
    #[error("Connection dropped before the broker replied")]
    Disconnected,

    /// The account was switched while the request awaited its reply.
    #[error("Account switched before the broker replied")]
    AccountSwitched,

    #[error("Authentication error: {message}")]
    Auth { message: String },

    #[error("Order rejected ({code}): {message}")]
    OrderRejected { code: String, message: String },

    #[error("Timed out waiting for {operation}")]
    Timeout { operation: String },

    #[error("Session closed")]
    SessionClosed,

    #[error("Invalid signal: {message}")]
    InvalidSignal { message: String },

    #[error("Unknown account: {0}")]
    AccountNotFound(String),

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Engine is not running")]
    NotRunning,

    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
