//! Custom error types for the control core.
//!
//! `RfError` is the single error enum for the crate, built with `thiserror`.
//! The taxonomy is deliberately closed: each variant maps to one recovery
//! policy, so callers can match instead of string-inspecting.
//!
//! - **`Connection`**: connect-time failure. Never retried automatically;
//!   the operator must request a new connection.
//! - **`Io`**: mid-session transport fault. Fatal for the session; the
//!   supervisor transitions to `Failed` and releases the port.
//! - **`InvalidPlan`**: a sweep plan rejected before any device interaction.
//! - **`Backpressure`**: command queue full, surfaced to the producer.
//! - **`DeviceUnresponsive`**: new work rejected while the session is
//!   `Degraded`.
//!
//! Malformed traffic and single unanswered requests deliberately have no
//! variant: the decoder drops and counts bad frames, and the poll loop's
//! miss counter absorbs individual timeouts, which surface only as a
//! `Degraded` state change.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type RfResult<T> = std::result::Result<T, RfError>;

#[derive(Error, Debug)]
pub enum RfError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid sweep plan: {0}")]
    InvalidPlan(String),

    #[error("Command queue full")]
    Backpressure,

    #[error("Device unresponsive (session degraded)")]
    DeviceUnresponsive,

    #[error("Session closed")]
    SessionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<serialport::Error> for RfError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::Io(kind) => RfError::Io(std::io::Error::new(kind, err.description)),
            _ => RfError::Connection(err.description),
        }
    }
}
