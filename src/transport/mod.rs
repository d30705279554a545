//! Physical-link ownership.
//!
//! A [`Transport`] owns exclusive access to one serial channel. It knows
//! nothing about framing: the codec lives above it, and only the session
//! supervisor ever holds a transport.

use async_trait::async_trait;

use crate::error::RfResult;

pub mod mock;
pub mod serial;

pub use mock::{MockDeviceHandle, MockTransport};
pub use serial::{SerialConfig, SerialTransport};

/// Exclusive handle to a byte channel.
///
/// `disconnect` is idempotent and the underlying OS resource is also
/// released when the transport is dropped, so every exit path, including
/// unwind, closes the port.
#[async_trait]
pub trait Transport: Send {
    /// Opens the underlying channel. Fails with `RfError::Connection`.
    async fn connect(&mut self) -> RfResult<()>;

    /// Closes the channel. Safe to call repeatedly or when never connected.
    async fn disconnect(&mut self) -> RfResult<()>;

    /// Non-blocking read: appends whatever is currently available to `buf`
    /// and returns the number of bytes taken (possibly zero).
    async fn try_read(&mut self, buf: &mut Vec<u8>) -> RfResult<usize>;

    /// Writes the full buffer. Fails with `RfError::Io` on a broken link.
    async fn write(&mut self, bytes: &[u8]) -> RfResult<()>;

    fn is_connected(&self) -> bool;
}
