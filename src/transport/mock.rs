//! In-memory transport with a scripted device behind it.
//!
//! The mock decodes real request frames with the crate codec and answers
//! them the way the firmware would (ack, nack, or status report), so session
//! tests exercise the full encode/decode path. Tests hold a
//! [`MockDeviceHandle`] to script faults and inspect the command log.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::error::{RfError, RfResult};
use crate::messages::{CommandOp, CommandRequest};
use crate::protocol::{self, Decoder, Frame};
use crate::snapshot::StatusSnapshot;
use crate::transport::Transport;

/// One request as the device saw it, with its arrival time. Responses are
/// produced in the same call, so this doubles as the ack timestamp.
#[derive(Debug, Clone)]
pub struct SeenCommand {
    pub at: Instant,
    pub request: CommandRequest,
}

#[derive(Debug)]
struct MockDevice {
    decoder: Decoder,
    outbox: Vec<u8>,
    commands: Vec<SeenCommand>,

    frequency_hz: f64,
    locked: bool,
    error_flags: u8,
    firmware_tick_ms: u32,

    /// Requests left to swallow without answering (simulates a mute device).
    mute_budget: u32,
    /// Mute indefinitely when set.
    mute: bool,
    /// Reason byte to reject the next request with.
    nack_next: Option<u8>,
    /// Every write fails with a broken pipe when set.
    fail_writes: bool,
}

impl MockDevice {
    fn new() -> Self {
        Self {
            decoder: Decoder::new(),
            outbox: Vec::new(),
            commands: Vec::new(),
            frequency_hz: 1.0e9,
            locked: true,
            error_flags: 0,
            firmware_tick_ms: 0,
            mute_budget: 0,
            mute: false,
            nack_next: None,
            fail_writes: false,
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            locked: self.locked,
            frequency_hz: self.frequency_hz,
            error_flags: self.error_flags,
            firmware_tick_ms: self.firmware_tick_ms,
            received_at: Utc::now(),
        }
    }

    fn handle_request(&mut self, request: CommandRequest) {
        self.commands.push(SeenCommand {
            at: Instant::now(),
            request: request.clone(),
        });

        if self.mute {
            return;
        }
        if self.mute_budget > 0 {
            self.mute_budget -= 1;
            return;
        }
        if let Some(reason) = self.nack_next.take() {
            self.outbox.extend(protocol::encode_nack(request.id, reason));
            return;
        }

        self.firmware_tick_ms = self.firmware_tick_ms.wrapping_add(1);
        match request.op {
            CommandOp::QueryStatus => {
                let snapshot = self.snapshot();
                self.outbox
                    .extend(protocol::encode_status(request.id, &snapshot));
            }
            CommandOp::SetParameter(hz) => {
                self.frequency_hz = hz;
                self.outbox.extend(protocol::encode_ack(request.id));
            }
            CommandOp::StartSweep(_)
            | CommandOp::StopSweep
            | CommandOp::Disconnect => {
                self.outbox.extend(protocol::encode_ack(request.id));
            }
        }
    }
}

/// Test-side handle for scripting the mock device and reading its log.
#[derive(Clone)]
pub struct MockDeviceHandle {
    device: Arc<Mutex<MockDevice>>,
}

impl MockDeviceHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockDevice> {
        match self.device.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every request the device has decoded, in arrival order.
    pub fn commands(&self) -> Vec<SeenCommand> {
        self.lock().commands.clone()
    }

    /// The `SetParameter` values the device has applied, with ack times.
    pub fn set_parameter_log(&self) -> Vec<(Instant, f64)> {
        self.lock()
            .commands
            .iter()
            .filter_map(|c| match c.request.op {
                CommandOp::SetParameter(hz) => Some((c.at, hz)),
                _ => None,
            })
            .collect()
    }

    pub fn frequency_hz(&self) -> f64 {
        self.lock().frequency_hz
    }

    /// Swallow the next `n` requests without answering.
    pub fn mute_next(&self, n: u32) {
        self.lock().mute_budget = n;
    }

    /// Swallow every request until unmuted.
    pub fn set_mute(&self, mute: bool) {
        self.lock().mute = mute;
    }

    /// Reject the next request with the given reason byte.
    pub fn nack_next(&self, reason: u8) {
        self.lock().nack_next = Some(reason);
    }

    /// Make every subsequent write fail with a broken pipe.
    pub fn fail_writes(&self) {
        self.lock().fail_writes = true;
    }

    /// Adjust the reported lock/error status.
    pub fn set_status(&self, locked: bool, error_flags: u8) {
        let mut device = self.lock();
        device.locked = locked;
        device.error_flags = error_flags;
    }
}

/// Transport connected to the scripted [`MockDevice`].
pub struct MockTransport {
    connected: bool,
    device: Arc<Mutex<MockDevice>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockDeviceHandle) {
        let device = Arc::new(Mutex::new(MockDevice::new()));
        let handle = MockDeviceHandle {
            device: device.clone(),
        };
        (
            Self {
                connected: false,
                device,
            },
            handle,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockDevice> {
        match self.device.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> RfResult<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> RfResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn try_read(&mut self, buf: &mut Vec<u8>) -> RfResult<usize> {
        if !self.connected {
            return Err(RfError::NotConnected);
        }
        let mut device = self.lock();
        let n = device.outbox.len();
        buf.extend_from_slice(&device.outbox);
        device.outbox.clear();
        Ok(n)
    }

    async fn write(&mut self, bytes: &[u8]) -> RfResult<()> {
        if !self.connected {
            return Err(RfError::NotConnected);
        }
        let mut device = self.lock();
        if device.fail_writes {
            return Err(RfError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock serial link broken",
            )));
        }

        let frames = device.decoder.feed(bytes);
        for frame in frames {
            if let Frame::Request(request) = frame {
                device.handle_request(request);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_acks_set_parameter() {
        let (mut transport, handle) = MockTransport::new();
        transport.connect().await.unwrap();

        let request = CommandRequest {
            id: 1,
            op: CommandOp::SetParameter(2.4e9),
        };
        transport.write(&protocol::encode(&request)).await.unwrap();

        let mut buf = Vec::new();
        transport.try_read(&mut buf).await.unwrap();
        let frames = Decoder::new().feed(&buf);
        assert_eq!(frames, vec![Frame::Ack(1)]);
        assert_eq!(handle.frequency_hz(), 2.4e9);
    }

    #[tokio::test]
    async fn test_mock_mute_swallows_requests() {
        let (mut transport, handle) = MockTransport::new();
        transport.connect().await.unwrap();
        handle.mute_next(1);

        let query = CommandRequest {
            id: 2,
            op: CommandOp::QueryStatus,
        };
        transport.write(&protocol::encode(&query)).await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(transport.try_read(&mut buf).await.unwrap(), 0);
        // The swallowed request is still visible in the log.
        assert_eq!(handle.commands().len(), 1);

        // The next request is answered again.
        let query = CommandRequest {
            id: 3,
            op: CommandOp::QueryStatus,
        };
        transport.write(&protocol::encode(&query)).await.unwrap();
        transport.try_read(&mut buf).await.unwrap();
        assert!(!buf.is_empty());
    }
}
