//! Wire codec for the command/response protocol.
//!
//! The vendor's byte layout is proprietary, so this crate defines its own
//! framing with the same request/response/async-status semantics:
//!
//! ```text
//! | 0xA5 | type u8 | correlation id u32 LE | len u8 | payload | xor u8 |
//! ```
//!
//! The checksum is the XOR of every byte from the type through the payload.
//! Request frames (host → device) use types `0x01..=0x05`; response frames
//! (device → host) use `0x81..=0x83`. The decoder understands both
//! directions so a scripted device double can share it with the host.
//!
//! Decoding is tolerant by design: garbled bytes are expected on a noisy
//! link. Anything that fails resync, checksum, or payload validation is
//! dropped and counted via [`Decoder::malformed_frames`], never surfaced as
//! an error.

use bytes::{Buf, BytesMut};
use chrono::Utc;

use crate::messages::{CommandOp, CommandRequest, CorrelationId};
use crate::snapshot::StatusSnapshot;
use crate::sweep::SweepPlan;

pub const FRAME_MARKER: u8 = 0xA5;

const TYPE_SET_PARAMETER: u8 = 0x01;
const TYPE_START_SWEEP: u8 = 0x02;
const TYPE_STOP_SWEEP: u8 = 0x03;
const TYPE_QUERY_STATUS: u8 = 0x04;
const TYPE_DISCONNECT: u8 = 0x05;
const TYPE_ACK: u8 = 0x81;
const TYPE_STATUS_REPORT: u8 = 0x82;
const TYPE_NACK: u8 = 0x83;

/// marker + type + id + len
const HEADER_LEN: usize = 7;

/// Nack reason: device busy with a previous command.
pub const NACK_BUSY: u8 = 0x01;
/// Nack reason: requested value out of the synthesizer's range.
pub const NACK_OUT_OF_RANGE: u8 = 0x02;
/// Nack reason: unspecified firmware fault.
pub const NACK_INTERNAL: u8 = 0x03;

/// A decoded, well-formed unit of the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Host-originated request (seen when decoding the host side of the
    /// link, e.g. in a device simulator).
    Request(CommandRequest),
    /// Command accepted by the firmware.
    Ack(CorrelationId),
    /// Status report, either answering a `QueryStatus` or pushed
    /// asynchronously by the firmware (correlation id 0).
    StatusReport {
        id: CorrelationId,
        snapshot: StatusSnapshot,
    },
    /// Command rejected by the firmware.
    Nack { id: CorrelationId, reason: u8 },
}

fn frame_bytes(frame_type: u8, id: CorrelationId, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u8::MAX as usize);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
    out.push(FRAME_MARKER);
    out.push(frame_type);
    out.extend_from_slice(&id.to_le_bytes());
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    let checksum = out[1..].iter().fold(0u8, |acc, b| acc ^ b);
    out.push(checksum);
    out
}

/// Encodes an outbound command request into wire bytes.
pub fn encode(request: &CommandRequest) -> Vec<u8> {
    match &request.op {
        CommandOp::SetParameter(hz) => {
            frame_bytes(TYPE_SET_PARAMETER, request.id, &hz.to_le_bytes())
        }
        CommandOp::StartSweep(plan) => {
            let mut payload = Vec::with_capacity(28);
            payload.extend_from_slice(&plan.start_hz.to_le_bytes());
            payload.extend_from_slice(&plan.stop_hz.to_le_bytes());
            payload.extend_from_slice(&plan.step_hz.to_le_bytes());
            payload.extend_from_slice(&(plan.dwell.as_millis() as u32).to_le_bytes());
            frame_bytes(TYPE_START_SWEEP, request.id, &payload)
        }
        CommandOp::StopSweep => frame_bytes(TYPE_STOP_SWEEP, request.id, &[]),
        CommandOp::QueryStatus => frame_bytes(TYPE_QUERY_STATUS, request.id, &[]),
        CommandOp::Disconnect => frame_bytes(TYPE_DISCONNECT, request.id, &[]),
    }
}

/// Encodes a device-side acknowledgment. Used by device doubles and tests.
pub fn encode_ack(id: CorrelationId) -> Vec<u8> {
    frame_bytes(TYPE_ACK, id, &[])
}

/// Encodes a device-side rejection.
pub fn encode_nack(id: CorrelationId, reason: u8) -> Vec<u8> {
    frame_bytes(TYPE_NACK, id, &[reason])
}

/// Encodes a device-side status report. `received_at` is host-local and is
/// not carried on the wire.
pub fn encode_status(id: CorrelationId, snapshot: &StatusSnapshot) -> Vec<u8> {
    let mut payload = Vec::with_capacity(14);
    payload.push(u8::from(snapshot.locked));
    payload.extend_from_slice(&snapshot.frequency_hz.to_le_bytes());
    payload.push(snapshot.error_flags);
    payload.extend_from_slice(&snapshot.firmware_tick_ms.to_le_bytes());
    frame_bytes(TYPE_STATUS_REPORT, id, &payload)
}

/// Incremental frame decoder.
///
/// Stateless beyond the retained partial-frame buffer: `feed` may be called
/// with arbitrary byte slices and frames split across calls are reassembled.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
    malformed: u64,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of dropped malformed frames / garbage runs since creation.
    pub fn malformed_frames(&self) -> u64 {
        self.malformed
    }

    /// Appends bytes and returns every complete frame now decodable.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            // Resynchronize on the frame marker, dropping any leading noise.
            match self.buf.iter().position(|&b| b == FRAME_MARKER) {
                Some(0) => {}
                Some(skip) => {
                    self.buf.advance(skip);
                    self.malformed += 1;
                }
                None => {
                    if !self.buf.is_empty() {
                        self.buf.clear();
                        self.malformed += 1;
                    }
                    break;
                }
            }

            if self.buf.len() < HEADER_LEN {
                break;
            }
            let payload_len = self.buf[6] as usize;
            let total = HEADER_LEN + payload_len + 1;
            if self.buf.len() < total {
                break;
            }

            let checksum = self.buf[1..total - 1].iter().fold(0u8, |acc, b| acc ^ b);
            if checksum != self.buf[total - 1] {
                // Corrupt or a marker byte inside noise: skip one byte and
                // search again.
                self.malformed += 1;
                self.buf.advance(1);
                continue;
            }

            let frame_type = self.buf[1];
            let id = CorrelationId::from_le_bytes([
                self.buf[2],
                self.buf[3],
                self.buf[4],
                self.buf[5],
            ]);
            match parse_payload(frame_type, id, &self.buf[HEADER_LEN..total - 1]) {
                Some(frame) => frames.push(frame),
                None => self.malformed += 1,
            }
            self.buf.advance(total);
        }

        frames
    }
}

fn parse_payload(frame_type: u8, id: CorrelationId, payload: &[u8]) -> Option<Frame> {
    match (frame_type, payload.len()) {
        (TYPE_SET_PARAMETER, 8) => {
            let hz = f64::from_le_bytes(payload.try_into().ok()?);
            Some(Frame::Request(CommandRequest {
                id,
                op: CommandOp::SetParameter(hz),
            }))
        }
        (TYPE_START_SWEEP, 28) => {
            let start_hz = f64::from_le_bytes(payload[0..8].try_into().ok()?);
            let stop_hz = f64::from_le_bytes(payload[8..16].try_into().ok()?);
            let step_hz = f64::from_le_bytes(payload[16..24].try_into().ok()?);
            let dwell_ms = u32::from_le_bytes(payload[24..28].try_into().ok()?);
            Some(Frame::Request(CommandRequest {
                id,
                op: CommandOp::StartSweep(SweepPlan {
                    start_hz,
                    stop_hz,
                    step_hz,
                    dwell: std::time::Duration::from_millis(u64::from(dwell_ms)),
                }),
            }))
        }
        (TYPE_STOP_SWEEP, 0) => Some(Frame::Request(CommandRequest {
            id,
            op: CommandOp::StopSweep,
        })),
        (TYPE_QUERY_STATUS, 0) => Some(Frame::Request(CommandRequest {
            id,
            op: CommandOp::QueryStatus,
        })),
        (TYPE_DISCONNECT, 0) => Some(Frame::Request(CommandRequest {
            id,
            op: CommandOp::Disconnect,
        })),
        (TYPE_ACK, 0) => Some(Frame::Ack(id)),
        (TYPE_STATUS_REPORT, 14) => {
            let locked = payload[0] != 0;
            let frequency_hz = f64::from_le_bytes(payload[1..9].try_into().ok()?);
            let error_flags = payload[9];
            let firmware_tick_ms = u32::from_le_bytes(payload[10..14].try_into().ok()?);
            Some(Frame::StatusReport {
                id,
                snapshot: StatusSnapshot {
                    locked,
                    frequency_hz,
                    error_flags,
                    firmware_tick_ms,
                    received_at: Utc::now(),
                },
            })
        }
        (TYPE_NACK, 1) => Some(Frame::Nack {
            id,
            reason: payload[0],
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn all_requests() -> Vec<CommandRequest> {
        vec![
            CommandRequest {
                id: 1,
                op: CommandOp::SetParameter(2.405e9),
            },
            CommandRequest {
                id: 2,
                op: CommandOp::StartSweep(SweepPlan {
                    start_hz: 2.4e9,
                    stop_hz: 2.42e9,
                    step_hz: 5.0e6,
                    dwell: Duration::from_millis(50),
                }),
            },
            CommandRequest {
                id: 3,
                op: CommandOp::StopSweep,
            },
            CommandRequest {
                id: 4,
                op: CommandOp::QueryStatus,
            },
            CommandRequest {
                id: 5,
                op: CommandOp::Disconnect,
            },
        ]
    }

    #[test]
    fn test_request_round_trip_all_variants() {
        let mut decoder = Decoder::new();
        for request in all_requests() {
            let frames = decoder.feed(&encode(&request));
            assert_eq!(frames, vec![Frame::Request(request)]);
        }
        assert_eq!(decoder.malformed_frames(), 0);
    }

    #[test]
    fn test_response_round_trip() {
        let mut decoder = Decoder::new();

        assert_eq!(decoder.feed(&encode_ack(9)), vec![Frame::Ack(9)]);
        assert_eq!(
            decoder.feed(&encode_nack(10, NACK_INTERNAL)),
            vec![Frame::Nack {
                id: 10,
                reason: NACK_INTERNAL
            }]
        );

        let snapshot = StatusSnapshot {
            locked: true,
            frequency_hz: 2.41e9,
            error_flags: 0x04,
            firmware_tick_ms: 123_456,
            received_at: Utc::now(),
        };
        let frames = decoder.feed(&encode_status(11, &snapshot));
        match &frames[..] {
            [Frame::StatusReport { id, snapshot: s }] => {
                assert_eq!(*id, 11);
                assert!(s.locked);
                assert_eq!(s.frequency_hz, 2.41e9);
                assert_eq!(s.error_flags, 0x04);
                assert_eq!(s.firmware_tick_ms, 123_456);
            }
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[test]
    fn test_split_frame_reassembled_across_feeds() {
        let request = CommandRequest {
            id: 77,
            op: CommandOp::SetParameter(1.0e9),
        };
        let bytes = encode(&request);

        let mut decoder = Decoder::new();
        assert!(decoder.feed(&bytes[..3]).is_empty());
        assert!(decoder.feed(&bytes[3..7]).is_empty());
        let frames = decoder.feed(&bytes[7..]);
        assert_eq!(frames, vec![Frame::Request(request)]);
        assert_eq!(decoder.malformed_frames(), 0);
    }

    #[test]
    fn test_garbage_before_frame_is_skipped_and_counted() {
        let mut decoder = Decoder::new();
        let mut bytes = vec![0x00, 0xFF, 0x42];
        bytes.extend_from_slice(&encode_ack(5));

        let frames = decoder.feed(&bytes);
        assert_eq!(frames, vec![Frame::Ack(5)]);
        assert_eq!(decoder.malformed_frames(), 1);
    }

    #[test]
    fn test_corrupt_checksum_dropped_then_resync() {
        let mut corrupted = encode_ack(6);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        corrupted.extend_from_slice(&encode_ack(7));

        let mut decoder = Decoder::new();
        let frames = decoder.feed(&corrupted);
        // The corrupted frame is dropped, the following good frame decodes.
        assert_eq!(frames, vec![Frame::Ack(7)]);
        assert!(decoder.malformed_frames() >= 1);
    }

    #[test]
    fn test_unknown_type_counted() {
        let bytes = frame_bytes(0x7F, 1, &[]);
        let mut decoder = Decoder::new();
        assert!(decoder.feed(&bytes).is_empty());
        assert_eq!(decoder.malformed_frames(), 1);
    }
}
