//! Message types for the control core's message-passing seams.
//!
//! Three channels meet in the session supervisor: the GUI-facing command
//! queue carrying [`CommandRequest`]s, the poll loop's request/outcome pair
//! ([`PollRequest`]/[`PollOutcome`]), and the poll loop's health signal
//! ([`PollHealth`]). All state mutation happens inside the supervisor task;
//! producers only ever hold channel ends.

use tokio::sync::oneshot;

use crate::snapshot::StatusSnapshot;
use crate::sweep::SweepPlan;

/// Identifier correlating a request with the device frame that resolves it.
///
/// Assigned monotonically from a counter shared by the GUI handle and the
/// supervisor, so sweep steps, polls, and ad-hoc commands never collide.
pub type CorrelationId = u32;

/// The operation a [`CommandRequest`] asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOp {
    /// Set the synthesizer output parameter (frequency in Hz).
    SetParameter(f64),
    /// Arm and run a host-driven sweep. Acts on the sweep engine; the device
    /// only ever sees the resulting `SetParameter` steps.
    StartSweep(SweepPlan),
    /// Abort any active sweep, leaving the device at its last set value.
    StopSweep,
    /// Request a one-off status report.
    QueryStatus,
    /// Tear the session down and release the serial port.
    Disconnect,
}

/// A user-issued request. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub id: CorrelationId,
    pub op: CommandOp,
}

/// Resolution of one poll round, routed back to the poll loop.
#[derive(Debug)]
pub enum PollOutcome {
    /// The device answered with a status report.
    Status(StatusSnapshot),
    /// The device acknowledged without a report (still counts as alive).
    Acked,
    /// No resolution within the per-request deadline.
    Timeout,
    /// The session ended; the poll loop should exit.
    Closed,
}

/// One poll round requested by the poll loop. The supervisor owns the wire;
/// the poll loop only asks and waits, which is what keeps at most one poll
/// outstanding at a time.
#[derive(Debug)]
pub struct PollRequest {
    pub reply: oneshot::Sender<PollOutcome>,
}

impl PollRequest {
    pub fn new() -> (Self, oneshot::Receiver<PollOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { reply: tx }, rx)
    }
}

/// Aggregate health signal from the poll loop's consecutive-miss counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollHealth {
    /// Miss threshold crossed: the supervisor should enter Degraded.
    Unresponsive,
    /// A poll succeeded after misses: the supervisor may return to Connected.
    Responsive,
}
