//! Session supervisor: the single owner of the device link.
//!
//! The supervisor is a single-task actor: it alone owns the
//! transport, the codec, the sweep engine, and the in-flight request slot,
//! and everything else talks to it over channels. That single-threaded
//! arbitration is what enforces the core invariant (at most one command in
//! flight at any instant) without any locking of shared device state.
//!
//! Priority when the slot is free: sweep steps, then the queued ad-hoc
//! command, then a pending status poll. An issued request is never
//! preempted; cancellation (StopSweep, Disconnect) is cooperative and takes
//! effect at the next control tick, after the in-flight request resolves.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Settings;
use crate::error::{RfError, RfResult};
use crate::messages::{
    CommandOp, CommandRequest, CorrelationId, PollHealth, PollOutcome, PollRequest,
};
use crate::poll::PollLoop;
use crate::protocol::{self, Decoder, Frame};
use crate::snapshot::{StatusFeed, StatusSnapshot};
use crate::sweep::{SweepEngine, SweepState};
use crate::transport::Transport;

/// Lifecycle of the one device session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Repeated unresponsiveness without a fatal fault. Still accepts
    /// StopSweep/Disconnect; rejects new SetParameter/StartSweep.
    Degraded,
    Disconnecting,
    /// Fatal fault. No automatic reconnect; the operator must act.
    Failed(String),
}

/// Which component issued the in-flight request; responses route back here.
#[derive(Debug)]
enum RequestOrigin {
    Sweep,
    Queue,
    Poll {
        reply: tokio::sync::oneshot::Sender<PollOutcome>,
    },
}

/// A command awaiting device acknowledgment. Exactly one exists at a time,
/// and it is resolved exactly once: ack, nack, timeout, or session teardown.
#[derive(Debug)]
struct InFlightRequest {
    id: CorrelationId,
    origin: RequestOrigin,
    issued_at: Instant,
    deadline: Instant,
    attempts: u32,
}

/// One open connection: the transport handle, the codec's partial-frame
/// buffer, and the last-known device facts.
struct DeviceSession {
    transport: Box<dyn Transport>,
    decoder: Decoder,
    last_status: Option<StatusSnapshot>,
    last_acked: CorrelationId,
}

pub struct SessionSupervisor {
    session: DeviceSession,
    settings: Settings,
    sweep: SweepEngine,

    state_tx: watch::Sender<SessionState>,
    sweep_state_tx: watch::Sender<SweepState>,
    feed: StatusFeed,

    queue_rx: mpsc::Receiver<CommandRequest>,
    poll_rx: mpsc::Receiver<PollRequest>,
    health_rx: mpsc::Receiver<PollHealth>,

    next_id: Arc<AtomicU32>,
    in_flight: Option<InFlightRequest>,
    /// Dequeued ad-hoc command waiting for the wire slot.
    pending_wire: Option<CommandRequest>,
    /// Poll round waiting for the wire slot.
    pending_poll: Option<PollRequest>,
    disconnecting: bool,
}

impl SessionSupervisor {
    fn alloc_id(&self) -> CorrelationId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                log::info!("Session state: {:?} -> {:?}", current, state);
                *current = state;
                true
            }
        });
    }

    fn publish_sweep_state(&self) {
        let state = self.sweep.state();
        self.sweep_state_tx
            .send_if_modified(|current| std::mem::replace(current, state) != state);
    }

    /// Main control loop. Exits on disconnect, fatal fault, or when every
    /// producer handle is gone.
    pub async fn run(mut self) {
        loop {
            if let Err(err) = self.issue_next().await {
                self.fail(err).await;
                break;
            }
            if self.disconnecting && self.in_flight.is_none() {
                self.teardown().await;
                break;
            }
            self.publish_sweep_state();

            let far = Instant::now() + Duration::from_secs(3600);
            let request_deadline = self.in_flight.as_ref().map_or(far, |r| r.deadline);
            let dwell_deadline = self.sweep.dwell_deadline().unwrap_or(far);

            let step = tokio::select! {
                biased;
                _ = tokio::time::sleep_until(request_deadline), if self.in_flight.is_some() => {
                    self.on_request_timeout();
                    Ok(())
                }
                _ = tokio::time::sleep_until(dwell_deadline), if self.sweep.dwell_deadline().is_some() => {
                    self.sweep.on_dwell_elapsed();
                    Ok(())
                }
                health = self.health_rx.recv() => {
                    if let Some(health) = health {
                        self.on_poll_health(health);
                    }
                    Ok(())
                }
                request = self.poll_rx.recv(), if self.pending_poll.is_none() => {
                    self.pending_poll = request;
                    Ok(())
                }
                command = self.queue_rx.recv(), if self.pending_wire.is_none() && !self.disconnecting => {
                    match command {
                        Some(command) => {
                            self.on_queue_command(command);
                            Ok(())
                        }
                        None => {
                            // Every handle dropped: treat as a disconnect
                            // request so the port is always released.
                            self.begin_disconnect("all command producers dropped");
                            Ok(())
                        }
                    }
                }
                _ = tokio::time::sleep(self.settings.read_tick()) => {
                    self.drain_transport().await
                }
            };

            if let Err(err) = step {
                self.fail(err).await;
                break;
            }
        }
    }

    /// Arbitration: fills the single in-flight slot from the highest
    /// priority source. No-op while a request is outstanding or the session
    /// is winding down.
    async fn issue_next(&mut self) -> RfResult<()> {
        if self.in_flight.is_some() || self.disconnecting {
            return Ok(());
        }

        if self.state() == SessionState::Connected {
            // The slot is free, so the device is not mid-command: an armed
            // sweep may take control now.
            self.sweep.grant();
            if let Some(hz) = self.sweep.next_step() {
                let id = self.alloc_id();
                let request = CommandRequest {
                    id,
                    op: CommandOp::SetParameter(hz),
                };
                return self.issue(request, RequestOrigin::Sweep).await;
            }
        }

        if let Some(request) = self.pending_wire.take() {
            return self.issue(request, RequestOrigin::Queue).await;
        }

        if let Some(poll) = self.pending_poll.take() {
            let id = self.alloc_id();
            let request = CommandRequest {
                id,
                op: CommandOp::QueryStatus,
            };
            return self
                .issue(request, RequestOrigin::Poll { reply: poll.reply })
                .await;
        }

        Ok(())
    }

    async fn issue(&mut self, request: CommandRequest, origin: RequestOrigin) -> RfResult<()> {
        let bytes = protocol::encode(&request);
        self.session.transport.write(&bytes).await?;

        let now = Instant::now();
        log::debug!("Issued {:?}", request);
        self.in_flight = Some(InFlightRequest {
            id: request.id,
            origin,
            issued_at: now,
            deadline: now + self.settings.response_timeout(),
            attempts: 1,
        });
        Ok(())
    }

    fn on_queue_command(&mut self, command: CommandRequest) {
        let degraded = self.state() == SessionState::Degraded;
        match command.op {
            CommandOp::StartSweep(plan) => {
                if degraded {
                    log::warn!("StartSweep rejected: device unresponsive");
                    return;
                }
                if let Err(err) = self.sweep.start(plan, self.settings.min_dwell()) {
                    log::warn!("StartSweep rejected: {}", err);
                }
            }
            CommandOp::StopSweep => {
                self.sweep.abort("stop requested");
            }
            CommandOp::Disconnect => {
                self.begin_disconnect("disconnect requested");
            }
            CommandOp::SetParameter(_) => {
                if degraded {
                    log::warn!("SetParameter rejected: device unresponsive");
                    return;
                }
                self.pending_wire = Some(command);
            }
            CommandOp::QueryStatus => {
                // Ad-hoc queries stay allowed in Degraded; a success is what
                // recovers the session.
                self.pending_wire = Some(command);
            }
        }
    }

    fn begin_disconnect(&mut self, reason: &str) {
        if self.disconnecting {
            return;
        }
        log::info!("Disconnecting: {}", reason);
        self.disconnecting = true;
        self.sweep.abort(reason);
        self.set_state(SessionState::Disconnecting);
        // The in-flight request, if any, is allowed to resolve (ack or
        // timeout) before teardown runs.
    }

    fn on_poll_health(&mut self, health: PollHealth) {
        match (health, self.state()) {
            (PollHealth::Unresponsive, SessionState::Connected) => {
                self.set_state(SessionState::Degraded);
            }
            (PollHealth::Responsive, SessionState::Degraded) => {
                self.set_state(SessionState::Connected);
            }
            _ => {}
        }
    }

    async fn drain_transport(&mut self) -> RfResult<()> {
        let mut buf = Vec::new();
        if self.session.transport.try_read(&mut buf).await? == 0 {
            return Ok(());
        }
        let frames = self.session.decoder.feed(&buf);
        for frame in frames {
            self.on_frame(frame);
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Ack(id) => {
                let Some(request) = self.take_in_flight(id) else {
                    log::debug!("Stale ack for request {}", id);
                    return;
                };
                self.session.last_acked = id;
                match request.origin {
                    RequestOrigin::Sweep => self.sweep.on_ack(Instant::now()),
                    RequestOrigin::Queue => {}
                    RequestOrigin::Poll { reply } => {
                        let _ = reply.send(PollOutcome::Acked);
                    }
                }
            }
            Frame::StatusReport { id, snapshot } => {
                self.session.last_status = Some(snapshot.clone());
                match self.take_in_flight(id) {
                    Some(request) => {
                        self.session.last_acked = id;
                        match request.origin {
                            // The poll loop publishes its own outcomes.
                            RequestOrigin::Poll { reply } => {
                                let _ = reply.send(PollOutcome::Status(snapshot));
                            }
                            RequestOrigin::Queue => self.feed.publish(snapshot),
                            RequestOrigin::Sweep => {
                                self.feed.publish(snapshot);
                                self.sweep.on_ack(Instant::now());
                            }
                        }
                    }
                    // Firmware-pushed status without a matching request.
                    None => self.feed.publish(snapshot),
                }
            }
            Frame::Nack { id, reason } => {
                let Some(request) = self.take_in_flight(id) else {
                    log::debug!("Stale nack for request {}", id);
                    return;
                };
                log::warn!("Request {} rejected by device (reason 0x{:02X})", id, reason);
                match request.origin {
                    RequestOrigin::Sweep => self.sweep.abort("device rejected sweep step"),
                    RequestOrigin::Queue => {}
                    RequestOrigin::Poll { reply } => {
                        // The device is alive; a nack is not a miss.
                        let _ = reply.send(PollOutcome::Acked);
                    }
                }
            }
            Frame::Request(request) => {
                log::debug!("Ignoring host-direction frame on inbound link: {:?}", request);
            }
        }
    }

    fn take_in_flight(&mut self, id: CorrelationId) -> Option<InFlightRequest> {
        if self.in_flight.as_ref().map(|r| r.id) == Some(id) {
            self.in_flight.take()
        } else {
            None
        }
    }

    fn on_request_timeout(&mut self) {
        let Some(request) = self.in_flight.take() else {
            return;
        };
        log::warn!(
            "Request {} timed out after {:?} ({} attempt)",
            request.id,
            request.issued_at.elapsed(),
            request.attempts
        );
        match request.origin {
            // Timeouts aggregate into the poll loop's miss counter; a single
            // one is absorbed here.
            RequestOrigin::Poll { reply } => {
                let _ = reply.send(PollOutcome::Timeout);
            }
            RequestOrigin::Sweep => self.sweep.abort("sweep step timed out"),
            RequestOrigin::Queue => {}
        }
    }

    fn resolve_pending_closed(&mut self) {
        if let Some(request) = self.in_flight.take() {
            if let RequestOrigin::Poll { reply } = request.origin {
                let _ = reply.send(PollOutcome::Closed);
            }
        }
        if let Some(poll) = self.pending_poll.take() {
            let _ = poll.reply.send(PollOutcome::Closed);
        }
    }

    async fn fail(&mut self, err: RfError) {
        log::error!("Session failed: {}", err);
        self.sweep.abort("session failure");
        self.publish_sweep_state();
        self.resolve_pending_closed();
        let _ = self.session.transport.disconnect().await;
        self.set_state(SessionState::Failed(err.to_string()));
    }

    async fn teardown(&mut self) {
        self.resolve_pending_closed();
        self.publish_sweep_state();
        if let Err(err) = self.session.transport.disconnect().await {
            log::warn!("Error releasing transport: {}", err);
        }
        match &self.session.last_status {
            Some(status) => log::info!(
                "Disconnected (last acked command {}, device at {:.3} MHz, locked={})",
                self.session.last_acked,
                status.frequency_hz / 1e6,
                status.locked
            ),
            None => log::info!(
                "Disconnected (last acked command {})",
                self.session.last_acked
            ),
        }
        self.set_state(SessionState::Disconnected);
    }
}

/// GUI-facing handle to one device session.
///
/// Cloneable producers may call [`submit`](RfLink::submit) from any thread;
/// snapshots and state changes come back through watch subscriptions, so the
/// GUI never blocks on device I/O.
pub struct RfLink {
    queue_tx: mpsc::Sender<CommandRequest>,
    state_rx: watch::Receiver<SessionState>,
    sweep_state_rx: watch::Receiver<SweepState>,
    feed: StatusFeed,
    next_id: Arc<AtomicU32>,
    supervisor: JoinHandle<()>,
    poll_task: JoinHandle<()>,
}

impl RfLink {
    /// Connects over an already-built transport and starts the supervisor
    /// and poll loop tasks.
    ///
    /// A connect-time failure is returned to the caller and is never retried
    /// automatically.
    pub async fn connect(
        mut transport: Box<dyn Transport>,
        settings: Settings,
    ) -> RfResult<Self> {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        if let Err(err) = transport.connect().await {
            log::error!("Connect failed: {}", err);
            return Err(err);
        }
        state_tx.send_replace(SessionState::Connected);

        let (sweep_state_tx, sweep_state_rx) = watch::channel(SweepState::Idle);
        let (queue_tx, queue_rx) = mpsc::channel(settings.link.command_queue_capacity);
        let (poll_tx, poll_rx) = mpsc::channel(1);
        let (health_tx, health_rx) = mpsc::channel(4);
        let feed = StatusFeed::new();
        let next_id = Arc::new(AtomicU32::new(1));

        let poll_loop = PollLoop::new(
            poll_tx,
            health_tx,
            feed.clone(),
            settings.poll_interval(),
            settings.poll.miss_threshold,
        );
        let poll_task = tokio::spawn(poll_loop.run());

        let supervisor = SessionSupervisor {
            session: DeviceSession {
                transport,
                decoder: Decoder::new(),
                last_status: None,
                last_acked: 0,
            },
            settings,
            sweep: SweepEngine::new(),
            state_tx,
            sweep_state_tx,
            feed: feed.clone(),
            queue_rx,
            poll_rx,
            health_rx,
            next_id: next_id.clone(),
            in_flight: None,
            pending_wire: None,
            pending_poll: None,
            disconnecting: false,
        };
        let supervisor = tokio::spawn(supervisor.run());

        Ok(Self {
            queue_tx,
            state_rx,
            sweep_state_rx,
            feed,
            next_id,
            supervisor,
            poll_task,
        })
    }

    /// Convenience constructor over a serial port named in `settings`.
    pub async fn open_serial(port_name: &str, settings: Settings) -> RfResult<Self> {
        let transport = crate::transport::SerialTransport::new(port_name, settings.serial.clone());
        Self::connect(Box::new(transport), settings).await
    }

    /// Enqueues a request. Never blocks: a full queue fails with
    /// `Backpressure`, and requests the session cannot honor are rejected
    /// here before touching the queue.
    pub fn submit(&self, op: CommandOp) -> RfResult<CorrelationId> {
        match self.session_state() {
            SessionState::Disconnected | SessionState::Failed(_) => {
                return Err(RfError::SessionClosed)
            }
            SessionState::Degraded
                if matches!(
                    op,
                    CommandOp::SetParameter(_) | CommandOp::StartSweep(_)
                ) =>
            {
                return Err(RfError::DeviceUnresponsive)
            }
            _ => {}
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = CommandRequest { id, op };
        self.queue_tx.try_send(request).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RfError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => RfError::SessionClosed,
        })?;
        Ok(id)
    }

    /// Non-blocking read of the latest published snapshot.
    pub fn current_snapshot(&self) -> Option<StatusSnapshot> {
        self.feed.latest()
    }

    pub fn session_state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn sweep_state(&self) -> SweepState {
        *self.sweep_state_rx.borrow()
    }

    /// Lazy, restartable stream of snapshot updates.
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Option<StatusSnapshot>> {
        self.feed.subscribe()
    }

    /// Lazy, restartable stream of session state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_sweep_state(&self) -> watch::Receiver<SweepState> {
        self.sweep_state_rx.clone()
    }

    /// Requests a disconnect and waits for the session tasks to finish.
    ///
    /// A full queue does not block shutdown: closing the queue is itself a
    /// disconnect signal to the supervisor.
    pub async fn shutdown(self) -> RfResult<()> {
        match self.submit(CommandOp::Disconnect) {
            Ok(_) | Err(RfError::SessionClosed) | Err(RfError::Backpressure) => {}
            Err(err) => return Err(err),
        }
        drop(self.queue_tx);
        let _ = self.supervisor.await;
        let _ = self.poll_task.await;
        Ok(())
    }
}
