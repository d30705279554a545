//! Host-driven frequency sweep engine.
//!
//! The engine is a pure state machine; all I/O and scheduling belongs to the
//! session supervisor, which drives it through `next_step`/`on_ack`/
//! `on_dwell_elapsed`. Dwell is measured from the device's acknowledgment,
//! not from command issuance, so the host never outruns firmware readiness.
//!
//! States: Idle → Armed (`start`) → Stepping (`grant`) → Dwelling (`on_ack`)
//! → Stepping/Completed (`on_dwell_elapsed`), with `abort` reachable from
//! every active state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{RfError, RfResult};

/// A validated sweep over `[start_hz, stop_hz]` in `step_hz` increments,
/// holding `dwell` at each value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPlan {
    pub start_hz: f64,
    pub stop_hz: f64,
    pub step_hz: f64,
    pub dwell: Duration,
}

impl SweepPlan {
    /// Validates bounds and direction, clamping the dwell up to the
    /// firmware-enforced minimum so status polling is never starved.
    pub fn validated(&self, min_dwell: Duration) -> RfResult<SweepPlan> {
        if !(self.start_hz.is_finite() && self.stop_hz.is_finite() && self.step_hz.is_finite()) {
            return Err(RfError::InvalidPlan("non-finite sweep bounds".into()));
        }
        if self.start_hz <= 0.0 || self.stop_hz <= 0.0 {
            return Err(RfError::InvalidPlan("frequencies must be positive".into()));
        }
        if self.step_hz == 0.0 {
            return Err(RfError::InvalidPlan("step must be non-zero".into()));
        }
        if self.start_hz < self.stop_hz && self.step_hz < 0.0 {
            return Err(RfError::InvalidPlan(
                "ascending range requires a positive step".into(),
            ));
        }
        if self.start_hz > self.stop_hz && self.step_hz > 0.0 {
            return Err(RfError::InvalidPlan(
                "descending range requires a negative step".into(),
            ));
        }

        let mut plan = self.clone();
        plan.dwell = plan.dwell.max(min_dwell);
        Ok(plan)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Armed,
    Stepping,
    Dwelling,
    Completed,
    Aborted,
}

/// Sweep controller, owned and driven by the session supervisor.
pub struct SweepEngine {
    state: SweepState,
    plan: Option<SweepPlan>,
    current_hz: f64,
    step_issued: bool,
    dwell_until: Option<Instant>,
}

impl SweepEngine {
    pub fn new() -> Self {
        Self {
            state: SweepState::Idle,
            plan: None,
            current_hz: 0.0,
            step_issued: false,
            dwell_until: None,
        }
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    /// True while a sweep holds the device (Armed, Stepping, or Dwelling).
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SweepState::Armed | SweepState::Stepping | SweepState::Dwelling
        )
    }

    /// Idle → Armed. Validates the plan before any device interaction.
    pub fn start(&mut self, plan: SweepPlan, min_dwell: Duration) -> RfResult<()> {
        if self.is_active() {
            return Err(RfError::InvalidPlan("a sweep is already active".into()));
        }
        let plan = plan.validated(min_dwell)?;
        log::info!(
            "Sweep armed: {:.0} Hz -> {:.0} Hz, step {:.0} Hz, dwell {:?}",
            plan.start_hz,
            plan.stop_hz,
            plan.step_hz,
            plan.dwell
        );
        self.current_hz = plan.start_hz;
        self.plan = Some(plan);
        self.step_issued = false;
        self.dwell_until = None;
        self.state = SweepState::Armed;
        Ok(())
    }

    /// Armed → Stepping. The supervisor grants control once the device is
    /// not mid-command.
    pub fn grant(&mut self) {
        if self.state == SweepState::Armed {
            log::info!("Sweep started");
            self.state = SweepState::Stepping;
        }
    }

    /// Returns the value to command next, at most once per step. The
    /// supervisor issues it as a `SetParameter` when the in-flight slot is
    /// free.
    pub fn next_step(&mut self) -> Option<f64> {
        if self.state == SweepState::Stepping && !self.step_issued {
            self.step_issued = true;
            Some(self.current_hz)
        } else {
            None
        }
    }

    /// Stepping → Dwelling, with the dwell clock starting at the device's
    /// acknowledgment time.
    pub fn on_ack(&mut self, acked_at: Instant) {
        if self.state == SweepState::Stepping && self.step_issued {
            let dwell = self
                .plan
                .as_ref()
                .map(|p| p.dwell)
                .unwrap_or_default();
            self.dwell_until = Some(acked_at + dwell);
            self.state = SweepState::Dwelling;
        }
    }

    /// The instant the current dwell expires, while Dwelling.
    pub fn dwell_deadline(&self) -> Option<Instant> {
        match self.state {
            SweepState::Dwelling => self.dwell_until,
            _ => None,
        }
    }

    /// Dwelling → Stepping (next value) or Completed (stop bound reached).
    ///
    /// The boundary is inclusive: the step that lands on or overshoots the
    /// stop value has already been visited when this decides to complete.
    pub fn on_dwell_elapsed(&mut self) {
        if self.state != SweepState::Dwelling {
            return;
        }
        self.dwell_until = None;

        let Some(plan) = self.plan.as_ref() else {
            self.state = SweepState::Idle;
            return;
        };

        let reached_stop = if plan.step_hz > 0.0 {
            self.current_hz >= plan.stop_hz
        } else {
            self.current_hz <= plan.stop_hz
        };

        if reached_stop {
            log::info!("Sweep complete at {:.0} Hz", self.current_hz);
            self.plan = None;
            self.state = SweepState::Completed;
        } else {
            self.current_hz += plan.step_hz;
            self.step_issued = false;
            self.state = SweepState::Stepping;
        }
    }

    /// Any active state → Aborted. The device is left at the last
    /// successfully set value; no further steps are issued.
    pub fn abort(&mut self, reason: &str) {
        if self.is_active() {
            log::info!("Sweep aborted: {}", reason);
            self.plan = None;
            self.dwell_until = None;
            self.state = SweepState::Aborted;
        }
    }
}

impl Default for SweepEngine {
    fn default() -> Self {
        Self::new()
    }
}
