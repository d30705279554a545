//! Host-side control core for a serial PLL synthesizer.
//!
//! This library is the real-time layer between an operator interface and a
//! microcontroller-driven RF synthesizer on a serial link. The MCU owns
//! timing and loop operation; this side only requests actions and
//! synchronizes with device-reported status. The GUI never talks to the
//! serial port directly: it submits [`messages::CommandRequest`]s through the
//! [`session::RfLink`] handle and observes published
//! [`snapshot::StatusSnapshot`]s and [`session::SessionState`] transitions.

pub mod config;
pub mod error;
pub mod messages;
pub mod poll;
pub mod protocol;
pub mod session;
pub mod snapshot;
pub mod sweep;
pub mod transport;
