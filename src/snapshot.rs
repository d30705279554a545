//! Published device status.
//!
//! A [`StatusSnapshot`] is an immutable, complete copy of the last decoded
//! device state. Snapshots are published through a `tokio::sync::watch`
//! channel: replacement is atomic and readers always see a whole snapshot,
//! never a partially updated one. Subscriptions are lazy and restartable:
//! a new subscriber immediately observes the latest value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Latest decoded device state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// PLL lock indicator.
    pub locked: bool,
    /// Current output frequency reported by the firmware.
    pub frequency_hz: f64,
    /// Raw firmware error flags (0 = clean).
    pub error_flags: u8,
    /// Firmware-side monotonic timing marker, in milliseconds.
    pub firmware_tick_ms: u32,
    /// Host receive time of the frame this snapshot was decoded from.
    pub received_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// True when the firmware reports any error flag.
    pub fn has_errors(&self) -> bool {
        self.error_flags != 0
    }
}

/// Shared publication point for snapshots. Cheap to clone; the poll loop and
/// the supervisor both publish through the same feed.
#[derive(Clone)]
pub struct StatusFeed {
    tx: watch::Sender<Option<StatusSnapshot>>,
}

impl StatusFeed {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Atomically replaces the published snapshot.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        // send_replace never fails; the sender keeps the value alive even
        // with zero subscribers.
        self.tx.send_replace(Some(snapshot));
    }

    /// Non-blocking read of the latest published snapshot, if any.
    pub fn latest(&self) -> Option<StatusSnapshot> {
        self.tx.borrow().clone()
    }

    /// New subscription starting from the current value.
    pub fn subscribe(&self) -> watch::Receiver<Option<StatusSnapshot>> {
        self.tx.subscribe()
    }
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(freq: f64) -> StatusSnapshot {
        StatusSnapshot {
            locked: true,
            frequency_hz: freq,
            error_flags: 0,
            firmware_tick_ms: 42,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_and_latest() {
        let feed = StatusFeed::new();
        assert!(feed.latest().is_none());

        feed.publish(snapshot(2.4e9));
        let latest = feed.latest().unwrap();
        assert_eq!(latest.frequency_hz, 2.4e9);
        assert!(latest.locked);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_latest() {
        let feed = StatusFeed::new();
        feed.publish(snapshot(1.0e9));
        feed.publish(snapshot(2.0e9));

        // A subscriber arriving after the fact still reads the final value.
        let rx = feed.subscribe();
        assert_eq!(rx.borrow().as_ref().unwrap().frequency_hz, 2.0e9);
    }
}
