//! Response-paced status polling.
//!
//! The poll loop never free-runs on a host timer: each round asks the
//! supervisor to issue one `QueryStatus` and waits for the routed outcome,
//! and only then sleeps the configured interval before the next round. The
//! device therefore paces the host, and there is structurally never more
//! than one outstanding poll.
//!
//! A consecutive-miss counter turns individual timeouts (absorbed here) into
//! an aggregate [`PollHealth::Unresponsive`] signal once the configured
//! threshold is crossed; the first success afterwards signals
//! [`PollHealth::Responsive`].

use std::time::Duration;

use tokio::sync::mpsc;

use crate::messages::{PollHealth, PollOutcome, PollRequest};
use crate::snapshot::StatusFeed;

pub struct PollLoop {
    poll_tx: mpsc::Sender<PollRequest>,
    health_tx: mpsc::Sender<PollHealth>,
    feed: StatusFeed,
    interval: Duration,
    miss_threshold: u32,
}

impl PollLoop {
    pub fn new(
        poll_tx: mpsc::Sender<PollRequest>,
        health_tx: mpsc::Sender<PollHealth>,
        feed: StatusFeed,
        interval: Duration,
        miss_threshold: u32,
    ) -> Self {
        Self {
            poll_tx,
            health_tx,
            feed,
            interval,
            miss_threshold,
        }
    }

    /// Runs until the supervisor goes away.
    pub async fn run(self) {
        let mut misses: u32 = 0;
        let mut degraded = false;

        log::debug!(
            "Poll loop started (interval {:?}, miss threshold {})",
            self.interval,
            self.miss_threshold
        );

        loop {
            let (request, outcome_rx) = PollRequest::new();
            if self.poll_tx.send(request).await.is_err() {
                break;
            }

            match outcome_rx.await {
                Ok(PollOutcome::Status(snapshot)) => {
                    self.feed.publish(snapshot);
                    if degraded {
                        degraded = false;
                        if self.health_tx.send(PollHealth::Responsive).await.is_err() {
                            break;
                        }
                    }
                    misses = 0;
                }
                Ok(PollOutcome::Acked) => {
                    // Alive but no report; still clears the miss streak.
                    if degraded {
                        degraded = false;
                        if self.health_tx.send(PollHealth::Responsive).await.is_err() {
                            break;
                        }
                    }
                    misses = 0;
                }
                Ok(PollOutcome::Timeout) => {
                    misses += 1;
                    log::warn!(
                        "Status poll timed out ({}/{} consecutive)",
                        misses,
                        self.miss_threshold
                    );
                    if !degraded && misses >= self.miss_threshold {
                        degraded = true;
                        if self
                            .health_tx
                            .send(PollHealth::Unresponsive)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Ok(PollOutcome::Closed) | Err(_) => break,
            }

            // Pacing measured from the outcome, not from issuance. Cut the
            // sleep short when the supervisor goes away so shutdown never
            // waits out a long interval.
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.poll_tx.closed() => break,
            }
        }

        log::debug!("Poll loop stopped");
    }
}
