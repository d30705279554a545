//! End-to-end session scenarios over the scripted mock device.
//!
//! These drive the public `RfLink` handle only: commands go through the
//! queue, results come back through the published snapshots, the session
//! state watch, and the mock device's command log.

use std::time::Duration;

use rf_link::config::Settings;
use rf_link::messages::CommandOp;
use rf_link::session::{RfLink, SessionState};
use rf_link::sweep::{SweepPlan, SweepState};
use rf_link::transport::{MockDeviceHandle, MockTransport};

const WAIT: Duration = Duration::from_secs(5);

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.link.response_timeout_ms = 50;
    settings.link.read_tick_ms = 2;
    settings.poll.interval_ms = 10;
    settings.poll.miss_threshold = 3;
    settings.sweep.min_dwell_ms = 10;
    settings
}

async fn connect_mock(settings: Settings) -> (RfLink, MockDeviceHandle) {
    let (transport, handle) = MockTransport::new();
    let link = RfLink::connect(Box::new(transport), settings)
        .await
        .unwrap();
    (link, handle)
}

fn plan(start: f64, stop: f64, step: f64, dwell_ms: u64) -> SweepPlan {
    SweepPlan {
        start_hz: start,
        stop_hz: stop,
        step_hz: step,
        dwell: Duration::from_millis(dwell_ms),
    }
}

async fn wait_sweep_state(link: &RfLink, expected: SweepState) {
    let mut rx = link.subscribe_sweep_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for sweep state {expected:?}"))
        .unwrap();
}

#[tokio::test]
async fn test_status_polling_publishes_snapshots() {
    let (link, _handle) = connect_mock(test_settings()).await;

    let mut snapshots = link.subscribe_snapshots();
    let snapshot = tokio::time::timeout(WAIT, snapshots.wait_for(|s| s.is_some()))
        .await
        .expect("no snapshot published")
        .unwrap()
        .clone()
        .unwrap();

    assert!(snapshot.locked);
    assert_eq!(link.session_state(), SessionState::Connected);
    assert!(link.current_snapshot().is_some());

    link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sweep_2400_to_2420_mhz_step_5_dwell_50ms() {
    let (link, handle) = connect_mock(test_settings()).await;

    link.submit(CommandOp::StartSweep(plan(2.4e9, 2.42e9, 5.0e6, 50)))
        .unwrap();
    wait_sweep_state(&link, SweepState::Completed).await;

    let steps = handle.set_parameter_log();
    let values: Vec<f64> = steps.iter().map(|(_, hz)| *hz).collect();
    assert_eq!(values, vec![2.4e9, 2.405e9, 2.41e9, 2.415e9, 2.42e9]);

    // Dwell is measured from the device acknowledgment: each step arrives
    // at least one dwell after the previous one was acked.
    for pair in steps.windows(2) {
        let held = pair[1].0.duration_since(pair[0].0);
        assert!(
            held >= Duration::from_millis(50),
            "dwell violated: held only {held:?}"
        );
    }

    link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_zero_length_sweep_issues_exactly_one_step() {
    let (link, handle) = connect_mock(test_settings()).await;

    link.submit(CommandOp::StartSweep(plan(1.0e9, 1.0e9, 1.0e6, 20)))
        .unwrap();
    wait_sweep_state(&link, SweepState::Completed).await;

    assert_eq!(handle.set_parameter_log().len(), 1);
    assert_eq!(handle.frequency_hz(), 1.0e9);

    link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_sweep_leaves_last_value() {
    let (link, handle) = connect_mock(test_settings()).await;

    // Long dwell so the stop lands mid-sweep.
    link.submit(CommandOp::StartSweep(plan(1.0e9, 2.0e9, 0.1e9, 300)))
        .unwrap();

    // Wait for the first step to reach the device.
    tokio::time::timeout(WAIT, async {
        while handle.set_parameter_log().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no sweep step issued");

    link.submit(CommandOp::StopSweep).unwrap();
    wait_sweep_state(&link, SweepState::Aborted).await;

    let issued = handle.set_parameter_log().len();
    let frequency = handle.frequency_hz();
    tokio::time::sleep(Duration::from_millis(400)).await;

    // No further steps after the abort; the device stays where it was.
    assert_eq!(handle.set_parameter_log().len(), issued);
    assert_eq!(handle.frequency_hz(), frequency);

    link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_mid_sweep_aborts_and_preserves_value() {
    let (link, handle) = connect_mock(test_settings()).await;

    link.submit(CommandOp::StartSweep(plan(1.0e9, 2.0e9, 0.1e9, 300)))
        .unwrap();
    tokio::time::timeout(WAIT, async {
        while handle.set_parameter_log().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no sweep step issued");

    let mut states = link.subscribe_state();
    link.submit(CommandOp::Disconnect).unwrap();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == SessionState::Disconnected))
        .await
        .expect("never disconnected")
        .unwrap();

    assert_eq!(link.sweep_state(), SweepState::Aborted);

    let issued = handle.set_parameter_log().len();
    let frequency = handle.frequency_hz();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.set_parameter_log().len(), issued);
    assert_eq!(handle.frequency_hz(), frequency);

    link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ad_hoc_set_parameter_reaches_device() {
    let (link, handle) = connect_mock(test_settings()).await;

    link.submit(CommandOp::SetParameter(1.5e9)).unwrap();

    // The new value shows up on the device and, via polling, in snapshots.
    let mut snapshots = link.subscribe_snapshots();
    tokio::time::timeout(
        WAIT,
        snapshots.wait_for(|s| {
            s.as_ref()
                .map(|snap| snap.frequency_hz == 1.5e9)
                .unwrap_or(false)
        }),
    )
    .await
    .expect("snapshot never reflected new frequency")
    .unwrap();
    assert_eq!(handle.frequency_hz(), 1.5e9);

    link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_plan_never_reaches_device() {
    let (link, handle) = connect_mock(test_settings()).await;

    // Zero step is rejected at the sweep engine boundary.
    link.submit(CommandOp::StartSweep(plan(1.0e9, 2.0e9, 0.0, 20)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(link.sweep_state(), SweepState::Idle);
    assert!(handle.set_parameter_log().is_empty());

    link.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_single_in_flight_request() {
    let mut settings = test_settings();
    settings.link.response_timeout_ms = 200;
    settings.poll.interval_ms = 5;
    let (link, handle) = connect_mock(settings).await;

    // Let normal polling flow first.
    tokio::time::timeout(WAIT, async {
        while handle.commands().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no poll issued");

    // A mute device stops resolving requests. With a 200 ms per-request
    // deadline, at most one new request can be issued inside a 120 ms
    // window: the in-flight slot stays occupied until the timeout.
    handle.set_mute(true);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let baseline = handle.commands().len();

    link.submit(CommandOp::SetParameter(1.2e9)).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let issued = handle.commands().len() - baseline;
    assert!(issued <= 1, "expected at most one in-flight request, saw {issued}");

    handle.set_mute(false);
    link.shutdown().await.unwrap();
}
