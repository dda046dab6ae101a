//! End-to-end tests against the mock instrument: synchronous round trips,
//! framing faults, continuous acquisition and lifecycle stress.

mod common;

use common::{Corruption, MockConfig, MockInstrument};
use micropulse_lib::{DeviceConfig, DigitisationRate, Frame, MicroPulse, MpError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn connect(mock: &MockInstrument, mps: &str) -> MicroPulse {
    let config = DeviceConfig::new("127.0.0.1", mock.port(), format!("tests/data/{mps}"))
        .with_rate(DigitisationRate::Mhz50);
    let mut device = MicroPulse::new(config);
    device.setup(Duration::ZERO).await.expect("bring-up failed");
    device
}

/// Poll until a fresh frame arrives or the deadline passes.
async fn wait_for_frame(device: &MicroPulse, deadline: Duration) -> Option<Frame> {
    let start = Instant::now();
    let mut out = Frame::default();
    while start.elapsed() < deadline {
        if device.poll_frame(&mut out) {
            return Some(out);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    None
}

#[tokio::test]
async fn sync_round_trip_8_bit() {
    let mock = MockInstrument::start(MockConfig::new(1, 100, 5)).await;
    let mut device = connect(&mock, "bench_8bit.mps").await;

    device.acquire_once().await.unwrap();

    let frame = device.latest_frame().unwrap();
    assert_eq!(frame.sub_frames.len(), 5);
    assert_eq!(frame.digitisation_rate_mhz, 50);

    // Mock ramp: raw byte = 128 + ((7i + j) mod 100), so sub-frame 0
    // decodes to 0, 1, 2, ...
    let first = &frame.sub_frames[0];
    assert_eq!(first.header.test_number, 1);
    assert_eq!(first.header.format_code, 1);
    assert_eq!(first.samples().unwrap().len(), 100);
    assert_eq!(&first.samples().unwrap()[..10], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    assert_eq!(frame.max_amplitude, 99);

    assert_eq!(mock.resets.load(Ordering::SeqCst), 1);
    assert_eq!(mock.data_requests.load(Ordering::SeqCst), 1);
    // Every line of bench_8bit.mps was replayed and absorbed
    assert_eq!(mock.config_lines.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn sync_round_trip_16_bit() {
    let mock = MockInstrument::start(MockConfig::new(4, 2000, 61)).await;
    let mut device = connect(&mock, "roller_probe.mps").await;

    device.acquire_once().await.unwrap();

    let frame = device.latest_frame().unwrap();
    assert_eq!(frame.sub_frames.len(), 61);

    let first = &frame.sub_frames[0];
    assert_eq!(first.header.format_code, 4);
    assert_eq!(first.samples().unwrap().len(), 2000);
    assert_eq!(&first.samples().unwrap()[..10], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
}

#[tokio::test]
async fn repeated_sync_requests() {
    let mock = MockInstrument::start(MockConfig::new(1, 775, 49)).await;
    let mut device = connect(&mock, "immersion_8bit.mps").await;

    for iteration in 0..50 {
        device
            .acquire_once()
            .await
            .unwrap_or_else(|err| panic!("iteration {iteration}: {err}"));
    }

    assert_eq!(mock.data_requests.load(Ordering::SeqCst), 50);
    assert_eq!(device.latest_frame().unwrap().sub_frames.len(), 49);
}

#[tokio::test]
async fn format_mismatch_leaves_latest_frame_untouched() {
    let config = MockConfig::new(1, 100, 5).with_corruption(Corruption::FormatCode(4));
    let mock = MockInstrument::start(config).await;
    let mut device = connect(&mock, "bench_8bit.mps").await;

    let err = device.acquire_once().await.unwrap_err();
    assert!(matches!(
        err,
        MpError::FormatMismatch { index: 0, expected: 1, actual: 4 }
    ));
    assert!(device.latest_frame().is_none());
}

#[tokio::test]
async fn count_mismatch_is_a_framing_error() {
    let config = MockConfig::new(1, 100, 5).with_corruption(Corruption::DeclaredCount(50));
    let mock = MockInstrument::start(config).await;
    let mut device = connect(&mock, "bench_8bit.mps").await;

    let err = device.acquire_once().await.unwrap_err();
    assert!(matches!(
        err,
        MpError::CountMismatch { index: 0, expected: 108, actual: 50 }
    ));
}

#[tokio::test]
async fn short_frame_publishes_nothing() {
    let config = MockConfig::new(1, 100, 5).with_corruption(Corruption::TruncateAfter(3));
    let mock = MockInstrument::start(config).await;
    let mut device = connect(&mock, "bench_8bit.mps").await;

    let err = device.acquire_once().await.unwrap_err();
    assert!(matches!(err, MpError::UnexpectedSubFrame { index: 3, .. }));
    assert!(device.latest_frame().is_none());
}

#[tokio::test]
async fn async_continuity_and_restart() {
    let mock = MockInstrument::start(MockConfig::new(1, 100, 5)).await;
    let mut device = connect(&mock, "bench_8bit.mps").await;

    let valid = Arc::new(AtomicU32::new(0));
    let invalid = Arc::new(AtomicU32::new(0));
    let (valid_cb, invalid_cb) = (Arc::clone(&valid), Arc::clone(&invalid));
    device
        .start_async(Some(Box::new(move |ok| {
            if ok {
                valid_cb.fetch_add(1, Ordering::SeqCst);
            } else {
                invalid_cb.fetch_add(1, Ordering::SeqCst);
            }
        })))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while valid.load(Ordering::SeqCst) < 20 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(valid.load(Ordering::SeqCst) >= 20, "too few valid frames");
    assert_eq!(invalid.load(Ordering::SeqCst), 0);

    let stop_started = Instant::now();
    device.stop_async().await.unwrap();
    assert!(stop_started.elapsed() < Duration::from_millis(500));

    // The last frame survives the stop for one final take
    let mut out = Frame::default();
    assert!(device.poll_frame(&mut out));
    assert_eq!(out.sub_frames.len(), 5);

    // No further callbacks fire once stop has returned
    let after_stop = valid.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(valid.load(Ordering::SeqCst), after_stop);

    // Restarting on the same connection observes clean framing
    device.start_async(None).unwrap();
    let frame = wait_for_frame(&device, Duration::from_secs(5)).await;
    device.stop_async().await.unwrap();
    assert_eq!(frame.expect("no frame after restart").sub_frames.len(), 5);
}

#[tokio::test]
async fn rapid_start_stop_cycles_keep_framing_intact() {
    let mock = MockInstrument::start(MockConfig::new(1, 100, 5)).await;
    let mut device = connect(&mock, "bench_8bit.mps").await;

    for _ in 0..20 {
        device.start_async(None).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        device.stop_async().await.unwrap();
    }

    device.start_async(None).unwrap();
    let frame = wait_for_frame(&device, Duration::from_secs(5)).await;
    device.stop_async().await.unwrap();
    assert_eq!(frame.expect("no frame after stress").sub_frames.len(), 5);
}

#[tokio::test]
async fn start_async_twice_is_a_noop_and_stop_is_idempotent() {
    let mock = MockInstrument::start(MockConfig::new(1, 100, 5)).await;
    let mut device = connect(&mock, "bench_8bit.mps").await;

    device.start_async(None).unwrap();
    device.start_async(None).unwrap();

    assert!(wait_for_frame(&device, Duration::from_secs(5)).await.is_some());

    device.stop_async().await.unwrap();
    device.stop_async().await.unwrap();
}

#[tokio::test]
async fn acquire_once_while_streaming_is_a_usage_error() {
    let mock = MockInstrument::start(MockConfig::new(1, 100, 5)).await;
    let mut device = connect(&mock, "bench_8bit.mps").await;

    device.start_async(None).unwrap();
    let err = device.acquire_once().await.unwrap_err();
    assert!(matches!(err, MpError::Usage { operation: "acquire_once", .. }));
    device.stop_async().await.unwrap();
}

#[tokio::test]
async fn reset_is_retried_until_the_instrument_accepts() {
    let config = MockConfig::new(1, 100, 5).with_reset_rejections(2);
    let mock = MockInstrument::start(config).await;

    // Third attempt succeeds
    let device = connect(&mock, "bench_8bit.mps").await;
    assert_eq!(mock.resets.load(Ordering::SeqCst), 3);
    assert!(device.reset_status().is_some());
}

#[tokio::test]
async fn reset_fails_after_bounded_attempts() {
    let config = MockConfig::new(1, 100, 5).with_reset_rejections(10);
    let mock = MockInstrument::start(config).await;

    let device_config =
        DeviceConfig::new("127.0.0.1", mock.port(), "tests/data/bench_8bit.mps");
    let mut device = MicroPulse::new(device_config);
    let err = device.setup(Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, MpError::ResetFailed { attempts: 3 }));
    assert_eq!(mock.resets.load(Ordering::SeqCst), 3);
}
