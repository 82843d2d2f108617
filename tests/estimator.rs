use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use doasteer::{
    Audio, Error, Estimator, EstimatorEvent, EstimatorState, GeometryProvider, HardwareGeometry,
    LevelCalibrator, Position, StaticGeometry,
};
use itertools::Itertools;

mod common;
use common::{array, assert_near, config, render, wait_for_snapshot, FRAME_SIZE};

const TIMEOUT: Duration = Duration::from_secs(10);

fn frames(source: &Position, count: usize, seed: u64) -> Vec<Audio> {
    render(source, &array(), count * FRAME_SIZE, seed)
        .frames(FRAME_SIZE)
        .collect_vec()
}

fn estimator() -> (Estimator, Arc<StaticGeometry>) {
    let geometry = Arc::new(StaticGeometry::new(array()));
    (Estimator::new(config(), geometry.clone()), geometry)
}

#[test]
fn publishes_located_target() {
    let (mut estimator, _) = estimator();
    let events = estimator.subscribe();
    estimator.start().unwrap();
    assert!(estimator.is_running());

    let source = Position::new(50., 0., 160.);
    let sink = estimator.frame_sink();
    for frame in frames(&source, 4, 21) {
        assert!(sink.add_audio_frame(frame));
    }
    let target = wait_for_snapshot(&events, TIMEOUT, |t| (t - source).magnitude() < 5.)
        .expect("target published");
    assert_near(&target, &source, 5.);
    assert_near(&estimator.target_source(), &source, 5.);
    assert_eq!(estimator.state(), EstimatorState::Running);

    let steering = estimator.steering();
    assert_eq!(steering.len(), 16);
    assert!(steering.iter().any(|s| s.steering == 0.));

    estimator.stop().unwrap();
    assert_eq!(estimator.state(), EstimatorState::Stopped);
}

#[test]
fn reports_lifecycle_and_stays_silent_after_stop() {
    let (mut estimator, _) = estimator();
    let events = estimator.subscribe();
    estimator.start().unwrap();
    assert!(matches!(estimator.start(), Err(Error::AlreadyRunning)));
    thread::sleep(Duration::from_millis(50));
    estimator.stop().unwrap();
    estimator.stop().unwrap();

    let seen = events.try_iter().collect_vec();
    assert_eq!(
        seen,
        [
            EstimatorEvent::StateChanged(EstimatorState::Starting),
            EstimatorEvent::StateChanged(EstimatorState::Running),
            EstimatorEvent::StateChanged(EstimatorState::Stopped),
        ]
    );

    estimator.add_audio_frame(Audio::zeros(48_000., 16, FRAME_SIZE));
    thread::sleep(Duration::from_millis(50));
    assert!(events.try_recv().is_err());
}

#[test]
fn unsubscribed_receives_nothing() {
    let (mut estimator, _) = estimator();
    let kept = estimator.subscribe();
    let dropped = estimator.subscribe();
    assert_ne!(kept.id(), dropped.id());
    estimator.unsubscribe(dropped);
    estimator.start().unwrap();
    estimator.stop().unwrap();
    assert_eq!(kept.try_iter().count(), 3);
}

#[test]
fn manual_target_pins_steering() {
    let (mut estimator, _) = estimator();
    let events = estimator.subscribe();
    let manual = Position::new(-120., 80., 100.);

    // ignored while tracking automatically
    estimator.set_target_source(Some(manual));
    assert!(estimator.is_auto_mode());
    assert_eq!(estimator.target_source(), Position::new(0., 0., 150.));

    estimator.set_auto_mode(false);
    estimator.set_target_source(Some(manual));
    assert_eq!(estimator.target_source(), manual);
    estimator.start().unwrap();

    // frames do not move a pinned target
    for frame in frames(&Position::new(50., 0., 160.), 4, 22) {
        estimator.add_audio_frame(frame);
    }
    let published = wait_for_snapshot(&events, TIMEOUT, |t| *t == manual);
    assert_eq!(published, Some(manual));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(estimator.snapshot().target, manual);

    // out of the room gets clamped
    estimator.set_target_source(Some(Position::new(0., 0., 500.)));
    assert_eq!(estimator.target_source(), Position::new(0., 0., 300.));

    estimator.set_target_source(None);
    assert!(estimator.is_auto_mode());
    estimator.stop().unwrap();
}

#[test]
fn unpaired_frames_are_discarded() {
    let (mut estimator, _) = estimator();
    let events = estimator.subscribe();
    estimator.start().unwrap();

    let source = Position::new(-60., 40., 150.);
    let frames = frames(&source, 6, 23);
    let sink = estimator.frame_sink();
    for sequence in [0, 2, 4] {
        sink.add_captured_frame(sequence, frames[sequence as usize].clone());
    }
    thread::sleep(Duration::from_millis(200));
    assert_eq!(estimator.snapshot().target, Position::new(0., 0., 150.));

    sink.add_captured_frame(4, frames[4].clone());
    sink.add_captured_frame(5, frames[5].clone());
    let target = wait_for_snapshot(&events, TIMEOUT, |t| (t - source).magnitude() < 5.);
    assert!(target.is_some());
    estimator.stop().unwrap();
}

#[test]
fn malformed_frames_keep_worker_running() {
    let (mut estimator, _) = estimator();
    let events = estimator.subscribe();
    estimator.start().unwrap();
    estimator.add_audio_frame(Audio::zeros(48_000., 3, FRAME_SIZE));
    estimator.add_audio_frame(Audio::zeros(48_000., 16, 17));

    let source = Position::new(-100., 50., 120.);
    for frame in frames(&source, 2, 24) {
        estimator.add_audio_frame(frame);
    }
    assert!(wait_for_snapshot(&events, TIMEOUT, |t| (t - source).magnitude() < 5.).is_some());
    assert_eq!(estimator.state(), EstimatorState::Running);
    estimator.stop().unwrap();
}

#[test]
fn geometry_changes_are_published() {
    let (mut estimator, geometry) = estimator();
    let events = estimator.subscribe();
    estimator.start().unwrap();
    geometry.set_active(3, false);
    geometry.set_trolley_y(10.);

    let deadline = Instant::now() + TIMEOUT;
    let snapshot = loop {
        match events.recv_timeout(deadline - Instant::now()) {
            Ok(EstimatorEvent::GeometryChanged(snapshot))
                if snapshot.trolley_y == 10. && !snapshot.active_mics[3] =>
            {
                break snapshot;
            }
            Ok(_) => {}
            Err(e) => panic!("no geometry update: {e}"),
        }
    };
    assert_eq!(snapshot.gains[3], 0.);
    assert_eq!(snapshot.positions[0], Position::new(0., 10., 0.));
    estimator.stop().unwrap();
}

#[test]
fn calibration_gains_reach_snapshot() {
    let calibrator = Arc::new(LevelCalibrator::new(2));
    let (estimator, _) = estimator();
    let mut estimator = estimator.with_calibration(calibrator.clone());
    assert!(matches!(
        estimator.calibrate(),
        Err(Error::CalibrationNotReady { .. })
    ));
    let events = estimator.subscribe();
    estimator.start().unwrap();
    for frame in frames(&Position::new(50., 0., 160.), 2, 25) {
        estimator.add_audio_frame(frame);
    }
    let deadline = Instant::now() + TIMEOUT;
    while calibrator.collected() < 2 {
        assert!(Instant::now() < deadline, "frames not observed");
        thread::sleep(Duration::from_millis(5));
    }
    let gains = estimator.calibrate().unwrap();
    assert_eq!(gains.len(), 16);

    let deadline = Instant::now() + TIMEOUT;
    loop {
        match events.recv_timeout(deadline - Instant::now()) {
            Ok(EstimatorEvent::GeometryChanged(snapshot)) if snapshot.gains == gains => break,
            Ok(_) => {}
            Err(e) => panic!("calibrated snapshot not published: {e}"),
        }
    }
    estimator.stop().unwrap();
}

#[test]
fn pairs_frames_at_capture_pace() {
    let mut config = config();
    config.frame_size = 4096;
    let interval = Duration::from_secs_f64(config.frame_interval());
    assert!(config.pair_timeout() >= 2 * interval);

    let geometry = Arc::new(StaticGeometry::new(array()));
    let mut estimator = Estimator::new(config, geometry);
    let events = estimator.subscribe();
    estimator.start().unwrap();

    let source = Position::new(50., 0., 160.);
    let captured = render(&source, &array(), 6 * 4096, 26)
        .frames(4096)
        .collect_vec();
    for frame in captured {
        estimator.add_audio_frame(frame);
        thread::sleep(interval);
    }
    let target = wait_for_snapshot(&events, TIMEOUT, |t| (t - source).magnitude() < 5.);
    assert!(target.is_some(), "target stayed at {:?}", estimator.target_source());
    estimator.stop().unwrap();
}

/// Panics on the first query after being armed.
struct FailingOnce {
    inner: StaticGeometry,
    armed: AtomicBool,
}

impl GeometryProvider for FailingOnce {
    fn current(&self) -> HardwareGeometry {
        assert!(!self.armed.swap(false, Ordering::SeqCst), "geometry unavailable");
        self.inner.current()
    }
}

#[test]
fn recovers_from_failed_cycle() {
    let mut config = config();
    config.fault_backoff_ms = 20;
    let geometry = Arc::new(FailingOnce {
        inner: StaticGeometry::new(array()),
        armed: AtomicBool::new(false),
    });
    let mut estimator = Estimator::new(config, geometry.clone());
    let events = estimator.subscribe();
    estimator.start().unwrap();

    let lifecycle = |count: usize| {
        let deadline = Instant::now() + TIMEOUT;
        let mut seen = Vec::new();
        while seen.len() < count {
            match events.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(EstimatorEvent::GeometryChanged(_)) => {}
                Ok(event) => seen.push(event),
                Err(e) => panic!("missing events after {seen:?}: {e}"),
            }
        }
        seen
    };
    assert_eq!(
        lifecycle(2),
        [
            EstimatorEvent::StateChanged(EstimatorState::Starting),
            EstimatorEvent::StateChanged(EstimatorState::Running),
        ]
    );

    geometry.armed.store(true, Ordering::SeqCst);
    assert_eq!(
        lifecycle(4),
        [
            EstimatorEvent::StateChanged(EstimatorState::Recovering),
            EstimatorEvent::Connection(false),
            EstimatorEvent::StateChanged(EstimatorState::Running),
            EstimatorEvent::Connection(true),
        ]
    );
    assert_eq!(estimator.state(), EstimatorState::Running);

    let source = Position::new(-60., 40., 150.);
    for frame in frames(&source, 4, 27) {
        estimator.add_audio_frame(frame);
    }
    assert!(wait_for_snapshot(&events, TIMEOUT, |t| (t - source).magnitude() < 5.).is_some());
    estimator.stop().unwrap();
}

#[test]
fn single_mic_per_sub_array_keeps_target() {
    let (mut estimator, geometry) = estimator();
    geometry.set_active_mics((0..16).map(|mic| mic % 8 == 0));
    estimator.start().unwrap();

    let sink = estimator.frame_sink();
    for frame in frames(&Position::new(50., 0., 160.), 4, 28) {
        sink.add_audio_frame(frame);
    }
    let deadline = Instant::now() + TIMEOUT;
    while !sink.is_empty() {
        assert!(Instant::now() < deadline, "frames not consumed");
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(50));

    assert_eq!(estimator.snapshot().target, Position::new(0., 0., 150.));
    assert_eq!(estimator.target_source(), Position::new(0., 0., 150.));
    assert_eq!(estimator.state(), EstimatorState::Running);
    estimator.stop().unwrap();
}
