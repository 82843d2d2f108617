#![allow(dead_code)]
use std::time::{Duration, Instant};

use doasteer::{Audio, EstimatorConfig, EstimatorEvent, Position, Subscription, F, SPEED_OF_SOUND};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const SAMPLE_RATE: F = 48_000.;
pub const FRAME_SIZE: usize = 1024;

/// Eight mics on the edge of a 180 cm square with one corner at `(x, y, 0)`.
#[rustfmt::skip]
pub fn square(x: F, y: F) -> Vec<Position> {
    [
        (  0.,   0.), ( 90.,   0.), (180.,   0.), (180.,  90.),
        (180., 180.), ( 90., 180.), (  0., 180.), (  0.,  90.),
    ]
    .into_iter()
    .map(|(dx, dy)| Position::new(x + dx, y + dy, 0.))
    .collect()
}

/// Both sub-arrays side by side on the floor, 16 channels.
pub fn array() -> Vec<Position> {
    let mut mics = square(0., 0.);
    mics.extend(square(-200., 0.));
    mics
}

pub fn config() -> EstimatorConfig {
    let mut config = EstimatorConfig::default();
    config.tracking.enabled = false;
    config.tracking.seed = Some(7);
    config.poll_interval_ms = 2;
    config
}

/// White noise from `source` as received by `mics`, delays rounded to whole
/// samples.
pub fn render(source: &Position, mics: &[Position], samples: usize, seed: u64) -> Audio {
    let delays = mics
        .iter()
        .map(|mic| (mic - source).magnitude() / SPEED_OF_SOUND * SAMPLE_RATE)
        .collect::<Vec<_>>();
    let nearest = delays.iter().copied().fold(F::INFINITY, F::min);
    let delays = delays
        .iter()
        .map(|d| (d - nearest).round() as usize)
        .collect::<Vec<_>>();
    let longest = delays.iter().copied().max().unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);
    let signal = (0..samples + longest)
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect::<Vec<F>>();
    Audio::new(
        SAMPLE_RATE,
        Array2::from_shape_fn((mics.len(), samples), |(mic, n)| {
            signal[n + longest - delays[mic]]
        }),
    )
}

pub fn assert_near(actual: &Position, expected: &Position, tolerance: F) {
    let error = (actual - expected).magnitude();
    assert!(
        error <= tolerance,
        "{actual:?} is {error:.2} cm away from {expected:?}, allowed {tolerance}"
    );
}

/// Waits for a published snapshot matching `accept`.
pub fn wait_for_snapshot(
    events: &Subscription,
    timeout: Duration,
    mut accept: impl FnMut(&Position) -> bool,
) -> Option<Position> {
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(EstimatorEvent::GeometryChanged(snapshot)) if accept(&snapshot.target) => {
                return Some(snapshot.target);
            }
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}
