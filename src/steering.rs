//! Per microphone delays and gains aligning the target's wavefront for
//! delay-and-sum beamforming.
use serde::{Deserialize, Serialize};

use crate::config::EstimatorConfig;
use crate::geometry::GeometrySnapshot;
use crate::utils::min;
use crate::F;

/// Steering of one microphone.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SteeringResult {
    /// Propagation time from the target to the mic.
    pub delay_seconds: F,
    /// Delay relative to the nearest mic in whole samples, never negative.
    pub steering: F,
    pub gain: F,
}

#[derive(Clone, Debug)]
pub struct SteeringComputer {
    speed_of_sound: F,
    sample_rate: F,
    calibration: Option<Vec<F>>,
}

impl SteeringComputer {
    #[must_use]
    pub fn new(speed_of_sound: F, sample_rate: F) -> Self {
        Self {
            speed_of_sound,
            sample_rate,
            calibration: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self::new(config.speed_of_sound, config.sample_rate)
    }

    /// Installs per-channel linear gains, `None` returns to unity gain.
    ///
    /// Channels without a calibration entry keep unity gain.
    pub fn set_calibration(&mut self, gains: Option<Vec<F>>) {
        self.calibration = gains;
    }

    #[must_use]
    pub fn calibration(&self) -> Option<&[F]> {
        self.calibration.as_deref()
    }

    /// Steering for every mic of `geometry` towards `geometry.target`.
    ///
    /// Inactive mics get zero gain. Identical input gives identical output.
    #[must_use]
    pub fn compute(&self, geometry: &GeometrySnapshot) -> Vec<SteeringResult> {
        let delays = geometry
            .positions
            .iter()
            .map(|p| (p - geometry.target).magnitude() / self.speed_of_sound)
            .collect::<Vec<_>>();
        let Some(nearest) = min(&delays) else {
            return Vec::new();
        };
        delays
            .iter()
            .enumerate()
            .map(|(mic, &delay_seconds)| SteeringResult {
                delay_seconds,
                steering: ((delay_seconds - nearest) * self.sample_rate).round(),
                gain: self.gain(geometry, mic),
            })
            .collect()
    }

    /// `geometry` with delays, steering vector and gains filled in.
    #[must_use]
    pub fn apply(&self, mut geometry: GeometrySnapshot) -> GeometrySnapshot {
        let steering = self.compute(&geometry);
        geometry.delays = steering.iter().map(|s| s.delay_seconds).collect();
        geometry.steering_vector = steering.iter().map(|s| s.steering).collect();
        geometry.gains = steering.iter().map(|s| s.gain).collect();
        geometry
    }

    fn gain(&self, geometry: &GeometrySnapshot, mic: usize) -> F {
        if !geometry.is_active(mic) {
            return 0.;
        }
        self.calibration
            .as_ref()
            .and_then(|gains| gains.get(mic).copied())
            .unwrap_or(1.)
    }
}

/// Steering entries stored in a snapshot.
#[must_use]
pub fn from_snapshot(geometry: &GeometrySnapshot) -> Vec<SteeringResult> {
    geometry
        .delays
        .iter()
        .zip(&geometry.steering_vector)
        .zip(&geometry.gains)
        .map(|((&delay_seconds, &steering), &gain)| SteeringResult {
            delay_seconds,
            steering,
            gain,
        })
        .collect()
}
