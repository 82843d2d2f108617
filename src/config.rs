use std::time::Duration;

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

use crate::gcc::GccWeighting;
use crate::geometry::{RoomBounds, SubArray};
use crate::{Position, F, SPEED_OF_SOUND};

/// Per sub-array settings.
#[derive(SmartDefault, Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SubArrayConfig {
    /// Global mic id used as GCC reference, falls back to the lowest active
    /// mic of the sub-array when unset or inactive.
    pub reference_mic: Option<usize>,
    /// Direction pointing from the array into the room. Sources behind the
    /// array are rejected.
    #[default(Position::new(0., 0., 1.))]
    pub facing: Position,
}

/// Particle filter smoothing of the localized target.
#[derive(SmartDefault, Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TrackingConfig {
    #[default = true]
    pub enabled: bool,
    #[default = 500]
    pub particles: usize,
    /// Velocity damping rate in 1/s.
    #[default = 2.0]
    pub beta: F,
    /// Stationary speed of the motion model in cm/s.
    #[default = 50.0]
    pub speed: F,
    /// Standard deviation of the measurement likelihood in cm.
    #[default = 20.0]
    pub measurement_sigma: F,
    /// Half width of the dispersal noise in cm.
    #[default = 2.0]
    pub spread: F,
    /// Resample when the effective sample size drops below
    /// `particles / resample_divisor`.
    #[default = 10.0]
    pub resample_divisor: F,
    pub reevaluate_after_dispersal: bool,
    /// Fixed seed for reproducible runs, entropy seeded otherwise.
    pub seed: Option<u64>,
}

#[derive(SmartDefault, Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EstimatorConfig {
    #[default = 48_000.0]
    pub sample_rate: F,
    /// Samples per channel of one hardware frame. Processing works on two
    /// consecutive frames.
    #[default = 1024]
    pub frame_size: usize,
    /// Channels of both sub-arrays together.
    #[default = 16]
    pub channel_count: usize,
    /// In cm/s.
    #[default(SPEED_OF_SOUND)]
    pub speed_of_sound: F,
    pub weighting: GccWeighting,
    /// Extra lags searched beyond the physically possible delay.
    #[default = 2]
    pub lag_margin: usize,
    pub room: RoomBounds,
    #[default(Position::new(0., 0., 150.))]
    pub initial_target: Position,
    /// Candidates at most this far outside the room are clamped, farther ones
    /// are rejected.
    #[default = 50.0]
    pub clamp_margin: F,
    pub sub_arrays: [SubArrayConfig; 2],
    pub tracking: TrackingConfig,
    #[default = true]
    pub auto_mode: bool,
    #[default = 10]
    pub poll_interval_ms: u64,
    #[default = 200]
    pub fault_backoff_ms: u64,
    /// A pending half frame is dropped when its successor does not arrive
    /// within this time or two frame intervals, whichever is longer.
    #[default = 50]
    pub pair_timeout_ms: u64,
    /// Queue length above which a backlog warning is logged.
    #[default = 8]
    pub backlog_warning: usize,
}

impl EstimatorConfig {
    #[must_use]
    pub fn sub_array(&self, sub_array: SubArray) -> &SubArrayConfig {
        &self.sub_arrays[sub_array.index()]
    }

    /// Samples per channel of a doubled frame.
    #[must_use]
    pub fn window_len(&self) -> usize {
        2 * self.frame_size
    }

    /// Time between two hardware frames in seconds.
    #[must_use]
    pub fn frame_interval(&self) -> F {
        self.frame_size as F / self.sample_rate
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn fault_backoff(&self) -> Duration {
        Duration::from_millis(self.fault_backoff_ms)
    }

    /// Time a pending half frame waits for its successor, never shorter than
    /// two frame intervals.
    #[must_use]
    pub fn pair_timeout(&self) -> Duration {
        let frames = Duration::try_from_secs_f64(2. * self.frame_interval().max(0.))
            .unwrap_or(Duration::MAX);
        Duration::from_millis(self.pair_timeout_ms).max(frames)
    }
}
