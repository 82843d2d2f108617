#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_panics_doc,
    clippy::cast_lossless,
    clippy::cast_precision_loss,
    clippy::module_name_repetitions
)]
//! Direction of arrival estimation and delay-and-sum steering for a
//! microphone array made of two sub-arrays.
//!
//! The processing chain for every doubled audio frame is
//! [`ChannelSelector`] → [`DelayAnalysis`] → [`Localizer`] →
//! [`PlausibilityChecker`] → [`ParticleFilter`] (optional) →
//! [`SteeringComputer`], driven by the worker thread of an [`Estimator`].
//!
//! Positions are in centimetres, delays in seconds.
use derive_more::Constructor;
use nalgebra::{Complex, UnitQuaternion, Vector3};

mod audio;
pub use audio::*;
pub mod calibration;
pub use calibration::{CalibrationSource, LevelCalibrator};
pub mod channel;
pub use channel::{AudioChannelSample, ChannelSelector};
pub mod config;
pub use config::{EstimatorConfig, SubArrayConfig, TrackingConfig};
pub mod dynamics;
pub use dynamics::{DampedVelocity, DynamicsModel, Particle};
mod error;
pub use error::{Error, Result};
pub mod estimator;
pub use estimator::{
    AudioFrame, Estimator, EstimatorEvent, EstimatorState, FrameSink, Pipeline, Subscription,
};
pub mod gcc;
pub use gcc::{DelayAnalysis, GccWeighting, MicPair, PairwiseDelay};
pub mod geometry;
pub use geometry::{
    GeometryProvider, GeometrySnapshot, HardwareGeometry, RoomBounds, StaticGeometry, SubArray,
};
pub mod localize;
pub use localize::Localizer;
pub mod particle;
pub use particle::{GaussianLikelihood, Likelihood, ParticleFilter, WeightedParticle};
pub mod plausibility;
pub use plausibility::{Plausibility, PlausibilityChecker};
mod sss;
pub use sss::delay_and_sum;
pub mod steering;
pub use steering::{SteeringComputer, SteeringResult};
mod utils;

pub type F = f64;
pub type I = i64;
pub type C = Complex<F>;
pub type Position = Vector3<F>;

/// Speed of sound in air at room temperature in cm/s.
pub const SPEED_OF_SOUND: F = 34_300.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Constructor)]
pub struct Direction {
    pub azimuth: F,
    pub elevation: F,
}

impl From<(F, F)> for Direction {
    fn from((azimuth, elevation): (F, F)) -> Self {
        Self::new(azimuth, elevation)
    }
}

impl Direction {
    /// Direction in which `target` is seen from `origin`.
    ///
    /// Returns the default direction when both points coincide.
    #[must_use]
    pub fn towards(origin: &Position, target: &Position) -> Self {
        let offset = target - origin;
        let horizontal = offset.x.hypot(offset.y);
        if horizontal == 0. && offset.z == 0. {
            return Self::default();
        }
        Self::new(offset.y.atan2(offset.x), offset.z.atan2(horizontal))
    }

    /// Point on the unit sphere seen in this direction.
    #[must_use]
    pub fn to_unit_vec(self) -> Position {
        let (sin_az, cos_az) = self.azimuth.sin_cos();
        let (sin_el, cos_el) = self.elevation.sin_cos();
        Position::new(cos_el * cos_az, cos_el * sin_az, sin_el)
    }
}
