//! Motion model of the tracked source.
use nalgebra::SVector;
use rand::Rng;

use crate::config::EstimatorConfig;
use crate::F;

/// Position and velocity of one hypothesis, `D` is 2 for tracking on the
/// floor plane and 3 for full spatial tracking.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Particle<const D: usize> {
    pub position: SVector<F, D>,
    pub velocity: SVector<F, D>,
}

impl<const D: usize> Particle<D> {
    #[must_use]
    pub fn new(position: SVector<F, D>, velocity: SVector<F, D>) -> Self {
        Self { position, velocity }
    }

    /// Particle at rest.
    #[must_use]
    pub fn at(position: SVector<F, D>) -> Self {
        Self::new(position, SVector::zeros())
    }
}

pub trait DynamicsModel<const D: usize> {
    /// State of `particle` one time step later. The input is left untouched.
    fn predict<R: Rng + ?Sized>(&self, particle: &Particle<D>, rng: &mut R) -> Particle<D>;
}

/// Discretized Ornstein-Uhlenbeck velocity process.
///
/// `v' = A v + w`, `x' = x + v' Δt` with `A = exp(-β Δt)` and `w` uniform in
/// `[-a, a]` per axis. `a` is chosen so the stationary velocity variance per
/// axis is `V²`, i.e. `a² / 3 = V² (1 - A²)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DampedVelocity {
    dt: F,
    damping: F,
    noise: F,
}

impl DampedVelocity {
    /// `dt` in seconds, `beta` in 1/s, `speed` in cm/s.
    #[must_use]
    pub fn new(dt: F, beta: F, speed: F) -> Self {
        let damping = (-beta * dt).exp();
        let variance = speed * speed * (1. - damping * damping);
        Self {
            dt,
            damping,
            noise: (3. * variance).max(0.).sqrt(),
        }
    }

    /// One step per processed (doubled) frame.
    #[must_use]
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self::new(
            config.window_len() as F / config.sample_rate,
            config.tracking.beta,
            config.tracking.speed,
        )
    }

    #[must_use]
    pub fn dt(&self) -> F {
        self.dt
    }

    #[must_use]
    pub fn damping(&self) -> F {
        self.damping
    }

    /// Half width of the uniform velocity noise.
    #[must_use]
    pub fn noise_amplitude(&self) -> F {
        self.noise
    }
}

impl<const D: usize> DynamicsModel<D> for DampedVelocity {
    fn predict<R: Rng + ?Sized>(&self, particle: &Particle<D>, rng: &mut R) -> Particle<D> {
        let noise = self.noise;
        let velocity = particle.velocity * self.damping
            + SVector::<F, D>::from_fn(|_, _| {
                if noise > 0. {
                    rng.gen_range(-noise..=noise)
                } else {
                    0.
                }
            });
        Particle::new(particle.position + velocity * self.dt, velocity)
    }
}
