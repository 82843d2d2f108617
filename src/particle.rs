//! Sequential importance resampling filter over [`Particle`]s.
//!
//! Every cycle runs predict → evaluate → resample (only when the weights have
//! degenerated) → disperse. Resampling records how many copies each source
//! particle received; dispersal leaves the first copy (the master) in place
//! and scatters the others so duplicates do not stay identical.
use itertools::Itertools;
use log::trace;
use nalgebra::SVector;
use rand::Rng;

use crate::dynamics::{DynamicsModel, Particle};
use crate::F;

/// Scores how well a position explains the current measurement.
pub trait Likelihood<const D: usize> {
    /// Non-negative score, larger is better.
    fn likelihood(&self, position: &SVector<F, D>) -> F;
}

/// Isotropic Gaussian around an observed position, over all tracked
/// dimensions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaussianLikelihood<const D: usize> {
    pub observed: SVector<F, D>,
    pub sigma: F,
}

impl<const D: usize> GaussianLikelihood<D> {
    #[must_use]
    pub fn new(observed: SVector<F, D>, sigma: F) -> Self {
        Self { observed, sigma }
    }
}

impl<const D: usize> Likelihood<D> for GaussianLikelihood<D> {
    fn likelihood(&self, position: &SVector<F, D>) -> F {
        let distance_squared = (position - self.observed).norm_squared();
        (-distance_squared / (2. * self.sigma * self.sigma)).exp()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeightedParticle<const D: usize> {
    pub particle: Particle<D>,
    pub weight: F,
    /// Copies the last resampling made of this particle's source.
    pub copy_count: usize,
    /// First copy of its source, skipped by dispersal.
    pub master: bool,
}

pub struct ParticleFilter<const D: usize, M> {
    model: M,
    population: Vec<WeightedParticle<D>>,
    resample_divisor: F,
    reevaluate_after_dispersal: bool,
    last_copy_counts: Vec<usize>,
}

impl<const D: usize, M: DynamicsModel<D>> ParticleFilter<D, M> {
    /// Filter over `particles` with equal weights.
    ///
    /// # Panics
    /// If `particles` is empty.
    pub fn from_particles(model: M, particles: impl IntoIterator<Item = Particle<D>>) -> Self {
        let particles = particles.into_iter().collect_vec();
        assert!(!particles.is_empty(), "particle population must not be empty");
        let weight = 1. / particles.len() as F;
        let last_copy_counts = vec![1; particles.len()];
        Self {
            model,
            population: particles
                .into_iter()
                .map(|particle| WeightedParticle {
                    particle,
                    weight,
                    copy_count: 1,
                    master: true,
                })
                .collect(),
            resample_divisor: 10.,
            reevaluate_after_dispersal: false,
            last_copy_counts,
        }
    }

    /// `size` particles at rest, uniformly spread over the box `min..max`.
    pub fn uniform<R: Rng + ?Sized>(
        model: M,
        size: usize,
        min: &SVector<F, D>,
        max: &SVector<F, D>,
        rng: &mut R,
    ) -> Self {
        let particles = (0..size)
            .map(|_| {
                Particle::at(SVector::from_fn(|axis, _| {
                    let (low, high) = (min[axis].min(max[axis]), min[axis].max(max[axis]));
                    if low < high {
                        rng.gen_range(low..high)
                    } else {
                        low
                    }
                }))
            })
            .collect_vec();
        Self::from_particles(model, particles)
    }

    #[must_use]
    pub fn with_resample_divisor(mut self, divisor: F) -> Self {
        self.resample_divisor = divisor.max(1.);
        self
    }

    #[must_use]
    pub fn with_reevaluation(mut self, reevaluate_after_dispersal: bool) -> Self {
        self.reevaluate_after_dispersal = reevaluate_after_dispersal;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.population.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.population.is_empty()
    }

    #[must_use]
    pub fn particles(&self) -> &[WeightedParticle<D>] {
        &self.population
    }

    pub fn weights(&self) -> impl Iterator<Item = F> + '_ {
        self.population.iter().map(|p| p.weight)
    }

    /// Per source particle copy counts of the last [`ParticleFilter::resample`]
    /// call, they always sum to the population size.
    #[must_use]
    pub fn last_copy_counts(&self) -> &[usize] {
        &self.last_copy_counts
    }

    /// Overwrites the weights, normalizing them.
    ///
    /// # Panics
    /// If `weights` does not have one entry per particle.
    pub fn set_weights(&mut self, weights: &[F]) {
        assert_eq!(weights.len(), self.len(), "one weight per particle");
        for (particle, &weight) in self.population.iter_mut().zip(weights) {
            particle.weight = weight;
        }
        self.normalize();
    }

    pub fn predict<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for particle in &mut self.population {
            particle.particle = self.model.predict(&particle.particle, rng);
        }
    }

    /// Weights every particle with `likelihood` and normalizes the weights to
    /// sum to one.
    pub fn evaluate(&mut self, likelihood: &impl Likelihood<D>) {
        for particle in &mut self.population {
            particle.weight = likelihood.likelihood(&particle.particle.position);
        }
        self.normalize();
    }

    /// `1 / Σ w²` of the normalized weights, between 1 and the population size.
    #[must_use]
    pub fn effective_sample_size(&self) -> F {
        let total: F = self.weights().sum();
        if total <= 0. {
            return 0.;
        }
        1. / self.weights().map(|w| (w / total).powi(2)).sum::<F>()
    }

    #[must_use]
    pub fn needs_resampling(&self) -> bool {
        self.effective_sample_size() < self.len() as F / self.resample_divisor
    }

    /// Systematic resampling if the weights degenerated. Returns whether the
    /// population was replaced.
    pub fn resample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        let n = self.len();
        if !self.needs_resampling() {
            self.last_copy_counts = vec![1; n];
            for particle in &mut self.population {
                particle.copy_count = 1;
                particle.master = true;
            }
            return false;
        }
        self.normalize();
        let step = 1. / n as F;
        let start = rng.gen_range(0.0..step);
        let mut counts = vec![0; n];
        let mut source = 0;
        let mut cumulative = self.population[0].weight;
        for i in 0..n {
            let pointer = start + i as F * step;
            while pointer >= cumulative && source + 1 < n {
                source += 1;
                cumulative += self.population[source].weight;
            }
            counts[source] += 1;
        }
        trace!(
            "resampled {n} particles from {} survivors",
            counts.iter().filter(|&&c| c > 0).count()
        );

        let population = self
            .population
            .iter()
            .zip(&counts)
            .flat_map(|(particle, &count)| {
                (0..count).map(move |copy| WeightedParticle {
                    particle: particle.particle,
                    weight: step,
                    copy_count: count,
                    master: copy == 0,
                })
            })
            .collect_vec();
        debug_assert_eq!(population.len(), n);
        self.population = population;
        self.last_copy_counts = counts;
        true
    }

    /// Moves every non-master particle by uniform noise in
    /// `[-spread, spread]` per axis.
    pub fn disperse<R: Rng + ?Sized>(&mut self, spread: F, rng: &mut R) {
        if spread <= 0. {
            return;
        }
        for particle in self.population.iter_mut().filter(|p| !p.master) {
            particle.particle.position +=
                SVector::<F, D>::from_fn(|_, _| rng.gen_range(-spread..=spread));
        }
    }

    /// [`ParticleFilter::disperse`] followed by a new evaluation.
    pub fn disperse_and_evaluate<R: Rng + ?Sized>(
        &mut self,
        spread: F,
        rng: &mut R,
        likelihood: &impl Likelihood<D>,
    ) {
        self.disperse(spread, rng);
        self.evaluate(likelihood);
    }

    /// Weighted mean position.
    #[must_use]
    pub fn estimate(&self) -> SVector<F, D> {
        let total: F = self.weights().sum();
        if total <= 0. {
            return self
                .population
                .iter()
                .fold(SVector::zeros(), |a, p| a + p.particle.position)
                / self.len() as F;
        }
        self.population
            .iter()
            .fold(SVector::zeros(), |a, p| a + p.particle.position * p.weight)
            / total
    }

    /// One full filter cycle against `likelihood`, returns the new estimate.
    pub fn step<R: Rng + ?Sized>(
        &mut self,
        likelihood: &impl Likelihood<D>,
        spread: F,
        rng: &mut R,
    ) -> SVector<F, D> {
        self.predict(rng);
        self.evaluate(likelihood);
        self.resample(rng);
        if self.reevaluate_after_dispersal {
            self.disperse_and_evaluate(spread, rng, likelihood);
        } else {
            self.disperse(spread, rng);
        }
        self.estimate()
    }

    /// Scales weights to sum to one, falls back to equal weights if nothing
    /// carries weight.
    fn normalize(&mut self) {
        for particle in &mut self.population {
            if !particle.weight.is_finite() || particle.weight < 0. {
                particle.weight = 0.;
            }
        }
        let total: F = self.weights().sum();
        let n = self.len() as F;
        for particle in &mut self.population {
            particle.weight = if total > 0. {
                particle.weight / total
            } else {
                1. / n
            };
        }
    }
}
