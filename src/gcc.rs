//! Pairwise time delay estimation with generalized cross-correlation.
//!
//! For a reference channel `r` and another channel `o` the cross spectrum
//! `O · conj(R)` is optionally whitened (phase transform, see C. Knapp,
//! G. Carter, "The generalized cross-correlation method for estimation of
//! time delay", 1976) and transformed back. The lag of the correlation peak
//! within the physically possible range is the delay of `o` relative to `r`
//! in samples.
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use derive_more::Constructor;
use itertools::Itertools;
use log::{debug, warn};
use ndarray::ArrayView1;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::channel::AudioChannelSample;
use crate::config::EstimatorConfig;
use crate::{Position, C, F, I};

/// Floor for the cross spectrum magnitude when whitening.
const PHAT_EPSILON: F = 1e-12;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GccWeighting {
    /// Phase transform, every frequency bin contributes with unit magnitude.
    #[default]
    Phat,
    /// Plain cross-correlation.
    Plain,
}

impl Display for GccWeighting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GccWeighting::Phat => write!(f, "phat"),
            GccWeighting::Plain => write!(f, "plain"),
        }
    }
}

impl FromStr for GccWeighting {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "phat" | "gcc_phat" => Self::Phat,
            "plain" | "cc" => Self::Plain,
            e => return Err(format!("Unsupported gcc weighting {e:?}")),
        })
    }
}

/// Typed key of a delay measurement.
#[derive(
    Clone, Copy, Debug, Constructor, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct MicPair {
    pub reference: usize,
    pub other: usize,
}

/// Delay of `pair.other` relative to `pair.reference`.
///
/// Positive `tau_samples` means the wavefront reaches `other` later.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct PairwiseDelay {
    pub pair: MicPair,
    pub tau_samples: I,
    /// Correlation value at the peak, normalized by the transform length.
    pub peak: F,
}

impl PairwiseDelay {
    /// Time difference of arrival in seconds.
    #[must_use]
    pub fn tdoa(&self, sample_rate: F) -> F {
        self.tau_samples as F / sample_rate
    }

    /// Path length difference `|other - source| - |reference - source|`.
    #[must_use]
    pub fn distance_difference(&self, sample_rate: F, speed_of_sound: F) -> F {
        self.tdoa(sample_rate) * speed_of_sound
    }
}

struct Plan {
    len: usize,
    forward: Arc<dyn RealToComplex<F>>,
    inverse: Arc<dyn ComplexToReal<F>>,
    input: Vec<F>,
    output: Vec<F>,
    reference: Vec<C>,
    cross: Vec<C>,
}

/// GCC engine, owns the FFT plans and scratch buffers reused across cycles.
pub struct DelayAnalysis {
    weighting: GccWeighting,
    sample_rate: F,
    speed_of_sound: F,
    lag_margin: usize,
    planner: RealFftPlanner<F>,
    plan: Option<Plan>,
}

impl std::fmt::Debug for DelayAnalysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayAnalysis")
            .field("weighting", &self.weighting)
            .field("sample_rate", &self.sample_rate)
            .field("speed_of_sound", &self.speed_of_sound)
            .field("lag_margin", &self.lag_margin)
            .field("fft_len", &self.plan.as_ref().map(|p| p.len))
            .finish()
    }
}

impl DelayAnalysis {
    #[must_use]
    pub fn new(
        weighting: GccWeighting,
        sample_rate: F,
        speed_of_sound: F,
        lag_margin: usize,
    ) -> Self {
        Self {
            weighting,
            sample_rate,
            speed_of_sound,
            lag_margin,
            planner: RealFftPlanner::new(),
            plan: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self::new(
            config.weighting,
            config.sample_rate,
            config.speed_of_sound,
            config.lag_margin,
        )
    }

    #[must_use]
    pub fn weighting(&self) -> GccWeighting {
        self.weighting
    }

    /// Largest lag in samples that is searched for a pair of mics, the
    /// propagation time over their distance plus the margin.
    #[must_use]
    pub fn max_lag(&self, a: &Position, b: &Position) -> usize {
        let lag = ((a - b).magnitude() / self.speed_of_sound * self.sample_rate).ceil();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            lag.max(0.) as usize + self.lag_margin
        }
    }

    /// Delays of every active channel except `ref_mic_id` relative to
    /// `reference`.
    ///
    /// Returns an empty map when there is no partner for the reference.
    pub fn estimate(
        &mut self,
        reference: &AudioChannelSample,
        channels: &BTreeMap<usize, AudioChannelSample>,
        ref_mic_id: usize,
    ) -> BTreeMap<MicPair, PairwiseDelay> {
        let partners = channels
            .values()
            .filter(|c| c.active && c.mic_id != ref_mic_id)
            .collect_vec();
        if !reference.active || partners.is_empty() {
            debug!(
                "gcc skipped for reference {ref_mic_id}: {} partner channels",
                partners.len()
            );
            return BTreeMap::new();
        }

        let len = reference.samples.len();
        let partners = partners
            .into_iter()
            .filter(|other| {
                let matching = other.samples.len() == len;
                if !matching {
                    warn!(
                        "mic {} has {} samples, reference {ref_mic_id} has {len}",
                        other.mic_id,
                        other.samples.len()
                    );
                }
                matching
            })
            .map(|other| {
                let max_lag = self
                    .max_lag(&reference.position, &other.position)
                    .min(len.saturating_sub(1));
                (other, max_lag)
            })
            .collect_vec();

        let weighting = self.weighting;
        let plan = self.prepare((2 * len).next_power_of_two());
        plan.spectrum(reference.samples.view());
        std::mem::swap(&mut plan.reference, &mut plan.cross);

        let mut delays = BTreeMap::new();
        for (other, max_lag) in partners {
            plan.spectrum(other.samples.view());
            plan.correlate(weighting);
            let (tau_samples, peak) = plan.peak(max_lag);
            let pair = MicPair::new(ref_mic_id, other.mic_id);
            delays.insert(pair, PairwiseDelay {
                pair,
                tau_samples,
                peak,
            });
        }
        debug!(
            "gcc taus for reference {ref_mic_id}: {:?}",
            delays
                .values()
                .map(|d| (d.pair.other, d.tau_samples))
                .collect_vec()
        );
        delays
    }

    /// Drops FFT plans and scratch buffers.
    pub fn release(&mut self) {
        self.plan = None;
        self.planner = RealFftPlanner::new();
    }

    fn prepare(&mut self, len: usize) -> &mut Plan {
        if self.plan.as_ref().is_some_and(|p| p.len != len) {
            self.plan = None;
        }
        let planner = &mut self.planner;
        self.plan.get_or_insert_with(|| {
            let forward = planner.plan_fft_forward(len);
            let inverse = planner.plan_fft_inverse(len);
            Plan {
                len,
                input: forward.make_input_vec(),
                output: inverse.make_output_vec(),
                reference: forward.make_output_vec(),
                cross: forward.make_output_vec(),
                forward,
                inverse,
            }
        })
    }
}

impl Plan {
    /// Zero padded spectrum of `samples`, written to `self.cross`.
    fn spectrum(&mut self, samples: ArrayView1<F>) {
        self.input.fill(0.);
        for (slot, &sample) in self.input.iter_mut().zip(samples.iter()) {
            *slot = sample;
        }
        self.forward
            .process(&mut self.input, &mut self.cross)
            .expect("buffers are sized by the plan");
    }

    /// Turns the spectrum in `self.cross` into the weighted correlation in
    /// `self.output`.
    fn correlate(&mut self, weighting: GccWeighting) {
        for (cross, reference) in self.cross.iter_mut().zip(self.reference.iter()) {
            *cross *= reference.conj();
            if weighting == GccWeighting::Phat {
                *cross /= cross.norm().max(PHAT_EPSILON);
            }
        }
        // a real signal has real DC and Nyquist bins
        if let Some(first) = self.cross.first_mut() {
            first.im = 0.;
        }
        if let Some(last) = self.cross.last_mut() {
            last.im = 0.;
        }
        self.inverse
            .process(&mut self.cross, &mut self.output)
            .expect("buffers are sized by the plan");
    }

    /// Lag with the largest correlation in `-max_lag..=max_lag`, ties go to the
    /// smaller magnitude and then to the negative lag.
    #[allow(clippy::cast_possible_wrap)]
    fn peak(&self, max_lag: usize) -> (I, F) {
        let value = |lag: I| {
            let index = if lag >= 0 {
                lag as usize
            } else {
                self.len - lag.unsigned_abs() as usize
            };
            self.output[index] / self.len as F
        };
        let mut best = (0, value(0));
        for magnitude in 1..=max_lag as I {
            for lag in [-magnitude, magnitude] {
                let v = value(lag);
                if v > best.1 {
                    best = (lag, v);
                }
            }
        }
        best
    }
}
