//! Per channel gain calibration.
use log::warn;
use parking_lot::Mutex;

use crate::{Audio, Error, Result, F};

/// Device side calibration the estimator delegates to.
pub trait CalibrationSource: Send + Sync {
    /// Sees every frame the estimator takes off its queue.
    fn observe(&self, _frame: &Audio) {}

    /// Linear gain per channel equalizing the channel levels.
    ///
    /// # Errors
    /// [`Error::CalibrationNotReady`] if not enough audio was observed.
    fn calibrate(&self) -> Result<Vec<F>>;
}

#[derive(Debug, Default)]
struct Levels {
    frames: usize,
    samples: usize,
    energy: Vec<F>,
}

/// Equalizes channels to their mean RMS level, assuming all mics hear the
/// same diffuse sound field while recording.
#[derive(Debug)]
pub struct LevelCalibrator {
    needed: usize,
    levels: Mutex<Levels>,
}

impl LevelCalibrator {
    /// Ready after `needed_frames` frames were observed.
    #[must_use]
    pub fn new(needed_frames: usize) -> Self {
        Self {
            needed: needed_frames.max(1),
            levels: Mutex::default(),
        }
    }

    #[must_use]
    pub fn collected(&self) -> usize {
        self.levels.lock().frames
    }

    pub fn reset(&self) {
        *self.levels.lock() = Levels::default();
    }

    pub fn record(&self, frame: &Audio) {
        let mut levels = self.levels.lock();
        if levels.energy.len() != frame.channels() {
            if levels.frames > 0 {
                warn!(
                    "channel count changed from {} to {}, restarting calibration",
                    levels.energy.len(),
                    frame.channels()
                );
            }
            *levels = Levels {
                energy: vec![0.; frame.channels()],
                ..Levels::default()
            };
        }
        for (channel, energy) in levels.energy.iter_mut().enumerate() {
            *energy += frame.channel(channel).iter().map(|s| s * s).sum::<F>();
        }
        levels.samples += frame.samples();
        levels.frames += 1;
    }
}

impl CalibrationSource for LevelCalibrator {
    fn observe(&self, frame: &Audio) {
        self.record(frame);
    }

    fn calibrate(&self) -> Result<Vec<F>> {
        let levels = self.levels.lock();
        if levels.frames < self.needed || levels.samples == 0 {
            return Err(Error::CalibrationNotReady {
                collected: levels.frames,
                needed: self.needed,
            });
        }
        let rms = levels
            .energy
            .iter()
            .map(|e| (e / levels.samples as F).sqrt())
            .collect::<Vec<_>>();
        let audible = rms.iter().filter(|&&r| r > 0.).collect::<Vec<_>>();
        if audible.is_empty() {
            return Err(Error::CalibrationNotReady {
                collected: levels.frames,
                needed: self.needed,
            });
        }
        let reference = audible.iter().copied().sum::<F>() / audible.len() as F;
        Ok(rms
            .iter()
            .enumerate()
            .map(|(channel, &r)| {
                if r > 0. {
                    reference / r
                } else {
                    warn!("channel {channel} is silent, keeping unity gain");
                    1.
                }
            })
            .collect())
    }
}
