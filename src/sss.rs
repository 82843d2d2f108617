use std::f64::consts::PI;

use nalgebra::ComplexField;

use crate::steering::SteeringResult;
use crate::utils::max;
use crate::{Audio, Error, Result, F};

const FILTER_LENGTH: usize = 11;

/// Delay-and-sum beamformer: aligns every channel of `audio` on the wavefront
/// described by `steering` and mixes them weighted by their gains.
///
/// Sample `n` of the output corresponds to sample `n` of the mic nearest to
/// the target. Fractional delays are applied with a Hamming windowed sinc
/// interpolator, samples outside of `audio` count as silence.
///
/// # Errors
/// [`Error::InvalidFrameShape`] if `steering` does not have one entry per
/// channel.
pub fn delay_and_sum(audio: &Audio, steering: &[SteeringResult]) -> Result<Vec<F>> {
    if steering.len() != audio.channels() {
        return Err(Error::InvalidFrameShape {
            expected: (steering.len(), audio.samples()),
            found: audio.shape(),
        });
    }
    let nearest = steering
        .iter()
        .map(|s| s.delay_seconds)
        .fold(F::INFINITY, F::min);
    let taus = steering
        .iter()
        .map(|s| (s.delay_seconds - nearest) * audio.sample_rate())
        .collect::<Vec<_>>();
    let total_gain: F = steering.iter().map(|s| s.gain).sum();
    if total_gain <= 0. {
        return Ok(Vec::new());
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let len = audio
        .samples()
        .saturating_sub(max(&taus).unwrap_or(0.).ceil() as usize);
    Ok((0..len)
        .map(|i| {
            steering
                .iter()
                .zip(&taus)
                .enumerate()
                .filter(|(_, (s, _))| s.gain != 0.)
                .map(|(mic, (s, tau))| s.gain * fractional_sample(audio, mic, i as F + tau))
                .sum::<F>()
                / total_gain
        })
        .collect())
}

// https://web.archive.org/web/20230605140150/http://www.labbookpages.co.uk/audio/beamforming/fractionalDelay.html
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn fractional_sample(audio: &Audio, mic: usize, position: F) -> F {
    let centre_tap = FILTER_LENGTH / 2;
    let whole = position.floor();
    let fraction = position - whole;
    if fraction == 0. {
        return sample(audio, mic, whole as i64);
    }
    (0..FILTER_LENGTH)
        .map(|t| {
            let x = t as F - fraction;
            let sinc = (PI * (x - centre_tap as F)).sinc();
            let window = 0.54 - 0.46 * (2. * PI * (x + 0.5) / FILTER_LENGTH as F).cos();
            sample(audio, mic, whole as i64 + t as i64 - centre_tap as i64) * window * sinc
        })
        .sum()
}

fn sample(audio: &Audio, mic: usize, index: i64) -> F {
    usize::try_from(index)
        .ok()
        .and_then(|index| audio.get(mic, index))
        .unwrap_or(0.)
}
