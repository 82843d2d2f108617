use std::collections::BTreeMap;

use doasteer::{
    AudioChannelSample, DelayAnalysis, GccWeighting, MicPair, Position, F, SPEED_OF_SOUND,
};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn channel(mic_id: usize, position: Position, samples: Vec<F>) -> AudioChannelSample {
    AudioChannelSample {
        mic_id,
        samples: Array1::from(samples),
        active: true,
        position,
    }
}

/// Reference and a copy of it arriving `delay` samples later.
fn delayed_pair(delay: usize) -> BTreeMap<usize, AudioChannelSample> {
    let len = 2048;
    let mut rng = StdRng::seed_from_u64(3);
    let signal = (0..len + delay)
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect::<Vec<F>>();
    let reference = signal[delay..].to_vec();
    let other = signal[..len].to_vec();
    BTreeMap::from([
        (0, channel(0, Position::zeros(), reference)),
        (1, channel(1, Position::new(30., 0., 0.), other)),
    ])
}

#[test]
fn later_arrival_gives_positive_delay() {
    for weighting in [GccWeighting::Phat, GccWeighting::Plain] {
        let channels = delayed_pair(7);
        let mut gcc = DelayAnalysis::new(weighting, 48_000., SPEED_OF_SOUND, 2);
        let delays = gcc.estimate(&channels[&0], &channels, 0);
        assert_eq!(delays.len(), 1);
        let delay = delays[&MicPair::new(0, 1)];
        assert_eq!(delay.tau_samples, 7, "{weighting}");
        assert!(delay.peak > 0.);
    }
}

#[test]
fn earlier_arrival_gives_negative_delay() {
    let channels = delayed_pair(5);
    let mut gcc = DelayAnalysis::new(GccWeighting::Phat, 48_000., SPEED_OF_SOUND, 2);
    let delays = gcc.estimate(&channels[&1], &channels, 1);
    assert_eq!(delays[&MicPair::new(1, 0)].tau_samples, -5);
}

#[test]
fn single_channel_has_no_delays() {
    let mut channels = delayed_pair(3);
    channels.remove(&1);
    let mut gcc = DelayAnalysis::new(GccWeighting::Phat, 48_000., SPEED_OF_SOUND, 2);
    assert!(gcc.estimate(&channels[&0], &channels, 0).is_empty());
}

#[test]
fn delay_beyond_mic_distance_is_not_reported() {
    // 30 cm apart allows at most 42 + 2 samples
    let channels = delayed_pair(100);
    let mut gcc = DelayAnalysis::new(GccWeighting::Phat, 48_000., SPEED_OF_SOUND, 2);
    let delay = gcc.estimate(&channels[&0], &channels, 0)[&MicPair::new(0, 1)];
    assert!(delay.tau_samples.abs() <= 44);
}

#[test]
fn release_keeps_results_identical() {
    let channels = delayed_pair(11);
    let mut gcc = DelayAnalysis::new(GccWeighting::Phat, 48_000., SPEED_OF_SOUND, 2);
    let before = gcc.estimate(&channels[&0], &channels, 0);
    gcc.release();
    let after = gcc.estimate(&channels[&0], &channels, 0);
    assert_eq!(before, after);
}
