use std::collections::BTreeMap;

use doasteer::{Error, Localizer, MicPair, PairwiseDelay, Position, SubArray, F, SPEED_OF_SOUND};

mod common;
use common::{assert_near, square, SAMPLE_RATE};

fn differences(reference: &Position, mics: &[Position], source: &Position) -> Vec<(Position, F)> {
    let d0 = (reference - source).magnitude();
    mics.iter()
        .map(|mic| (*mic, (mic - source).magnitude() - d0))
        .collect()
}

#[test]
fn spatial_array_recovers_source() {
    let reference = Position::zeros();
    #[rustfmt::skip]
    let mics = [
        Position::new(100.,   0.,   0.), Position::new(  0., 100.,   0.),
        Position::new(  0.,   0., 100.), Position::new(100., 100.,   0.),
        Position::new(100.,   0., 100.), Position::new(  0., 100., 100.),
        Position::new(100., 100., 100.),
    ];
    let source = Position::new(30., 250., 80.);
    let found = Localizer::default()
        .solve_distance_differences(
            &reference,
            &differences(&reference, &mics, &source),
            &Position::z(),
        )
        .unwrap();
    assert_near(&found, &source, 1e-6);
}

#[test]
fn planar_array_uses_facing_side() {
    let mics = square(0., 0.);
    let source = Position::new(50., 20., 160.);
    let measurements = differences(&mics[0], &mics[1..], &source);
    let localizer = Localizer::default();

    let above = localizer
        .solve_distance_differences(&mics[0], &measurements, &Position::z())
        .unwrap();
    assert_near(&above, &source, 1e-6);

    let below = localizer
        .solve_distance_differences(&mics[0], &measurements, &-Position::z())
        .unwrap();
    assert_near(&below, &Position::new(50., 20., -160.), 1e-6);
}

#[test]
fn too_few_measurements() {
    let mics = square(0., 0.);
    let source = Position::new(50., 20., 160.);
    let localizer = Localizer::default();
    let err = localizer
        .solve_distance_differences(
            &mics[0],
            &differences(&mics[0], &mics[1..3], &source),
            &Position::z(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientChannels { needed: 3, found: 2 }));

    // four points spanning space need a fourth delay
    let mics = [
        Position::new(100., 0., 0.),
        Position::new(0., 100., 0.),
        Position::new(0., 0., 100.),
    ];
    let err = localizer
        .solve_distance_differences(
            &Position::zeros(),
            &differences(&Position::zeros(), &mics, &source),
            &Position::z(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientChannels { needed: 4, found: 3 }));
}

#[test]
fn whole_sample_delays_land_near_source() {
    let mics = square(0., 0.);
    let source = Position::new(50., 0., 160.);
    let distances = mics
        .iter()
        .map(|mic| (mic - source).magnitude())
        .collect::<Vec<_>>();
    let nearest = distances.iter().copied().fold(F::INFINITY, F::min);
    let samples = distances
        .iter()
        .map(|d| ((d - nearest) / SPEED_OF_SOUND * SAMPLE_RATE).round() as i64)
        .collect::<Vec<_>>();
    let delays = (1..mics.len())
        .map(|mic| {
            let pair = MicPair::new(0, mic);
            (pair, PairwiseDelay {
                pair,
                tau_samples: samples[mic] - samples[0],
                peak: 1.,
            })
        })
        .collect::<BTreeMap<_, _>>();

    let found = Localizer::new(SAMPLE_RATE, SPEED_OF_SOUND)
        .solve(&mics[0], 0, &delays, &mics, SubArray::Array1)
        .unwrap();
    assert_near(&found, &source, 2.);
}

#[test]
fn delays_of_other_reference_are_ignored() {
    let mics = square(0., 0.);
    let delays = (2..mics.len())
        .map(|mic| {
            let pair = MicPair::new(1, mic);
            (pair, PairwiseDelay {
                pair,
                tau_samples: 0,
                peak: 1.,
            })
        })
        .collect::<BTreeMap<_, _>>();
    assert_eq!(
        Localizer::default().solve(&mics[0], 0, &delays, &mics, SubArray::Array1),
        None
    );
}
