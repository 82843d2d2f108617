use doasteer::{Audio, PcmFormat, F};
use float_cmp::assert_approx_eq;
use itertools::Itertools;

fn audio() -> Audio {
    Audio::from_channels(
        48_000.,
        [
            (0..100).map(|i| (i as F / 100.) - 0.5).collect_vec(),
            (0..100).map(|i| ((i as F) * 0.3).sin() * 0.9).collect_vec(),
        ],
    )
}

#[test]
fn round_trip_pcm() {
    let expected = audio();
    let bytes = expected
        .to_interleaved()
        .flat_map(f32::to_le_bytes)
        .collect_vec();
    let actual = Audio::from_pcm_bytes(
        "F32LE".parse().unwrap(),
        expected.sample_rate(),
        expected.channels(),
        &bytes,
    );
    assert_approx_eq!(&Audio, &actual, &expected, epsilon = 0.0001);
}

#[test]
fn round_trip_interleaved() {
    let expected = audio();
    let actual = Audio::from_interleaved(
        expected.sample_rate(),
        expected.channels(),
        expected.to_interleaved::<F>(),
    );
    assert_approx_eq!(&Audio, &actual, &expected, epsilon = 0.0001);
}

#[test]
fn pcm_formats() {
    assert_eq!(
        "s16le".parse::<PcmFormat>().unwrap(),
        PcmFormat::Int {
            signed: true,
            bytes: 2,
            lower_endian: true
        }
    );
    let format: PcmFormat = "F64BE".parse().unwrap();
    assert_eq!(format.bytes(), 8);
    assert!(!format.lower_endian());
    assert!("F16LE".parse::<PcmFormat>().is_err());
    assert!("S12LE".parse::<PcmFormat>().is_err());
    assert!("".parse::<PcmFormat>().is_err());

    let samples = PcmFormat::Int {
        signed: true,
        bytes: 2,
        lower_endian: true,
    }
    .from_data(&[0x00, 0x40, 0x00, 0xc0])
    .collect_vec();
    assert_eq!(samples, [0.5, -0.5]);
}

#[test]
fn frames_and_concat() {
    let audio = audio();
    let frames = audio.frames(30).collect_vec();
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| f.shape() == (2, 30)));

    let doubled = frames[0].concat(&frames[1]).unwrap();
    assert_eq!(doubled.shape(), (2, 60));
    assert_eq!(doubled.channel(1)[45], audio.channel(1)[45]);

    let mono = Audio::zeros(48_000., 1, 30);
    assert!(frames[0].concat(&mono).is_err());
}

#[test]
fn empty_channel_layouts() {
    let audio = Audio::from_interleaved(48_000., 0, [0.1, 0.2, 0.3]);
    assert_eq!(audio.shape(), (0, 0));

    let audio = Audio::from_channels(48_000., Vec::<Vec<F>>::new());
    assert_eq!(audio.shape(), (0, 0));

    let audio = Audio::from_pcm_bytes("S16LE".parse().unwrap(), 48_000., 0, &[0, 0x40]);
    assert_eq!(audio.channels(), 0);

    // a partial trailing sample is dropped
    let audio = Audio::from_interleaved(48_000., 2, [1., 2., 3., 4., 5.]);
    assert_eq!(audio.shape(), (2, 2));
    assert_eq!(audio.channel(1)[1], 4.);
}
