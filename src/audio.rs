use std::iter;
#[cfg(feature = "wav")]
use std::path::Path;
use std::str::FromStr;

use float_cmp::{ApproxEq, F64Margin};
#[cfg(feature = "wav")]
pub use hound::SampleFormat as WavFormat;
use itertools::Itertools;
use ndarray::{concatenate, s, Array2, ArrayView1, Axis};
use num::FromPrimitive;

use crate::{Error, Result, F};

/// Multi-channel block of samples, one row per channel.
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub struct Audio {
    pub(crate) sample_rate: F,
    pub(crate) data: Array2<F>,
}

impl Audio {
    pub fn new(sample_rate: F, data: Array2<F>) -> Self {
        Self { sample_rate, data }
    }

    pub fn zeros(sample_rate: F, channels: usize, samples: usize) -> Self {
        Self::new(sample_rate, Array2::zeros((channels, samples)))
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.data.dim().0
    }

    #[must_use]
    pub fn samples(&self) -> usize {
        self.data.dim().1
    }

    /// `(channels, samples)`
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    #[must_use]
    pub fn sample_rate(&self) -> F {
        self.sample_rate
    }

    #[must_use]
    pub fn channel(&self, channel: usize) -> ArrayView1<'_, F> {
        self.data.row(channel)
    }

    /// Appends `next` to the end of `self`, producing a block twice as long
    /// when both are hardware frames.
    ///
    /// # Errors
    /// Fails with [`Error::InvalidFrameShape`] if the channel counts differ.
    pub fn concat(&self, next: &Audio) -> Result<Self> {
        if self.channels() != next.channels() {
            return Err(Error::InvalidFrameShape {
                expected: (self.channels(), next.samples()),
                found: next.shape(),
            });
        }
        let data = concatenate(Axis(1), &[self.data.view(), next.data.view()])
            .expect("channel counts are equal");
        Ok(Self::new(self.sample_rate, data))
    }

    /// Splits into consecutive frames of `frame_size` samples, dropping an
    /// incomplete tail.
    pub fn frames(&self, frame_size: usize) -> impl Iterator<Item = Audio> + '_ {
        assert!(frame_size > 0, "frame size must be positive");
        (0..self.samples() / frame_size).map(move |frame| {
            Self::new(
                self.sample_rate,
                self.data
                    .slice(s![.., frame * frame_size..(frame + 1) * frame_size])
                    .to_owned(),
            )
        })
    }

    #[cfg(feature = "wav")]
    /// # Errors
    /// Fails if the file cannot be opened or is not a valid wave file.
    pub fn from_file(path: impl AsRef<Path>) -> std::result::Result<Self, hound::Error> {
        Self::from_wav(std::fs::File::open(path)?)
    }

    #[cfg(feature = "wav")]
    /// # Errors
    /// Fails if `data` is not a valid wave file.
    pub fn from_wav<R: std::io::Read>(data: R) -> std::result::Result<Self, hound::Error> {
        let reader = hound::WavReader::new(data)?;
        let spec = reader.spec();
        Ok(match spec.sample_format {
            hound::SampleFormat::Float => Self::from_interleaved(
                spec.sample_rate as F,
                spec.channels as usize,
                reader
                    .into_samples()
                    .collect::<std::result::Result<Vec<f32>, _>>()?,
            ),
            hound::SampleFormat::Int => Self::from_interleaved(
                spec.sample_rate as F,
                spec.channels as usize,
                reader
                    .into_samples()
                    .map_ok(normalize_pcm_wav(spec.bits_per_sample))
                    .collect::<std::result::Result<Vec<F>, _>>()?,
            ),
        })
    }

    /// Deinterleaves `data`, dropping an incomplete last sample. Zero
    /// `channels` give an empty recording.
    pub fn from_interleaved(
        sample_rate: F,
        channels: usize,
        data: impl IntoIterator<Item = impl Into<F>>,
    ) -> Self {
        let data = data.into_iter().map_into::<F>().collect_vec();
        let samples = data.len().checked_div(channels).unwrap_or(0);
        Self {
            sample_rate,
            data: Array2::from_shape_fn((channels, samples), |(c, s)| data[c + s * channels]),
        }
    }

    pub fn from_channels(
        sample_rate: F,
        channels: impl IntoIterator<Item = impl IntoIterator<Item = impl Into<F>>>,
    ) -> Self {
        let mut channels = channels
            .into_iter()
            .map(IntoIterator::into_iter)
            .collect_vec();
        if channels.is_empty() {
            return Self::zeros(sample_rate, 0, 0);
        }
        let mut channel = channels.len() - 1;
        Self::from_interleaved(
            sample_rate,
            channels.len(),
            iter::from_fn(|| {
                channel = (channel + 1) % channels.len();
                channels[channel].next()
            }),
        )
    }

    pub fn to_interleaved<T: FromPrimitive>(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.samples()).flat_map(move |sample| {
            (0..self.channels()).map(move |channel| {
                T::from_f64(self.data[(channel, sample)]).expect("audio format can be converted")
            })
        })
    }

    /// Parses raw interleaved PCM without header.
    pub fn from_pcm_bytes(format: PcmFormat, sample_rate: F, channels: usize, data: &[u8]) -> Self {
        Self::from_interleaved(sample_rate, channels, format.from_data(data))
    }

    pub(crate) fn get(&self, mic: usize, sample: usize) -> Option<F> {
        self.data.get((mic, sample)).copied()
    }
}

impl<'a> ApproxEq for &'a Audio {
    type Margin = F64Margin;

    fn approx_eq<M: Into<Self::Margin>>(self, other: Self, margin: M) -> bool {
        let margin = margin.into();
        self.sample_rate.approx_eq(other.sample_rate, margin)
            && self.shape() == other.shape()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(&a, &b)| a.approx_eq(b, margin))
    }
}

/// Utility to normalize wav data
#[must_use]
pub fn normalize_pcm_wav(bits_per_sample: u16) -> impl Fn(i32) -> F {
    let scale = 2f64.powi(i32::from(bits_per_sample) - 1);
    move |s: i32| s as F / scale
}

/// Sample encoding of headerless PCM data, e.g. `S16LE` or `F32LE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmFormat {
    Float {
        bytes: u8,
        lower_endian: bool,
    },
    Int {
        signed: bool,
        bytes: u8,
        lower_endian: bool,
    },
}

impl FromStr for PcmFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.to_ascii_uppercase();
        let kind = s.get(0..1).ok_or("format name empty")?;
        let digits = s[1..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>();
        let bits = digits
            .parse::<u8>()
            .map_err(|e| format!("invalid sample width in {s:?}: {e}"))?;
        if bits % 8 != 0 || bits == 0 {
            return Err(format!("sample width must be a multiple of 8, got {bits}"));
        }
        let bytes = bits / 8;
        let lower_endian = !s.ends_with("BE");
        Ok(match kind {
            "F" if matches!(bytes, 4 | 8) => Self::Float {
                bytes,
                lower_endian,
            },
            "F" => return Err(format!("only 32 or 64 bit floats are supported, got {bits}")),
            "S" | "U" if bytes <= 4 => Self::Int {
                signed: kind == "S",
                bytes,
                lower_endian,
            },
            e => return Err(format!("Unsupported pcm format {e:?}")),
        })
    }
}

impl PcmFormat {
    /// Amount of bytes `PcmFormat` has.
    #[must_use]
    pub fn bytes(self) -> u8 {
        match self {
            PcmFormat::Float { bytes, .. } | PcmFormat::Int { bytes, .. } => bytes,
        }
    }

    /// Returns whether `PcmFormat` uses lower endian.
    #[must_use]
    pub fn lower_endian(self) -> bool {
        match self {
            PcmFormat::Int { lower_endian, .. } | PcmFormat::Float { lower_endian, .. } => {
                lower_endian
            }
        }
    }

    /// Returns whether the `PcmFormat` is signed.
    #[must_use]
    pub fn signed(self) -> bool {
        !matches!(self, Self::Int { signed: false, .. })
    }

    /// Decodes `data` into samples normalized to `[-1, 1)`.
    pub fn from_data(self, data: &[u8]) -> impl Iterator<Item = F> + '_ {
        data.chunks_exact(self.bytes().into()).map(move |data| {
            let mut raw = [0u8; 8];
            let bytes = data.len();
            // big endian input is flipped so `raw` always holds little endian
            if self.lower_endian() {
                raw[..bytes].copy_from_slice(data);
            } else {
                raw[..bytes]
                    .iter_mut()
                    .zip(data.iter().rev())
                    .for_each(|(r, &d)| *r = d);
            }
            match self {
                PcmFormat::Float { bytes: 4, .. } => {
                    f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).into()
                }
                PcmFormat::Float { .. } => f64::from_le_bytes(raw),
                PcmFormat::Int { signed, bytes, .. } => {
                    let bits = u32::from(bytes) * 8;
                    let value = u64::from_le_bytes(raw);
                    let half = 2f64.powi(bits as i32 - 1);
                    if signed {
                        // sign extend from `bits`
                        let shift = 64 - bits;
                        #[allow(clippy::cast_possible_wrap)]
                        let value = ((value << shift) as i64) >> shift;
                        value as F / half
                    } else {
                        (value as F - half) / half
                    }
                }
            }
        })
    }
}
