//! Picks the active channels of one sub-array out of a doubled frame.
use std::collections::BTreeMap;

use ndarray::Array1;

use crate::config::EstimatorConfig;
use crate::geometry::{GeometrySnapshot, SubArray};
use crate::{Audio, Error, Position, Result, F};

/// Samples of one microphone for the current processing cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioChannelSample {
    pub mic_id: usize,
    pub samples: Array1<F>,
    pub active: bool,
    pub position: Position,
}

/// Splits doubled frames into per-microphone samples.
#[derive(Clone, Debug)]
pub struct ChannelSelector {
    channel_count: usize,
    window_len: usize,
    reference_mics: [Option<usize>; 2],
}

impl ChannelSelector {
    #[must_use]
    pub fn new(channel_count: usize, window_len: usize) -> Self {
        Self {
            channel_count,
            window_len,
            reference_mics: [None; 2],
        }
    }

    #[must_use]
    pub fn from_config(config: &EstimatorConfig) -> Self {
        let mut selector = Self::new(config.channel_count, config.window_len());
        for sub_array in SubArray::ALL {
            selector.reference_mics[sub_array.index()] = config.sub_array(sub_array).reference_mic;
        }
        selector
    }

    #[must_use]
    pub fn with_reference(mut self, sub_array: SubArray, mic: usize) -> Self {
        self.reference_mics[sub_array.index()] = Some(mic);
        self
    }

    /// Active channels of `sub_array` keyed by mic id.
    ///
    /// # Errors
    /// [`Error::InvalidFrameShape`] if `frame` is not `channel_count` ×
    /// `window_len`, or the geometry describes a different number of mics.
    pub fn select(
        &self,
        frame: &Audio,
        geometry: &GeometrySnapshot,
        sub_array: SubArray,
    ) -> Result<BTreeMap<usize, AudioChannelSample>> {
        let expected = (self.channel_count, self.window_len);
        if frame.shape() != expected {
            return Err(Error::InvalidFrameShape {
                expected,
                found: frame.shape(),
            });
        }
        if geometry.len() != self.channel_count {
            return Err(Error::InvalidFrameShape {
                expected,
                found: (geometry.len(), frame.samples()),
            });
        }
        Ok(geometry
            .active_in(sub_array)
            .map(|mic| {
                (mic, AudioChannelSample {
                    mic_id: mic,
                    samples: frame.channel(mic).to_owned(),
                    active: true,
                    position: geometry.positions[mic],
                })
            })
            .collect())
    }

    /// Reference mic of `sub_array` among the selected `channels`.
    ///
    /// The configured reference wins if it was selected, otherwise the lowest
    /// selected id is used.
    #[must_use]
    pub fn reference<'a>(
        &self,
        sub_array: SubArray,
        channels: &'a BTreeMap<usize, AudioChannelSample>,
    ) -> Option<&'a AudioChannelSample> {
        self.reference_mics[sub_array.index()]
            .and_then(|mic| channels.get(&mic))
            .or_else(|| channels.values().next())
    }
}
