//! Microphone geometry and the immutable per-epoch [`GeometrySnapshot`].
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;

use derive_more::Display;
use itertools::Itertools;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{Position, F};

/// One of the two halves of the microphone array.
///
/// `Array1` owns the first half of the channel range, `Array2` the second.
#[derive(Clone, Copy, Debug, Display, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SubArray {
    #[display(fmt = "array1")]
    Array1,
    #[display(fmt = "array2")]
    Array2,
}

impl FromStr for SubArray {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "array1" | "1" => Self::Array1,
            "array2" | "2" => Self::Array2,
            e => return Err(format!("Unsupported sub array {e:?}")),
        })
    }
}

impl SubArray {
    pub const ALL: [SubArray; 2] = [SubArray::Array1, SubArray::Array2];

    /// Channel indices belonging to this sub-array out of `total` channels.
    #[must_use]
    pub fn channels(self, total: usize) -> Range<usize> {
        let half = total / 2;
        match self {
            SubArray::Array1 => 0..half,
            SubArray::Array2 => half..total,
        }
    }

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            SubArray::Array1 => 0,
            SubArray::Array2 => 1,
        }
    }
}

/// Axis aligned box describing the room, in cm.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct RoomBounds {
    pub min: Position,
    pub max: Position,
}

impl Default for RoomBounds {
    fn default() -> Self {
        Self {
            min: Position::new(-300., -300., 0.),
            max: Position::new(300., 300., 300.),
        }
    }
}

impl RoomBounds {
    #[must_use]
    pub fn new(min: Position, max: Position) -> Self {
        Self {
            min: min.inf(&max),
            max: min.sup(&max),
        }
    }

    #[must_use]
    pub fn contains(&self, point: &Position) -> bool {
        (0..3).all(|axis| (self.min[axis]..=self.max[axis]).contains(&point[axis]))
    }

    /// Nearest point inside the box. NaN coordinates are replaced by the
    /// centre of the box.
    #[must_use]
    pub fn clamp(&self, point: &Position) -> Position {
        let center = self.center();
        Position::from_fn(|axis, _| {
            if point[axis].is_nan() {
                center[axis]
            } else {
                point[axis].clamp(self.min[axis], self.max[axis])
            }
        })
    }

    /// Largest per-axis distance by which `point` lies outside the box, `0`
    /// when inside.
    #[must_use]
    pub fn distance_outside(&self, point: &Position) -> F {
        (0..3)
            .map(|axis| {
                (self.min[axis] - point[axis])
                    .max(point[axis] - self.max[axis])
                    .max(0.)
            })
            .fold(0., F::max)
    }

    #[must_use]
    pub fn center(&self) -> Position {
        (self.min + self.max) / 2.
    }
}

/// Live state reported by the hardware: absolute mic positions, which mics
/// are switched on and where the trolley carrying the arrays currently is.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HardwareGeometry {
    pub positions: Vec<Position>,
    pub active_mics: Vec<bool>,
    pub trolley_y: F,
}

impl HardwareGeometry {
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Source of the current [`HardwareGeometry`], queried once per processing
/// cycle.
pub trait GeometryProvider: Send + Sync {
    fn current(&self) -> HardwareGeometry;
}

impl<T: GeometryProvider + ?Sized> GeometryProvider for Arc<T> {
    fn current(&self) -> HardwareGeometry {
        (**self).current()
    }
}

/// Fixed array layout mounted on a trolley that moves along the y axis.
///
/// Positions are stored relative to the trolley; [`GeometryProvider::current`]
/// reports them shifted by the trolley offset.
#[derive(Debug, Default)]
pub struct StaticGeometry {
    inner: RwLock<HardwareGeometry>,
}

impl StaticGeometry {
    #[must_use]
    pub fn new(positions: impl IntoIterator<Item = impl Into<Position>>) -> Self {
        let positions = positions.into_iter().map(Into::into).collect_vec();
        let active_mics = vec![true; positions.len()];
        Self {
            inner: RwLock::new(HardwareGeometry {
                positions,
                active_mics,
                trolley_y: 0.,
            }),
        }
    }

    /// Switches a single microphone on or off. Unknown ids are ignored.
    pub fn set_active(&self, mic: usize, active: bool) {
        if let Some(flag) = self.inner.write().active_mics.get_mut(mic) {
            *flag = active;
        }
    }

    pub fn set_active_mics(&self, active: impl IntoIterator<Item = bool>) {
        let mut inner = self.inner.write();
        for (flag, active) in inner.active_mics.iter_mut().zip(active) {
            *flag = active;
        }
    }

    pub fn set_trolley_y(&self, trolley_y: F) {
        self.inner.write().trolley_y = trolley_y;
    }
}

impl GeometryProvider for StaticGeometry {
    fn current(&self) -> HardwareGeometry {
        let inner = self.inner.read();
        let offset = Position::new(0., inner.trolley_y, 0.);
        HardwareGeometry {
            positions: inner.positions.iter().map(|p| p + offset).collect(),
            active_mics: inner.active_mics.clone(),
            trolley_y: inner.trolley_y,
        }
    }
}

/// Immutable copy of the array geometry for one epoch together with the
/// steering state derived from it.
///
/// All vectors are indexed by microphone id and have the same length as
/// `positions`. Field order and units (cm, s, linear gain) are part of the
/// serialized format.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GeometrySnapshot {
    pub positions: Vec<Position>,
    pub active_mics: Vec<bool>,
    pub target: Position,
    pub trolley_y: F,
    pub delays: Vec<F>,
    pub steering_vector: Vec<F>,
    pub gains: Vec<F>,
}

impl GeometrySnapshot {
    /// Snapshot without steering information, delays and steering are zero
    /// and gains one.
    #[must_use]
    pub fn new(hardware: HardwareGeometry, target: Position) -> Self {
        let HardwareGeometry {
            positions,
            mut active_mics,
            trolley_y,
        } = hardware;
        let len = positions.len();
        active_mics.resize(len, false);
        Self {
            positions,
            active_mics,
            target,
            trolley_y,
            delays: vec![0.; len],
            steering_vector: vec![0.; len],
            gains: vec![1.; len],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[must_use]
    pub fn is_active(&self, mic: usize) -> bool {
        self.active_mics.get(mic).copied().unwrap_or(false)
    }

    /// Active microphone ids of `sub_array`.
    pub fn active_in(&self, sub_array: SubArray) -> impl Iterator<Item = usize> + '_ {
        sub_array
            .channels(self.len())
            .filter(|&mic| self.is_active(mic))
    }

    /// Mean position of the microphones of `sub_array`, active or not.
    #[must_use]
    pub fn centroid(&self, sub_array: SubArray) -> Position {
        let range = sub_array.channels(self.len());
        let count = range.len().max(1) as F;
        self.positions[range]
            .iter()
            .fold(Position::zeros(), |a, p| a + p / count)
    }
}

/// Holds the last built snapshot and the inputs it was built from.
///
/// A new snapshot is built only when the hardware geometry or the target
/// differ from the cached inputs.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    inputs: Option<(HardwareGeometry, Position)>,
    snapshot: Option<Arc<GeometrySnapshot>>,
}

impl SnapshotCache {
    /// Returns the cached snapshot, or the result of `build` if the inputs
    /// changed. The flag is `true` when a new snapshot was built.
    pub fn get_or_rebuild(
        &mut self,
        hardware: HardwareGeometry,
        target: Position,
        build: impl FnOnce(GeometrySnapshot) -> GeometrySnapshot,
    ) -> (Arc<GeometrySnapshot>, bool) {
        if let (Some((cached_hw, cached_target)), Some(snapshot)) = (&self.inputs, &self.snapshot)
        {
            if *cached_hw == hardware && *cached_target == target {
                return (Arc::clone(snapshot), false);
            }
        }
        let snapshot = Arc::new(build(GeometrySnapshot::new(hardware.clone(), target)));
        self.inputs = Some((hardware, target));
        self.snapshot = Some(Arc::clone(&snapshot));
        (snapshot, true)
    }

    pub fn invalidate(&mut self) {
        self.inputs = None;
        self.snapshot = None;
    }
}
