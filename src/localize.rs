//! Closed form multilateration from time differences of arrival.
//!
//! With the reference mic at `p_0`, source at `x`, `d_0 = |x - p_0|` and the
//! measured path difference `r_i = |x - p_i| - d_0`, subtracting the squared
//! range equation of the reference from that of mic `i` cancels `|x|²`:
//!
//! ```text
//! 2 (p_i - p_0)·(x - p_0) + 2 r_i d_0 = |p_i - p_0|² - r_i²
//! ```
//!
//! which is linear in `(x - p_0, d_0)` and solved in the least squares sense.
//! For planar arrays the component normal to the plane drops out; it is
//! recovered from `d_0` and the side of the array the sub-array faces.
use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;
use nalgebra::{DMatrix, DVector, Matrix3xX};

use crate::config::EstimatorConfig;
use crate::gcc::{MicPair, PairwiseDelay};
use crate::geometry::SubArray;
use crate::{Error, Position, Result, F, SPEED_OF_SOUND};

/// Ratio of smallest to largest singular value below which a system counts as
/// singular.
const CONDITION_LIMIT: F = 1e-10;
/// Relative thickness below which an array is treated as planar.
const PLANAR_LIMIT: F = 1e-6;

#[derive(Clone, Debug)]
pub struct Localizer {
    sample_rate: F,
    speed_of_sound: F,
    facing: [Position; 2],
}

impl Localizer {
    #[must_use]
    pub fn new(sample_rate: F, speed_of_sound: F) -> Self {
        Self {
            sample_rate,
            speed_of_sound,
            facing: [Position::z(); 2],
        }
    }

    #[must_use]
    pub fn from_config(config: &EstimatorConfig) -> Self {
        let mut localizer = Self::new(config.sample_rate, config.speed_of_sound);
        for sub_array in SubArray::ALL {
            localizer.facing[sub_array.index()] = config.sub_array(sub_array).facing;
        }
        localizer
    }

    #[must_use]
    pub fn with_facing(mut self, sub_array: SubArray, facing: Position) -> Self {
        self.facing[sub_array.index()] = facing;
        self
    }

    /// Source position from the delays measured against `ref_mic_id`.
    ///
    /// `positions` is indexed by mic id. Returns `None` if fewer than three
    /// usable delays exist or the geometry is degenerate.
    #[must_use]
    pub fn solve(
        &self,
        reference_position: &Position,
        ref_mic_id: usize,
        delays: &BTreeMap<MicPair, PairwiseDelay>,
        positions: &[Position],
        sub_array: SubArray,
    ) -> Option<Position> {
        match self.try_solve(reference_position, ref_mic_id, delays, positions, sub_array) {
            Ok(position) => Some(position),
            Err(e) => {
                debug!("{sub_array}: localization failed: {e}");
                None
            }
        }
    }

    /// Like [`Localizer::solve`] but reports why no position was found.
    ///
    /// # Errors
    /// [`Error::InsufficientChannels`] or [`Error::SingularGeometry`].
    pub fn try_solve(
        &self,
        reference_position: &Position,
        ref_mic_id: usize,
        delays: &BTreeMap<MicPair, PairwiseDelay>,
        positions: &[Position],
        sub_array: SubArray,
    ) -> Result<Position> {
        let measurements = delays
            .values()
            .filter(|delay| delay.pair.reference == ref_mic_id)
            .filter_map(|delay| {
                positions.get(delay.pair.other).map(|&position| {
                    (
                        position,
                        delay.distance_difference(self.sample_rate, self.speed_of_sound),
                    )
                })
            })
            .collect_vec();
        self.solve_distance_differences(
            reference_position,
            &measurements,
            &self.facing[sub_array.index()],
        )
    }

    /// Solves for the source given `(mic position, path difference to the
    /// reference)` pairs.
    ///
    /// Planar arrays need three measurements and place the source on the
    /// `facing` side, other arrays need four.
    ///
    /// # Errors
    /// [`Error::InsufficientChannels`] or [`Error::SingularGeometry`].
    pub fn solve_distance_differences(
        &self,
        reference: &Position,
        measurements: &[(Position, F)],
        facing: &Position,
    ) -> Result<Position> {
        if measurements.len() < 3 {
            return Err(Error::InsufficientChannels {
                needed: 3,
                found: measurements.len(),
            });
        }
        let relative = measurements
            .iter()
            .map(|(position, r)| (position - reference, *r))
            .collect_vec();

        match plane_normal(&relative) {
            Some((normal, e1, e2)) => solve_planar(&relative, &normal, &e1, &e2, facing),
            None => solve_spatial(&relative),
        }
        .map(|offset| reference + offset)
    }
}

impl Default for Localizer {
    fn default() -> Self {
        Self::new(48_000., SPEED_OF_SOUND)
    }
}

/// Orthonormal frame `(normal, e1, e2)` of the plane containing the
/// reference (origin) and all measurement positions, `None` if they span
/// space.
fn plane_normal(relative: &[(Position, F)]) -> Option<(Position, Position, Position)> {
    let points = std::iter::once(Position::zeros())
        .chain(relative.iter().map(|(q, _)| *q))
        .collect_vec();
    let centroid = points.iter().sum::<Position>() / points.len() as F;
    let centered = Matrix3xX::from_columns(&points.iter().map(|p| p - centroid).collect_vec());
    let svd = centered.svd(true, false);
    let u = svd.u?;
    let singular = svd.singular_values;
    let order = (0..singular.len())
        .sorted_by(|&a, &b| singular[b].total_cmp(&singular[a]))
        .collect_vec();
    let (largest, smallest) = (singular[order[0]], singular[order[order.len() - 1]]);
    if order.len() == 3 && smallest > largest * PLANAR_LIMIT {
        return None;
    }
    let e1 = u.column(order[0]).into_owned();
    let e2 = u.column(order[1]).into_owned();
    Some((e1.cross(&e2).normalize(), e1, e2))
}

fn least_squares(a: DMatrix<F>, b: &DVector<F>) -> Result<DVector<F>> {
    let svd = a.svd(true, true);
    let (min, max) = svd
        .singular_values
        .iter()
        .copied()
        .minmax_by(F::total_cmp)
        .into_option()
        .ok_or(Error::SingularGeometry)?;
    if max <= 0. || min <= max * CONDITION_LIMIT {
        return Err(Error::SingularGeometry);
    }
    let solution = svd
        .solve(b, max * CONDITION_LIMIT)
        .map_err(|_| Error::SingularGeometry)?;
    if solution.iter().all(|v| v.is_finite()) {
        Ok(solution)
    } else {
        Err(Error::SingularGeometry)
    }
}

fn solve_spatial(relative: &[(Position, F)]) -> Result<Position> {
    if relative.len() < 4 {
        return Err(Error::InsufficientChannels {
            needed: 4,
            found: relative.len(),
        });
    }
    let a = DMatrix::from_fn(relative.len(), 4, |row, col| {
        let (q, r) = &relative[row];
        2. * if col < 3 { q[col] } else { *r }
    });
    let b = DVector::from_fn(relative.len(), |row, _| {
        let (q, r) = &relative[row];
        q.norm_squared() - r * r
    });
    let solution = least_squares(a, &b)?;
    Ok(Position::new(solution[0], solution[1], solution[2]))
}

fn solve_planar(
    relative: &[(Position, F)],
    normal: &Position,
    e1: &Position,
    e2: &Position,
    facing: &Position,
) -> Result<Position> {
    let a = DMatrix::from_fn(relative.len(), 3, |row, col| {
        let (q, r) = &relative[row];
        2. * match col {
            0 => q.dot(e1),
            1 => q.dot(e2),
            _ => *r,
        }
    });
    let b = DVector::from_fn(relative.len(), |row, _| {
        let (q, r) = &relative[row];
        q.norm_squared() - r * r
    });
    let solution = least_squares(a, &b)?;
    let (u, v, range) = (solution[0], solution[1], solution[2]);
    let height_squared = range * range - u * u - v * v;
    // a slightly negative radicand is measurement noise, a large one means
    // the delays do not fit any point
    if range < 0. || height_squared < -0.01 * range * range {
        return Err(Error::SingularGeometry);
    }
    let height = height_squared.max(0.).sqrt();
    let height = if facing.dot(normal) < 0. { -height } else { height };
    Ok(e1 * u + e2 * v + normal * height)
}
