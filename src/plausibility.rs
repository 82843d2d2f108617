//! Validation of raw localization candidates against the room.
//!
//! Every point handed out by [`PlausibilityChecker`] lies inside the room
//! box, whatever the input:
//!
//! | candidate                                         | result                     |
//! |---------------------------------------------------|----------------------------|
//! | `None`, NaN or infinite coordinate                | fallback                   |
//! | behind the sub-array (against its facing)         | fallback                   |
//! | outside the room by at most `clamp_margin`        | clamped to the room        |
//! | outside the room by more than `clamp_margin`      | fallback                   |
//! | inside the room                                   | accepted                   |
//!
//! The fallback is the last accepted or clamped point of the same sub-array,
//! initially the configured start target.
use log::debug;

use crate::config::EstimatorConfig;
use crate::geometry::{RoomBounds, SubArray};
use crate::{Error, Position, F};

/// Outcome of a plausibility check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Plausibility {
    Accepted(Position),
    Clamped(Position),
    /// The candidate was rejected, the point is the last known good one.
    Fallback(Position),
}

impl Plausibility {
    #[must_use]
    pub fn point(self) -> Position {
        match self {
            Plausibility::Accepted(p) | Plausibility::Clamped(p) | Plausibility::Fallback(p) => p,
        }
    }

    /// Whether the candidate contributed to the result.
    #[must_use]
    pub fn is_measurement(self) -> bool {
        !matches!(self, Plausibility::Fallback(_))
    }
}

#[derive(Clone, Copy, Debug)]
struct ArrayState {
    origin: Position,
    facing: Position,
    last_good: Position,
}

#[derive(Clone, Debug)]
pub struct PlausibilityChecker {
    room: RoomBounds,
    clamp_margin: F,
    arrays: [ArrayState; 2],
}

impl PlausibilityChecker {
    /// Both sub-arrays start at `initial` (clamped into the room), with no
    /// half-space restriction until [`PlausibilityChecker::set_array`] is
    /// called.
    #[must_use]
    pub fn new(room: RoomBounds, clamp_margin: F, initial: Position) -> Self {
        let state = ArrayState {
            origin: Position::zeros(),
            facing: Position::zeros(),
            last_good: room.clamp(&initial),
        };
        Self {
            room,
            clamp_margin: clamp_margin.max(0.),
            arrays: [state; 2],
        }
    }

    #[must_use]
    pub fn from_config(config: &EstimatorConfig) -> Self {
        let mut checker = Self::new(config.room, config.clamp_margin, config.initial_target);
        for sub_array in SubArray::ALL {
            checker.arrays[sub_array.index()].facing = config.sub_array(sub_array).facing;
        }
        checker
    }

    /// Updates where `sub_array` sits and which way it looks, the half-space
    /// test uses `(candidate - origin) · facing >= 0`.
    pub fn set_array(&mut self, sub_array: SubArray, origin: Position, facing: Position) {
        let state = &mut self.arrays[sub_array.index()];
        state.origin = origin;
        state.facing = facing;
    }

    #[must_use]
    pub fn room(&self) -> &RoomBounds {
        &self.room
    }

    #[must_use]
    pub fn last_good(&self, sub_array: SubArray) -> Position {
        self.arrays[sub_array.index()].last_good
    }

    pub fn check_array1(&mut self, candidate: Option<Position>) -> Position {
        self.check(SubArray::Array1, candidate).point()
    }

    pub fn check_array2(&mut self, candidate: Option<Position>) -> Position {
        self.check(SubArray::Array2, candidate).point()
    }

    pub fn check(&mut self, sub_array: SubArray, candidate: Option<Position>) -> Plausibility {
        let room = self.room;
        let clamp_margin = self.clamp_margin;
        let state = &mut self.arrays[sub_array.index()];
        let result = match candidate.map(|c| classify(&room, clamp_margin, state, c)) {
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                debug!("{sub_array}: {e}, using last known good {:?}", state.last_good);
                Plausibility::Fallback(state.last_good)
            }
            None => Plausibility::Fallback(state.last_good),
        };
        if result.is_measurement() {
            state.last_good = result.point();
        }
        result
    }
}

fn classify(
    room: &RoomBounds,
    clamp_margin: F,
    state: &ArrayState,
    candidate: Position,
) -> Result<Plausibility, Error> {
    if !candidate.iter().all(|v| v.is_finite()) {
        return Err(Error::ImplausibleEstimate);
    }
    if (candidate - state.origin).dot(&state.facing) < 0. {
        return Err(Error::ImplausibleEstimate);
    }
    let outside = room.distance_outside(&candidate);
    if outside == 0. {
        Ok(Plausibility::Accepted(candidate))
    } else if outside <= clamp_margin {
        Ok(Plausibility::Clamped(room.clamp(&candidate)))
    } else {
        Err(Error::ImplausibleEstimate)
    }
}
