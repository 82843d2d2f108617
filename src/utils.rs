use crate::{Position, F};

pub fn min<'a>(iter: impl IntoIterator<Item = &'a F>) -> Option<F> {
    iter.into_iter().copied().reduce(F::min)
}

pub fn max<'a>(iter: impl IntoIterator<Item = &'a F>) -> Option<F> {
    iter.into_iter().copied().reduce(F::max)
}

pub fn mean<'a>(positions: impl IntoIterator<Item = &'a Position>) -> Option<Position> {
    let (sum, count) = positions
        .into_iter()
        .fold((Position::zeros(), 0usize), |(sum, count), p| (sum + p, count + 1));
    (count > 0).then(|| sum / count as F)
}

pub fn is_finite(position: &Position) -> bool {
    position.iter().all(|v| v.is_finite())
}
