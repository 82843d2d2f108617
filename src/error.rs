use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while estimating and steering.
///
/// [`crate::Estimator`] only returns the lifecycle variants
/// ([`Error::Spawn`], [`Error::WorkerPanicked`], [`Error::AlreadyRunning`])
/// and [`Error::CalibrationNotReady`]. Inside the processing cycle the others
/// lead to a fallback to the last valid state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Frame does not have `(channels, samples)` of the expected shape.
    #[error("invalid frame shape: expected {expected:?} (channels, samples), found {found:?}")]
    InvalidFrameShape {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("insufficient channels: need {needed}, found {found}")]
    InsufficientChannels { needed: usize, found: usize },
    #[error("localization system is singular for the current geometry")]
    SingularGeometry,
    #[error("implausible position estimate")]
    ImplausibleEstimate,
    #[error("calibration not ready: {collected} of {needed} frames collected")]
    CalibrationNotReady { collected: usize, needed: usize },
    /// Unexpected failure inside one processing cycle.
    #[error("worker fault: {0}")]
    WorkerFault(String),
    #[error("failed to spawn estimator thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("estimator thread panicked")]
    WorkerPanicked,
    #[error("estimator is already running")]
    AlreadyRunning,
}
