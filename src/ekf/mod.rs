//! The calibration EKF: joint state, covariance, predict and update steps.

pub mod filter;
pub mod state;
pub mod update;

use thiserror::Error;

pub use filter::Ekf;
pub use state::{
    AugmentedState, BodyState, CamState, FrameId, ImuState, SensorId, State, AUG_STATE_SIZE,
    BODY_STATE_SIZE, CAM_EXTRINSIC_SIZE, GRAVITY, IMU_EXTRINSIC_SIZE, IMU_INTRINSIC_SIZE,
};

/// Error kinds of the estimation core.
///
/// `ConfigInvalid` and `SealedState` abort at startup. `DimensionMismatch`
/// and `NonFinite` mean the filter is corrupt and are fatal. The remaining
/// kinds drop the offending message without mutating the state.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("sensor {0} is already registered")]
    AlreadyRegistered(SensorId),
    #[error("initial covariance block is {got}x{got}, expected {expected}x{expected}")]
    InvalidShape { expected: usize, got: usize },
    #[error("sensor registration after the first measurement update")]
    SealedState,
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("innovation matrix is singular")]
    NumericalSingular,
    #[error("message at t={time} is older than t={current} by more than the tolerance")]
    StaleMessage { time: f64, current: f64 },
    #[error("no sensor registered with id {0}")]
    UnknownSensorId(SensorId),
    #[error("non-finite state or covariance after update")]
    NonFinite,
}
