//! Per-sensor measurement updates. Each updater borrows the filter for the
//! duration of one measurement; none of them owns state.

pub mod fiducial;
pub mod imu;
pub mod msckf;

pub use fiducial::{BoardDetection, FiducialUpdater};
pub use imu::ImuUpdater;
pub use msckf::{FeaturePoint, FeatureTrack, MsckfUpdater};
