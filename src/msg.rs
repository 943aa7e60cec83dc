//! Measurement messages and their total ordering.
//!
//! Every message carries a timestamp used as the primary sort key. Within a
//! timestamp the kind rank keeps the filter discipline: prediction-driving
//! IMU first, then IMU updates, tracker batches, and fiducials; remaining
//! ties break by sensor id.

use nalgebra::{Matrix3, Matrix6, UnitQuaternion, Vector2, Vector3};

use crate::ekf::state::SensorId;
use crate::ekf::update::msckf::FeatureTrack;

/// One inertial sample.
#[derive(Debug, Clone)]
pub struct ImuSample {
    pub sensor_id: SensorId,
    pub time: f64,
    pub acceleration: Vector3<f64>,
    pub acceleration_cov: Matrix3<f64>,
    pub angular_rate: Vector3<f64>,
    pub angular_rate_cov: Matrix3<f64>,
    /// True for the single IMU allowed to drive prediction.
    pub is_prediction_driver: bool,
}

/// A detected keypoint, before track association.
#[derive(Debug, Clone)]
pub struct DetectedFeature {
    pub feature_id: u32,
    pub pixel: Vector2<f64>,
    /// Detector response; used by grid downsampling.
    pub response: f64,
}

/// One camera frame with its detected features.
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub sensor_id: SensorId,
    pub time: f64,
    pub features: Vec<DetectedFeature>,
}

/// A batch of terminated feature tracks from an external tracker.
#[derive(Debug, Clone)]
pub struct TrackerBatch {
    pub sensor_id: SensorId,
    pub time: f64,
    pub tracks: Vec<FeatureTrack>,
}

/// A fiducial board pose estimate from a board detector.
#[derive(Debug, Clone)]
pub struct FiducialDetection {
    pub sensor_id: SensorId,
    pub time: f64,
    pub board_id: u32,
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub covariance: Matrix6<f64>,
}

/// Tagged measurement variant routed by the orchestrator.
#[derive(Debug, Clone)]
pub enum Message {
    Imu(ImuSample),
    Frame(FrameSample),
    TrackerBatch(TrackerBatch),
    Fiducial(FiducialDetection),
}

impl Message {
    pub fn time(&self) -> f64 {
        match self {
            Message::Imu(m) => m.time,
            Message::Frame(m) => m.time,
            Message::TrackerBatch(m) => m.time,
            Message::Fiducial(m) => m.time,
        }
    }

    pub fn sensor_id(&self) -> SensorId {
        match self {
            Message::Imu(m) => m.sensor_id,
            Message::Frame(m) => m.sensor_id,
            Message::TrackerBatch(m) => m.sensor_id,
            Message::Fiducial(m) => m.sensor_id,
        }
    }

    /// Dispatch rank inside a single timestamp.
    pub fn kind_rank(&self) -> u8 {
        match self {
            Message::Imu(m) if m.is_prediction_driver => 0,
            Message::Imu(_) => 1,
            Message::Frame(_) | Message::TrackerBatch(_) => 2,
            Message::Fiducial(_) => 3,
        }
    }
}
