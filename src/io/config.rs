//! YAML configuration tree and its validation.
//!
//! Sensor sections are keyed by name; the `*_list` entries select which
//! ones participate. Validation runs once at startup and turns every
//! structural problem into `ConfigInvalid` before any sensor is built.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::{UnitQuaternion, Vector3};
use serde::Deserialize;

use crate::ekf::state::BODY_STATE_SIZE;
use crate::ekf::FilterError;
use crate::sensors::Intrinsics;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debug_log_level: u8,
    #[serde(default = "default_true")]
    pub data_logging_on: bool,
    #[serde(default = "default_body_data_rate")]
    pub body_data_rate: f64,
    pub filter_params: FilterParams,
    #[serde(default)]
    pub imu_list: Vec<String>,
    #[serde(default)]
    pub camera_list: Vec<String>,
    #[serde(default)]
    pub tracker_list: Vec<String>,
    #[serde(default)]
    pub fiducial_list: Vec<String>,
    #[serde(default)]
    pub imu: BTreeMap<String, ImuConfig>,
    #[serde(default)]
    pub camera: BTreeMap<String, CameraConfig>,
    #[serde(default)]
    pub tracker: BTreeMap<String, TrackerConfig>,
    #[serde(default)]
    pub fiducial: BTreeMap<String, FiducialConfig>,
    #[serde(default)]
    pub sim_params: SimParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterParams {
    pub process_noise: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImuConfig {
    #[serde(default)]
    pub is_extrinsic: bool,
    #[serde(default)]
    pub is_intrinsic: bool,
    #[serde(default = "default_imu_rate")]
    pub rate: f64,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub variance: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub pos_i_in_b: Vec<f64>,
    #[serde(default = "default_quat")]
    pub ang_i_to_b: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub acc_bias: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub omg_bias: Vec<f64>,
    #[serde(default = "default_stability")]
    pub pos_stability: f64,
    #[serde(default = "default_stability")]
    pub ang_stability: f64,
    #[serde(default = "default_stability")]
    pub acc_bias_stability: f64,
    #[serde(default = "default_stability")]
    pub omg_bias_stability: f64,
    #[serde(default)]
    pub use_for_prediction: bool,
    #[serde(default)]
    pub sim_params: ImuSimConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImuSimConfig {
    #[serde(default)]
    pub time_bias_error: f64,
    #[serde(default)]
    pub time_skew_error: f64,
    #[serde(default)]
    pub time_error: f64,
    #[serde(default = "default_vec3")]
    pub acc_error: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub omg_error: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub pos_error: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub ang_error: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub acc_bias_error: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub omg_bias_error: Vec<f64>,
}

impl Default for ImuSimConfig {
    fn default() -> Self {
        empty_section()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_cam_rate")]
    pub rate: f64,
    #[serde(default = "default_vec6")]
    pub variance: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub pos_c_in_b: Vec<f64>,
    #[serde(default = "default_quat")]
    pub ang_c_to_b: Vec<f64>,
    #[serde(default = "default_stability")]
    pub pos_stability: f64,
    #[serde(default = "default_stability")]
    pub ang_stability: f64,
    #[serde(default)]
    pub tracker: String,
    #[serde(default)]
    pub fiducial: String,
    #[serde(default)]
    pub intrinsics: Intrinsics,
    #[serde(default)]
    pub sim_params: CameraSimConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraSimConfig {
    #[serde(default)]
    pub time_bias_error: f64,
    #[serde(default)]
    pub time_skew_error: f64,
    #[serde(default)]
    pub time_error: f64,
    #[serde(default = "default_vec3")]
    pub pos_error: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub ang_error: Vec<f64>,
}

impl Default for CameraSimConfig {
    fn default() -> Self {
        empty_section()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_pixel_error")]
    pub pixel_error: f64,
    #[serde(default = "default_min_track_length")]
    pub min_track_length: usize,
    #[serde(default = "default_max_track_length")]
    pub max_track_length: usize,
    #[serde(default = "default_min_feat_dist")]
    pub min_feat_dist: f64,
    #[serde(default)]
    pub sim_params: TrackerSimConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSimConfig {
    #[serde(default = "default_feature_count")]
    pub feature_count: usize,
    #[serde(default = "default_room_size")]
    pub room_size: f64,
}

impl Default for TrackerSimConfig {
    fn default() -> Self {
        Self {
            feature_count: default_feature_count(),
            room_size: default_room_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FiducialConfig {
    #[serde(default = "default_vec3")]
    pub pos_f_in_g: Vec<f64>,
    #[serde(default = "default_quat")]
    pub ang_f_to_g: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub variance: Vec<f64>,
    #[serde(default = "default_one_u32")]
    pub squares_x: u32,
    #[serde(default = "default_one_u32")]
    pub squares_y: u32,
    #[serde(default)]
    pub square_length: f64,
    #[serde(default)]
    pub marker_length: f64,
    #[serde(default)]
    pub sim_params: FiducialSimConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FiducialSimConfig {
    #[serde(default = "default_vec3")]
    pub pos_error: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub ang_error: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub t_vec_error: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub r_vec_error: Vec<f64>,
}

impl Default for FiducialSimConfig {
    fn default() -> Self {
        empty_section()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimParams {
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub use_seed: bool,
    #[serde(default)]
    pub no_errors: bool,
    #[serde(default = "default_max_time")]
    pub max_time: f64,
    #[serde(default = "default_truth_type")]
    pub truth_type: String,
    #[serde(default)]
    pub stationary_time: f64,
    #[serde(default = "default_vec3")]
    pub pos_frequency: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub ang_frequency: Vec<f64>,
    #[serde(default = "default_vec3")]
    pub pos_offset: Vec<f64>,
    #[serde(default = "default_pos_amplitude")]
    pub pos_amplitude: f64,
    #[serde(default = "default_ang_amplitude")]
    pub ang_amplitude: f64,
    #[serde(default)]
    pub positions: Vec<Vec<f64>>,
    #[serde(default)]
    pub angles: Vec<Vec<f64>>,
}

impl Default for SimParams {
    fn default() -> Self {
        empty_section()
    }
}

/// Deserializes an empty mapping so absent sections pick up the same
/// per-field defaults as present ones.
fn empty_section<T: serde::de::DeserializeOwned>() -> T {
    serde_yaml::from_str("{}").expect("empty section deserializes")
}

fn default_true() -> bool {
    true
}
fn default_body_data_rate() -> f64 {
    1.0
}
fn default_imu_rate() -> f64 {
    100.0
}
fn default_cam_rate() -> f64 {
    10.0
}
fn default_stability() -> f64 {
    1e-9
}
fn default_vec3() -> Vec<f64> {
    vec![0.0, 0.0, 0.0]
}
fn default_vec6() -> Vec<f64> {
    vec![0.0; 6]
}
fn default_quat() -> Vec<f64> {
    vec![1.0, 0.0, 0.0, 0.0]
}
fn default_pixel_error() -> f64 {
    1.0
}
fn default_min_track_length() -> usize {
    2
}
fn default_max_track_length() -> usize {
    20
}
fn default_min_feat_dist() -> f64 {
    1.0
}
fn default_feature_count() -> usize {
    100
}
fn default_room_size() -> f64 {
    10.0
}
fn default_max_time() -> f64 {
    10.0
}
fn default_truth_type() -> String {
    "cyclic".to_string()
}
fn default_pos_amplitude() -> f64 {
    1.0
}
fn default_ang_amplitude() -> f64 {
    0.1
}
fn default_one_u32() -> u32 {
    1
}

/// Converts a 3-element config array.
pub fn to_vector3(values: &[f64]) -> Vector3<f64> {
    Vector3::new(values[0], values[1], values[2])
}

/// Converts a w-first 4-element config array to a unit quaternion.
pub fn to_quaternion(values: &[f64]) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
        values[0], values[1], values[2], values[3],
    ))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open config {}", path.display()))?;
        let config: Config = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Structural checks that must all pass before sensors are built.
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.debug_log_level > 5 {
            return Err(FilterError::ConfigInvalid(format!(
                "debug_log_level {} out of range 0..5",
                self.debug_log_level
            )));
        }
        if self.filter_params.process_noise.len() != BODY_STATE_SIZE {
            return Err(FilterError::ConfigInvalid(format!(
                "process_noise has {} entries, expected {}",
                self.filter_params.process_noise.len(),
                BODY_STATE_SIZE
            )));
        }

        let mut prediction_imus = 0;
        for name in &self.imu_list {
            let imu = self.imu.get(name).ok_or_else(|| {
                FilterError::ConfigInvalid(format!("imu_list names unknown sensor '{name}'"))
            })?;
            if imu.use_for_prediction {
                prediction_imus += 1;
            }

            let state_size =
                6 * usize::from(imu.is_extrinsic) + 6 * usize::from(imu.is_intrinsic);
            if state_size > 0 && imu.variance.len() != state_size {
                return Err(FilterError::ConfigInvalid(format!(
                    "imu '{name}' variance has {} entries, expected {state_size}",
                    imu.variance.len()
                )));
            }
            check_arity(name, "pos_i_in_b", &imu.pos_i_in_b, 3)?;
            check_arity(name, "ang_i_to_b", &imu.ang_i_to_b, 4)?;
            check_arity(name, "acc_bias", &imu.acc_bias, 3)?;
            check_arity(name, "omg_bias", &imu.omg_bias, 3)?;
        }
        if prediction_imus > 0 && self.imu_list.len() > 1 {
            return Err(FilterError::ConfigInvalid(
                "cannot combine multiple IMUs with IMU prediction".to_string(),
            ));
        }

        for name in &self.camera_list {
            let camera = self.camera.get(name).ok_or_else(|| {
                FilterError::ConfigInvalid(format!("camera_list names unknown sensor '{name}'"))
            })?;
            check_arity(name, "pos_c_in_b", &camera.pos_c_in_b, 3)?;
            check_arity(name, "ang_c_to_b", &camera.ang_c_to_b, 4)?;
            check_arity(name, "variance", &camera.variance, 6)?;
            if !camera.tracker.is_empty() && !self.tracker.contains_key(&camera.tracker) {
                return Err(FilterError::ConfigInvalid(format!(
                    "camera '{name}' references unknown tracker '{}'",
                    camera.tracker
                )));
            }
            if !camera.fiducial.is_empty() && !self.fiducial.contains_key(&camera.fiducial) {
                return Err(FilterError::ConfigInvalid(format!(
                    "camera '{name}' references unknown fiducial '{}'",
                    camera.fiducial
                )));
            }
        }

        for name in &self.tracker_list {
            if !self.tracker.contains_key(name) {
                return Err(FilterError::ConfigInvalid(format!(
                    "tracker_list names unknown tracker '{name}'"
                )));
            }
        }
        for name in &self.fiducial_list {
            let fiducial = self.fiducial.get(name).ok_or_else(|| {
                FilterError::ConfigInvalid(format!("fiducial_list names unknown board '{name}'"))
            })?;
            check_arity(name, "pos_f_in_g", &fiducial.pos_f_in_g, 3)?;
            check_arity(name, "ang_f_to_g", &fiducial.ang_f_to_g, 4)?;
        }

        if self.sim_params.truth_type != "cyclic" && self.sim_params.truth_type != "spline" {
            return Err(FilterError::ConfigInvalid(format!(
                "unknown truth_type '{}'",
                self.sim_params.truth_type
            )));
        }
        Ok(())
    }
}

fn check_arity(sensor: &str, field: &str, values: &[f64], expected: usize) -> Result<(), FilterError> {
    if values.len() != expected {
        return Err(FilterError::ConfigInvalid(format!(
            "'{sensor}' field {field} has {} entries, expected {expected}",
            values.len()
        )));
    }
    Ok(())
}
