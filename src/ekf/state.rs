//! Joint filter state: body kinematics plus per-sensor calibration blocks.
//!
//! The flat error-state layout is body (18) followed by each IMU in
//! registration order, then each camera in registration order. A camera
//! block is its extrinsic pair followed by the sliding window of clones.
//! Offsets are recomputed on every query: clone eviction shifts every later
//! camera's base index, so nothing here may be cached across a mutation.

use nalgebra::{DVector, UnitQuaternion, Vector3};

use crate::geometry::apply_rotation_error;

/// Error-state scalars in the body block:
/// position, velocity, acceleration, orientation, rate, angular acceleration.
pub const BODY_STATE_SIZE: usize = 18;
/// Error-state scalars of an IMU extrinsic pair (position, orientation).
pub const IMU_EXTRINSIC_SIZE: usize = 6;
/// Error-state scalars of an IMU intrinsic pair (accel bias, gyro bias).
pub const IMU_INTRINSIC_SIZE: usize = 6;
/// Error-state scalars of a camera extrinsic pair.
pub const CAM_EXTRINSIC_SIZE: usize = 6;
/// Error-state scalars of one camera clone (camera pose + body pose).
pub const AUG_STATE_SIZE: usize = 12;

/// Specific-force offset measured by a stationary, level accelerometer.
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, 9.80665);

pub type SensorId = u32;
pub type FrameId = u32;

/// Rigid-body state of the platform.
///
/// Linear position/velocity/acceleration are expressed in the global frame;
/// angular rate and angular acceleration in the body frame. The orientation
/// is the nominal body-to-global quaternion; its covariance entry is the
/// 3-vector rotation error, zero at linearization.
#[derive(Debug, Clone)]
pub struct BodyState {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub angular_velocity: Vector3<f64>,
    pub angular_acceleration: Vector3<f64>,
}

impl Default for BodyState {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            angular_velocity: Vector3::zeros(),
            angular_acceleration: Vector3::zeros(),
        }
    }
}

impl BodyState {
    /// Flattens to the 18-vector used by the data log (orientation as a
    /// rotation vector).
    pub fn to_vector(&self) -> DVector<f64> {
        let mut out = DVector::zeros(BODY_STATE_SIZE);
        out.fixed_rows_mut::<3>(0).copy_from(&self.position);
        out.fixed_rows_mut::<3>(3).copy_from(&self.velocity);
        out.fixed_rows_mut::<3>(6).copy_from(&self.acceleration);
        out.fixed_rows_mut::<3>(9).copy_from(&self.orientation.scaled_axis());
        out.fixed_rows_mut::<3>(12).copy_from(&self.angular_velocity);
        out.fixed_rows_mut::<3>(15).copy_from(&self.angular_acceleration);
        out
    }

    fn apply_delta(&mut self, delta: &DVector<f64>, start: usize) {
        self.position += delta.fixed_rows::<3>(start);
        self.velocity += delta.fixed_rows::<3>(start + 3);
        self.acceleration += delta.fixed_rows::<3>(start + 6);
        let dtheta: Vector3<f64> = delta.fixed_rows::<3>(start + 9).into_owned();
        self.orientation = apply_rotation_error(&self.orientation, &dtheta);
        self.angular_velocity += delta.fixed_rows::<3>(start + 12);
        self.angular_acceleration += delta.fixed_rows::<3>(start + 15);
    }
}

/// Calibration state of one IMU.
///
/// Which halves participate in the estimated state is fixed at registration
/// by the two flags; a base IMU with neither flag contributes zero scalars.
#[derive(Debug, Clone)]
pub struct ImuState {
    pub pos_i_in_b: Vector3<f64>,
    pub ang_i_to_b: UnitQuaternion<f64>,
    pub acc_bias: Vector3<f64>,
    pub omg_bias: Vector3<f64>,
    pub is_extrinsic: bool,
    pub is_intrinsic: bool,
}

impl ImuState {
    pub fn size(&self) -> usize {
        let mut size = 0;
        if self.is_extrinsic {
            size += IMU_EXTRINSIC_SIZE;
        }
        if self.is_intrinsic {
            size += IMU_INTRINSIC_SIZE;
        }
        size
    }

    fn apply_delta(&mut self, delta: &DVector<f64>, mut start: usize) {
        if self.is_extrinsic {
            self.pos_i_in_b += delta.fixed_rows::<3>(start);
            let dtheta: Vector3<f64> = delta.fixed_rows::<3>(start + 3).into_owned();
            self.ang_i_to_b = apply_rotation_error(&self.ang_i_to_b, &dtheta);
            start += IMU_EXTRINSIC_SIZE;
        }
        if self.is_intrinsic {
            self.acc_bias += delta.fixed_rows::<3>(start);
            self.omg_bias += delta.fixed_rows::<3>(start + 3);
        }
    }
}

/// Snapshot of the camera pose and the body pose at frame capture.
#[derive(Debug, Clone)]
pub struct AugmentedState {
    pub frame_id: FrameId,
    pub cam_position: Vector3<f64>,
    pub cam_orientation: UnitQuaternion<f64>,
    pub body_position: Vector3<f64>,
    pub body_orientation: UnitQuaternion<f64>,
}

impl AugmentedState {
    fn apply_delta(&mut self, delta: &DVector<f64>, start: usize) {
        self.cam_position += delta.fixed_rows::<3>(start);
        let dtheta_cam: Vector3<f64> = delta.fixed_rows::<3>(start + 3).into_owned();
        self.cam_orientation = apply_rotation_error(&self.cam_orientation, &dtheta_cam);
        self.body_position += delta.fixed_rows::<3>(start + 6);
        let dtheta_body: Vector3<f64> = delta.fixed_rows::<3>(start + 9).into_owned();
        self.body_orientation = apply_rotation_error(&self.body_orientation, &dtheta_body);
    }
}

/// Calibration state of one camera plus its clone window.
#[derive(Debug, Clone)]
pub struct CamState {
    pub pos_c_in_b: Vector3<f64>,
    pub ang_c_to_b: UnitQuaternion<f64>,
    pub clones: Vec<AugmentedState>,
}

impl CamState {
    pub fn size(&self) -> usize {
        CAM_EXTRINSIC_SIZE + AUG_STATE_SIZE * self.clones.len()
    }

    /// Clone matching `frame_id`, if it is still in the window.
    pub fn clone_for_frame(&self, frame_id: FrameId) -> Option<&AugmentedState> {
        self.clones.iter().find(|aug| aug.frame_id == frame_id)
    }

    fn apply_delta(&mut self, delta: &DVector<f64>, start: usize) {
        self.pos_c_in_b += delta.fixed_rows::<3>(start);
        let dtheta: Vector3<f64> = delta.fixed_rows::<3>(start + 3).into_owned();
        self.ang_c_to_b = apply_rotation_error(&self.ang_c_to_b, &dtheta);
        let mut offset = start + CAM_EXTRINSIC_SIZE;
        for aug in &mut self.clones {
            aug.apply_delta(delta, offset);
            offset += AUG_STATE_SIZE;
        }
    }
}

/// The joint state. Sensor entries are append-only and keep registration
/// order, which defines the covariance layout.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub body: BodyState,
    pub imus: Vec<(SensorId, ImuState)>,
    pub cams: Vec<(SensorId, CamState)>,
}

impl State {
    pub fn state_size(&self) -> usize {
        BODY_STATE_SIZE
            + self.imus.iter().map(|(_, imu)| imu.size()).sum::<usize>()
            + self.cams.iter().map(|(_, cam)| cam.size()).sum::<usize>()
    }

    pub fn body_slice(&self) -> (usize, usize) {
        (0, BODY_STATE_SIZE)
    }

    /// Offset and length of one IMU's block.
    pub fn imu_slice(&self, imu_id: SensorId) -> Option<(usize, usize)> {
        let mut start = BODY_STATE_SIZE;
        for (id, imu) in &self.imus {
            if *id == imu_id {
                return Some((start, imu.size()));
            }
            start += imu.size();
        }
        None
    }

    /// Offset and length of one camera's block (extrinsic plus clones).
    pub fn cam_slice(&self, cam_id: SensorId) -> Option<(usize, usize)> {
        let mut start = BODY_STATE_SIZE
            + self.imus.iter().map(|(_, imu)| imu.size()).sum::<usize>();
        for (id, cam) in &self.cams {
            if *id == cam_id {
                return Some((start, cam.size()));
            }
            start += cam.size();
        }
        None
    }

    /// Offset of one clone inside a camera's block.
    pub fn aug_slice(&self, cam_id: SensorId, frame_id: FrameId) -> Option<(usize, usize)> {
        let (cam_start, _) = self.cam_slice(cam_id)?;
        let (_, cam) = self.cams.iter().find(|(id, _)| *id == cam_id)?;
        let mut start = cam_start + CAM_EXTRINSIC_SIZE;
        for aug in &cam.clones {
            if aug.frame_id == frame_id {
                return Some((start, AUG_STATE_SIZE));
            }
            start += AUG_STATE_SIZE;
        }
        None
    }

    pub fn imu_state(&self, imu_id: SensorId) -> Option<&ImuState> {
        self.imus.iter().find(|(id, _)| *id == imu_id).map(|(_, imu)| imu)
    }

    pub fn cam_state(&self, cam_id: SensorId) -> Option<&CamState> {
        self.cams.iter().find(|(id, _)| *id == cam_id).map(|(_, cam)| cam)
    }

    pub fn cam_state_mut(&mut self, cam_id: SensorId) -> Option<&mut CamState> {
        self.cams
            .iter_mut()
            .find(|(id, _)| *id == cam_id)
            .map(|(_, cam)| cam)
    }

    /// Folds a full-size correction into the state. Quaternion portions
    /// compose through the exponential map; everything else is additive.
    pub fn apply_update(&mut self, delta: &DVector<f64>) {
        debug_assert_eq!(delta.len(), self.state_size());
        self.body.apply_delta(delta, 0);
        let mut offset = BODY_STATE_SIZE;
        for (_, imu) in &mut self.imus {
            imu.apply_delta(delta, offset);
            offset += imu.size();
        }
        for (_, cam) in &mut self.cams {
            cam.apply_delta(delta, offset);
            offset += cam.size();
        }
    }

    /// True when any scalar of the state is NaN. Checked after every update;
    /// a hit means the filter is corrupt.
    pub fn has_nan(&self) -> bool {
        let body_ok = self.body.to_vector().iter().all(|v| v.is_finite());
        let imus_ok = self.imus.iter().all(|(_, imu)| {
            imu.pos_i_in_b.iter().all(|v| v.is_finite())
                && imu.acc_bias.iter().all(|v| v.is_finite())
                && imu.omg_bias.iter().all(|v| v.is_finite())
                && imu.ang_i_to_b.coords.iter().all(|v| v.is_finite())
        });
        let cams_ok = self.cams.iter().all(|(_, cam)| {
            cam.pos_c_in_b.iter().all(|v| v.is_finite())
                && cam.ang_c_to_b.coords.iter().all(|v| v.is_finite())
                && cam.clones.iter().all(|aug| {
                    aug.cam_position.iter().all(|v| v.is_finite())
                        && aug.body_position.iter().all(|v| v.is_finite())
                })
        });
        !(body_ok && imus_ok && cams_ok)
    }
}
