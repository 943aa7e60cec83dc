//! Direct relative-pose update from a fiducial board detection.
//!
//! The detector measures the board pose in the camera frame; the predicted
//! measurement composes the body pose, the camera extrinsic, and the known
//! board pose in the global frame. Position residuals are metric, rotation
//! residuals are rotation vectors.

use nalgebra::{DMatrix, DVector, Matrix6, UnitQuaternion, Vector3};
use tracing::debug;

use crate::ekf::state::{SensorId, BODY_STATE_SIZE, CAM_EXTRINSIC_SIZE};
use crate::ekf::{Ekf, FilterError};
use crate::geometry::{min_bound_diagonal, quat_log_diff, skew};

/// Diagonal floor on the detection covariance.
const MIN_BOARD_VARIANCE: f64 = 1e-6;

/// A fiducial board detection: the board pose in the camera frame.
#[derive(Debug, Clone)]
pub struct BoardDetection {
    pub board_id: u32,
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub covariance: Matrix6<f64>,
}

/// Correction summary for the per-camera board log.
pub struct FiducialUpdateLog {
    pub residual: DVector<f64>,
    pub body_update: DVector<f64>,
    pub cam_update: DVector<f64>,
}

pub struct FiducialUpdater {
    cam_id: SensorId,
    /// Board pose in the global frame, from configuration.
    pos_f_in_g: Vector3<f64>,
    ang_f_to_g: UnitQuaternion<f64>,
}

impl FiducialUpdater {
    pub fn new(
        cam_id: SensorId,
        pos_f_in_g: Vector3<f64>,
        ang_f_to_g: UnitQuaternion<f64>,
    ) -> Self {
        Self {
            cam_id,
            pos_f_in_g,
            ang_f_to_g,
        }
    }

    pub fn cam_id(&self) -> SensorId {
        self.cam_id
    }

    /// Applies one board detection.
    pub fn update(
        &self,
        ekf: &mut Ekf,
        time: f64,
        detection: &BoardDetection,
    ) -> Result<FiducialUpdateLog, FilterError> {
        ekf.predict(time);

        let cam = ekf
            .state
            .cam_state(self.cam_id)
            .ok_or(FilterError::UnknownSensorId(self.cam_id))?
            .clone();
        let body = ekf.state.body.clone();

        let r_g_to_b = body.orientation.inverse().to_rotation_matrix().into_inner();
        let r_b_to_c = cam.ang_c_to_b.inverse().to_rotation_matrix().into_inner();

        // Predicted board pose in the camera frame.
        let pos_f_in_b = r_g_to_b * (self.pos_f_in_g - body.position);
        let pos_f_in_c = r_b_to_c * (pos_f_in_b - cam.pos_c_in_b);
        let ang_f_to_c =
            (body.orientation * cam.ang_c_to_b).inverse() * self.ang_f_to_g;

        let mut residual = DVector::zeros(6);
        residual
            .fixed_rows_mut::<3>(0)
            .copy_from(&(detection.position - pos_f_in_c));
        residual
            .fixed_rows_mut::<3>(3)
            .copy_from(&quat_log_diff(&detection.orientation, &ang_f_to_c));
        debug!(
            cam_id = self.cam_id,
            board_id = detection.board_id,
            residual = %residual.transpose(),
            "fiducial residual"
        );

        let state_size = ekf.state.state_size();
        let (cam_start, _) = ekf
            .state
            .cam_slice(self.cam_id)
            .ok_or(FilterError::UnknownSensorId(self.cam_id))?;

        let mut jacobian = DMatrix::zeros(6, state_size);

        // Position rows against body position and orientation.
        let d_pos_d_body = -r_b_to_c * r_g_to_b;
        jacobian.view_mut((0, 0), (3, 3)).copy_from(&d_pos_d_body);
        jacobian
            .view_mut((0, 9), (3, 3))
            .copy_from(&(r_b_to_c * r_g_to_b * skew(&(self.pos_f_in_g - body.position))));
        // Position rows against the camera extrinsic.
        jacobian
            .view_mut((0, cam_start), (3, 3))
            .copy_from(&(-r_b_to_c));
        jacobian
            .view_mut((0, cam_start + 3), (3, 3))
            .copy_from(&(r_b_to_c * skew(&(pos_f_in_b - cam.pos_c_in_b))));

        // Rotation rows.
        jacobian
            .view_mut((3, 9), (3, 3))
            .copy_from(&(-(r_b_to_c * r_g_to_b)));
        jacobian
            .view_mut((3, cam_start + 3), (3, 3))
            .copy_from(&(-r_b_to_c));

        let mut noise = DMatrix::from_fn(6, 6, |i, j| detection.covariance[(i, j)]);
        min_bound_diagonal(&mut noise, MIN_BOARD_VARIANCE);

        let delta = ekf.kalman_update(&jacobian, &residual, &noise)?;

        Ok(FiducialUpdateLog {
            residual,
            body_update: delta.rows(0, BODY_STATE_SIZE).into_owned(),
            cam_update: delta.rows(cam_start, CAM_EXTRINSIC_SIZE).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ekf::state::{BodyState, CamState};
    use approx::assert_relative_eq;

    fn filter_with_camera() -> Ekf {
        let mut ekf = Ekf::new(DVector::from_element(BODY_STATE_SIZE, 1e-4));
        ekf.initialize(0.0, BodyState::default());
        ekf.register_camera(
            2,
            CamState {
                pos_c_in_b: Vector3::new(0.1, 0.0, 0.0),
                ang_c_to_b: UnitQuaternion::identity(),
                clones: Vec::new(),
            },
            DMatrix::identity(6, 6) * 1e-4,
        )
        .unwrap();
        ekf
    }

    fn board_updater() -> FiducialUpdater {
        FiducialUpdater::new(2, Vector3::new(0.0, 0.0, 3.0), UnitQuaternion::identity())
    }

    fn perfect_detection(ekf: &Ekf, updater: &FiducialUpdater) -> BoardDetection {
        let cam = ekf.state.cam_state(2).unwrap();
        let body = &ekf.state.body;
        let pos_f_in_b = body.orientation.inverse() * (updater.pos_f_in_g - body.position);
        BoardDetection {
            board_id: 0,
            position: cam.ang_c_to_b.inverse() * (pos_f_in_b - cam.pos_c_in_b),
            orientation: (body.orientation * cam.ang_c_to_b).inverse() * updater.ang_f_to_g,
            covariance: Matrix6::identity() * 1e-4,
        }
    }

    #[test]
    fn test_perfect_detection_gives_zero_residual() {
        let mut ekf = filter_with_camera();
        let updater = board_updater();
        let detection = perfect_detection(&ekf, &updater);

        let log = updater.update(&mut ekf, 0.1, &detection).unwrap();

        assert_relative_eq!(log.residual.norm(), 0.0, epsilon = 1e-10);
        assert!(log.body_update.norm() < 1e-9);
    }

    #[test]
    fn test_offset_detection_pulls_body_position() {
        let mut ekf = filter_with_camera();
        let updater = board_updater();
        let mut detection = perfect_detection(&ekf, &updater);
        // Board appears 10 cm closer than predicted: the body moved forward.
        detection.position.z -= 0.1;

        let log = updater.update(&mut ekf, 0.1, &detection).unwrap();

        assert!(log.residual.norm() > 0.0);
        assert!(ekf.state.body.position.z > 1e-4);
    }

    #[test]
    fn test_update_keeps_covariance_symmetric() {
        let mut ekf = filter_with_camera();
        let updater = board_updater();
        let mut detection = perfect_detection(&ekf, &updater);
        detection.position.x += 0.05;

        updater.update(&mut ekf, 0.1, &detection).unwrap();

        let cov = ekf.cov().clone();
        assert_relative_eq!(cov.clone(), cov.transpose(), epsilon = 1e-10);
    }

    #[test]
    fn test_unknown_camera_is_rejected() {
        let mut ekf = filter_with_camera();
        let updater = FiducialUpdater::new(77, Vector3::zeros(), UnitQuaternion::identity());
        let detection = BoardDetection {
            board_id: 0,
            position: Vector3::new(0.0, 0.0, 1.0),
            orientation: UnitQuaternion::identity(),
            covariance: Matrix6::identity() * 1e-4,
        };

        let out = updater.update(&mut ekf, 0.1, &detection);
        assert!(matches!(out, Err(FilterError::UnknownSensorId(77))));
    }
}
