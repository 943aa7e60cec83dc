//! IMU measurement update.
//!
//! An IMU either corrects the filter through a Kalman update or, when
//! flagged as the prediction driver, dead-reckons the process model
//! directly. At most one IMU in the system may drive prediction.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use tracing::debug;

use crate::ekf::state::{BodyState, ImuState, SensorId, BODY_STATE_SIZE, GRAVITY};
use crate::ekf::{Ekf, FilterError};
use crate::geometry::{min_bound_diagonal, skew};

/// Diagonal floor applied to the accelerometer noise block.
const MIN_ACC_VARIANCE: f64 = 1e-3;
/// Diagonal floor applied to the gyroscope noise block.
const MIN_OMG_VARIANCE: f64 = 1e-2;

/// Correction summary for the per-IMU data log.
pub struct ImuUpdateLog {
    pub residual: DVector<f64>,
    pub body_update: DVector<f64>,
    pub sensor_update: DVector<f64>,
}

pub struct ImuUpdater {
    imu_id: SensorId,
    use_for_prediction: bool,
}

impl ImuUpdater {
    pub fn new(imu_id: SensorId, use_for_prediction: bool) -> Self {
        Self {
            imu_id,
            use_for_prediction,
        }
    }

    pub fn imu_id(&self) -> SensorId {
        self.imu_id
    }

    pub fn is_prediction_driver(&self) -> bool {
        self.use_for_prediction
    }

    /// Specific force and angular rate this IMU should measure given the
    /// current body state:
    ///
    /// ```text
    /// ĥ_acc = Rᵢᵀ ( R_bᵀ (a + g) + α × pᵢ + ω × (ω × pᵢ) ) + b_a
    /// ĥ_ω   = Rᵢᵀ ω + b_ω
    /// ```
    pub fn predict_measurement(body: &BodyState, imu: &ImuState) -> (Vector3<f64>, Vector3<f64>) {
        let acc_at_imu = body.orientation.inverse() * (body.acceleration + GRAVITY)
            + body.angular_acceleration.cross(&imu.pos_i_in_b)
            + body
                .angular_velocity
                .cross(&body.angular_velocity.cross(&imu.pos_i_in_b));

        let acc = imu.ang_i_to_b.inverse() * acc_at_imu + imu.acc_bias;
        let omg = imu.ang_i_to_b.inverse() * body.angular_velocity + imu.omg_bias;
        (acc, omg)
    }

    /// Measurement Jacobian against the body block plus this IMU's own
    /// block. Columns beyond `BODY_STATE_SIZE` exist only for the halves the
    /// IMU actually estimates.
    pub fn measurement_jacobian(body: &BodyState, imu: &ImuState) -> DMatrix<f64> {
        let r_b_inv = body.orientation.inverse().to_rotation_matrix().into_inner();
        let r_i_inv = imu.ang_i_to_b.inverse().to_rotation_matrix().into_inner();
        let omega = body.angular_velocity;
        let pos = imu.pos_i_in_b;

        let mut jacobian = DMatrix::zeros(6, BODY_STATE_SIZE + imu.size());

        // Body acceleration.
        jacobian
            .view_mut((0, 6), (3, 3))
            .copy_from(&(r_i_inv * r_b_inv));
        // Body angular rate, through the centripetal term.
        jacobian.view_mut((0, 12), (3, 3)).copy_from(
            &(r_i_inv
                * (skew(&omega) * skew(&pos).transpose()
                    + skew(&omega.cross(&pos)).transpose())),
        );
        // Body angular acceleration, through the tangential term.
        jacobian
            .view_mut((0, 15), (3, 3))
            .copy_from(&(r_i_inv * skew(&pos)));
        // Gyro row block against the body rate.
        jacobian.view_mut((3, 12), (3, 3)).copy_from(&r_i_inv);

        let mut offset = BODY_STATE_SIZE;
        if imu.is_extrinsic {
            let acc_at_imu = body.orientation.inverse() * (body.acceleration + GRAVITY)
                + body.angular_acceleration.cross(&pos)
                + omega.cross(&omega.cross(&pos));

            jacobian.view_mut((0, offset), (3, 3)).copy_from(
                &(r_i_inv * (skew(&body.angular_acceleration) + skew(&omega) * skew(&omega))),
            );
            jacobian
                .view_mut((0, offset + 3), (3, 3))
                .copy_from(&(r_i_inv * skew(&acc_at_imu)));
            jacobian
                .view_mut((3, offset + 3), (3, 3))
                .copy_from(&(r_i_inv * skew(&omega)));
            offset += 6;
        }
        if imu.is_intrinsic {
            jacobian
                .view_mut((0, offset), (3, 3))
                .copy_from(&Matrix3::identity());
            jacobian
                .view_mut((3, offset + 3), (3, 3))
                .copy_from(&Matrix3::identity());
        }

        jacobian
    }

    /// Routes one sample into the filter: either the dead-reckoning driver
    /// or the Kalman update. Returns the correction for logging (`None`
    /// when the sample drove prediction).
    pub fn update(
        &self,
        ekf: &mut Ekf,
        time: f64,
        acceleration: Vector3<f64>,
        acceleration_cov: Matrix3<f64>,
        angular_rate: Vector3<f64>,
        angular_rate_cov: Matrix3<f64>,
    ) -> Result<Option<ImuUpdateLog>, FilterError> {
        let imu = ekf
            .state
            .imu_state(self.imu_id)
            .ok_or(FilterError::UnknownSensorId(self.imu_id))?
            .clone();

        if self.use_for_prediction {
            // Compensate the fixed mounting and biases, then let the sample
            // drive the body model directly.
            let acc_body = imu.ang_i_to_b * (acceleration - imu.acc_bias);
            let omg_body = imu.ang_i_to_b * (angular_rate - imu.omg_bias);
            ekf.predict_with_imu(time, acc_body, acceleration_cov, omg_body, angular_rate_cov);
            return Ok(None);
        }

        ekf.predict(time);

        let body = ekf.state.body.clone();
        let (acc_pred, omg_pred) = Self::predict_measurement(&body, &imu);
        let mut residual = DVector::zeros(6);
        residual
            .fixed_rows_mut::<3>(0)
            .copy_from(&(acceleration - acc_pred));
        residual
            .fixed_rows_mut::<3>(3)
            .copy_from(&(angular_rate - omg_pred));
        debug!(imu_id = self.imu_id, residual = %residual.transpose(), "IMU residual");

        let sub_jacobian = Self::measurement_jacobian(&body, &imu);
        let state_size = ekf.state.state_size();
        let mut jacobian = DMatrix::zeros(6, state_size);
        jacobian
            .view_mut((0, 0), (6, BODY_STATE_SIZE))
            .copy_from(&sub_jacobian.view((0, 0), (6, BODY_STATE_SIZE)));
        let (imu_start, imu_len) = ekf
            .state
            .imu_slice(self.imu_id)
            .ok_or(FilterError::UnknownSensorId(self.imu_id))?;
        if imu_len > 0 {
            jacobian
                .view_mut((0, imu_start), (6, imu_len))
                .copy_from(&sub_jacobian.view((0, BODY_STATE_SIZE), (6, imu_len)));
        }

        let mut noise = DMatrix::zeros(6, 6);
        let mut acc_block = DMatrix::from_fn(3, 3, |i, j| acceleration_cov[(i, j)] * 3.0);
        min_bound_diagonal(&mut acc_block, MIN_ACC_VARIANCE);
        let mut omg_block = DMatrix::from_fn(3, 3, |i, j| angular_rate_cov[(i, j)] * 3.0);
        min_bound_diagonal(&mut omg_block, MIN_OMG_VARIANCE);
        noise.view_mut((0, 0), (3, 3)).copy_from(&acc_block);
        noise.view_mut((3, 3), (3, 3)).copy_from(&omg_block);

        let delta = ekf.kalman_update(&jacobian, &residual, &noise)?;

        let body_update = delta.rows(0, BODY_STATE_SIZE).into_owned();
        let sensor_update = delta.rows(imu_start, imu_len).into_owned();
        Ok(Some(ImuUpdateLog {
            residual,
            body_update,
            sensor_update,
        }))
    }
}
