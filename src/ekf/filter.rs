//! Filter owner: predict, registration, clone window, and the shared
//! Kalman update kernel.

use nalgebra::{DMatrix, DVector, Matrix3, UnitQuaternion, Vector3};
use tracing::{debug, info, warn};

use crate::geometry::{insert_block, quat_exp, remove_block, skew, symmetrize};

use super::state::{
    AugmentedState, BodyState, CamState, FrameId, ImuState, SensorId, State,
    AUG_STATE_SIZE, BODY_STATE_SIZE, CAM_EXTRINSIC_SIZE, GRAVITY,
};
use super::FilterError;

/// Per-IMU bias random-walk intensities, fixed at registration.
#[derive(Debug, Clone, Copy)]
pub struct BiasStability {
    pub acc: f64,
    pub omg: f64,
}

/// Extended Kalman filter over the joint body + calibration state.
///
/// The orchestrator is the single owner; updaters receive `&mut Ekf` for the
/// duration of one measurement. The covariance is a single dense matrix that
/// reallocates only on structural changes (registration, clone churn).
pub struct Ekf {
    pub state: State,
    cov: DMatrix<f64>,
    process_noise: DVector<f64>,
    bias_stability: Vec<(SensorId, BiasStability)>,
    current_time: Option<f64>,
    sealed: bool,
}

impl Ekf {
    /// Creates a filter holding only the body block.
    ///
    /// `process_noise` is the 18-entry spectral density of the body process
    /// noise, applied as `Q = diag(q) · Δt` on every predict.
    pub fn new(process_noise: DVector<f64>) -> Self {
        debug_assert_eq!(process_noise.len(), BODY_STATE_SIZE);
        Self {
            state: State::default(),
            cov: DMatrix::identity(BODY_STATE_SIZE, BODY_STATE_SIZE) * 1e-3,
            process_noise,
            bias_stability: Vec::new(),
            current_time: None,
            sealed: false,
        }
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    pub fn current_time(&self) -> Option<f64> {
        self.current_time
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Sets the initial time and body state before any measurements arrive.
    pub fn initialize(&mut self, time: f64, body: BodyState) {
        self.current_time = Some(time);
        self.state.body = body;
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    fn check_unsealed_and_unused(&self, id: SensorId) -> Result<(), FilterError> {
        if self.sealed {
            return Err(FilterError::SealedState);
        }
        let used = self.state.imus.iter().any(|(i, _)| *i == id)
            || self.state.cams.iter().any(|(i, _)| *i == id);
        if used {
            return Err(FilterError::AlreadyRegistered(id));
        }
        Ok(())
    }

    /// Appends an IMU block to the state and pads the covariance with
    /// `cov_block` on the new diagonal (zero cross-covariance).
    pub fn register_imu(
        &mut self,
        id: SensorId,
        imu: ImuState,
        stability: BiasStability,
        cov_block: DMatrix<f64>,
    ) -> Result<(), FilterError> {
        self.check_unsealed_and_unused(id)?;
        let expected = imu.size();
        if cov_block.nrows() != expected || cov_block.ncols() != expected {
            return Err(FilterError::InvalidShape {
                expected,
                got: cov_block.nrows(),
            });
        }

        // New IMU blocks land after the existing IMUs, before any camera.
        let start = BODY_STATE_SIZE
            + self.state.imus.iter().map(|(_, i)| i.size()).sum::<usize>();
        if expected > 0 {
            self.cov = insert_block(&cov_block, &self.cov, start, start);
        }
        self.state.imus.push((id, imu));
        self.bias_stability.push((id, stability));

        info!(imu_id = id, state_size = self.state.state_size(), "registered IMU");
        Ok(())
    }

    /// Appends a camera block (extrinsic only; clones come later).
    pub fn register_camera(
        &mut self,
        id: SensorId,
        cam: CamState,
        cov_block: DMatrix<f64>,
    ) -> Result<(), FilterError> {
        self.check_unsealed_and_unused(id)?;
        if !cam.clones.is_empty() {
            return Err(FilterError::DimensionMismatch(
                "cameras register without clones".into(),
            ));
        }
        if cov_block.nrows() != CAM_EXTRINSIC_SIZE || cov_block.ncols() != CAM_EXTRINSIC_SIZE {
            return Err(FilterError::InvalidShape {
                expected: CAM_EXTRINSIC_SIZE,
                got: cov_block.nrows(),
            });
        }

        let start = self.state.state_size();
        self.cov = insert_block(&cov_block, &self.cov, start, start);
        self.state.cams.push((id, cam));

        info!(cam_id = id, state_size = self.state.state_size(), "registered camera");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Prediction
    // ------------------------------------------------------------------

    /// Body-block state transition for one step.
    ///
    /// Couplings p←v, v←a, q←ω, ω←α, each `Δt`-scaled; the q←ω block is
    /// rotated because angular rate lives in the body frame while the
    /// orientation error lives in the global frame.
    fn body_transition(&self, dt: f64) -> nalgebra::SMatrix<f64, 18, 18> {
        let mut f = nalgebra::SMatrix::<f64, 18, 18>::identity();
        let i_dt = Matrix3::identity() * dt;
        f.fixed_view_mut::<3, 3>(0, 3).copy_from(&i_dt);
        f.fixed_view_mut::<3, 3>(3, 6).copy_from(&i_dt);
        f.fixed_view_mut::<3, 3>(9, 12)
            .copy_from(&(self.state.body.orientation.to_rotation_matrix().into_inner() * dt));
        f.fixed_view_mut::<3, 3>(12, 15).copy_from(&i_dt);
        f
    }

    /// Propagates the covariance through the body-block transition and adds
    /// the body process noise plus per-IMU bias random walks.
    fn propagate_covariance(&mut self, f: &nalgebra::SMatrix<f64, 18, 18>, dt: f64) {
        let n = self.cov.nrows();

        // Everything outside the body block has an identity transition, so
        // F P Fᵀ only touches the body rows and columns.
        let body_rows = self.cov.view((0, 0), (BODY_STATE_SIZE, n)).into_owned();
        self.cov
            .view_mut((0, 0), (BODY_STATE_SIZE, n))
            .copy_from(&(f * body_rows));
        let body_cols = self.cov.view((0, 0), (n, BODY_STATE_SIZE)).into_owned();
        self.cov
            .view_mut((0, 0), (n, BODY_STATE_SIZE))
            .copy_from(&(body_cols * f.transpose()));

        for i in 0..BODY_STATE_SIZE {
            self.cov[(i, i)] += self.process_noise[i] * dt;
        }
        self.add_bias_walk(dt);
        symmetrize(&mut self.cov);
    }

    fn add_bias_walk(&mut self, dt: f64) {
        for (id, stability) in &self.bias_stability {
            let Some(imu) = self.state.imu_state(*id) else { continue };
            if !imu.is_intrinsic {
                continue;
            }
            let Some((start, len)) = self.state.imu_slice(*id) else { continue };
            let bias_start = start + len - super::state::IMU_INTRINSIC_SIZE;
            for i in 0..3 {
                self.cov[(bias_start + i, bias_start + i)] += stability.acc.powi(2) * dt;
                self.cov[(bias_start + 3 + i, bias_start + 3 + i)] += stability.omg.powi(2) * dt;
            }
        }
    }

    /// Advances the filter to `time` with the constant-jerk body model.
    ///
    /// An out-of-order request leaves the mean untouched and only inflates
    /// the covariance by `|Δt|`-scaled process noise.
    pub fn predict(&mut self, time: f64) {
        let Some(current) = self.current_time else {
            self.current_time = Some(time);
            info!(time, "prediction time initialized");
            return;
        };

        let dt = time - current;
        if dt < 0.0 {
            warn!(requested = time, current, "prediction to the past; inflating noise only");
            for i in 0..BODY_STATE_SIZE {
                self.cov[(i, i)] += self.process_noise[i] * dt.abs();
            }
            self.add_bias_walk(dt.abs());
            return;
        }

        debug!(time, dt, "process model predict");

        let body = &mut self.state.body;
        let accel_world = body.acceleration;
        body.position += body.velocity * dt + accel_world * (0.5 * dt * dt);
        body.velocity += accel_world * dt;
        let dtheta =
            body.angular_velocity * dt + body.angular_acceleration * (0.5 * dt * dt);
        body.orientation *= quat_exp(&dtheta);
        body.angular_velocity += body.angular_acceleration * dt;

        let f = self.body_transition(dt);
        self.propagate_covariance(&f, dt);
        self.current_time = Some(time);
    }

    /// Dead-reckons the body forward from one base-IMU sample.
    ///
    /// `accel`/`rate` must already be compensated to the body frame (fixed
    /// extrinsics and biases removed). The measured specific force is turned
    /// into global acceleration by removing the gravity offset.
    pub fn predict_with_imu(
        &mut self,
        time: f64,
        accel: Vector3<f64>,
        accel_cov: Matrix3<f64>,
        rate: Vector3<f64>,
        rate_cov: Matrix3<f64>,
    ) {
        let Some(current) = self.current_time else {
            self.current_time = Some(time);
            info!(time, "prediction time initialized");
            return;
        };

        let dt = time - current;
        if dt < 0.0 {
            warn!(requested = time, current, "IMU predict to the past; dropped");
            return;
        }

        let body = &mut self.state.body;
        let accel_world = body.orientation * accel - GRAVITY;

        body.position += body.velocity * dt + accel_world * (0.5 * dt * dt);
        body.velocity += accel_world * dt;
        body.acceleration = accel_world;
        body.orientation *= quat_exp(&(rate * dt));
        body.angular_velocity = rate;
        body.angular_acceleration.fill(0.0);

        let f = self.body_transition(dt);
        let n = self.cov.nrows();
        let body_rows = self.cov.view((0, 0), (BODY_STATE_SIZE, n)).into_owned();
        self.cov
            .view_mut((0, 0), (BODY_STATE_SIZE, n))
            .copy_from(&(f * body_rows));
        let body_cols = self.cov.view((0, 0), (n, BODY_STATE_SIZE)).into_owned();
        self.cov
            .view_mut((0, 0), (n, BODY_STATE_SIZE))
            .copy_from(&(body_cols * f.transpose()));

        // Driven prediction: measurement covariance enters at the driven
        // blocks instead of the configured spectral density.
        for i in 0..3 {
            for j in 0..3 {
                self.cov[(6 + i, 6 + j)] += accel_cov[(i, j)] * dt;
                self.cov[(12 + i, 12 + j)] += rate_cov[(i, j)] * dt;
            }
        }
        self.add_bias_walk(dt);
        symmetrize(&mut self.cov);
        self.current_time = Some(time);
    }

    // ------------------------------------------------------------------
    // Clone window
    // ------------------------------------------------------------------

    /// Snapshots the body pose and `cam_id`'s pose into a new clone, growing
    /// the covariance through the augmentation Jacobian. Evicts the oldest
    /// clone first when the window is at `max_clones`.
    pub fn augment_state(
        &mut self,
        cam_id: SensorId,
        frame_id: FrameId,
        max_clones: usize,
    ) -> Result<(), FilterError> {
        let cam = self
            .state
            .cam_state(cam_id)
            .ok_or(FilterError::UnknownSensorId(cam_id))?
            .clone();

        if cam.clones.len() >= max_clones {
            self.evict_oldest_clone(cam_id)?;
        }

        let body = self.state.body.clone();
        let clone = AugmentedState {
            frame_id,
            cam_position: body.position + body.orientation * cam.pos_c_in_b,
            cam_orientation: body.orientation * cam.ang_c_to_b,
            body_position: body.position,
            body_orientation: body.orientation,
        };

        debug!(cam_id, frame_id, "augmenting state");

        let old_size = self.state.state_size();
        let (cam_start, cam_len) = self.state.cam_slice(cam_id).expect("camera exists");
        let aug_start = cam_start + cam_len;

        let jacobian = self.augment_jacobian(&body.orientation, &cam, cam_start, aug_start, old_size);
        self.cov = &jacobian * &self.cov * jacobian.transpose();
        symmetrize(&mut self.cov);

        self.state
            .cam_state_mut(cam_id)
            .expect("camera exists")
            .clones
            .push(clone);
        Ok(())
    }

    /// Maps the old error state onto old + one clone:
    /// identity for every existing row, and for the clone rows the
    /// derivatives of the snapshot with respect to body pose and extrinsic.
    fn augment_jacobian(
        &self,
        body_orientation: &UnitQuaternion<f64>,
        cam: &CamState,
        cam_start: usize,
        aug_start: usize,
        old_size: usize,
    ) -> DMatrix<f64> {
        let r_body = body_orientation.to_rotation_matrix().into_inner();
        let mut jacobian = DMatrix::zeros(old_size + AUG_STATE_SIZE, old_size);

        for i in 0..aug_start {
            jacobian[(i, i)] = 1.0;
        }
        for i in aug_start..old_size {
            jacobian[(i + AUG_STATE_SIZE, i)] = 1.0;
        }

        let identity = Matrix3::identity();

        // Clone camera position: p_C = p_B + R_B p_c.
        jacobian
            .view_mut((aug_start, 0), (3, 3))
            .copy_from(&identity);
        jacobian
            .view_mut((aug_start, 9), (3, 3))
            .copy_from(&(-skew(&(r_body * cam.pos_c_in_b))));
        jacobian
            .view_mut((aug_start, cam_start), (3, 3))
            .copy_from(&r_body);

        // Clone camera orientation: δθ_C = δθ_B + R_B δθ_c.
        jacobian
            .view_mut((aug_start + 3, 9), (3, 3))
            .copy_from(&identity);
        jacobian
            .view_mut((aug_start + 3, cam_start + 3), (3, 3))
            .copy_from(&r_body);

        // Clone body pose is a direct snapshot.
        jacobian
            .view_mut((aug_start + 6, 0), (3, 3))
            .copy_from(&identity);
        jacobian
            .view_mut((aug_start + 9, 9), (3, 3))
            .copy_from(&identity);

        jacobian
    }

    fn evict_oldest_clone(&mut self, cam_id: SensorId) -> Result<(), FilterError> {
        let (cam_start, _) = self
            .state
            .cam_slice(cam_id)
            .ok_or(FilterError::UnknownSensorId(cam_id))?;
        let clone_start = cam_start + CAM_EXTRINSIC_SIZE;

        let cam = self.state.cam_state_mut(cam_id).expect("camera exists");
        if cam.clones.is_empty() {
            return Ok(());
        }
        let evicted = cam.clones.remove(0);
        debug!(cam_id, frame_id = evicted.frame_id, "evicting oldest clone");

        self.cov = remove_block(&self.cov, clone_start, clone_start, AUG_STATE_SIZE);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Update kernel
    // ------------------------------------------------------------------

    /// Applies one Kalman update `(H, r, R)` against the full state.
    ///
    /// On `NumericalSingular` nothing is mutated. Returns the correction
    /// that was folded into the state, for the per-sensor data logs.
    pub fn kalman_update(
        &mut self,
        h: &DMatrix<f64>,
        residual: &DVector<f64>,
        noise: &DMatrix<f64>,
    ) -> Result<DVector<f64>, FilterError> {
        let n = self.state.state_size();
        if h.ncols() != n || self.cov.nrows() != n {
            return Err(FilterError::DimensionMismatch(format!(
                "H is {}x{}, state size is {}, covariance is {}x{}",
                h.nrows(),
                h.ncols(),
                n,
                self.cov.nrows(),
                self.cov.ncols()
            )));
        }

        let s = h * &self.cov * h.transpose() + noise;
        let s_inv = s.try_inverse().ok_or(FilterError::NumericalSingular)?;
        let gain = &self.cov * h.transpose() * s_inv;
        let delta = &gain * residual;

        self.state.apply_update(&delta);
        let identity = DMatrix::identity(n, n);
        self.cov = (identity - &gain * h) * &self.cov;
        symmetrize(&mut self.cov);
        self.sealed = true;

        if self.state.has_nan() || self.cov.iter().any(|v| !v.is_finite()) {
            return Err(FilterError::NonFinite);
        }
        Ok(delta)
    }
}
