//! Multi-state-constraint update from terminated feature tracks.
//!
//! Each track is triangulated in its anchor clone's frame, linearized
//! against the clone window and the camera extrinsic, projected onto the
//! left nullspace of the feature Jacobian, and stacked. The stacked system
//! is compressed with Givens rotations before a single Kalman update.

use nalgebra::{DMatrix, DVector, Matrix3, SMatrix, Vector2, Vector3};
use tracing::debug;

use crate::ekf::state::{FrameId, SensorId, BODY_STATE_SIZE, CAM_EXTRINSIC_SIZE};
use crate::ekf::{Ekf, FilterError};
use crate::geometry::{compress_measurements, project_left_nullspace, skew};
use crate::sensors::Intrinsics;

/// Triangulated solutions closer than this to the anchor are degenerate.
const MIN_FEATURE_DISTANCE: f64 = 1e-3;
/// Minimum depth for a feature to count as in front of a clone.
const MIN_DEPTH: f64 = 1e-6;

/// One observation of a feature: the frame it was seen in and its pixel.
#[derive(Debug, Clone)]
pub struct FeaturePoint {
    pub frame_id: FrameId,
    pub pixel: Vector2<f64>,
}

/// A completed track of one feature across consecutive frames.
#[derive(Debug, Clone)]
pub struct FeatureTrack {
    pub feature_id: u32,
    pub points: Vec<FeaturePoint>,
}

/// Outcome of one MSCKF update, for the per-camera data log.
pub struct MsckfUpdateLog {
    pub body_update: DVector<f64>,
    pub cam_update: DVector<f64>,
    /// Triangulated feature positions in the global frame.
    pub features: Vec<(u32, Vector3<f64>)>,
}

/// One usable observation: undistorted pixel plus the observing clone's
/// camera pose and its offset inside the camera block.
struct Observation {
    normalized: Vector2<f64>,
    r_cam_to_global: Matrix3<f64>,
    pos_cam_in_global: Vector3<f64>,
    clone_offset: usize,
}

/// Anchor-frame camera pose reconstructed from the anchor clone's body pose
/// composed with the current extrinsic estimate.
struct AnchorFrame {
    r_anchor_to_global: Matrix3<f64>,
    pos_anchor_in_global: Vector3<f64>,
    r_body_to_global: Matrix3<f64>,
    body_position: Vector3<f64>,
    r_cam_to_body: Matrix3<f64>,
}

pub struct MsckfUpdater {
    cam_id: SensorId,
    intrinsics: Intrinsics,
    pixel_error: f64,
}

impl MsckfUpdater {
    pub fn new(cam_id: SensorId, intrinsics: Intrinsics, pixel_error: f64) -> Self {
        Self {
            cam_id,
            intrinsics,
            pixel_error,
        }
    }

    pub fn cam_id(&self) -> SensorId {
        self.cam_id
    }

    /// Least-squares triangulation of one track in the anchor frame.
    ///
    /// Every observation contributes `Aᵢ = [bᵢ]×ᵀ [bᵢ]×` and
    /// `cᵢ = Aᵢ · p_{Cᵢ∈A}` (the anchor's own term has zero offset); the
    /// normal equations are solved with a column-pivoted QR. Returns `None`
    /// for rank-deficient geometry or a solution collapsing onto the anchor.
    fn triangulate(
        &self,
        anchor: &AnchorFrame,
        observations: &[Observation],
    ) -> Option<Vector3<f64>> {
        let mut a = Matrix3::<f64>::zeros();
        let mut c = Vector3::<f64>::zeros();

        for obs in observations {
            let r_ci_to_anchor = anchor.r_anchor_to_global.transpose() * obs.r_cam_to_global;
            let pos_ci_in_anchor = anchor.r_anchor_to_global.transpose()
                * (obs.pos_cam_in_global - anchor.pos_anchor_in_global);

            let bearing = (r_ci_to_anchor
                * Vector3::new(obs.normalized.x, obs.normalized.y, 1.0))
            .normalize();

            let b_skew = skew(&bearing);
            let a_i = b_skew.transpose() * b_skew;
            a += a_i;
            c += a_i * pos_ci_in_anchor;
        }

        let solution = a.col_piv_qr().solve(&c)?;
        if solution.norm() < MIN_FEATURE_DISTANCE {
            debug!(cam_id = self.cam_id, "triangulation collapsed onto anchor");
            return None;
        }
        Some(solution)
    }

    /// Builds the per-track linear system `(res, H_f, H_x)` where `H_x`
    /// spans this camera's block: extrinsic columns first, then the clone
    /// window. Returns `None` when the track geometry is unusable.
    #[allow(clippy::type_complexity)]
    fn linearize_track(
        &self,
        ekf: &Ekf,
        track: &FeatureTrack,
        cam_len: usize,
    ) -> Option<(DVector<f64>, DMatrix<f64>, DMatrix<f64>, Vector3<f64>)> {
        let cam = ekf.state.cam_state(self.cam_id)?;
        let (cam_start, _) = ekf.state.cam_slice(self.cam_id)?;

        // Collect the observations whose clones are still in the window.
        let mut observations = Vec::with_capacity(track.points.len());
        for point in &track.points {
            let Some(clone) = cam.clone_for_frame(point.frame_id) else {
                continue;
            };
            let (aug_start, _) = ekf.state.aug_slice(self.cam_id, point.frame_id)?;
            observations.push(Observation {
                normalized: self.intrinsics.undistort(&point.pixel),
                r_cam_to_global: clone.cam_orientation.to_rotation_matrix().into_inner(),
                pos_cam_in_global: clone.cam_position,
                clone_offset: aug_start - cam_start,
            });
        }
        if observations.len() < 2 {
            debug!(feature_id = track.feature_id, "track lost its clones; skipped");
            return None;
        }

        // Anchor camera pose: anchor clone body pose composed with the
        // current extrinsic, so the lift exposes both to the update.
        let anchor_clone = track
            .points
            .iter()
            .find_map(|p| cam.clone_for_frame(p.frame_id))?;
        let r_cam_to_body = cam.ang_c_to_b.to_rotation_matrix().into_inner();
        let r_body_to_global = anchor_clone
            .body_orientation
            .to_rotation_matrix()
            .into_inner();
        let anchor = AnchorFrame {
            r_anchor_to_global: r_body_to_global * r_cam_to_body,
            pos_anchor_in_global: anchor_clone.body_position + r_body_to_global * cam.pos_c_in_b,
            r_body_to_global,
            body_position: anchor_clone.body_position,
            r_cam_to_body,
        };

        let pos_f_in_anchor = self.triangulate(&anchor, &observations)?;
        let pos_f_in_global =
            anchor.r_anchor_to_global * pos_f_in_anchor + anchor.pos_anchor_in_global;

        // Reject features behind any observing clone.
        for obs in &observations {
            let depth =
                (obs.r_cam_to_global.transpose() * (pos_f_in_global - obs.pos_cam_in_global)).z;
            if depth <= MIN_DEPTH {
                debug!(feature_id = track.feature_id, "feature behind camera; skipped");
                return None;
            }
        }

        let rows = 2 * observations.len();
        let mut res = DVector::zeros(rows);
        let mut h_f = DMatrix::zeros(rows, 3);
        let mut h_x = DMatrix::zeros(rows, cam_len);

        // Derivatives of the global lift, shared across observations:
        // p_{F∈G} = p_B_A + R_B_A (p_c + R_c · p_{F∈A}).
        let anchor_offset = observations[0].clone_offset;
        let d_lift_d_anchor_ang = -skew(&(pos_f_in_global - anchor.body_position));
        let d_lift_d_ext_pos = anchor.r_body_to_global;
        let d_lift_d_ext_ang =
            -anchor.r_body_to_global * skew(&(anchor.r_cam_to_body * pos_f_in_anchor));

        for (idx, obs) in observations.iter().enumerate() {
            let r_g_to_ci = obs.r_cam_to_global.transpose();
            let offset_in_global = pos_f_in_global - obs.pos_cam_in_global;
            let pos_f_in_ci = r_g_to_ci * offset_in_global;

            let predicted = Vector2::new(
                pos_f_in_ci.x / pos_f_in_ci.z,
                pos_f_in_ci.y / pos_f_in_ci.z,
            );
            let row = 2 * idx;
            res[row] = obs.normalized.x - predicted.x;
            res[row + 1] = obs.normalized.y - predicted.y;

            // Projection Jacobian in normalized coordinates.
            let z_inv = 1.0 / pos_f_in_ci.z;
            let z2_inv = z_inv * z_inv;
            let mut dzn = SMatrix::<f64, 2, 3>::zeros();
            dzn[(0, 0)] = z_inv;
            dzn[(1, 1)] = z_inv;
            dzn[(0, 2)] = -pos_f_in_ci.x * z2_inv;
            dzn[(1, 2)] = -pos_f_in_ci.y * z2_inv;

            let dz_d_global = dzn * r_g_to_ci;

            // Feature Jacobian, chained through the anchor representation.
            h_f.view_mut((row, 0), (2, 3))
                .copy_from(&(dz_d_global * anchor.r_anchor_to_global));

            // This clone's camera pose (position, then orientation).
            let d_clone_pos = dzn * (-r_g_to_ci);
            let d_clone_ang = dzn * (r_g_to_ci * skew(&offset_in_global));
            add_block(&mut h_x, row, obs.clone_offset, &d_clone_pos);
            add_block(&mut h_x, row, obs.clone_offset + 3, &d_clone_ang);

            // Anchor clone body pose, through the global lift.
            add_block(&mut h_x, row, anchor_offset + 6, &dz_d_global);
            add_block(
                &mut h_x,
                row,
                anchor_offset + 9,
                &(dz_d_global * d_lift_d_anchor_ang),
            );

            // Camera extrinsic, through the global lift.
            add_block(&mut h_x, row, 0, &(dz_d_global * d_lift_d_ext_pos));
            add_block(&mut h_x, row, 3, &(dz_d_global * d_lift_d_ext_ang));
        }

        Some((res, h_f, h_x, pos_f_in_global))
    }

    /// Runs the full MSCKF pipeline on a batch of terminated tracks.
    pub fn update(
        &self,
        ekf: &mut Ekf,
        time: f64,
        tracks: &[FeatureTrack],
    ) -> Result<Option<MsckfUpdateLog>, FilterError> {
        ekf.predict(time);

        if tracks.is_empty() {
            return Ok(None);
        }
        debug!(cam_id = self.cam_id, tracks = tracks.len(), "MSCKF update");

        let state_size = ekf.state.state_size();
        let (cam_start, cam_len) = ekf
            .state
            .cam_slice(self.cam_id)
            .ok_or(FilterError::UnknownSensorId(self.cam_id))?;

        let max_rows: usize = tracks.iter().map(|t| 2 * t.points.len()).sum();
        let mut res_big = DVector::zeros(max_rows);
        let mut h_big = DMatrix::zeros(max_rows, state_size);
        let mut row_count = 0;
        let mut features = Vec::new();

        for track in tracks {
            let Some((mut res, mut h_f, mut h_x, pos_f_in_global)) =
                self.linearize_track(ekf, track, cam_len)
            else {
                continue;
            };

            let Some((h_proj, res_proj)) = project_left_nullspace(&mut h_f, &mut h_x, &mut res)
            else {
                continue;
            };

            h_big
                .view_mut((row_count, cam_start), (h_proj.nrows(), cam_len))
                .copy_from(&h_proj);
            res_big
                .rows_mut(row_count, res_proj.nrows())
                .copy_from(&res_proj);
            row_count += h_proj.nrows();
            features.push((track.feature_id, pos_f_in_global));
        }

        if row_count == 0 {
            return Ok(None);
        }

        let h_stacked = h_big.rows(0, row_count).into_owned();
        let res_stacked = res_big.rows(0, row_count).into_owned();
        let (h_final, res_final) = compress_measurements(h_stacked, res_stacked);
        if res_final.nrows() <= 1 {
            debug!(cam_id = self.cam_id, "compressed system is ill-formed; dropped");
            return Ok(None);
        }

        let noise =
            DMatrix::identity(res_final.nrows(), res_final.nrows()) * self.pixel_error.powi(2);
        let delta = ekf.kalman_update(&h_final, &res_final, &noise)?;

        Ok(Some(MsckfUpdateLog {
            body_update: delta.rows(0, BODY_STATE_SIZE).into_owned(),
            cam_update: delta.rows(cam_start, CAM_EXTRINSIC_SIZE).into_owned(),
            features,
        }))
    }
}

/// Adds a 2×3 band into `mat` at (`row`, `col`).
fn add_block(mat: &mut DMatrix<f64>, row: usize, col: usize, block: &SMatrix<f64, 2, 3>) {
    for r in 0..2 {
        for c in 0..3 {
            mat[(row + r, col + c)] += block[(r, c)];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ekf::state::BodyState;
    use crate::ekf::state::CamState;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn normalized_intrinsics() -> Intrinsics {
        // f/pixel_size = 1 with a centered principal point: pixel
        // coordinates are normalized coordinates directly.
        Intrinsics {
            f: 1.0,
            pixel_size: 1.0,
            c_x: 0.0,
            c_y: 0.0,
            width: 4.0,
            height: 4.0,
            ..Intrinsics::default()
        }
    }

    /// Filter with one camera (identity extrinsic) and clones placed at the
    /// given global positions, all looking along +z.
    fn filter_with_clones(positions: &[Vector3<f64>]) -> Ekf {
        let mut ekf = Ekf::new(DVector::from_element(BODY_STATE_SIZE, 1e-4));
        ekf.initialize(0.0, BodyState::default());
        ekf.register_camera(
            0,
            CamState {
                pos_c_in_b: Vector3::zeros(),
                ang_c_to_b: UnitQuaternion::identity(),
                clones: Vec::new(),
            },
            DMatrix::identity(6, 6) * 1e-4,
        )
        .unwrap();

        for (frame, pos) in positions.iter().enumerate() {
            ekf.state.body.position = *pos;
            ekf.augment_state(0, frame as u32, 8).unwrap();
        }
        ekf
    }

    fn observe(feature: &Vector3<f64>, clone_pos: &Vector3<f64>) -> Vector2<f64> {
        let rel = feature - clone_pos;
        Vector2::new(rel.x / rel.z, rel.y / rel.z)
    }

    fn track_of(feature: &Vector3<f64>, positions: &[Vector3<f64>], id: u32) -> FeatureTrack {
        FeatureTrack {
            feature_id: id,
            points: positions
                .iter()
                .enumerate()
                .map(|(frame, pos)| FeaturePoint {
                    frame_id: frame as u32,
                    pixel: observe(feature, pos),
                })
                .collect(),
        }
    }

    #[test]
    fn test_two_view_triangulation_recovers_feature() {
        let positions = [Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)];
        let ekf = filter_with_clones(&positions);
        let feature = Vector3::new(0.0, 0.0, 4.0);

        let track = track_of(&feature, &positions, 0);
        // The second view sees the feature displaced by baseline over depth.
        assert_relative_eq!(track.points[1].pixel.x, -0.25, epsilon = 1e-12);

        let updater = MsckfUpdater::new(0, normalized_intrinsics(), 1e-2);
        let cam_len = ekf.state.cam_slice(0).unwrap().1;
        let (_, _, _, pos_f_in_global) =
            updater.linearize_track(&ekf, &track, cam_len).unwrap();

        assert!((pos_f_in_global - feature).norm() < 1e-3);
    }

    #[test]
    fn test_residual_rows_follow_track_length() {
        let positions = [
            Vector3::zeros(),
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
        ];
        let ekf = filter_with_clones(&positions);
        let track = track_of(&Vector3::new(0.2, -0.1, 5.0), &positions, 0);

        let updater = MsckfUpdater::new(0, normalized_intrinsics(), 1e-2);
        let cam_len = ekf.state.cam_slice(0).unwrap().1;
        let (res, h_f, h_x, _) = updater.linearize_track(&ekf, &track, cam_len).unwrap();

        assert_eq!(res.nrows(), 6);
        assert_eq!(h_f.shape(), (6, 3));
        assert_eq!(h_x.shape(), (6, cam_len));
    }

    #[test]
    fn test_track_behind_camera_is_rejected() {
        let positions = [Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)];
        let ekf = filter_with_clones(&positions);

        // Pixels of a virtual feature behind the image plane.
        let feature = Vector3::new(0.0, 0.0, -3.0);
        let track = track_of(&feature, &positions, 1);

        let updater = MsckfUpdater::new(0, normalized_intrinsics(), 1e-2);
        let cam_len = ekf.state.cam_slice(0).unwrap().1;
        assert!(updater.linearize_track(&ekf, &track, cam_len).is_none());
    }

    #[test]
    fn test_update_shrinks_covariance_and_stays_symmetric() {
        let positions = [
            Vector3::zeros(),
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(1.0, 0.2, 0.0),
            Vector3::new(1.5, 0.1, 0.0),
        ];
        let mut ekf = filter_with_clones(&positions);
        let features = [
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(1.0, -0.5, 6.0),
            Vector3::new(-0.8, 0.4, 4.0),
        ];

        let tracks: Vec<FeatureTrack> = features
            .iter()
            .enumerate()
            .map(|(fid, feature)| track_of(feature, &positions, fid as u32))
            .collect();

        let updater = MsckfUpdater::new(0, normalized_intrinsics(), 1e-2);
        let trace_before = ekf.cov().trace();
        let log = updater.update(&mut ekf, 0.1, &tracks).unwrap().unwrap();

        assert!(ekf.cov().trace() < trace_before);
        assert_eq!(log.features.len(), 3);
        let cov = ekf.cov().clone();
        assert_relative_eq!(cov.clone(), cov.transpose(), epsilon = 1e-10);
        for value in cov.symmetric_eigen().eigenvalues.iter() {
            assert!(*value >= -1e-9);
        }
    }

    #[test]
    fn test_consistent_observations_yield_small_correction() {
        // Clones and pixels agree perfectly with the triangulated feature,
        // so the projected residual and the correction are tiny.
        let positions = [
            Vector3::zeros(),
            Vector3::new(0.4, 0.0, 0.0),
            Vector3::new(0.8, 0.0, 0.0),
        ];
        let mut ekf = filter_with_clones(&positions);
        let feature = Vector3::new(0.3, 0.2, 5.0);
        let track = track_of(&feature, &positions, 0);

        let updater = MsckfUpdater::new(0, normalized_intrinsics(), 1e-2);
        let log = updater.update(&mut ekf, 0.1, &[track]).unwrap().unwrap();

        assert!(log.body_update.norm() < 1e-6);
        assert!((log.features[0].1 - feature).norm() < 1e-6);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut ekf = filter_with_clones(&[Vector3::zeros()]);
        let updater = MsckfUpdater::new(0, normalized_intrinsics(), 1e-2);

        let log = updater.update(&mut ekf, 0.1, &[]).unwrap();
        assert!(log.is_none());
        assert!(!ekf.is_sealed());
    }
}
