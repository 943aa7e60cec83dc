//! Synthetic camera: projects world feature points and the fiducial board
//! into each simulated frame.

use nalgebra::{Matrix6, UnitQuaternion, Vector3};
use tracing::info;

use crate::ekf::state::SensorId;
use crate::msg::{DetectedFeature, FiducialDetection, FrameSample, Message};
use crate::sensors::Intrinsics;

use super::rng::SimRng;
use super::truth::TruthEngine;

#[derive(Debug, Clone)]
pub struct SimCameraParams {
    pub sensor_id: SensorId,
    pub rate: f64,
    pub pos_c_in_b: Vector3<f64>,
    pub ang_c_to_b: UnitQuaternion<f64>,
    pub intrinsics: Intrinsics,
    pub time_error: f64,
    pub pos_error: Vector3<f64>,
    pub ang_error: Vector3<f64>,
    pub pixel_error: f64,
    pub no_errors: bool,
}

/// Simulated fiducial board attached to a camera.
#[derive(Debug, Clone)]
pub struct SimBoardParams {
    pub board_id: u32,
    pub pos_f_in_g: Vector3<f64>,
    pub ang_f_to_g: UnitQuaternion<f64>,
    pub variance: Vector3<f64>,
    pub t_vec_error: Vector3<f64>,
    pub r_vec_error: Vector3<f64>,
}

pub struct SimCamera {
    params: SimCameraParams,
    pos_c_in_b_true: Vector3<f64>,
    ang_c_to_b_true: UnitQuaternion<f64>,
    /// World feature points visible to the tracker.
    features: Vec<Vector3<f64>>,
    board: Option<SimBoardParams>,
}

impl SimCamera {
    pub fn new(params: SimCameraParams, rng: &mut SimRng) -> Self {
        let (pos_true, ang_true) = if params.no_errors {
            (params.pos_c_in_b, params.ang_c_to_b)
        } else {
            (
                rng.vec_normal(params.pos_c_in_b, &params.pos_error),
                rng.quat_normal(params.ang_c_to_b, &params.ang_error),
            )
        };
        Self {
            params,
            pos_c_in_b_true: pos_true,
            ang_c_to_b_true: ang_true,
            features: Vec::new(),
            board: None,
        }
    }

    pub fn true_extrinsics(&self) -> (Vector3<f64>, UnitQuaternion<f64>) {
        (self.pos_c_in_b_true, self.ang_c_to_b_true)
    }

    pub fn board(&self) -> Option<&SimBoardParams> {
        self.board.as_ref()
    }

    pub fn attach_board(&mut self, board: SimBoardParams) {
        self.board = Some(board);
    }

    /// Seeds the feature field: axis markers plus uniformly drawn room
    /// points, flattened in z like a typical indoor scene.
    pub fn generate_features(&mut self, count: usize, room_size: f64, rng: &mut SimRng) {
        self.features = vec![
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(-1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, -1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.0, -1.0),
        ];
        for _ in 0..count {
            self.features.push(Vector3::new(
                rng.uniform(-room_size, room_size),
                rng.uniform(-room_size, room_size),
                rng.uniform(-room_size / 10.0, room_size / 10.0),
            ));
        }
    }

    pub fn features(&self) -> &[Vector3<f64>] {
        &self.features
    }

    /// True camera pose in the global frame at `time`.
    fn camera_pose(
        &self,
        truth: &dyn TruthEngine,
        time: f64,
    ) -> (Vector3<f64>, UnitQuaternion<f64>) {
        let body_pos = truth.body_position(time);
        let body_ang = truth.body_angular_position(time);
        (
            body_pos + body_ang * self.pos_c_in_b_true,
            body_ang * self.ang_c_to_b_true,
        )
    }

    /// Features currently in the frustum, projected to (noisy) pixels.
    pub fn visible_features(
        &self,
        truth: &dyn TruthEngine,
        time: f64,
        rng: &mut SimRng,
    ) -> Vec<DetectedFeature> {
        let (cam_pos, cam_ang) = self.camera_pose(truth, time);
        let r_g_to_c = cam_ang.inverse();

        let mut detected = Vec::new();
        for (feature_id, point) in self.features.iter().enumerate() {
            let in_cam = r_g_to_c * (point - cam_pos);
            let Some(mut pixel) = self.params.intrinsics.project(&in_cam) else {
                continue;
            };
            if !self.params.no_errors {
                pixel.x += rng.normal(0.0, self.params.pixel_error);
                pixel.y += rng.normal(0.0, self.params.pixel_error);
            }
            if self.params.intrinsics.in_frame(&pixel) {
                detected.push(DetectedFeature {
                    feature_id: feature_id as u32,
                    pixel,
                    response: 1.0,
                });
            }
        }
        detected
    }

    /// Board pose in the camera frame, with detection noise.
    fn detect_board(
        &self,
        board: &SimBoardParams,
        truth: &dyn TruthEngine,
        time: f64,
        rng: &mut SimRng,
    ) -> FiducialDetection {
        let (cam_pos, cam_ang) = self.camera_pose(truth, time);

        let mut position = cam_ang.inverse() * (board.pos_f_in_g - cam_pos);
        let mut orientation = cam_ang.inverse() * board.ang_f_to_g;
        if !self.params.no_errors {
            position = rng.vec_normal(position, &board.t_vec_error);
            orientation = rng.quat_normal(orientation, &board.r_vec_error);
        }

        let mut covariance = Matrix6::zeros();
        for i in 0..3 {
            covariance[(i, i)] = board.variance[i].max(1e-9);
            covariance[(i + 3, i + 3)] = board.variance[i].max(1e-9);
        }

        FiducialDetection {
            sensor_id: self.params.sensor_id,
            time,
            board_id: board.board_id,
            position,
            orientation,
            covariance,
        }
    }

    /// Generates frame and board-detection messages up to `max_time`.
    pub fn generate_messages(
        &self,
        truth: &dyn TruthEngine,
        max_time: f64,
        rng: &mut SimRng,
    ) -> Vec<Message> {
        let count = (max_time * self.params.rate).floor() as usize;
        info!(cam_id = self.params.sensor_id, count, "generating camera frames");

        let time_init = if self.params.no_errors {
            0.0
        } else {
            rng.uniform(0.0, 1.0 / self.params.rate)
        };

        let mut messages = Vec::with_capacity(count);
        for i in 0..count {
            let mut time = time_init + i as f64 / self.params.rate;
            if !self.params.no_errors {
                time += rng.normal(0.0, self.params.time_error);
            }

            messages.push(Message::Frame(FrameSample {
                sensor_id: self.params.sensor_id,
                time,
                features: self.visible_features(truth, time, rng),
            }));

            if let Some(board) = &self.board {
                messages.push(Message::Fiducial(self.detect_board(board, truth, time, rng)));
            }
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::truth::TruthEngineCyclic;
    use approx::assert_relative_eq;

    fn stationary_truth() -> TruthEngineCyclic {
        TruthEngineCyclic {
            pos_frequency: Vector3::zeros(),
            ang_frequency: Vector3::zeros(),
            pos_offset: Vector3::zeros(),
            pos_amplitude: 0.0,
            ang_amplitude: 0.0,
            stationary_time: 0.0,
        }
    }

    fn camera_params() -> SimCameraParams {
        SimCameraParams {
            sensor_id: 1,
            rate: 10.0,
            pos_c_in_b: Vector3::zeros(),
            ang_c_to_b: UnitQuaternion::identity(),
            intrinsics: Intrinsics {
                f: 0.01,
                pixel_size: 1e-5,
                c_x: 320.0,
                c_y: 240.0,
                width: 640.0,
                height: 480.0,
                ..Intrinsics::default()
            },
            time_error: 0.0,
            pos_error: Vector3::zeros(),
            ang_error: Vector3::zeros(),
            pixel_error: 0.0,
            no_errors: true,
        }
    }

    #[test]
    fn test_only_frustum_features_are_detected() {
        let mut rng = SimRng::from_seed(0);
        let mut camera = SimCamera::new(camera_params(), &mut rng);
        // One feature ahead (+z), one behind.
        camera.features = vec![Vector3::new(0.0, 0.0, 5.0), Vector3::new(0.0, 0.0, -5.0)];

        let detected = camera.visible_features(&stationary_truth(), 0.0, &mut rng);

        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].feature_id, 0);
        assert_relative_eq!(detected[0].pixel.x, 320.0, epsilon = 1e-9);
    }

    #[test]
    fn test_board_detection_is_exact_without_errors() {
        let mut rng = SimRng::from_seed(0);
        let mut camera = SimCamera::new(camera_params(), &mut rng);
        camera.attach_board(SimBoardParams {
            board_id: 0,
            pos_f_in_g: Vector3::new(0.5, -0.2, 3.0),
            ang_f_to_g: UnitQuaternion::from_euler_angles(0.1, 0.0, 0.0),
            variance: Vector3::new(1e-4, 1e-4, 1e-4),
            t_vec_error: Vector3::zeros(),
            r_vec_error: Vector3::zeros(),
        });

        let board = camera.board().unwrap().clone();
        let detection = camera.detect_board(&board, &stationary_truth(), 0.0, &mut rng);

        assert_relative_eq!(detection.position, Vector3::new(0.5, -0.2, 3.0), epsilon = 1e-12);
    }

    #[test]
    fn test_frame_stream_carries_board_detections() {
        let mut rng = SimRng::from_seed(0);
        let mut camera = SimCamera::new(camera_params(), &mut rng);
        camera.generate_features(10, 5.0, &mut rng);
        camera.attach_board(SimBoardParams {
            board_id: 0,
            pos_f_in_g: Vector3::new(0.0, 0.0, 2.0),
            ang_f_to_g: UnitQuaternion::identity(),
            variance: Vector3::new(1e-4, 1e-4, 1e-4),
            t_vec_error: Vector3::zeros(),
            r_vec_error: Vector3::zeros(),
        });

        let messages = camera.generate_messages(&stationary_truth(), 1.0, &mut rng);

        let frames = messages.iter().filter(|m| matches!(m, Message::Frame(_))).count();
        let boards = messages
            .iter()
            .filter(|m| matches!(m, Message::Fiducial(_)))
            .count();
        assert_eq!(frames, 10);
        assert_eq!(boards, 10);
    }

    #[test]
    fn test_extrinsic_truth_perturbed_only_with_errors() {
        let mut rng = SimRng::from_seed(5);
        let exact = SimCamera::new(camera_params(), &mut rng);
        assert_relative_eq!(exact.true_extrinsics().0, Vector3::zeros());

        let mut noisy_params = camera_params();
        noisy_params.no_errors = false;
        noisy_params.pos_error = Vector3::new(0.1, 0.1, 0.1);
        let noisy = SimCamera::new(noisy_params, &mut rng);
        assert!(noisy.true_extrinsics().0.norm() > 0.0);
    }
}
