//! Orchestrator: the single owner of the filter.
//!
//! Messages drain from the time-ordered queue one at a time; each is routed
//! to its updater, which first advances the filter to the measurement time
//! and then applies its correction. Frames additionally snapshot a camera
//! clone before the tracker output is folded in.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::ekf::state::{FrameId, SensorId, BODY_STATE_SIZE, CAM_EXTRINSIC_SIZE};
use crate::ekf::update::{BoardDetection, FiducialUpdater, ImuUpdater, MsckfUpdater};
use crate::ekf::{Ekf, FilterError};
use crate::io::data_log::{enumerate_header, push_dvector, push_quaternion, push_vector3, DataLogger};
use crate::msg::{FiducialDetection, FrameSample, ImuSample, Message, TrackerBatch};
use crate::queue::TimeOrderedQueue;
use crate::trackers::FeatureTracker;

/// One camera with its front-end and updaters.
pub struct CameraPipeline {
    pub cam_id: SensorId,
    pub tracker: FeatureTracker,
    pub msckf: MsckfUpdater,
    pub fiducial: Option<FiducialUpdater>,
    next_frame_id: FrameId,
}

impl CameraPipeline {
    pub fn new(
        cam_id: SensorId,
        tracker: FeatureTracker,
        msckf: MsckfUpdater,
        fiducial: Option<FiducialUpdater>,
    ) -> Self {
        Self {
            cam_id,
            tracker,
            msckf,
            fiducial,
            next_frame_id: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorParams {
    /// Messages older than `current_time - stale_tolerance` are dropped.
    pub stale_tolerance: f64,
    /// Soft per-message budget; exceeding it logs a warning.
    pub deadline: Option<Duration>,
    /// Body-state log rate; zero disables the body log.
    pub body_data_rate: f64,
}

impl Default for OrchestratorParams {
    fn default() -> Self {
        Self {
            stale_tolerance: 1.0,
            deadline: None,
            body_data_rate: 0.0,
        }
    }
}

/// CSV sinks, one file per subsystem.
#[derive(Default)]
pub struct SystemLogs {
    pub body: Option<DataLogger>,
    pub imu: BTreeMap<SensorId, DataLogger>,
    pub msckf: BTreeMap<SensorId, DataLogger>,
    pub board: BTreeMap<SensorId, DataLogger>,
    pub feature: Option<DataLogger>,
}

pub struct Orchestrator {
    ekf: Ekf,
    imus: Vec<ImuUpdater>,
    cameras: Vec<CameraPipeline>,
    params: OrchestratorParams,
    shutdown: Arc<AtomicBool>,
    logs: SystemLogs,
    prev_body_log_time: Option<f64>,
}

impl Orchestrator {
    pub fn new(ekf: Ekf, params: OrchestratorParams) -> Self {
        Self {
            ekf,
            imus: Vec::new(),
            cameras: Vec::new(),
            params,
            shutdown: Arc::new(AtomicBool::new(false)),
            logs: SystemLogs::default(),
            prev_body_log_time: None,
        }
    }

    pub fn ekf(&self) -> &Ekf {
        &self.ekf
    }

    pub fn ekf_mut(&mut self) -> &mut Ekf {
        &mut self.ekf
    }

    /// Flag observed between messages; setting it stops the drain loop.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn add_imu(&mut self, updater: ImuUpdater) {
        self.imus.push(updater);
    }

    pub fn add_camera(&mut self, pipeline: CameraPipeline) {
        self.cameras.push(pipeline);
    }

    pub fn set_logs(&mut self, logs: SystemLogs) {
        self.logs = logs;
    }

    fn clone_window(tracker: &FeatureTracker) -> usize {
        // The window must hold every clone an unterminated track can still
        // reference, plus the frame that forces termination.
        tracker.max_track_length() + 1
    }

    fn handle_imu(&mut self, sample: &ImuSample) -> Result<(), FilterError> {
        let updater = self
            .imus
            .iter()
            .find(|u| u.imu_id() == sample.sensor_id)
            .ok_or(FilterError::UnknownSensorId(sample.sensor_id))?;

        let log = updater.update(
            &mut self.ekf,
            sample.time,
            sample.acceleration,
            sample.acceleration_cov,
            sample.angular_rate,
            sample.angular_rate_cov,
        )?;

        if let Some(log) = log {
            if let Some(logger) = self.logs.imu.get_mut(&sample.sensor_id) {
                let mut values = Vec::new();
                push_dvector(&mut values, &log.residual);
                push_dvector(&mut values, &log.body_update);
                push_dvector(&mut values, &log.sensor_update);
                let _ = logger.log_values(sample.time, &values);
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: &FrameSample) -> Result<(), FilterError> {
        let camera = self
            .cameras
            .iter_mut()
            .find(|c| c.cam_id == frame.sensor_id)
            .ok_or(FilterError::UnknownSensorId(frame.sensor_id))?;

        let frame_id = camera.next_frame_id;
        camera.next_frame_id += 1;

        // Advance to the frame time before snapshotting the clone.
        self.ekf.predict(frame.time);
        let window = Self::clone_window(&camera.tracker);
        self.ekf.augment_state(camera.cam_id, frame_id, window)?;

        let tracks = camera.tracker.track(frame_id, frame.features.clone());
        if tracks.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let log = camera.msckf.update(&mut self.ekf, frame.time, &tracks)?;
        let elapsed_us = started.elapsed().as_micros() as f64;

        if let Some(log) = log {
            if let Some(logger) = self.logs.msckf.get_mut(&frame.sensor_id) {
                let mut values = Vec::new();
                push_dvector(&mut values, &self.ekf.state.body.to_vector());
                if let Some(cam) = self.ekf.state.cam_state(frame.sensor_id) {
                    push_vector3(&mut values, &cam.pos_c_in_b);
                    push_quaternion(&mut values, &cam.ang_c_to_b);
                }
                push_dvector(&mut values, &log.body_update);
                push_dvector(&mut values, &log.cam_update);
                values.push(elapsed_us);
                let _ = logger.log_values(frame.time, &values);
            }
            if let Some(feature_log) = &mut self.logs.feature {
                for (feature_id, position) in &log.features {
                    let _ = feature_log.log(&[
                        format!("{}", frame.time),
                        format!("{feature_id}"),
                        format!("{}", position.x),
                        format!("{}", position.y),
                        format!("{}", position.z),
                    ]);
                }
            }
        }
        Ok(())
    }

    fn handle_tracker_batch(&mut self, batch: &TrackerBatch) -> Result<(), FilterError> {
        let camera = self
            .cameras
            .iter_mut()
            .find(|c| c.cam_id == batch.sensor_id)
            .ok_or(FilterError::UnknownSensorId(batch.sensor_id))?;
        camera.msckf.update(&mut self.ekf, batch.time, &batch.tracks)?;
        Ok(())
    }

    fn handle_fiducial(&mut self, detection: &FiducialDetection) -> Result<(), FilterError> {
        let camera = self
            .cameras
            .iter()
            .find(|c| c.cam_id == detection.sensor_id)
            .ok_or(FilterError::UnknownSensorId(detection.sensor_id))?;
        let updater = camera
            .fiducial
            .as_ref()
            .ok_or(FilterError::UnknownSensorId(detection.sensor_id))?;

        updater.update(
            &mut self.ekf,
            detection.time,
            &BoardDetection {
                board_id: detection.board_id,
                position: detection.position,
                orientation: detection.orientation,
                covariance: detection.covariance,
            },
        )?;

        if let Some(logger) = self.logs.board.get_mut(&detection.sensor_id) {
            let mut values = vec![detection.board_id as f64];
            push_vector3(&mut values, &detection.position);
            push_quaternion(&mut values, &detection.orientation);
            let _ = logger.log_values(detection.time, &values);
        }
        Ok(())
    }

    /// Routes one message. Staleness is checked here so no updater ever
    /// sees a message older than the configured tolerance.
    pub fn handle_message(&mut self, message: &Message) -> Result<(), FilterError> {
        if let Some(current) = self.ekf.current_time() {
            if message.time() < current - self.params.stale_tolerance {
                return Err(FilterError::StaleMessage {
                    time: message.time(),
                    current,
                });
            }
        }

        match message {
            Message::Imu(sample) => self.handle_imu(sample),
            Message::Frame(frame) => self.handle_frame(frame),
            Message::TrackerBatch(batch) => self.handle_tracker_batch(batch),
            Message::Fiducial(detection) => self.handle_fiducial(detection),
        }
    }

    fn log_body_state_if_needed(&mut self) {
        let Some(time) = self.ekf.current_time() else { return };
        if self.params.body_data_rate <= 0.0 {
            return;
        }
        if let Some(prev) = self.prev_body_log_time {
            if time < prev + 1.0 / self.params.body_data_rate {
                return;
            }
        }
        self.prev_body_log_time = Some(time);
        if let Some(logger) = &mut self.logs.body {
            let mut values = Vec::new();
            push_dvector(&mut values, &self.ekf.state.body.to_vector());
            for i in 0..BODY_STATE_SIZE {
                values.push(self.ekf.cov()[(i, i)]);
            }
            let _ = logger.log_values(time, &values);
        }
    }

    /// Drains the queue until empty or shutdown. Fatal errors abort; every
    /// other failure drops the message and continues.
    pub fn run(&mut self, queue: &TimeOrderedQueue) -> Result<(), FilterError> {
        info!("orchestrator draining {} messages", queue.len());
        while !self.shutdown.load(Ordering::Relaxed) {
            let Some(message) = queue.pop() else { break };

            let started = Instant::now();
            match self.handle_message(&message) {
                Ok(()) => {}
                Err(
                    error @ (FilterError::DimensionMismatch(_)
                    | FilterError::NonFinite
                    | FilterError::SealedState),
                ) => return Err(error),
                Err(error) => {
                    warn!(%error, time = message.time(), "message dropped");
                }
            }

            if let Some(deadline) = self.params.deadline {
                let elapsed = started.elapsed();
                if elapsed > deadline {
                    warn!(?elapsed, ?deadline, "message handling exceeded deadline");
                }
            }
            self.log_body_state_if_needed();
        }
        debug!("orchestrator drain complete");
        Ok(())
    }
}

/// Builds the standard per-subsystem log set for registered sensors.
pub fn build_logs(
    out_dir: &std::path::Path,
    enabled: bool,
    imu_sizes: &[(SensorId, usize)],
    cam_ids: &[SensorId],
    boards: &[SensorId],
) -> Result<SystemLogs> {
    let mut logs = SystemLogs::default();

    let mut body = DataLogger::new(out_dir, "body_state.csv", enabled)?;
    let mut header = vec!["time".to_string()];
    header.extend(enumerate_header("body_state", BODY_STATE_SIZE));
    header.extend(enumerate_header("body_cov", BODY_STATE_SIZE));
    body.define_header(&header)?;
    logs.body = Some(body);

    for (imu_id, size) in imu_sizes {
        let mut logger = DataLogger::new(out_dir, &format!("imu_{imu_id}.csv"), enabled)?;
        let mut header = vec!["time".to_string()];
        header.extend(enumerate_header("residual", 6));
        header.extend(enumerate_header("body_update", BODY_STATE_SIZE));
        header.extend(enumerate_header("imu_update", *size));
        logger.define_header(&header)?;
        logs.imu.insert(*imu_id, logger);
    }

    for cam_id in cam_ids {
        let mut logger = DataLogger::new(out_dir, &format!("msckf_{cam_id}.csv"), enabled)?;
        let mut header = vec!["time".to_string()];
        header.extend(enumerate_header("body_state", BODY_STATE_SIZE));
        header.extend(enumerate_header("cam_state", 7));
        header.extend(enumerate_header("body_update", BODY_STATE_SIZE));
        header.extend(enumerate_header("cam_update", CAM_EXTRINSIC_SIZE));
        header.push("execution_time_us".to_string());
        logger.define_header(&header)?;
        logs.msckf.insert(*cam_id, logger);
    }

    for cam_id in boards {
        let mut logger = DataLogger::new(out_dir, &format!("board_{cam_id}.csv"), enabled)?;
        let mut header = vec!["time".to_string(), "board_id".to_string()];
        header.extend(enumerate_header("pos", 3));
        header.extend(enumerate_header("quat", 4));
        logger.define_header(&header)?;
        logs.board.insert(*cam_id, logger);
    }

    let mut feature = DataLogger::new(out_dir, "features.csv", enabled)?;
    feature.define_header(&[
        "time".to_string(),
        "feature_id".to_string(),
        "x".to_string(),
        "y".to_string(),
        "z".to_string(),
    ])?;
    logs.feature = Some(feature);

    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ekf::filter::BiasStability;
    use crate::ekf::state::{BodyState, CamState, ImuState, GRAVITY};
    use crate::sensors::Intrinsics;
    use crate::trackers::FeatureTrackerParams;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector, Matrix3, UnitQuaternion, Vector3};

    fn base_imu_state() -> ImuState {
        ImuState {
            pos_i_in_b: Vector3::zeros(),
            ang_i_to_b: UnitQuaternion::identity(),
            acc_bias: Vector3::zeros(),
            omg_bias: Vector3::zeros(),
            is_extrinsic: false,
            is_intrinsic: false,
        }
    }

    /// Orchestrator with one base IMU that drives prediction.
    fn dead_reckoning_system() -> Orchestrator {
        let mut ekf = Ekf::new(DVector::from_element(BODY_STATE_SIZE, 1e-4));
        ekf.initialize(0.0, BodyState::default());
        ekf.register_imu(
            0,
            base_imu_state(),
            BiasStability { acc: 0.0, omg: 0.0 },
            DMatrix::zeros(0, 0),
        )
        .unwrap();

        let mut orchestrator = Orchestrator::new(ekf, OrchestratorParams::default());
        orchestrator.add_imu(ImuUpdater::new(0, true));
        orchestrator
    }

    fn imu_message(time: f64, acc: Vector3<f64>, omg: Vector3<f64>) -> Message {
        Message::Imu(ImuSample {
            sensor_id: 0,
            time,
            acceleration: acc,
            acceleration_cov: Matrix3::identity() * 1e-6,
            angular_rate: omg,
            angular_rate_cov: Matrix3::identity() * 1e-6,
            is_prediction_driver: true,
        })
    }

    #[test]
    fn test_stationary_base_imu_holds_position() {
        let mut system = dead_reckoning_system();
        let queue = TimeOrderedQueue::new();
        for i in 0..=1000 {
            queue.push(imu_message(i as f64 * 0.01, GRAVITY, Vector3::zeros()));
        }

        system.run(&queue).unwrap();

        let body = &system.ekf().state.body;
        assert!(body.position.norm() < 1e-6);
        assert!(body.velocity.norm() < 1e-6);
        assert_relative_eq!(body.orientation.angle(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_constant_acceleration_integrates_to_half_meter() {
        let mut system = dead_reckoning_system();
        let queue = TimeOrderedQueue::new();
        let acc = Vector3::new(1.0, 0.0, 0.0) + GRAVITY;
        for i in 0..=100 {
            queue.push(imu_message(i as f64 * 0.01, acc, Vector3::zeros()));
        }

        system.run(&queue).unwrap();

        let body = &system.ekf().state.body;
        assert_relative_eq!(body.position.x, 0.5, epsilon = 1e-9);
        assert_relative_eq!(body.velocity.x, 1.0, epsilon = 1e-9);
        assert!(body.position.yz().norm() < 1e-9);
    }

    #[test]
    fn test_pure_rotation_reaches_quarter_turn() {
        let mut system = dead_reckoning_system();
        let queue = TimeOrderedQueue::new();
        let omega = Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        for i in 0..=100 {
            queue.push(imu_message(i as f64 * 0.01, GRAVITY, omega));
        }

        system.run(&queue).unwrap();

        let orientation = system.ekf().state.body.orientation;
        let expected =
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2);
        assert_relative_eq!(orientation.angle_to(&expected), 0.0, epsilon = 1e-9);
        // Gravity rotates with the body about z, so the position holds.
        assert!(system.ekf().state.body.position.norm() < 1e-9);
    }

    #[test]
    fn test_unknown_sensor_is_dropped_not_fatal() {
        let mut system = dead_reckoning_system();
        let queue = TimeOrderedQueue::new();
        queue.push(imu_message(0.0, GRAVITY, Vector3::zeros()));
        queue.push(Message::Imu(ImuSample {
            sensor_id: 99,
            time: 0.01,
            acceleration: GRAVITY,
            acceleration_cov: Matrix3::identity(),
            angular_rate: Vector3::zeros(),
            angular_rate_cov: Matrix3::identity(),
            is_prediction_driver: false,
        }));

        system.run(&queue).unwrap();
    }

    #[test]
    fn test_stale_message_is_dropped() {
        let mut system = dead_reckoning_system();
        system.params.stale_tolerance = 0.5;
        system
            .handle_message(&imu_message(10.0, GRAVITY, Vector3::zeros()))
            .unwrap();

        let out = system.handle_message(&imu_message(9.0, GRAVITY, Vector3::zeros()));
        assert!(matches!(out, Err(FilterError::StaleMessage { .. })));
    }

    #[test]
    fn test_shutdown_flag_stops_drain() {
        let mut system = dead_reckoning_system();
        let queue = TimeOrderedQueue::new();
        for i in 0..100 {
            queue.push(imu_message(i as f64 * 0.01, GRAVITY, Vector3::zeros()));
        }

        system.shutdown_flag().store(true, Ordering::Relaxed);
        system.run(&queue).unwrap();

        // Nothing was consumed.
        assert_eq!(queue.len(), 100);
    }

    #[test]
    fn test_frames_create_clones_and_msckf_updates() {
        let mut ekf = Ekf::new(DVector::from_element(BODY_STATE_SIZE, 1e-4));
        ekf.initialize(0.0, BodyState::default());
        ekf.register_imu(
            0,
            base_imu_state(),
            BiasStability { acc: 0.0, omg: 0.0 },
            DMatrix::zeros(0, 0),
        )
        .unwrap();
        ekf.register_camera(
            1,
            CamState {
                pos_c_in_b: Vector3::zeros(),
                ang_c_to_b: UnitQuaternion::identity(),
                clones: Vec::new(),
            },
            DMatrix::identity(6, 6) * 1e-4,
        )
        .unwrap();

        let intrinsics = Intrinsics {
            f: 1.0,
            pixel_size: 1.0,
            c_x: 0.0,
            c_y: 0.0,
            width: 4.0,
            height: 4.0,
            ..Intrinsics::default()
        };
        let tracker = FeatureTracker::new(FeatureTrackerParams {
            min_track_length: 2,
            max_track_length: 5,
            min_feat_dist: 1e-6,
            grid: None,
            image_width: 4.0,
            image_height: 4.0,
        });

        let mut system = Orchestrator::new(ekf, OrchestratorParams::default());
        system.add_imu(ImuUpdater::new(0, true));
        system.add_camera(CameraPipeline::new(
            1,
            tracker,
            MsckfUpdater::new(1, intrinsics, 1e-2),
            None,
        ));

        // A feature straight ahead, observed while the body translates. The
        // body pose is set directly so frame pixels and clone snapshots
        // agree exactly.
        let feature = Vector3::new(0.2, 0.0, 5.0);
        for i in 0..4 {
            let cam_pos = Vector3::new(0.25 * i as f64, 0.0, 0.0);
            system.ekf_mut().state.body.position = cam_pos;
            let rel = feature - cam_pos;
            system
                .handle_message(&Message::Frame(FrameSample {
                    sensor_id: 1,
                    time: i as f64 * 0.1,
                    features: vec![crate::msg::DetectedFeature {
                        feature_id: 0,
                        pixel: nalgebra::Vector2::new(rel.x / rel.z, rel.y / rel.z),
                        response: 1.0,
                    }],
                }))
                .unwrap();
        }
        // A final frame without the feature terminates the track.
        system
            .handle_message(&Message::Frame(FrameSample {
                sensor_id: 1,
                time: 0.4,
                features: Vec::new(),
            }))
            .unwrap();

        let cam = system.ekf().state.cam_state(1).unwrap();
        assert_eq!(cam.clones.len(), 5);
        assert!(system.ekf().is_sealed());
    }
}
