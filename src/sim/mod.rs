//! Offline simulation driver.
//!
//! Builds the truth engine and synthetic sensors from the configuration,
//! registers every sensor with the filter, pre-generates the full
//! measurement set, and drains it through the orchestrator in time order.

pub mod camera;
pub mod imu;
pub mod rng;
pub mod truth;

use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3};
use tracing::info;

use crate::ekf::filter::BiasStability;
use crate::ekf::state::{BodyState, CamState, ImuState, SensorId};
use crate::ekf::update::{FiducialUpdater, ImuUpdater, MsckfUpdater};
use crate::ekf::Ekf;
use crate::io::config::{to_quaternion, to_vector3, Config};
use crate::io::data_log::{enumerate_header, push_quaternion, push_vector3, DataLogger};
use crate::queue::TimeOrderedQueue;
use crate::system::{build_logs, CameraPipeline, Orchestrator, OrchestratorParams};
use crate::trackers::{FeatureTracker, FeatureTrackerParams};

use camera::{SimBoardParams, SimCamera, SimCameraParams};
use imu::{SimImu, SimImuParams};
use rng::SimRng;
use truth::{TruthEngine, TruthEngineCyclic, TruthEngineSpline};

/// Diagonal floor for registered sensor covariance blocks.
const MIN_SENSOR_VARIANCE: f64 = 1e-6;

fn build_truth(config: &Config) -> Box<dyn TruthEngine> {
    let sim = &config.sim_params;
    if sim.truth_type == "spline" {
        let positions: Vec<Vector3<f64>> =
            sim.positions.iter().map(|p| to_vector3(p)).collect();
        let angles: Vec<Vector3<f64>> = sim.angles.iter().map(|a| to_vector3(a)).collect();
        let segments = positions.len().saturating_sub(1).max(1);
        let delta_time = sim.max_time / segments as f64;
        Box::new(TruthEngineSpline::new(
            delta_time,
            positions,
            angles,
            sim.stationary_time,
        ))
    } else {
        Box::new(TruthEngineCyclic {
            pos_frequency: to_vector3(&sim.pos_frequency),
            ang_frequency: to_vector3(&sim.ang_frequency),
            pos_offset: to_vector3(&sim.pos_offset),
            pos_amplitude: sim.pos_amplitude,
            ang_amplitude: sim.ang_amplitude,
            stationary_time: sim.stationary_time,
        })
    }
}

fn variance_block(variance: &[f64], size: usize) -> DMatrix<f64> {
    let mut block = DMatrix::zeros(size, size);
    for i in 0..size {
        let value = variance.get(i).copied().unwrap_or(MIN_SENSOR_VARIANCE);
        block[(i, i)] = value.max(MIN_SENSOR_VARIANCE);
    }
    block
}

fn initial_body_state(truth: &dyn TruthEngine) -> BodyState {
    BodyState {
        position: truth.body_position(0.0),
        velocity: truth.body_velocity(0.0),
        acceleration: truth.body_acceleration(0.0),
        orientation: truth.body_angular_position(0.0),
        angular_velocity: truth.body_angular_rate(0.0),
        angular_acceleration: truth.body_angular_acceleration(0.0),
    }
}

struct ImuTruthRecord {
    pos: Vector3<f64>,
    ang: UnitQuaternion<f64>,
    acc_bias: Vector3<f64>,
    omg_bias: Vector3<f64>,
}

struct CamTruthRecord {
    pos: Vector3<f64>,
    ang: UnitQuaternion<f64>,
}

/// Writes the ground-truth file sampled at the body data rate.
fn write_truth_data(
    out_dir: &Path,
    truth: &dyn TruthEngine,
    imu_truths: &[ImuTruthRecord],
    cam_truths: &[CamTruthRecord],
    rate: f64,
    duration: f64,
) -> Result<()> {
    let mut logger = DataLogger::new(out_dir, "body_truth.csv", true)?;
    let mut header = vec!["time".to_string()];
    header.extend(enumerate_header("body_pos", 3));
    header.extend(enumerate_header("body_vel", 3));
    header.extend(enumerate_header("body_acc", 3));
    header.extend(enumerate_header("body_ang_pos", 4));
    header.extend(enumerate_header("body_ang_vel", 3));
    header.extend(enumerate_header("body_ang_acc", 3));
    for (i, _) in imu_truths.iter().enumerate() {
        header.extend(enumerate_header(&format!("imu_{i}_pos"), 3));
        header.extend(enumerate_header(&format!("imu_{i}_ang_pos"), 4));
        header.extend(enumerate_header(&format!("imu_{i}_acc_bias"), 3));
        header.extend(enumerate_header(&format!("imu_{i}_gyr_bias"), 3));
    }
    for (i, _) in cam_truths.iter().enumerate() {
        header.extend(enumerate_header(&format!("cam_{i}_pos"), 3));
        header.extend(enumerate_header(&format!("cam_{i}_ang_pos"), 4));
    }
    logger.define_header(&header)?;

    if rate <= 0.0 {
        return Ok(());
    }
    let steps = (duration * rate).floor() as usize;
    for i in 0..=steps {
        let time = i as f64 / rate;
        let mut values = Vec::new();
        push_vector3(&mut values, &truth.body_position(time));
        push_vector3(&mut values, &truth.body_velocity(time));
        push_vector3(&mut values, &truth.body_acceleration(time));
        push_quaternion(&mut values, &truth.body_angular_position(time));
        push_vector3(&mut values, &truth.body_angular_rate(time));
        push_vector3(&mut values, &truth.body_angular_acceleration(time));
        for imu in imu_truths {
            push_vector3(&mut values, &imu.pos);
            push_quaternion(&mut values, &imu.ang);
            push_vector3(&mut values, &imu.acc_bias);
            push_vector3(&mut values, &imu.omg_bias);
        }
        for cam in cam_truths {
            push_vector3(&mut values, &cam.pos);
            push_quaternion(&mut values, &cam.ang);
        }
        logger.log_values(time, &values)?;
    }
    Ok(())
}

/// Runs one full simulation to completion and returns the final body
/// estimate.
pub fn run(config: &Config, out_dir: &Path) -> Result<BodyState> {
    let sim = &config.sim_params;
    let mut rng = if sim.use_seed {
        SimRng::from_seed(sim.seed)
    } else {
        SimRng::from_entropy()
    };
    let truth = build_truth(config);
    let total_time = sim.max_time + sim.stationary_time;

    let mut ekf = Ekf::new(DVector::from_vec(config.filter_params.process_noise.clone()));
    ekf.initialize(0.0, initial_body_state(truth.as_ref()));

    let queue = TimeOrderedQueue::new();
    let mut next_sensor_id: SensorId = 0;
    let mut imu_updaters = Vec::new();
    let mut imu_log_sizes = Vec::new();
    let mut imu_truths = Vec::new();

    info!("loading IMUs");
    for name in &config.imu_list {
        let imu_cfg = &config.imu[name];
        let sensor_id = next_sensor_id;
        next_sensor_id += 1;

        let imu_state = ImuState {
            pos_i_in_b: to_vector3(&imu_cfg.pos_i_in_b),
            ang_i_to_b: to_quaternion(&imu_cfg.ang_i_to_b),
            acc_bias: to_vector3(&imu_cfg.acc_bias),
            omg_bias: to_vector3(&imu_cfg.omg_bias),
            is_extrinsic: imu_cfg.is_extrinsic,
            is_intrinsic: imu_cfg.is_intrinsic,
        };
        let block = variance_block(&imu_cfg.variance, imu_state.size());
        ekf.register_imu(
            sensor_id,
            imu_state.clone(),
            BiasStability {
                acc: imu_cfg.acc_bias_stability,
                omg: imu_cfg.omg_bias_stability,
            },
            block,
        )
        .with_context(|| format!("registering imu '{name}'"))?;

        let sim_imu = SimImu::new(
            SimImuParams {
                sensor_id,
                rate: imu_cfg.rate,
                is_extrinsic: imu_cfg.is_extrinsic,
                is_intrinsic: imu_cfg.is_intrinsic,
                use_for_prediction: imu_cfg.use_for_prediction,
                pos_i_in_b: imu_state.pos_i_in_b,
                ang_i_to_b: imu_state.ang_i_to_b,
                acc_bias: imu_state.acc_bias,
                omg_bias: imu_state.omg_bias,
                time_error: imu_cfg.sim_params.time_error,
                acc_error: to_vector3(&imu_cfg.sim_params.acc_error),
                omg_error: to_vector3(&imu_cfg.sim_params.omg_error),
                pos_error: to_vector3(&imu_cfg.sim_params.pos_error),
                ang_error: to_vector3(&imu_cfg.sim_params.ang_error),
                acc_bias_error: to_vector3(&imu_cfg.sim_params.acc_bias_error),
                omg_bias_error: to_vector3(&imu_cfg.sim_params.omg_bias_error),
                no_errors: sim.no_errors,
            },
            &mut rng,
        );

        let (pos_true, ang_true) = sim_imu.true_extrinsics();
        let (acc_bias_true, omg_bias_true) = sim_imu.true_biases();
        imu_truths.push(ImuTruthRecord {
            pos: pos_true,
            ang: ang_true,
            acc_bias: acc_bias_true,
            omg_bias: omg_bias_true,
        });

        for message in sim_imu.generate_messages(truth.as_ref(), total_time, &mut rng) {
            queue.push(message);
        }
        imu_updaters.push(ImuUpdater::new(sensor_id, imu_cfg.use_for_prediction));
        imu_log_sizes.push((sensor_id, imu_state.size()));
    }

    info!("loading cameras");
    let mut pipelines = Vec::new();
    let mut cam_ids = Vec::new();
    let mut board_ids = Vec::new();
    let mut cam_truths = Vec::new();

    for name in &config.camera_list {
        let cam_cfg = &config.camera[name];
        let sensor_id = next_sensor_id;
        next_sensor_id += 1;

        let cam_state = CamState {
            pos_c_in_b: to_vector3(&cam_cfg.pos_c_in_b),
            ang_c_to_b: to_quaternion(&cam_cfg.ang_c_to_b),
            clones: Vec::new(),
        };
        ekf.register_camera(sensor_id, cam_state.clone(), variance_block(&cam_cfg.variance, 6))
            .with_context(|| format!("registering camera '{name}'"))?;

        let mut sim_camera = SimCamera::new(
            SimCameraParams {
                sensor_id,
                rate: cam_cfg.rate,
                pos_c_in_b: cam_state.pos_c_in_b,
                ang_c_to_b: cam_state.ang_c_to_b,
                intrinsics: cam_cfg.intrinsics.clone(),
                time_error: cam_cfg.sim_params.time_error,
                pos_error: to_vector3(&cam_cfg.sim_params.pos_error),
                ang_error: to_vector3(&cam_cfg.sim_params.ang_error),
                pixel_error: config
                    .tracker
                    .get(&cam_cfg.tracker)
                    .map(|t| t.pixel_error)
                    .unwrap_or(0.0),
                no_errors: sim.no_errors,
            },
            &mut rng,
        );

        let tracker_cfg = config.tracker.get(&cam_cfg.tracker);
        let tracker_params = tracker_cfg
            .map(|cfg| FeatureTrackerParams {
                min_track_length: cfg.min_track_length,
                max_track_length: cfg.max_track_length,
                min_feat_dist: cfg.min_feat_dist,
                grid: None,
                image_width: cam_cfg.intrinsics.width,
                image_height: cam_cfg.intrinsics.height,
            })
            .unwrap_or_default();
        if let Some(cfg) = tracker_cfg {
            sim_camera.generate_features(
                cfg.sim_params.feature_count,
                cfg.sim_params.room_size,
                &mut rng,
            );
        }

        let fiducial_updater = config.fiducial.get(&cam_cfg.fiducial).map(|fid_cfg| {
            let pos_f_in_g = to_vector3(&fid_cfg.pos_f_in_g);
            let ang_f_to_g = to_quaternion(&fid_cfg.ang_f_to_g);
            let (pos_true, ang_true) = if sim.no_errors {
                (pos_f_in_g, ang_f_to_g)
            } else {
                (
                    rng.vec_normal(pos_f_in_g, &to_vector3(&fid_cfg.sim_params.pos_error)),
                    rng.quat_normal(ang_f_to_g, &to_vector3(&fid_cfg.sim_params.ang_error)),
                )
            };
            sim_camera.attach_board(SimBoardParams {
                board_id: 0,
                pos_f_in_g: pos_true,
                ang_f_to_g: ang_true,
                variance: to_vector3(&fid_cfg.variance),
                t_vec_error: to_vector3(&fid_cfg.sim_params.t_vec_error),
                r_vec_error: to_vector3(&fid_cfg.sim_params.r_vec_error),
            });
            board_ids.push(sensor_id);
            FiducialUpdater::new(sensor_id, pos_f_in_g, ang_f_to_g)
        });

        let (pos_true, ang_true) = sim_camera.true_extrinsics();
        cam_truths.push(CamTruthRecord {
            pos: pos_true,
            ang: ang_true,
        });

        for message in sim_camera.generate_messages(truth.as_ref(), total_time, &mut rng) {
            queue.push(message);
        }

        let pixel_error = tracker_cfg.map(|t| t.pixel_error).unwrap_or(1.0);
        pipelines.push(CameraPipeline::new(
            sensor_id,
            FeatureTracker::new(tracker_params),
            MsckfUpdater::new(sensor_id, cam_cfg.intrinsics.clone(), pixel_error),
            fiducial_updater,
        ));
        cam_ids.push(sensor_id);
    }

    if config.data_logging_on {
        write_truth_data(
            out_dir,
            truth.as_ref(),
            &imu_truths,
            &cam_truths,
            config.body_data_rate,
            total_time,
        )?;
    }

    let mut orchestrator = Orchestrator::new(
        ekf,
        OrchestratorParams {
            stale_tolerance: 1.0,
            deadline: None,
            body_data_rate: config.body_data_rate,
        },
    );
    for updater in imu_updaters {
        orchestrator.add_imu(updater);
    }
    for pipeline in pipelines {
        orchestrator.add_camera(pipeline);
    }
    if config.data_logging_on {
        orchestrator.set_logs(build_logs(
            out_dir,
            true,
            &imu_log_sizes,
            &cam_ids,
            &board_ids,
        )?);
    }

    info!("begin simulation");
    orchestrator.run(&queue).context("simulation aborted")?;
    info!("end simulation");
    Ok(orchestrator.ekf().state.body.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATIONARY_CONFIG: &str = r#"
debug_log_level: 0
data_logging_on: false
body_data_rate: 10.0
filter_params:
  process_noise: [1.0e-6, 1.0e-6, 1.0e-6, 1.0e-6, 1.0e-6, 1.0e-6,
                  1.0e-6, 1.0e-6, 1.0e-6, 1.0e-6, 1.0e-6, 1.0e-6,
                  1.0e-6, 1.0e-6, 1.0e-6, 1.0e-6, 1.0e-6, 1.0e-6]
imu_list: [base_imu]
imu:
  base_imu:
    use_for_prediction: true
    rate: 100.0
sim_params:
  use_seed: true
  seed: 1
  no_errors: true
  max_time: 5.0
  truth_type: cyclic
"#;

    #[test]
    fn test_stationary_sim_converges_to_initial_position() {
        // Zero-frequency cyclic truth is exactly stationary; with no_errors
        // the dead-reckoned estimate must stay at the origin.
        let config: Config = serde_yaml::from_str(STATIONARY_CONFIG).unwrap();
        config.validate().unwrap();

        let out_dir = std::env::temp_dir().join("vical_sim_stationary");
        let body = run(&config, &out_dir).unwrap();

        assert!(body.position.norm() < 1e-6);
        assert!(body.velocity.norm() < 1e-6);
    }

    #[test]
    fn test_sim_with_camera_and_board_runs_clean() {
        let yaml = r#"
debug_log_level: 0
data_logging_on: false
body_data_rate: 10.0
filter_params:
  process_noise: [1.0e-4, 1.0e-4, 1.0e-4, 1.0e-4, 1.0e-4, 1.0e-4,
                  1.0e-4, 1.0e-4, 1.0e-4, 1.0e-4, 1.0e-4, 1.0e-4,
                  1.0e-4, 1.0e-4, 1.0e-4, 1.0e-4, 1.0e-4, 1.0e-4]
imu_list: [base_imu]
camera_list: [cam_0]
tracker_list: [sim_tracker]
fiducial_list: [board_0]
imu:
  base_imu:
    use_for_prediction: true
    rate: 100.0
camera:
  cam_0:
    rate: 10.0
    variance: [0.01, 0.01, 0.01, 0.001, 0.001, 0.001]
    pos_c_in_b: [0.0, 0.0, 0.0]
    ang_c_to_b: [1.0, 0.0, 0.0, 0.0]
    tracker: sim_tracker
    fiducial: board_0
    intrinsics:
      f: 0.01
      pixel_size: 1.0e-5
      c_x: 320.0
      c_y: 240.0
      width: 640.0
      height: 480.0
tracker:
  sim_tracker:
    pixel_error: 0.5
    min_track_length: 3
    max_track_length: 10
    sim_params:
      feature_count: 50
      room_size: 5.0
fiducial:
  board_0:
    pos_f_in_g: [0.0, 0.0, 3.0]
    ang_f_to_g: [1.0, 0.0, 0.0, 0.0]
    variance: [1.0e-3, 1.0e-3, 1.0e-3]
sim_params:
  use_seed: true
  seed: 7
  no_errors: true
  max_time: 2.0
  truth_type: cyclic
  pos_frequency: [0.2, 0.0, 0.0]
  ang_frequency: [0.0, 0.0, 0.1]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        let out_dir = std::env::temp_dir().join("vical_sim_camera");
        let body = run(&config, &out_dir).unwrap();

        assert!(body.position.iter().all(|v| v.is_finite()));
    }
}
