//! Synthetic IMU: samples the truth engine and applies the configured
//! mounting, bias, and noise errors.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use tracing::info;

use crate::ekf::state::{SensorId, GRAVITY};
use crate::msg::{ImuSample, Message};

use super::rng::SimRng;
use super::truth::TruthEngine;

#[derive(Debug, Clone)]
pub struct SimImuParams {
    pub sensor_id: SensorId,
    pub rate: f64,
    pub is_extrinsic: bool,
    pub is_intrinsic: bool,
    pub use_for_prediction: bool,
    pub pos_i_in_b: Vector3<f64>,
    pub ang_i_to_b: UnitQuaternion<f64>,
    pub acc_bias: Vector3<f64>,
    pub omg_bias: Vector3<f64>,
    pub time_error: f64,
    pub acc_error: Vector3<f64>,
    pub omg_error: Vector3<f64>,
    pub pos_error: Vector3<f64>,
    pub ang_error: Vector3<f64>,
    pub acc_bias_error: Vector3<f64>,
    pub omg_bias_error: Vector3<f64>,
    pub no_errors: bool,
}

pub struct SimImu {
    params: SimImuParams,
    /// Ground-truth mounting and biases, perturbed from the configured
    /// values for the halves the filter is asked to calibrate.
    pos_i_in_b_true: Vector3<f64>,
    ang_i_to_b_true: UnitQuaternion<f64>,
    acc_bias_true: Vector3<f64>,
    omg_bias_true: Vector3<f64>,
}

impl SimImu {
    pub fn new(params: SimImuParams, rng: &mut SimRng) -> Self {
        let (pos_true, ang_true) = if params.is_extrinsic && !params.no_errors {
            (
                rng.vec_normal(params.pos_i_in_b, &params.pos_error),
                rng.quat_normal(params.ang_i_to_b, &params.ang_error),
            )
        } else {
            (params.pos_i_in_b, params.ang_i_to_b)
        };
        let (acc_bias_true, omg_bias_true) = if params.is_intrinsic && !params.no_errors {
            (
                rng.vec_normal(params.acc_bias, &params.acc_bias_error),
                rng.vec_normal(params.omg_bias, &params.omg_bias_error),
            )
        } else {
            (params.acc_bias, params.omg_bias)
        };

        Self {
            params,
            pos_i_in_b_true: pos_true,
            ang_i_to_b_true: ang_true,
            acc_bias_true,
            omg_bias_true,
        }
    }

    pub fn true_extrinsics(&self) -> (Vector3<f64>, UnitQuaternion<f64>) {
        (self.pos_i_in_b_true, self.ang_i_to_b_true)
    }

    pub fn true_biases(&self) -> (Vector3<f64>, Vector3<f64>) {
        (self.acc_bias_true, self.omg_bias_true)
    }

    /// Exact specific force and angular rate at the IMU's true mounting.
    fn true_measurement(
        &self,
        truth: &dyn TruthEngine,
        time: f64,
    ) -> (Vector3<f64>, Vector3<f64>) {
        let body_acc = truth.body_acceleration(time);
        let body_ang = truth.body_angular_position(time);
        let omega = truth.body_angular_rate(time);
        let alpha = truth.body_angular_acceleration(time);

        let acc_at_imu = body_ang.inverse() * (body_acc + GRAVITY)
            + alpha.cross(&self.pos_i_in_b_true)
            + omega.cross(&omega.cross(&self.pos_i_in_b_true));

        let acc = self.ang_i_to_b_true.inverse() * acc_at_imu;
        let omg = self.ang_i_to_b_true.inverse() * omega;
        (acc, omg)
    }

    /// Generates the full measurement stream up to `max_time`.
    pub fn generate_messages(
        &self,
        truth: &dyn TruthEngine,
        max_time: f64,
        rng: &mut SimRng,
    ) -> Vec<Message> {
        let count = (max_time * self.params.rate).floor() as usize;
        info!(imu_id = self.params.sensor_id, count, "generating IMU measurements");

        let time_init = if self.params.no_errors {
            0.0
        } else {
            rng.uniform(0.0, 1.0 / self.params.rate)
        };

        let acc_cov = Matrix3::from_diagonal(&self.params.acc_error.map(|e| e * e));
        let omg_cov = Matrix3::from_diagonal(&self.params.omg_error.map(|e| e * e));

        let mut messages = Vec::with_capacity(count);
        for i in 0..count {
            let mut time = time_init + i as f64 / self.params.rate;
            let (mut acc, mut omg) = self.true_measurement(truth, time);

            if !self.params.no_errors {
                time += rng.normal(0.0, self.params.time_error);
                acc = rng.vec_normal(acc + self.acc_bias_true, &self.params.acc_error);
                omg = rng.vec_normal(omg + self.omg_bias_true, &self.params.omg_error);
            }

            messages.push(Message::Imu(ImuSample {
                sensor_id: self.params.sensor_id,
                time,
                acceleration: acc,
                acceleration_cov: acc_cov,
                angular_rate: omg,
                angular_rate_cov: omg_cov,
                is_prediction_driver: self.params.use_for_prediction,
            }));
        }
        messages
    }
}
