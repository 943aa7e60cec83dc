//! Analytic truth trajectories for simulation.
//!
//! A truth engine provides the body state and its derivatives in closed
//! form, so synthetic sensors sample exact kinematics rather than a
//! numerically integrated approximation. Both engines hold still for a
//! configurable lead-in before the trajectory starts.

use std::f64::consts::TAU;

use nalgebra::{UnitQuaternion, Vector3};

/// Closed-form body trajectory.
pub trait TruthEngine {
    fn body_position(&self, time: f64) -> Vector3<f64>;
    fn body_velocity(&self, time: f64) -> Vector3<f64>;
    fn body_acceleration(&self, time: f64) -> Vector3<f64>;
    fn body_angular_position(&self, time: f64) -> UnitQuaternion<f64>;
    fn body_angular_rate(&self, time: f64) -> Vector3<f64>;
    fn body_angular_acceleration(&self, time: f64) -> Vector3<f64>;
}

/// Sinusoidal trajectory: each axis follows `A (1 − cos(2π f t))` around a
/// fixed offset, so the body starts at rest at the offset.
pub struct TruthEngineCyclic {
    pub pos_frequency: Vector3<f64>,
    pub ang_frequency: Vector3<f64>,
    pub pos_offset: Vector3<f64>,
    pub pos_amplitude: f64,
    pub ang_amplitude: f64,
    pub stationary_time: f64,
}

impl TruthEngineCyclic {
    fn active_time(&self, time: f64) -> f64 {
        (time - self.stationary_time).max(0.0)
    }

    fn euler_angles(&self, time: f64) -> Vector3<f64> {
        let t = self.active_time(time);
        self.ang_frequency
            .map(|f| self.ang_amplitude * (1.0 - (f * TAU * t).cos()))
    }
}

impl TruthEngine for TruthEngineCyclic {
    fn body_position(&self, time: f64) -> Vector3<f64> {
        let t = self.active_time(time);
        self.pos_frequency
            .map(|f| self.pos_amplitude * (1.0 - (f * TAU * t).cos()))
            + self.pos_offset
    }

    fn body_velocity(&self, time: f64) -> Vector3<f64> {
        let t = self.active_time(time);
        self.pos_frequency
            .map(|f| self.pos_amplitude * f * TAU * (f * TAU * t).sin())
    }

    fn body_acceleration(&self, time: f64) -> Vector3<f64> {
        let t = self.active_time(time);
        self.pos_frequency
            .map(|f| self.pos_amplitude * (f * TAU).powi(2) * (f * TAU * t).cos())
    }

    fn body_angular_position(&self, time: f64) -> UnitQuaternion<f64> {
        let angles = self.euler_angles(time);
        UnitQuaternion::from_euler_angles(angles.x, angles.y, angles.z)
    }

    fn body_angular_rate(&self, time: f64) -> Vector3<f64> {
        let t = self.active_time(time);
        self.ang_frequency
            .map(|f| self.ang_amplitude * f * TAU * (f * TAU * t).sin())
    }

    fn body_angular_acceleration(&self, time: f64) -> Vector3<f64> {
        let t = self.active_time(time);
        self.ang_frequency
            .map(|f| self.ang_amplitude * (f * TAU).powi(2) * (f * TAU * t).cos())
    }
}

/// Piecewise-cubic trajectory through uniformly spaced control points
/// (Catmull-Rom tangents), with analytic first and second derivatives.
pub struct TruthEngineSpline {
    positions: Vec<Vector3<f64>>,
    angles: Vec<Vector3<f64>>,
    delta_time: f64,
    stationary_time: f64,
}

impl TruthEngineSpline {
    pub fn new(
        delta_time: f64,
        positions: Vec<Vector3<f64>>,
        angles: Vec<Vector3<f64>>,
        stationary_time: f64,
    ) -> Self {
        Self {
            positions,
            angles,
            delta_time,
            stationary_time,
        }
    }

    /// Hermite basis evaluation over one segment; `order` selects value,
    /// first, or second derivative with respect to the segment parameter.
    fn evaluate(points: &[Vector3<f64>], segment: usize, s: f64, order: usize) -> Vector3<f64> {
        let p0 = points[segment];
        let p1 = points[segment + 1];
        let m0 = if segment == 0 {
            p1 - p0
        } else {
            (p1 - points[segment - 1]) * 0.5
        };
        let m1 = if segment + 2 >= points.len() {
            p1 - p0
        } else {
            (points[segment + 2] - p0) * 0.5
        };

        let (h00, h10, h01, h11) = match order {
            0 => (
                2.0 * s.powi(3) - 3.0 * s.powi(2) + 1.0,
                s.powi(3) - 2.0 * s.powi(2) + s,
                -2.0 * s.powi(3) + 3.0 * s.powi(2),
                s.powi(3) - s.powi(2),
            ),
            1 => (
                6.0 * s.powi(2) - 6.0 * s,
                3.0 * s.powi(2) - 4.0 * s + 1.0,
                -6.0 * s.powi(2) + 6.0 * s,
                3.0 * s.powi(2) - 2.0 * s,
            ),
            _ => (
                12.0 * s - 6.0,
                6.0 * s - 4.0,
                -12.0 * s + 6.0,
                6.0 * s - 2.0,
            ),
        };
        p0 * h00 + m0 * h10 + p1 * h01 + m1 * h11
    }

    fn sample(&self, points: &[Vector3<f64>], time: f64, order: usize) -> Vector3<f64> {
        if points.is_empty() {
            return Vector3::zeros();
        }
        if points.len() < 2 || time < self.stationary_time {
            return if order == 0 { points[0] } else { Vector3::zeros() };
        }

        let t = time - self.stationary_time;
        let span = self.delta_time * (points.len() - 1) as f64;
        if t >= span {
            return if order == 0 {
                *points.last().expect("non-empty")
            } else {
                Vector3::zeros()
            };
        }

        let segment = ((t / self.delta_time) as usize).min(points.len() - 2);
        let s = t / self.delta_time - segment as f64;
        let value = Self::evaluate(points, segment, s, order);
        match order {
            0 => value,
            1 => value / self.delta_time,
            _ => value / (self.delta_time * self.delta_time),
        }
    }
}

impl TruthEngine for TruthEngineSpline {
    fn body_position(&self, time: f64) -> Vector3<f64> {
        self.sample(&self.positions, time, 0)
    }

    fn body_velocity(&self, time: f64) -> Vector3<f64> {
        self.sample(&self.positions, time, 1)
    }

    fn body_acceleration(&self, time: f64) -> Vector3<f64> {
        self.sample(&self.positions, time, 2)
    }

    fn body_angular_position(&self, time: f64) -> UnitQuaternion<f64> {
        let angles = self.sample(&self.angles, time, 0);
        UnitQuaternion::from_euler_angles(angles.x, angles.y, angles.z)
    }

    fn body_angular_rate(&self, time: f64) -> Vector3<f64> {
        self.sample(&self.angles, time, 1)
    }

    fn body_angular_acceleration(&self, time: f64) -> Vector3<f64> {
        self.sample(&self.angles, time, 2)
    }
}
