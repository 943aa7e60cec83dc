//! SO(3) utilities shared by the process model and the measurement updaters.
//!
//! Orientation states are stored as nominal `UnitQuaternion`s with a 3-vector
//! rotation-vector error tracked in the covariance. Corrections therefore
//! compose through the exponential map rather than by addition.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Small angle threshold below which `exp` falls back to identity.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-12;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map: rotation vector → unit quaternion.
pub fn quat_exp(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    if phi.norm() < SMALL_ANGLE_THRESHOLD {
        UnitQuaternion::identity()
    } else {
        UnitQuaternion::from_scaled_axis(*phi)
    }
}

/// Composes a rotation-vector error into a nominal quaternion.
///
/// The error is applied on the left in the global frame, matching the
/// linearization R ≈ (I + [δθ]×) R̂ used by every Jacobian in this crate.
pub fn apply_rotation_error(
    nominal: &UnitQuaternion<f64>,
    delta: &Vector3<f64>,
) -> UnitQuaternion<f64> {
    quat_exp(delta) * nominal
}

/// Logarithm map of the relative rotation between two quaternions,
/// `log(a · b⁻¹)`, as a rotation vector.
pub fn quat_log_diff(a: &UnitQuaternion<f64>, b: &UnitQuaternion<f64>) -> Vector3<f64> {
    (a * b.inverse()).scaled_axis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let skew_v = skew(&v);

        assert_relative_eq!(skew_v, -skew_v.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_identity_at_zero() {
        let q = quat_exp(&Vector3::zeros());
        assert_relative_eq!(q.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_error_composition_preserves_norm() {
        let nominal = UnitQuaternion::from_euler_angles(0.3, -0.2, 0.7);
        let delta = Vector3::new(1e-4, -2e-4, 3e-4);

        let composed = apply_rotation_error(&nominal, &delta);
        assert_relative_eq!(composed.norm(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_log_inverts_exp() {
        let phi = Vector3::new(0.1, -0.2, 0.15);
        let q = quat_exp(&phi);

        assert_relative_eq!(
            quat_log_diff(&q, &UnitQuaternion::identity()),
            phi,
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_small_error_recovered_by_log() {
        let nominal = UnitQuaternion::from_euler_angles(-0.4, 0.1, 0.9);
        let delta = Vector3::new(1e-6, 2e-6, -1e-6);

        let composed = apply_rotation_error(&nominal, &delta);
        let recovered = quat_log_diff(&composed, &nominal);
        assert_relative_eq!(recovered, delta, epsilon = 1e-10);
    }
}
