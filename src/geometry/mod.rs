//! Math utilities: SO(3) maps, Givens elimination, covariance block edits.

pub mod givens;
pub mod matrix;
pub mod so3;

pub use givens::{compress_measurements, project_left_nullspace};
pub use matrix::{insert_block, min_bound_diagonal, remove_block, symmetrize};
pub use so3::{apply_rotation_error, quat_exp, quat_log_diff, skew};
