//! Givens-rotation elimination for the MSCKF measurement pipeline.
//!
//! Both routines follow Golub & Van Loan, "Matrix Computations" 4th ed.,
//! Algorithm 5.2.4 (upward elimination): columns left to right, rows bottom
//! to top, each rotation annihilating one subdiagonal entry while the same
//! rotation is applied to the companion matrices.

use nalgebra::{DMatrix, DVector};

/// A single Givens rotation (c, s) chosen so that
/// `[c s; -s c] · [a; b] = [r; 0]`.
fn make_givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        return (1.0, 0.0);
    }
    let r = a.hypot(b);
    (a / r, b / r)
}

/// Rotates rows `m` and `m + 1` of `mat` by (c, s).
fn rotate_rows(mat: &mut DMatrix<f64>, m: usize, c: f64, s: f64) {
    for j in 0..mat.ncols() {
        let upper = mat[(m, j)];
        let lower = mat[(m + 1, j)];
        mat[(m, j)] = c * upper + s * lower;
        mat[(m + 1, j)] = -s * upper + c * lower;
    }
}

fn rotate_vec(vec: &mut DVector<f64>, m: usize, c: f64, s: f64) {
    let upper = vec[m];
    let lower = vec[m + 1];
    vec[m] = c * upper + s * lower;
    vec[m + 1] = -s * upper + c * lower;
}

/// Projects the stacked feature Jacobian out of a per-track linear system.
///
/// `h_f` (2n×3) has rank at most 3. The Givens sequence zeroes everything
/// below its top 3 rows while the same rotations are applied to `h_x` and
/// `res`; the function then discards those top 3 rows, returning the
/// (2n−3)-row system that is independent of the feature position.
///
/// Returns `None` when there are not enough rows to retain anything.
pub fn project_left_nullspace(
    h_f: &mut DMatrix<f64>,
    h_x: &mut DMatrix<f64>,
    res: &mut DVector<f64>,
) -> Option<(DMatrix<f64>, DVector<f64>)> {
    let rows = h_f.nrows();
    let rank = h_f.ncols();
    if rows <= rank {
        return None;
    }

    for n in 0..rank {
        for m in (n..rows - 1).rev() {
            let (c, s) = make_givens(h_f[(m, n)], h_f[(m + 1, n)]);
            rotate_rows(h_f, m, c, s);
            rotate_rows(h_x, m, c, s);
            rotate_vec(res, m, c, s);
        }
    }

    let kept = rows - rank;
    let h_proj = h_x.rows(rank, kept).into_owned();
    let res_proj = res.rows(rank, kept).into_owned();
    Some((h_proj, res_proj))
}

/// Compresses a tall stacked Jacobian to at most `ncols` rows.
///
/// Upper-triangularizes `h` with Givens rotations (mirrored onto `res`) and
/// truncates to `min(rows, cols)` rows. A wide matrix is returned unchanged.
pub fn compress_measurements(
    h: DMatrix<f64>,
    res: DVector<f64>,
) -> (DMatrix<f64>, DVector<f64>) {
    let (rows, cols) = (h.nrows(), h.ncols());
    if rows <= cols {
        return (h, res);
    }

    let mut h = h;
    let mut res = res;
    for n in 0..cols {
        for m in (n..rows - 1).rev() {
            let (c, s) = make_givens(h[(m, n)], h[(m + 1, n)]);
            rotate_rows(&mut h, m, c, s);
            rotate_vec(&mut res, m, c, s);
        }
    }

    let kept = rows.min(cols);
    (h.rows(0, kept).into_owned(), res.rows(0, kept).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn deterministic_matrix(rows: usize, cols: usize, scale: f64) -> DMatrix<f64> {
        DMatrix::from_fn(rows, cols, |i, j| {
            ((i as f64 + 1.3) * (j as f64 + 0.7)).sin() * scale
        })
    }

    #[test]
    fn test_nullspace_zeroes_bottom_rows() {
        let mut h_f = deterministic_matrix(8, 3, 1.0);
        let mut h_x = deterministic_matrix(8, 12, 0.5);
        let mut res = DVector::from_fn(8, |i, _| (i as f64 * 0.9).cos());

        project_left_nullspace(&mut h_f, &mut h_x, &mut res).unwrap();

        for i in 3..8 {
            for j in 0..3 {
                assert_relative_eq!(h_f[(i, j)], 0.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_nullspace_preserves_residual_norm() {
        // Rotations are orthogonal, so the full residual norm is invariant;
        // the projected part carries everything outside the dropped rank.
        let mut h_f = deterministic_matrix(10, 3, 1.0);
        let mut h_x = deterministic_matrix(10, 6, 0.5);
        let mut res = DVector::from_fn(10, |i, _| (i as f64 * 1.7).sin());
        let norm_before = res.norm();

        project_left_nullspace(&mut h_f, &mut h_x, &mut res).unwrap();

        assert_relative_eq!(res.norm(), norm_before, epsilon = 1e-10);
    }

    #[test]
    fn test_nullspace_row_count() {
        let mut h_f = deterministic_matrix(12, 3, 1.0);
        let mut h_x = deterministic_matrix(12, 18, 1.0);
        let mut res = DVector::zeros(12);

        let (h_proj, res_proj) =
            project_left_nullspace(&mut h_f, &mut h_x, &mut res).unwrap();

        assert_eq!(h_proj.nrows(), 9);
        assert_eq!(res_proj.nrows(), 9);
    }

    #[test]
    fn test_nullspace_rejects_short_tracks() {
        let mut h_f = deterministic_matrix(2, 3, 1.0);
        let mut h_x = deterministic_matrix(2, 6, 1.0);
        let mut res = DVector::zeros(2);

        assert!(project_left_nullspace(&mut h_f, &mut h_x, &mut res).is_none());
    }

    #[test]
    fn test_compression_truncates_tall_system() {
        let h = deterministic_matrix(20, 6, 1.0);
        let res = DVector::from_fn(20, |i, _| i as f64);

        let (h_c, res_c) = compress_measurements(h, res);

        assert_eq!(h_c.nrows(), 6);
        assert_eq!(res_c.nrows(), 6);
    }

    #[test]
    fn test_compression_preserves_normal_equations() {
        // Orthogonal row operations keep HᵀH and Hᵀr unchanged, which is
        // exactly what the Kalman update consumes.
        let h = deterministic_matrix(15, 4, 1.0);
        let res = DVector::from_fn(15, |i, _| (i as f64 * 0.3).cos());
        let hth = h.transpose() * &h;
        let htr = h.transpose() * &res;

        let (h_c, res_c) = compress_measurements(h, res);

        assert_relative_eq!(h_c.transpose() * &h_c, hth, epsilon = 1e-9);
        assert_relative_eq!(h_c.transpose() * &res_c, htr, epsilon = 1e-9);
    }

    #[test]
    fn test_compression_leaves_wide_system_alone() {
        let h = deterministic_matrix(4, 10, 1.0);
        let res = DVector::from_fn(4, |i, _| i as f64);

        let (h_c, res_c) = compress_measurements(h.clone(), res.clone());

        assert_relative_eq!(h_c, h, epsilon = 1e-15);
        assert_relative_eq!(res_c, res, epsilon = 1e-15);
    }
}
