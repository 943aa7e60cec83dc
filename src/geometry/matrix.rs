//! Dense-matrix helpers for a covariance that grows at sensor registration
//! and shrinks at clone eviction.

use nalgebra::DMatrix;

/// Expands `mat` by the size of `block`, copying the existing entries around
/// the insertion point and placing `block` on the diagonal at (`row`, `col`).
/// Cross-covariance with the new block starts at zero.
pub fn insert_block(block: &DMatrix<f64>, mat: &DMatrix<f64>, row: usize, col: usize) -> DMatrix<f64> {
    let (in_rows, in_cols) = mat.shape();
    let (sub_rows, sub_cols) = block.shape();
    let mut out = DMatrix::zeros(in_rows + sub_rows, in_cols + sub_cols);

    out.view_mut((0, 0), (row, col)).copy_from(&mat.view((0, 0), (row, col)));
    out.view_mut((row, col), (sub_rows, sub_cols)).copy_from(block);
    out.view_mut((row + sub_rows, col + sub_cols), (in_rows - row, in_cols - col))
        .copy_from(&mat.view((row, col), (in_rows - row, in_cols - col)));
    out.view_mut((0, col + sub_cols), (row, in_cols - col))
        .copy_from(&mat.view((0, col), (row, in_cols - col)));
    out.view_mut((row + sub_rows, 0), (in_rows - row, col))
        .copy_from(&mat.view((row, 0), (in_rows - row, col)));

    out
}

/// Removes `size` rows and columns starting at (`row`, `col`), closing the
/// gap so the remaining blocks stay contiguous.
pub fn remove_block(mat: &DMatrix<f64>, row: usize, col: usize, size: usize) -> DMatrix<f64> {
    let (in_rows, in_cols) = mat.shape();
    let mut out = DMatrix::zeros(in_rows - size, in_cols - size);

    out.view_mut((0, 0), (row, col)).copy_from(&mat.view((0, 0), (row, col)));
    out.view_mut((row, col), (in_rows - row - size, in_cols - col - size))
        .copy_from(&mat.view((row + size, col + size), (in_rows - row - size, in_cols - col - size)));
    out.view_mut((row, 0), (in_rows - row - size, col))
        .copy_from(&mat.view((row + size, 0), (in_rows - row - size, col)));
    out.view_mut((0, col), (row, in_cols - col - size))
        .copy_from(&mat.view((0, col + size), (row, in_cols - col - size)));

    out
}

/// Clamps every diagonal entry of `mat` to at least `min_bound`.
///
/// Runs on every measurement noise block before inversion so a degenerate
/// sensor covariance cannot make the innovation matrix singular.
pub fn min_bound_diagonal(mat: &mut DMatrix<f64>, min_bound: f64) {
    let n = mat.nrows().min(mat.ncols());
    for i in 0..n {
        if mat[(i, i)] < min_bound {
            mat[(i, i)] = min_bound;
        }
    }
}

/// Replaces `mat` with its symmetric part (P + Pᵀ)/2.
pub fn symmetrize(mat: &mut DMatrix<f64>) {
    let transpose = mat.transpose();
    *mat += transpose;
    *mat *= 0.5;
}
