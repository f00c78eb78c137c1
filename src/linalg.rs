//! Small bridge between `ndarray` storage and `nalgebra` decompositions.
//!
//! Pipeline data lives in `ndarray` arrays; SVD, symmetric eigen-decomposition
//! and inversion go through `nalgebra::DMatrix`.
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, ArrayView2};
use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Copy an `ndarray` matrix into a column-major `DMatrix`.
pub fn to_dmatrix(a: &ArrayView2<f64>) -> DMatrix<f64> {
    let (r, c) = a.dim();
    DMatrix::from_fn(r, c, |i, j| a[[i, j]])
}

/// Copy a `DMatrix` back into a row-major `Array2`.
pub fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Singular values sorted in descending order.
pub fn singular_values_desc(m: &DMatrix<f64>) -> Vec<f64> {
    let mut s: Vec<f64> = m.clone().svd(false, false).singular_values.iter().copied().collect();
    s.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    s
}

/// Symmetric eigen-decomposition with eigenpairs sorted by descending
/// eigenvalue. Column `i` of the returned matrix belongs to value `i`.
pub fn sym_eig_desc(m: &DMatrix<f64>) -> (Vec<f64>, DMatrix<f64>) {
    let eig = SymmetricEigen::new(m.clone());
    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eig.eigenvalues[b]
            .partial_cmp(&eig.eigenvalues[a])
            .unwrap_or(Ordering::Equal)
    });
    let values = order.iter().map(|&i| eig.eigenvalues[i]).collect();
    let vectors = DMatrix::from_fn(m.nrows(), order.len(), |r, c| eig.eigenvectors[(r, order[c])]);
    (values, vectors)
}

/// Pseudo-inverse of a symmetric PSD matrix restricted to its top-`k`
/// eigen-subspace: `U_k diag(1/s_k) U_kᵀ`.
pub fn truncated_pinv_sym(m: &DMatrix<f64>, k: usize) -> Result<DMatrix<f64>> {
    let n = m.nrows();
    if k == 0 || k > n {
        return Err(Error::numerical(format!(
            "truncation rank {k} outside 1..={n}"
        )));
    }
    let (values, vectors) = sym_eig_desc(m);
    if values[k - 1] <= f64::EPSILON * values[0].abs().max(f64::MIN_POSITIVE) {
        return Err(Error::numerical(format!(
            "matrix is rank deficient below requested rank {k} (eigenvalue {:.3e})",
            values[k - 1]
        )));
    }
    let mut out = DMatrix::zeros(n, n);
    for c in 0..k {
        let u = vectors.column(c);
        out += (u * u.transpose()) / values[c];
    }
    Ok(out)
}

/// Inverse of a small dense matrix, failing with [`Error::Numerical`] when
/// it is singular.
pub fn invert(m: &DMatrix<f64>, what: &str) -> Result<DMatrix<f64>> {
    m.clone()
        .try_inverse()
        .ok_or_else(|| Error::numerical(format!("{what} is not invertible")))
}
