//! Demeaning and column normalisation.
//!
//! `baseline_correct_inplace` — matches FieldTrip `cfg.demean = 'yes'` with
//! the baseline window spanning the whole trial:
//!   for each trial and channel: x[e, c, :] -= mean(x[e, c, :])
//!
//! `normalize_columns` — leadfield depth normalisation: every column of a
//! `[C, k]` leadfield is scaled to unit Euclidean norm.
use ndarray::{Array2, Array3, Axis};

/// Per-channel, per-trial baseline correction.
/// `trials`: [E, C, T]  →  x[e, c, :] -= mean(x[e, c, :])
pub fn baseline_correct_inplace(trials: &mut Array3<f64>) {
    for mut trial in trials.axis_iter_mut(Axis(0)) {
        for mut row in trial.rows_mut() {
            let m = row.mean().unwrap_or(0.0);
            row.mapv_inplace(|v| v - m);
        }
    }
}

/// Scale every column of `lf` to unit norm. Returns the original norms.
///
/// Columns with zero norm are left untouched and reported as `0.0`; callers
/// decide whether that is fatal.
pub fn normalize_columns(lf: &mut Array2<f64>) -> Vec<f64> {
    let mut norms = Vec::with_capacity(lf.ncols());
    for mut col in lf.columns_mut() {
        let n = col.dot(&col).sqrt();
        if n > 0.0 {
            col.mapv_inplace(|v| v / n);
        }
        norms.push(n);
    }
    norms
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn baseline_removes_per_channel_mean() {
        let mut trials = Array3::from_shape_fn((3, 8, 300), |(e, c, t)| {
            e as f64 * 10.0 + c as f64 * 5.0 + (t as f64 * 0.1).sin() + 1.0
        });
        baseline_correct_inplace(&mut trials);
        for e in 0..3usize {
            for c in 0..8usize {
                let ch_mean = trials.slice(ndarray::s![e, c, ..]).mean().unwrap();
                approx::assert_abs_diff_eq!(ch_mean, 0.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn columns_have_unit_norm() {
        let mut lf = array![[3.0, 0.0], [4.0, 2.0], [0.0, 0.0]];
        let norms = normalize_columns(&mut lf);
        assert_eq!(norms, vec![5.0, 2.0]);
        for col in lf.columns() {
            approx::assert_abs_diff_eq!(col.dot(&col), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn zero_column_left_alone() {
        let mut lf = array![[0.0, 1.0], [0.0, 1.0]];
        let norms = normalize_columns(&mut lf);
        approx::assert_abs_diff_eq!(norms[0], 0.0);
        assert_eq!(lf.column(0).to_vec(), vec![0.0, 0.0]);
    }
}
