//! Signal conditioning: band-pass filtering, demeaning and the two
//! covariance products consumed downstream.
//!
//! ```text
//! SensorData [E, C, T]
//!   ├─ zero-phase FIR band-pass (per trial)
//!   ├─ demean (baseline = whole trial)
//!   ├─ average        [C, T]     trial mean, input of the averaged source estimate
//!   ├─ trial_cov      [E, C, C]  one covariance per trial, kept for reuse
//!   └─ avg_cov        [C, C]     trials pooled, input of kappa + LCMV
//! ```
use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::filter::{design_bandpass, filter_trials};
use crate::normalize::baseline_correct_inplace;
use crate::sensors::SensorData;

/// Trial-pooled channel covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct Covariance {
    /// `[C, C]`, symmetric positive semi-definite.
    pub matrix: Array2<f64>,
    /// Channel order of rows and columns.
    pub labels: Vec<String>,
    /// Number of trials pooled.
    pub n_trials: usize,
}

impl Covariance {
    pub fn n_channels(&self) -> usize {
        self.labels.len()
    }

    /// Mean eigenvalue, i.e. `trace / C`.
    pub fn mean_eigenvalue(&self) -> f64 {
        self.matrix.diag().sum() / self.matrix.nrows() as f64
    }
}

/// One covariance per trial, trial dimension retained.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialCovariance {
    /// `[E, C, C]`.
    pub matrices: Array3<f64>,
    pub labels: Vec<String>,
}

/// Output of [`condition`]. The filtered data and both covariance products
/// are separate immutable artifacts.
#[derive(Debug, Clone)]
pub struct Conditioned {
    /// Band-passed, demeaned trials; sensor geometry unchanged.
    pub data: SensorData,
    /// `[C, T]` trial average of `data`.
    pub average: Array2<f64>,
    pub avg_cov: Covariance,
    pub trial_cov: TrialCovariance,
}

/// Band-pass, demean and compute both covariance products.
///
/// # Errors
///
/// * [`Error::Configuration`] for a pass band the sampling rate cannot carry.
/// * [`Error::Numerical`] if the covariance contains non-finite values.
pub fn condition(data: &SensorData, band: (f64, f64)) -> Result<Conditioned> {
    let h = design_bandpass(band.0, band.1, data.sfreq)?;
    log::debug!(
        "band-pass [{}, {}] Hz at {} Hz: {} taps",
        band.0,
        band.1,
        data.sfreq,
        h.len()
    );

    let mut trials = data.trials.clone();
    filter_trials(&mut trials, &h)?;
    baseline_correct_inplace(&mut trials);

    let trial_cov = trial_covariances(&trials);
    if trial_cov.iter().any(|v| !v.is_finite()) {
        return Err(Error::numerical("covariance contains non-finite values"));
    }
    let avg_cov = trial_cov
        .mean_axis(Axis(0))
        .ok_or_else(|| Error::config("no trials to pool"))?;
    let average = trials
        .mean_axis(Axis(0))
        .ok_or_else(|| Error::config("no trials to average"))?;

    let labels = data.labels().to_vec();
    let n_trials = trials.len_of(Axis(0));
    log::info!(
        "conditioned {} trials x {} channels x {} samples",
        n_trials,
        trials.len_of(Axis(1)),
        trials.len_of(Axis(2))
    );

    Ok(Conditioned {
        data: SensorData {
            trials,
            sfreq: data.sfreq,
            grad: data.grad.clone(),
        },
        average,
        avg_cov: Covariance { matrix: avg_cov, labels: labels.clone(), n_trials },
        trial_cov: TrialCovariance { matrices: trial_cov, labels },
    })
}

/// Per-trial covariance `X Xᵀ / (T − 1)` of already demeaned `[E, C, T]` data.
pub fn trial_covariances(trials: &Array3<f64>) -> Array3<f64> {
    let (n_e, n_c, n_t) = trials.dim();
    let denom = (n_t.max(2) - 1) as f64;
    let covs: Vec<Array2<f64>> = (0..n_e)
        .into_par_iter()
        .map(|e| {
            let x = trials.index_axis(Axis(0), e);
            x.dot(&x.t()) / denom
        })
        .collect();
    let mut out = Array3::zeros((n_e, n_c, n_c));
    for (e, c) in covs.into_iter().enumerate() {
        out.index_axis_mut(Axis(0), e).assign(&c);
    }
    out
}
