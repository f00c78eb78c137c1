//! Effective-rank (kappa) selection from the covariance eigenspectrum.
//!
//! With singular values `s₀ ≥ s₁ ≥ … ≥ s_{C−1}`:
//!
//! ```text
//! d_i   = log10(s_i) − log10(s_{i+1})      drop between neighbours, i < C−1
//! z_i   = (d_i − mean(d)) / std(d)         ddof = 0
//! kappa = 1 + first i with z_i > threshold
//! ```
//!
//! kappa is the number of components above the drop: the size of the
//! signal subspace that the leadfield reduction and the LCMV inverse share.
//! No qualifying drop is an error, never a silent full-rank fallback.
use crate::condition::Covariance;
use crate::error::{Error, Result};
use crate::linalg::{singular_values_desc, to_dmatrix};

/// Selected rank plus the evidence it was chosen on.
#[derive(Debug, Clone, PartialEq)]
pub struct KappaSelection {
    pub kappa: usize,
    /// Standardised drop at the cutoff.
    pub score: f64,
    /// Singular values, descending.
    pub singular_values: Vec<f64>,
}

/// Pick kappa for `cov` at the given standardised-drop `threshold`.
///
/// # Errors
///
/// [`Error::Numerical`] when the matrix has fewer than three channels, when
/// its spectrum has zero or non-finite values in a way that makes the log
/// spectrum undefined, when the drops have zero spread (a perfectly flat or
/// perfectly geometric spectrum), or when no drop exceeds `threshold`.
pub fn select_kappa(cov: &Covariance, threshold: f64) -> Result<KappaSelection> {
    let s = singular_values_desc(&to_dmatrix(&cov.matrix.view()));
    let kappa = kappa_from_spectrum(&s, threshold)?;
    log::debug!(
        "kappa = {} of {} (s[k-1] = {:.3e}, s[k] = {:.3e}, z = {:.2})",
        kappa.0,
        s.len(),
        s[kappa.0 - 1],
        s[kappa.0],
        kappa.1
    );
    Ok(KappaSelection { kappa: kappa.0, score: kappa.1, singular_values: s })
}

/// Core of [`select_kappa`] on an already sorted (descending) spectrum.
/// Returns `(kappa, z)`.
pub fn kappa_from_spectrum(s: &[f64], threshold: f64) -> Result<(usize, f64)> {
    if s.len() < 3 {
        return Err(Error::numerical(format!(
            "need at least 3 singular values to locate a spectral drop, got {}",
            s.len()
        )));
    }
    // Exact zeros (rank-deficient data) would give -inf; clamp to the
    // smallest positive double so the drop into the null space still counts.
    let logs: Vec<f64> = s.iter().map(|&v| v.max(f64::MIN_POSITIVE).log10()).collect();
    if logs.iter().any(|v| !v.is_finite()) {
        return Err(Error::numerical("covariance spectrum has non-finite values"));
    }

    let d: Vec<f64> = logs.windows(2).map(|w| w[0] - w[1]).collect();
    let n = d.len() as f64;
    let mean = d.iter().sum::<f64>() / n;
    let std = (d.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if !(std > 1e-12 * mean.abs().max(1.0)) {
        return Err(Error::numerical(
            "covariance eigenspectrum is flat: no spectral drop to select kappa from",
        ));
    }

    d.iter()
        .map(|v| (v - mean) / std)
        .enumerate()
        .find(|&(_, z)| z > threshold)
        .map(|(i, z)| (i + 1, z))
        .ok_or_else(|| {
            Error::numerical(format!(
                "no standardised eigenspectrum drop exceeds {threshold}; kappa is undefined"
            ))
        })
}
