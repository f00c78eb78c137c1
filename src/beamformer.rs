//! LCMV beamformer.
//!
//! Filters are computed once from the stable trial-averaged covariance and
//! then reapplied, unchanged, to the trial average and to every single
//! trial. Per inside grid point with gain `L` (`[C, k]`):
//!
//! ```text
//! C_reg  = C + λ · mean(eig(C)) · I
//! C⁻¹    = pinv of C_reg restricted to its top-kappa eigen-subspace
//! G      = Lᵀ C⁻¹ L                        [k, k]
//! W      = G⁻¹ Lᵀ C⁻¹                      [k, C]   unit gain, minimum variance
//! η      = dominant eigenvector of G⁻¹      maximum-power orientation
//! w      = ηᵀ W                             [1, C]   fixed orientation
//! w     /= sqrt(w N wᵀ)                     unit-noise-gain, N = noise covariance
//! ```
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;

use crate::condition::Covariance;
use crate::config::WeightNorm;
use crate::error::{Error, Result};
use crate::geometry::CoordSys;
use crate::leadfield::{Leadfield, PointLeadfield};
use crate::linalg::{from_dmatrix, invert, sym_eig_desc, to_dmatrix, truncated_pinv_sym};
use crate::sensors::ensure_same_channels;

/// Beamformer options.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamformerOptions {
    /// Effective rank of the covariance inverse, from [`crate::kappa`].
    pub kappa: usize,
    /// Diagonal loading as a fraction of the mean eigenvalue (0.05 = 5 %).
    pub lambda: f64,
    pub fixed_orientation: bool,
    pub weight_norm: WeightNorm,
    /// `[C, C]` noise covariance for unit-noise-gain scaling; identity when
    /// `None`.
    pub noise_cov: Option<Array2<f64>>,
}

/// Spatial filters for a whole grid, retained for reuse on single trials.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialFilters {
    /// `[N, k, C]`; `k = 1` with fixed orientation. Rows of outside points
    /// are zero.
    pub weights: Array3<f64>,
    pub inside: Vec<bool>,
    /// `[N, 3]` unit source orientation of fixed-orientation filters, zero
    /// for outside points and free-orientation filters.
    pub ori: Array2<f64>,
    /// Channel order of the filter columns.
    pub labels: Vec<String>,
    pub coordsys: CoordSys,
    pub grid_fingerprint: u64,
    pub kappa: usize,
    pub lambda: f64,
}

impl SpatialFilters {
    pub fn n_points(&self) -> usize {
        self.weights.len_of(Axis(0))
    }

    /// Orientations per point.
    pub fn n_components(&self) -> usize {
        self.weights.len_of(Axis(1))
    }

    pub fn n_channels(&self) -> usize {
        self.weights.len_of(Axis(2))
    }

    /// `[k, C]` filter of point `i`.
    pub fn point(&self, i: usize) -> ArrayView2<'_, f64> {
        self.weights.index_axis(Axis(0), i)
    }

    /// Apply every filter to `[C, T]` sensor data, giving `[N, k, T]`.
    pub fn apply(&self, data: &ArrayView2<f64>) -> Result<Array3<f64>> {
        if data.nrows() != self.n_channels() {
            return Err(Error::config(format!(
                "data has {} channels, filters expect {}",
                data.nrows(),
                self.n_channels()
            )));
        }
        let (n, k, c) = self.weights.dim();
        let flat = self.weights.view().into_shape_with_order((n * k, c))?;
        let out = flat.dot(data);
        Ok(out.into_shape_with_order((n, k, data.ncols()))?)
    }
}

/// Averaged source estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEstimate {
    /// `[N, 3]` grid positions.
    pub pos: Array2<f64>,
    pub filters: SpatialFilters,
    /// `[N]` filter output power on the average covariance, zero outside.
    pub pow: Array1<f64>,
    /// `[N, k, T]` filters applied to the trial-averaged data.
    pub mom: Array3<f64>,
}

/// Compute LCMV filters for every inside point of `lf`.
///
/// # Errors
///
/// * [`Error::Configuration`] if the covariance and leadfield channel
///   orders differ, or the noise covariance has the wrong shape.
/// * [`Error::Numerical`] if kappa is out of range, the regularised
///   covariance is rank deficient below kappa, or a point's `Lᵀ C⁻¹ L` is
///   singular.
pub fn compute_filters(
    cov: &Covariance,
    lf: &Leadfield,
    opts: &BeamformerOptions,
) -> Result<SpatialFilters> {
    ensure_same_channels(&cov.labels, &lf.labels, "covariance vs leadfield")?;
    let n_ch = cov.n_channels();
    if opts.kappa == 0 || opts.kappa > n_ch {
        return Err(Error::numerical(format!(
            "kappa {} outside 1..={n_ch}",
            opts.kappa
        )));
    }
    if let Some(noise) = &opts.noise_cov {
        if noise.dim() != (n_ch, n_ch) {
            return Err(Error::config(format!(
                "noise covariance is {:?}, expected [{n_ch}, {n_ch}]",
                noise.dim()
            )));
        }
    }

    let mut c_reg = to_dmatrix(&cov.matrix.view());
    let loading = opts.lambda * cov.mean_eigenvalue();
    for i in 0..n_ch {
        c_reg[(i, i)] += loading;
    }
    let inv_c = truncated_pinv_sym(&c_reg, opts.kappa)?;
    let noise = opts.noise_cov.as_ref().map(|n| to_dmatrix(&n.view()));
    log::debug!(
        "LCMV: {} channels, kappa {}, loading {:.3e} ({} % of mean eigenvalue)",
        n_ch,
        opts.kappa,
        loading,
        opts.lambda * 100.0
    );

    let k = lf
        .points
        .iter()
        .flatten()
        .map(|p| if opts.fixed_orientation { 1 } else { p.gain.ncols() })
        .next()
        .unwrap_or(1);

    let per_point: Vec<Option<(Array2<f64>, [f64; 3])>> = lf
        .points
        .par_iter()
        .enumerate()
        .map(|(i, p)| -> Result<Option<(Array2<f64>, [f64; 3])>> {
            let Some(p) = p else { return Ok(None) };
            point_filter(p, &inv_c, noise.as_ref(), opts)
                .map(Some)
                .map_err(|e| match e {
                    Error::Numerical(m) => Error::numerical(format!("grid point {i}: {m}")),
                    other => other,
                })
        })
        .collect::<Result<_>>()?;

    let n = lf.n_points();
    let mut weights = Array3::zeros((n, k, n_ch));
    let mut ori = Array2::zeros((n, 3));
    for (i, f) in per_point.into_iter().enumerate() {
        if let Some((w, o)) = f {
            if w.nrows() != k {
                return Err(Error::config(format!(
                    "grid point {i} has {} orientations, expected {k}",
                    w.nrows()
                )));
            }
            weights.index_axis_mut(Axis(0), i).assign(&w);
            ori.row_mut(i).assign(&ndarray::arr1(&o));
        }
    }

    let inside: Vec<bool> = lf.points.iter().map(Option::is_some).collect();
    log::info!(
        "LCMV filters: {} of {} points, {} x {}",
        inside.iter().filter(|&&b| b).count(),
        n,
        k,
        n_ch
    );
    Ok(SpatialFilters {
        weights,
        inside,
        ori,
        labels: lf.labels.clone(),
        coordsys: lf.coordsys.clone(),
        grid_fingerprint: lf.grid_fingerprint,
        kappa: opts.kappa,
        lambda: opts.lambda,
    })
}

fn point_filter(
    p: &PointLeadfield,
    inv_c: &DMatrix<f64>,
    noise: Option<&DMatrix<f64>>,
    opts: &BeamformerOptions,
) -> Result<(Array2<f64>, [f64; 3])> {
    let l = to_dmatrix(&p.gain.view());
    let lt_ic = l.transpose() * inv_c;
    let g = &lt_ic * &l;
    let g_inv = invert(&g, "Lᵀ C⁻¹ L")?;
    let w_full = &g_inv * &lt_ic;

    let (mut w, ori) = if opts.fixed_orientation {
        // Power along η is 1 / ηᵀGη, so the top eigenvector of G would be
        // the weakest orientation; take the top one of G⁻¹.
        let (_, vecs) = sym_eig_desc(&g_inv);
        let mut eta = vecs.column(0).into_owned();
        // Sign: largest-magnitude component positive.
        let imax = eta.iamax();
        if eta[imax] < 0.0 {
            eta = -eta;
        }
        let w = eta.transpose() * &w_full;
        let basis = to_dmatrix(&p.basis.view());
        let o = &basis * &eta;
        let n = o.norm();
        let o = if n > 0.0 { [o[0] / n, o[1] / n, o[2] / n] } else { [0.0; 3] };
        (DMatrix::from_row_slice(1, w.ncols(), w.as_slice()), o)
    } else {
        (w_full, [0.0; 3])
    };

    if opts.weight_norm == WeightNorm::UnitNoiseGain {
        for mut row in w.row_iter_mut() {
            let gain = match noise {
                Some(n) => (&row * n * row.transpose())[(0, 0)],
                None => row.norm_squared(),
            };
            if !(gain > 0.0 && gain.is_finite()) {
                return Err(Error::numerical("filter has zero projected noise"));
            }
            row /= gain.sqrt();
        }
    }
    Ok((from_dmatrix(&w), ori))
}

/// Compute filters and apply them to the averaged data.
///
/// `average` is the `[C, T]` trial average from the signal conditioner.
pub fn beamform(
    cov: &Covariance,
    average: &Array2<f64>,
    lf: &Leadfield,
    opts: &BeamformerOptions,
) -> Result<SourceEstimate> {
    let filters = compute_filters(cov, lf, opts)?;
    let mom = filters.apply(&average.view())?;
    let pow = Array1::from_iter((0..filters.n_points()).map(|i| {
        let w = filters.point(i);
        (w.dot(&cov.matrix).dot(&w.t())).diag().sum()
    }));
    Ok(SourceEstimate { pos: lf.pos.clone(), filters, pow, mom })
}
