//! Parcel timeseries: per-trial virtual channels reduced to one signal per
//! atlas parcel.
//!
//! For every trial the retained LCMV filters are applied to that trial's
//! sensor data. The filter outputs of all inside points sharing a parcel
//! label form a `[points, T]` block, reduced to one `[T]` timecourse.
//!
//! First-principal-component convention: rows are centred, `u` is the unit
//! dominant eigenvector of the row covariance and the timecourse is
//! `uᵀ X_centred` (variance equals the top eigenvalue / T). The sign is
//! chosen so the timecourse correlates non-negatively with the plain mean of
//! the centred rows; when that correlation vanishes the largest-magnitude
//! loading is made positive.
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;

use crate::atlas::{Atlas, ParcelAssignment};
use crate::beamformer::SpatialFilters;
use crate::config::Reduction;
use crate::error::{Error, Result};
use crate::linalg::{sym_eig_desc, to_dmatrix};
use crate::sensors::{ensure_same_channels, SensorData};

/// Final artifact: `[trials, parcels, samples]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParcelTimeseries {
    pub data: Array3<f64>,
    /// Atlas label of each parcel, ascending.
    pub labels: Vec<u32>,
    /// Parcel names in `labels` order.
    pub names: Vec<String>,
    pub sfreq: f64,
}

impl ParcelTimeseries {
    pub fn n_trials(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn n_parcels(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn n_samples(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    /// Replace the placeholder names with the atlas's label table.
    pub fn with_names(mut self, atlas: &Atlas) -> Self {
        self.names = self.labels.iter().map(|&l| atlas.name_of(l)).collect();
        self
    }
}

/// Reduce per-trial source activity to parcel timecourses.
///
/// Parcels without any inside grid point yield all-zero timecourses, so the
/// parcel axis always matches the distinct non-background labels of
/// `assignment`.
///
/// # Errors
///
/// [`Error::Configuration`] if `assignment` was computed on a different grid
/// than `filters`, or the data's channel order differs from the filters'.
pub fn parcellate(
    data: &SensorData,
    filters: &SpatialFilters,
    assignment: &ParcelAssignment,
    reduction: Reduction,
) -> Result<ParcelTimeseries> {
    if assignment.n_points() != filters.n_points()
        || assignment.grid_fingerprint != filters.grid_fingerprint
    {
        return Err(Error::config(format!(
            "parcel assignment ({} points) was computed on a different grid than the filters ({} points)",
            assignment.n_points(),
            filters.n_points()
        )));
    }
    ensure_same_channels(data.labels(), &filters.labels, "trial data vs filters")?;

    let labels = assignment.parcels();
    let members: Vec<Vec<usize>> = labels
        .iter()
        .map(|&l| {
            assignment
                .members(l)
                .into_iter()
                .filter(|&i| filters.inside[i])
                .collect()
        })
        .collect();
    for (l, m) in labels.iter().zip(&members) {
        if m.is_empty() {
            log::warn!("parcel {l} has no inside grid points; its timecourse is zero");
        }
    }

    let (n_e, _, n_t) = data.trials.dim();
    let per_trial: Vec<Array2<f64>> = (0..n_e)
        .into_par_iter()
        .map(|e| -> Result<Array2<f64>> {
            let src = filters.apply(&data.trials.index_axis(Axis(0), e))?;
            let mut out = Array2::zeros((labels.len(), n_t));
            for (p, pts) in members.iter().enumerate() {
                if pts.is_empty() {
                    continue;
                }
                let block = parcel_block(&src, pts);
                out.row_mut(p).assign(&reduce(&block.view(), reduction));
            }
            Ok(out)
        })
        .collect::<Result<_>>()?;

    let mut out = Array3::zeros((n_e, labels.len(), n_t));
    for (e, tr) in per_trial.into_iter().enumerate() {
        out.index_axis_mut(Axis(0), e).assign(&tr);
    }
    log::info!(
        "parcellated {n_e} trials into {} parcels ({:?})",
        labels.len(),
        reduction
    );

    Ok(ParcelTimeseries {
        data: out,
        names: labels.iter().map(|l| format!("label_{l}")).collect(),
        labels,
        sfreq: data.sfreq,
    })
}

/// Stack the `[k, T]` outputs of the given points into `[points·k, T]`.
fn parcel_block(src: &Array3<f64>, points: &[usize]) -> Array2<f64> {
    let (_, k, n_t) = src.dim();
    let mut block = Array2::zeros((points.len() * k, n_t));
    for (r, &i) in points.iter().enumerate() {
        block
            .slice_mut(ndarray::s![r * k..(r + 1) * k, ..])
            .assign(&src.index_axis(Axis(0), i));
    }
    block
}

/// Reduce `[rows, T]` to one `[T]` timecourse.
pub fn reduce(block: &ArrayView2<f64>, reduction: Reduction) -> Array1<f64> {
    match reduction {
        Reduction::Mean => block
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(block.ncols())),
        Reduction::FirstPrincipalComponent => first_pc(block),
    }
}

fn first_pc(block: &ArrayView2<f64>) -> Array1<f64> {
    let n_t = block.ncols();
    let mut centred = block.to_owned();
    for mut row in centred.rows_mut() {
        let m = row.mean().unwrap_or(0.0);
        row.mapv_inplace(|v| v - m);
    }
    let cov = centred.dot(&centred.t());
    let (_, vecs) = sym_eig_desc(&to_dmatrix(&cov.view()));
    let u = Array1::from_iter(vecs.column(0).iter().copied());
    let mut pc = u.dot(&centred);

    let mean_row = centred
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(n_t));
    let agreement = pc.dot(&mean_row);
    let scale = (pc.dot(&pc) * mean_row.dot(&mean_row)).sqrt();
    let flip = if agreement.abs() > 1e-12 * scale {
        agreement < 0.0
    } else {
        let imax = u
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| i)
            .unwrap_or(0);
        u[imax] < 0.0
    };
    if flip {
        pc.mapv_inplace(|v| -v);
    }
    pc
}
