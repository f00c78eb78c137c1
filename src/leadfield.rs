//! Forward model: per-grid-point MEG leadfields.
//!
//! For every inside grid point the field of a unit current dipole along x, y
//! and z is evaluated at each coil, projected on the coil normal and mixed
//! into channels with the sensor array's `tra` matrix, giving a `[C, 3]`
//! gain. The gain is then
//!
//! 1. projected on the point's fixed orientation, if the source model has
//!    one, or reduced to the top `rank` right-singular directions,
//! 2. column-normalised, so deep sources are not systematically weaker.
//!
//! Spherical conductors use the Sarvas (1987) closed form, which depends on
//! the sphere centre only. Radial dipoles produce no external field in a
//! sphere, so a rank-3 request on a spherical model is rank deficient.
use nalgebra::{DMatrix, Vector3};
use ndarray::{Array2, Axis};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::geometry::{ensure_same_coordsys, CoordSys, HeadModel, SourceModel, VolumeConductor};
use crate::linalg::{from_dmatrix, to_dmatrix};
use crate::normalize::normalize_columns;
use crate::sensors::SensorArray;

/// μ₀ / 4π in T·m/A.
const MU0_OVER_4PI: f64 = 1e-7;

/// Relative singular-value floor below which a leadfield counts as rank
/// deficient.
const RANK_TOL: f64 = 1e-10;

/// Leadfield construction options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeadfieldOptions {
    /// Orientation components kept per point (1..=3).
    pub rank: usize,
    /// Scale every column to unit norm.
    pub normalize: bool,
}

impl Default for LeadfieldOptions {
    fn default() -> Self {
        Self { rank: 2, normalize: true }
    }
}

/// Gain of one grid point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointLeadfield {
    /// `[C, k]` sensitivity, one column per retained orientation.
    pub gain: Array2<f64>,
    /// `[3, k]` orthonormal orientation basis of the columns, in the
    /// leadfield's coordinate system.
    pub basis: Array2<f64>,
}

/// Leadfields for a whole grid.
#[derive(Debug, Clone)]
pub struct Leadfield {
    /// `[N, 3]` grid positions the gains were computed at.
    pub pos: Array2<f64>,
    /// `None` for points outside the brain.
    pub points: Vec<Option<PointLeadfield>>,
    /// Channel order of every gain's rows.
    pub labels: Vec<String>,
    pub coordsys: CoordSys,
    /// [`SourceModel::fingerprint`] of the grid.
    pub grid_fingerprint: u64,
}

impl Leadfield {
    pub fn n_points(&self) -> usize {
        self.points.len()
    }

    pub fn n_channels(&self) -> usize {
        self.labels.len()
    }
}

/// Build leadfields for every inside point of `source`.
///
/// # Errors
///
/// * [`Error::Configuration`] if the head model, source model and sensors
///   are not in one coordinate system, if a local-spheres model does not
///   have one sphere per channel, or if an inside point lies outside the
///   volume conductor.
/// * [`Error::Numerical`] if a point's gain is zero or has fewer than
///   `rank` significant singular values.
pub fn build_leadfield(
    head: &HeadModel,
    source: &SourceModel,
    grad: &SensorArray,
    opts: LeadfieldOptions,
) -> Result<Leadfield> {
    ensure_same_coordsys(&head.coordsys, &source.coordsys, "head model vs source model")?;
    ensure_same_coordsys(&head.coordsys, &grad.coordsys, "head model vs sensors")?;
    if !(1..=3).contains(&opts.rank) {
        return Err(Error::config(format!("leadfield rank {} outside 1..=3", opts.rank)));
    }
    let coil_spheres = coil_sphere_centres(head, grad)?;

    for i in (0..source.n_points()).filter(|&i| source.inside[i]) {
        if !head.contains(source.point(i)) {
            return Err(Error::config(format!(
                "grid point {i} {:?} is flagged inside but lies outside the volume conductor",
                source.point(i)
            )));
        }
    }

    let points: Vec<Option<PointLeadfield>> = (0..source.n_points())
        .into_par_iter()
        .map(|i| -> Result<Option<PointLeadfield>> {
            if !source.inside[i] {
                return Ok(None);
            }
            let full = dipole_gain(&coil_spheres, grad, source.point(i));
            let fixed = source.ori.as_ref().map(|o| [o[[i, 0]], o[[i, 1]], o[[i, 2]]]);
            reduce_point(full, fixed, opts).map(Some).map_err(|e| match e {
                Error::Numerical(m) => Error::numerical(format!("grid point {i}: {m}")),
                other => other,
            })
        })
        .collect::<Result<_>>()?;

    log::info!(
        "leadfield: {} of {} points, {} channels, rank {}",
        source.n_inside(),
        source.n_points(),
        grad.n_channels(),
        if source.ori.is_some() { 1 } else { opts.rank }
    );

    Ok(Leadfield {
        pos: source.pos.clone(),
        points,
        labels: grad.labels.clone(),
        coordsys: source.coordsys.clone(),
        grid_fingerprint: source.fingerprint(),
    })
}

/// `[C, 3]` channel gain of unit dipoles along x, y, z at `pos`, before any
/// reduction. Also used to simulate sensor data from known sources.
pub fn forward_gain(head: &HeadModel, grad: &SensorArray, pos: [f64; 3]) -> Result<Array2<f64>> {
    ensure_same_coordsys(&head.coordsys, &grad.coordsys, "head model vs sensors")?;
    let spheres = coil_sphere_centres(head, grad)?;
    Ok(dipole_gain(&spheres, grad, pos))
}

/// Which sphere centre each coil sees. `None` means infinite medium.
fn coil_sphere_centres(head: &HeadModel, grad: &SensorArray) -> Result<Vec<Option<[f64; 3]>>> {
    let k = grad.n_coils();
    match &head.conductor {
        VolumeConductor::SingleSphere { center, .. } => Ok(vec![Some(*center); k]),
        VolumeConductor::InfiniteMedium => Ok(vec![None; k]),
        VolumeConductor::LocalSpheres { centers, .. } => {
            if centers.nrows() != grad.n_channels() {
                return Err(Error::config(format!(
                    "local spheres model has {} spheres for {} channels",
                    centers.nrows(),
                    grad.n_channels()
                )));
            }
            // A coil uses the sphere of the channel that weights it most.
            Ok(grad
                .tra
                .axis_iter(Axis(1))
                .map(|col| {
                    let ch = col
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
                        .map(|(c, _)| c)
                        .unwrap_or(0);
                    Some([centers[[ch, 0]], centers[[ch, 1]], centers[[ch, 2]]])
                })
                .collect())
        }
    }
}

fn dipole_gain(spheres: &[Option<[f64; 3]>], grad: &SensorArray, pos: [f64; 3]) -> Array2<f64> {
    let k = grad.n_coils();
    let mut coil_gain = Array2::<f64>::zeros((k, 3));
    for c in 0..k {
        let r = Vector3::new(grad.coil_pos[[c, 0]], grad.coil_pos[[c, 1]], grad.coil_pos[[c, 2]]);
        let n = Vector3::new(grad.coil_ori[[c, 0]], grad.coil_ori[[c, 1]], grad.coil_ori[[c, 2]]);
        let r0 = Vector3::new(pos[0], pos[1], pos[2]);
        for (axis, q) in [Vector3::x(), Vector3::y(), Vector3::z()].iter().enumerate() {
            let b = match spheres[c] {
                Some(o) => {
                    let o = Vector3::new(o[0], o[1], o[2]);
                    sarvas(q, &(r0 - o), &(r - o))
                }
                None => biot_savart(q, &r0, &r),
            };
            coil_gain[[c, axis]] = b.dot(&n);
        }
    }
    grad.tra.dot(&coil_gain)
}

/// Field at `r` of dipole moment `q` at `r0`, both relative to the centre of
/// a spherically symmetric conductor.
fn sarvas(q: &Vector3<f64>, r0: &Vector3<f64>, r: &Vector3<f64>) -> Vector3<f64> {
    let a_vec = r - r0;
    let a = a_vec.norm();
    let rn = r.norm();
    if a == 0.0 || rn == 0.0 {
        return Vector3::zeros();
    }
    let ar = a_vec.dot(r);
    let f = a * (rn * a + rn * rn - r0.dot(r));
    if f == 0.0 {
        return Vector3::zeros();
    }
    let grad_f = r * (a * a / rn + ar / a + 2.0 * a + 2.0 * rn) - r0 * (a + 2.0 * rn + ar / a);
    let q_x_r0 = q.cross(r0);
    (q_x_r0 * f - grad_f * q_x_r0.dot(r)) * (MU0_OVER_4PI / (f * f))
}

/// Primary-current field of dipole `q` at `r0`, evaluated at `r`.
fn biot_savart(q: &Vector3<f64>, r0: &Vector3<f64>, r: &Vector3<f64>) -> Vector3<f64> {
    let d = r - r0;
    let dn = d.norm();
    if dn == 0.0 {
        return Vector3::zeros();
    }
    q.cross(&d) * (MU0_OVER_4PI / (dn * dn * dn))
}

/// Orientation handling and normalisation for one point.
fn reduce_point(
    full: Array2<f64>,
    fixed: Option<[f64; 3]>,
    opts: LeadfieldOptions,
) -> Result<PointLeadfield> {
    let (mut gain, basis) = match fixed {
        Some(o) => {
            let n = (o[0] * o[0] + o[1] * o[1] + o[2] * o[2]).sqrt();
            if n == 0.0 {
                return Err(Error::numerical("fixed orientation is the zero vector"));
            }
            let basis = Array2::from_shape_vec((3, 1), vec![o[0] / n, o[1] / n, o[2] / n])?;
            (full.dot(&basis), basis)
        }
        None => {
            let svd = to_dmatrix(&full.view()).svd(false, true);
            let v_t = svd
                .v_t
                .ok_or_else(|| Error::numerical("leadfield SVD did not converge"))?;
            let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
            order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
            let s0 = svd.singular_values[order[0]];
            if !(s0 > 0.0) {
                return Err(Error::numerical("leadfield is zero"));
            }
            let s_last = svd.singular_values[order[opts.rank - 1]];
            if s_last <= RANK_TOL * s0 {
                return Err(Error::numerical(format!(
                    "leadfield rank is below {} (singular values {:?})",
                    opts.rank,
                    svd.singular_values.as_slice()
                )));
            }
            let basis = DMatrix::from_fn(3, opts.rank, |r, c| v_t[(order[c], r)]);
            let basis = from_dmatrix(&basis);
            (full.dot(&basis), basis)
        }
    };
    if opts.normalize {
        let norms = normalize_columns(&mut gain);
        if norms.iter().any(|&n| n == 0.0) {
            return Err(Error::numerical("leadfield has an all-zero column"));
        }
    }
    Ok(PointLeadfield { gain, basis })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn one_coil(pos: [f64; 3], ori: [f64; 3]) -> SensorArray {
        SensorArray::magnetometers(
            vec!["MEG0".into()],
            array![[pos[0], pos[1], pos[2]]],
            array![[ori[0], ori[1], ori[2]]],
            CoordSys::new("ctf"),
        )
        .unwrap()
    }

    #[test]
    fn radial_dipole_is_silent_in_sphere() {
        let q = Vector3::new(0.0, 0.0, 1.0);
        let r0 = Vector3::new(0.0, 0.0, 0.05);
        let r = Vector3::new(0.03, 0.01, 0.11);
        let b = sarvas(&q, &r0, &r);
        assert!(b.norm() < 1e-25, "radial field {b:?}");
    }

    #[test]
    fn sarvas_matches_biot_savart_radial_component() {
        // Volume currents add no radial field: B·r̂ equals the primary-current value.
        let q = Vector3::new(1.0, 0.3, 0.0);
        let r0 = Vector3::new(0.01, 0.0, 0.05);
        let r = Vector3::new(0.02, -0.01, 0.12);
        let rhat = r.normalize();
        let bs = sarvas(&q, &r0, &r).dot(&rhat);
        let bp = biot_savart(&q, &r0, &r).dot(&rhat);
        approx::assert_relative_eq!(bs, bp, max_relative = 1e-9);
    }

    #[test]
    fn gain_mixes_coils_through_tra() {
        // Axial gradiometer: two coils 5 cm apart, weights +1/−1.
        let grad = SensorArray::new(
            vec!["G0".into()],
            array![[0.0, 0.02, 0.12], [0.0, 0.02, 0.17]],
            array![[0.0, 0.0, 1.0], [0.0, 0.0, 1.0]],
            array![[1.0, -1.0]],
            CoordSys::new("ctf"),
        )
        .unwrap();
        let hm = HeadModel::single_sphere([0.0; 3], 0.09, CoordSys::new("ctf"));
        let g = forward_gain(&hm, &grad, [0.0, 0.0, 0.06]).unwrap();
        let near = forward_gain(&hm, &one_coil([0.0, 0.02, 0.12], [0.0, 0.0, 1.0]), [0.0, 0.0, 0.06]).unwrap();
        let far = forward_gain(&hm, &one_coil([0.0, 0.02, 0.17], [0.0, 0.0, 1.0]), [0.0, 0.0, 0.06]).unwrap();
        for a in 0..3 {
            approx::assert_abs_diff_eq!(g[[0, a]], near[[0, a]] - far[[0, a]], epsilon = 1e-18);
        }
    }

    /// Two axial gradiometers on opposite sides of the head.
    fn two_gradiometers() -> SensorArray {
        SensorArray::new(
            vec!["G0".into(), "G1".into()],
            array![[0.0, 0.03, 0.11], [0.0, 0.04, 0.16], [0.05, -0.02, 0.10], [0.07, -0.03, 0.14]],
            array![[0.0, 0.27, 0.96], [0.0, 0.27, 0.96], [0.45, -0.18, 0.87], [0.45, -0.18, 0.87]],
            array![[1.0, -1.0, 0.0, 0.0], [0.0, 0.0, 1.0, -1.0]],
            CoordSys::new("ctf"),
        )
        .unwrap()
    }

    fn local_spheres(centers: Array2<f64>) -> HeadModel {
        let radii = vec![0.09; centers.nrows()];
        HeadModel {
            conductor: VolumeConductor::LocalSpheres { centers, radii },
            conductivity: vec![0.33],
            coordsys: CoordSys::new("ctf"),
        }
    }

    #[test]
    fn shared_local_spheres_match_single_sphere() {
        let grad = two_gradiometers();
        let single = HeadModel::single_sphere([0.0, 0.0, 0.04], 0.09, CoordSys::new("ctf"));
        let local = local_spheres(array![[0.0, 0.0, 0.04], [0.0, 0.0, 0.04]]);
        for pos in [[0.0, 0.0, 0.06], [0.02, -0.01, 0.07]] {
            let a = forward_gain(&single, &grad, pos).unwrap();
            let b = forward_gain(&local, &grad, pos).unwrap();
            for (x, y) in a.iter().zip(b.iter()) {
                approx::assert_abs_diff_eq!(*x, *y, epsilon = 1e-20);
            }
        }
    }

    #[test]
    fn each_channel_sees_its_own_sphere() {
        let grad = two_gradiometers();
        let local = local_spheres(array![[0.0, 0.0, 0.04], [0.01, 0.0, 0.03]]);
        let pos = [0.02, -0.01, 0.07];
        let g = forward_gain(&local, &grad, pos).unwrap();
        for (ch, centre) in [(0, [0.0, 0.0, 0.04]), (1, [0.01, 0.0, 0.03])] {
            let single = HeadModel::single_sphere(centre, 0.09, CoordSys::new("ctf"));
            let expected = forward_gain(&single, &grad, pos).unwrap();
            for a in 0..3 {
                approx::assert_abs_diff_eq!(g[[ch, a]], expected[[ch, a]], epsilon = 1e-20);
            }
        }
    }

    #[test]
    fn local_sphere_count_must_match_channels() {
        let grad = two_gradiometers();
        let local = local_spheres(array![[0.0, 0.0, 0.04]]);
        assert!(matches!(
            forward_gain(&local, &grad, [0.0, 0.0, 0.06]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn zero_fixed_orientation_rejected() {
        let full = array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        assert!(reduce_point(full, Some([0.0; 3]), LeadfieldOptions::default()).is_err());
    }

    #[test]
    fn rank_reduction_keeps_orthonormal_basis() {
        let full = array![[1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 1e-20], [1.0, 1.0, 0.0]];
        let p = reduce_point(full, None, LeadfieldOptions { rank: 2, normalize: true }).unwrap();
        assert_eq!(p.gain.dim(), (4, 2));
        let btb = p.basis.t().dot(&p.basis);
        approx::assert_abs_diff_eq!(btb[[0, 0]], 1.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(btb[[0, 1]], 0.0, epsilon = 1e-12);
        // The near-null z direction is dropped.
        assert!(p.basis.row(2).iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn rank_three_in_sphere_is_rank_deficient() {
        let full = array![[1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 1e-20], [1.0, 1.0, 0.0]];
        let err = reduce_point(full, None, LeadfieldOptions { rank: 3, normalize: true });
        assert!(matches!(err, Err(Error::Numerical(_))));
    }
}
