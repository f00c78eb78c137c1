//! Coordinate systems, affine transforms and the geometric inputs of the
//! pipeline (head model, source model).
//!
//! Every geometric entity carries a [`CoordSys`] tag. Cross-entity operations
//! (leadfield, atlas lookup) refuse to run on mismatched tags; the
//! `align_*` functions are the only way to move geometry between spaces.
//!
//! Positions are transformed with the full homogeneous 4×4 matrix.
//! Orientation vectors only see the linear 3×3 block and are renormalised to
//! unit length afterwards.
use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Name of a coordinate system, e.g. `"ctf"` (subject head space) or `"mni"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoordSys(String);

impl CoordSys {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoordSys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fail with a [`Error::Configuration`] unless `a == b`.
pub fn ensure_same_coordsys(a: &CoordSys, b: &CoordSys, what: &str) -> Result<()> {
    if a != b {
        return Err(Error::config(format!(
            "{what}: coordinate systems differ ({a} vs {b})"
        )));
    }
    Ok(())
}

// ── Affine transform ─────────────────────────────────────────────────────────

/// Homogeneous 4×4 affine transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    m: Matrix4<f64>,
}

impl Affine {
    pub fn identity() -> Self {
        Self { m: Matrix4::identity() }
    }

    /// Build from a `[4, 4]` array. Any other shape is a configuration error.
    pub fn from_array(a: &ArrayView2<f64>) -> Result<Self> {
        if a.dim() != (4, 4) {
            return Err(Error::config(format!(
                "affine transform must be 4x4, got {}x{}",
                a.nrows(),
                a.ncols()
            )));
        }
        Ok(Self { m: Matrix4::from_fn(|i, j| a[[i, j]]) })
    }

    /// Build from 16 values in row-major order.
    pub fn from_row_slice(v: &[f64]) -> Result<Self> {
        if v.len() != 16 {
            return Err(Error::config(format!(
                "affine transform needs 16 values, got {}",
                v.len()
            )));
        }
        Ok(Self { m: Matrix4::from_row_slice(v) })
    }

    /// Pure translation.
    pub fn translation(t: [f64; 3]) -> Self {
        let mut m = Matrix4::identity();
        m[(0, 3)] = t[0];
        m[(1, 3)] = t[1];
        m[(2, 3)] = t[2];
        Self { m }
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.m
    }

    /// Row-major copy, as stored in artifacts.
    pub fn to_array(&self) -> Array2<f64> {
        Array2::from_shape_fn((4, 4), |(i, j)| self.m[(i, j)])
    }

    fn linear(&self) -> Matrix3<f64> {
        self.m.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// Fails unless the bottom row is `[0 0 0 1]` and the linear block is
    /// non-singular.
    pub fn validate(&self) -> Result<()> {
        let bottom = self.m.row(3);
        let homogeneous = bottom[0].abs() < 1e-12
            && bottom[1].abs() < 1e-12
            && bottom[2].abs() < 1e-12
            && (bottom[3] - 1.0).abs() < 1e-12;
        if !homogeneous {
            return Err(Error::config("affine transform has a non-affine bottom row"));
        }
        let det = self.linear().determinant();
        if !det.is_finite() || det.abs() < 1e-12 {
            return Err(Error::config(format!(
                "affine transform is not invertible (det = {det:.3e})"
            )));
        }
        Ok(())
    }

    pub fn inverse(&self) -> Result<Affine> {
        self.validate()?;
        self.m
            .try_inverse()
            .map(|m| Affine { m })
            .ok_or_else(|| Error::config("affine transform is not invertible"))
    }

    /// `other ∘ self`: apply `self` first, then `other`.
    pub fn then(&self, other: &Affine) -> Affine {
        Affine { m: other.m * self.m }
    }

    pub fn apply_point(&self, p: [f64; 3]) -> [f64; 3] {
        let v = self.m * Vector4::new(p[0], p[1], p[2], 1.0);
        [v[0], v[1], v[2]]
    }

    /// Linear part only, renormalised. Zero vectors stay zero.
    pub fn apply_direction(&self, d: [f64; 3]) -> [f64; 3] {
        let v = self.linear() * Vector3::new(d[0], d[1], d[2]);
        let n = v.norm();
        if n > 0.0 {
            [v[0] / n, v[1] / n, v[2] / n]
        } else {
            [0.0; 3]
        }
    }

    /// Isotropic length scale of the linear block, `|det|^(1/3)`.
    pub fn length_scale(&self) -> f64 {
        self.linear().determinant().abs().cbrt()
    }

    /// Transform an `[N, 3]` position array.
    pub fn transform_points(&self, pos: &Array2<f64>) -> Result<Array2<f64>> {
        check_xyz(pos, "positions")?;
        let mut out = Array2::zeros(pos.dim());
        for (i, row) in pos.rows().into_iter().enumerate() {
            let p = self.apply_point([row[0], row[1], row[2]]);
            out.row_mut(i).assign(&ndarray::arr1(&p));
        }
        Ok(out)
    }

    /// Transform an `[N, 3]` orientation array (no translation, unit length).
    pub fn transform_directions(&self, ori: &Array2<f64>) -> Result<Array2<f64>> {
        check_xyz(ori, "orientations")?;
        let mut out = Array2::zeros(ori.dim());
        for (i, row) in ori.rows().into_iter().enumerate() {
            let d = self.apply_direction([row[0], row[1], row[2]]);
            out.row_mut(i).assign(&ndarray::arr1(&d));
        }
        Ok(out)
    }
}

fn check_xyz(a: &Array2<f64>, what: &str) -> Result<()> {
    if a.ncols() != 3 {
        return Err(Error::config(format!(
            "{what} must be [N, 3] to match a 3-D affine, got [{}, {}]",
            a.nrows(),
            a.ncols()
        )));
    }
    Ok(())
}

// ── Head model ───────────────────────────────────────────────────────────────

/// Volume-conductor geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeConductor {
    /// One sphere for all channels (Sarvas formula).
    SingleSphere { center: [f64; 3], radius: f64 },
    /// One sphere per channel, `centers` is `[C, 3]` in channel order.
    LocalSpheres { centers: Array2<f64>, radii: Vec<f64> },
    /// Unbounded homogeneous medium (primary current only).
    InfiniteMedium,
}

/// Volume conductor + conductivity + coordinate system.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadModel {
    pub conductor: VolumeConductor,
    /// Compartment conductivities in S/m. MEG fields in spherical models do
    /// not depend on them; kept for provenance.
    pub conductivity: Vec<f64>,
    pub coordsys: CoordSys,
}

impl HeadModel {
    pub fn single_sphere(center: [f64; 3], radius: f64, coordsys: CoordSys) -> Self {
        Self {
            conductor: VolumeConductor::SingleSphere { center, radius },
            conductivity: vec![0.33],
            coordsys,
        }
    }

    /// `true` when `p` lies inside the conductor (always for infinite media).
    pub fn contains(&self, p: [f64; 3]) -> bool {
        match &self.conductor {
            VolumeConductor::SingleSphere { center, radius } => dist(p, *center) < *radius,
            VolumeConductor::LocalSpheres { centers, radii } => centers
                .rows()
                .into_iter()
                .zip(radii)
                .any(|(c, &r)| dist(p, [c[0], c[1], c[2]]) < r),
            VolumeConductor::InfiniteMedium => true,
        }
    }
}

fn dist(a: [f64; 3], b: [f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

// ── Source model ─────────────────────────────────────────────────────────────

/// Ordered source grid.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceModel {
    /// `[N, 3]` grid positions.
    pub pos: Array2<f64>,
    /// Points flagged `false` get no leadfield or filter.
    pub inside: Vec<bool>,
    /// Optional `[N, 3]` fixed dipole orientations.
    pub ori: Option<Array2<f64>>,
    pub coordsys: CoordSys,
}

impl SourceModel {
    /// All points inside, free orientation.
    pub fn new(pos: Array2<f64>, coordsys: CoordSys) -> Result<Self> {
        check_xyz(&pos, "source positions")?;
        let n = pos.nrows();
        Ok(Self { pos, inside: vec![true; n], ori: None, coordsys })
    }

    pub fn with_inside(mut self, inside: Vec<bool>) -> Result<Self> {
        if inside.len() != self.pos.nrows() {
            return Err(Error::config(format!(
                "inside mask has {} entries for {} grid points",
                inside.len(),
                self.pos.nrows()
            )));
        }
        self.inside = inside;
        Ok(self)
    }

    pub fn with_orientations(mut self, ori: Array2<f64>) -> Result<Self> {
        check_xyz(&ori, "source orientations")?;
        if ori.nrows() != self.pos.nrows() {
            return Err(Error::config(format!(
                "{} orientations for {} grid points",
                ori.nrows(),
                self.pos.nrows()
            )));
        }
        self.ori = Some(ori);
        Ok(self)
    }

    pub fn n_points(&self) -> usize {
        self.pos.nrows()
    }

    pub fn n_inside(&self) -> usize {
        self.inside.iter().filter(|&&b| b).count()
    }

    pub fn point(&self, i: usize) -> [f64; 3] {
        [self.pos[[i, 0]], self.pos[[i, 1]], self.pos[[i, 2]]]
    }

    /// Hash of the exact grid (positions bit-for-bit, plus point count).
    pub fn fingerprint(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.pos.nrows().hash(&mut h);
        for v in self.pos.iter() {
            v.to_bits().hash(&mut h);
        }
        h.finish()
    }
}

// ── Alignment ────────────────────────────────────────────────────────────────

/// Move a head model into `target` space.
pub fn align_head_model(hm: &HeadModel, xfm: &Affine, target: &CoordSys) -> Result<HeadModel> {
    xfm.validate()?;
    let scale = xfm.length_scale();
    let conductor = match &hm.conductor {
        VolumeConductor::SingleSphere { center, radius } => VolumeConductor::SingleSphere {
            center: xfm.apply_point(*center),
            radius: radius * scale,
        },
        VolumeConductor::LocalSpheres { centers, radii } => VolumeConductor::LocalSpheres {
            centers: xfm.transform_points(centers)?,
            radii: radii.iter().map(|r| r * scale).collect(),
        },
        VolumeConductor::InfiniteMedium => VolumeConductor::InfiniteMedium,
    };
    log::debug!("head model {} -> {}", hm.coordsys, target);
    Ok(HeadModel {
        conductor,
        conductivity: hm.conductivity.clone(),
        coordsys: target.clone(),
    })
}

/// Move a source grid into `target` space.
pub fn align_source_model(sm: &SourceModel, xfm: &Affine, target: &CoordSys) -> Result<SourceModel> {
    xfm.validate()?;
    let pos = xfm.transform_points(&sm.pos)?;
    let ori = sm.ori.as_ref().map(|o| xfm.transform_directions(o)).transpose()?;
    log::debug!("source model ({} points) {} -> {}", sm.n_points(), sm.coordsys, target);
    Ok(SourceModel {
        pos,
        inside: sm.inside.clone(),
        ori,
        coordsys: target.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn rot_z(theta: f64, t: [f64; 3]) -> Affine {
        let (s, c) = theta.sin_cos();
        Affine::from_row_slice(&[
            c, -s, 0.0, t[0],
            s, c, 0.0, t[1],
            0.0, 0.0, 1.0, t[2],
            0.0, 0.0, 0.0, 1.0,
        ])
        .unwrap()
    }

    #[test]
    fn rejects_wrong_dimensionality() {
        let a = Array2::<f64>::eye(3);
        assert!(matches!(Affine::from_array(&a.view()), Err(Error::Configuration(_))));
        assert!(Affine::from_row_slice(&[1.0; 9]).is_err());
    }

    #[test]
    fn rejects_singular_transform() {
        let xfm = Affine::from_row_slice(&[
            1.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ])
        .unwrap();
        assert!(matches!(xfm.inverse(), Err(Error::Configuration(_))));
        let sm = SourceModel::new(array![[0.0, 0.0, 0.0]], CoordSys::new("ctf")).unwrap();
        assert!(align_source_model(&sm, &xfm, &CoordSys::new("mni")).is_err());
    }

    #[test]
    fn directions_ignore_translation_and_stay_unit() {
        let xfm = rot_z(std::f64::consts::FRAC_PI_2, [10.0, 20.0, 30.0]).then(&Affine::from_row_slice(&[
            2.0, 0.0, 0.0, 0.0,
            0.0, 2.0, 0.0, 0.0,
            0.0, 0.0, 2.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]).unwrap());
        let d = xfm.apply_direction([1.0, 0.0, 0.0]);
        approx::assert_abs_diff_eq!(d[0], 0.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(d[1], 1.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(d[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn sphere_radius_follows_scale() {
        let hm = HeadModel::single_sphere([0.0, 0.0, 0.04], 0.08, CoordSys::new("ctf"));
        let xfm = Affine::from_row_slice(&[
            1000.0, 0.0, 0.0, 0.0,
            0.0, 1000.0, 0.0, 0.0,
            0.0, 0.0, 1000.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ])
        .unwrap();
        let out = align_head_model(&hm, &xfm, &CoordSys::new("ctf_mm")).unwrap();
        match out.conductor {
            VolumeConductor::SingleSphere { center, radius } => {
                approx::assert_abs_diff_eq!(center[2], 40.0, epsilon = 1e-9);
                approx::assert_abs_diff_eq!(radius, 80.0, epsilon = 1e-9);
            }
            other => panic!("unexpected conductor {other:?}"),
        }
        assert_eq!(out.coordsys.as_str(), "ctf_mm");
    }

    #[test]
    fn fingerprint_changes_with_grid() {
        let a = SourceModel::new(array![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]], CoordSys::new("mni")).unwrap();
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.pos[[1, 0]] = 1.0 + 1e-9;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
