//! Atlas lookup: one anatomical label per source-grid point.
//!
//! Grid positions are mapped to voxel indices with the inverse of the
//! atlas's voxel→world affine and rounded to the nearest voxel. Points that
//! land outside the volume get [`BACKGROUND`].
use ndarray::Array3;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::Interpolation;
use crate::error::{Error, Result};
use crate::geometry::{ensure_same_coordsys, Affine, CoordSys, SourceModel};

/// Label value reserved for "no parcel".
pub const BACKGROUND: u32 = 0;

/// Labelled volume. Loaded once and shared read-only across subjects.
#[derive(Debug, Clone, PartialEq)]
pub struct Atlas {
    /// `[nx, ny, nz]` label volume.
    pub labels: Array3<u32>,
    /// Voxel index `(i, j, k)` → world position.
    pub affine: Affine,
    /// Label value → parcel name.
    pub names: BTreeMap<u32, String>,
    pub coordsys: CoordSys,
    inverse: Affine,
}

impl Atlas {
    pub fn new(
        labels: Array3<u32>,
        affine: Affine,
        names: BTreeMap<u32, String>,
        coordsys: CoordSys,
    ) -> Result<Self> {
        let inverse = affine.inverse()?;
        if labels.is_empty() {
            return Err(Error::config("atlas volume is empty"));
        }
        Ok(Self { labels, affine, names, coordsys, inverse })
    }

    /// Name of `label`, falling back to `"label_<n>"` when the table has no
    /// entry.
    pub fn name_of(&self, label: u32) -> String {
        self.names
            .get(&label)
            .cloned()
            .unwrap_or_else(|| format!("label_{label}"))
    }

    /// Nearest voxel to world position `p`, `None` outside the volume.
    pub fn nearest_voxel(&self, p: [f64; 3]) -> Option<[usize; 3]> {
        let v = self.inverse.apply_point(p);
        let dims = self.labels.dim();
        let dims = [dims.0, dims.1, dims.2];
        let mut idx = [0usize; 3];
        for a in 0..3 {
            let r = v[a].round();
            if !(r >= 0.0 && r < dims[a] as f64) {
                return None;
            }
            idx[a] = r as usize;
        }
        Some(idx)
    }

    fn label_at(&self, p: [f64; 3], method: Interpolation) -> u32 {
        let Some(v) = self.nearest_voxel(p) else { return BACKGROUND };
        match method {
            Interpolation::Nearest => self.labels[v],
            Interpolation::Majority { radius } => self.majority_around(v, radius),
        }
    }

    fn majority_around(&self, v: [usize; 3], radius: usize) -> u32 {
        let (nx, ny, nz) = self.labels.dim();
        let range = |c: usize, n: usize| c.saturating_sub(radius)..=c.saturating_add(radius).min(n - 1);
        let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
        for i in range(v[0], nx) {
            for j in range(v[1], ny) {
                for k in range(v[2], nz) {
                    let l = self.labels[[i, j, k]];
                    if l != BACKGROUND {
                        *counts.entry(l).or_default() += 1;
                    }
                }
            }
        }
        // BTreeMap iterates in ascending label order; keep the first maximum.
        counts
            .into_iter()
            .fold((BACKGROUND, 0), |best, (l, c)| if c > best.1 { (l, c) } else { best })
            .0
    }
}

/// One label per grid point, valid only for the grid it was computed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelAssignment {
    pub labels: Vec<u32>,
    /// [`SourceModel::fingerprint`] of that grid.
    pub grid_fingerprint: u64,
}

impl ParcelAssignment {
    pub fn n_points(&self) -> usize {
        self.labels.len()
    }

    /// Distinct non-background labels, ascending.
    pub fn parcels(&self) -> Vec<u32> {
        self.labels
            .iter()
            .copied()
            .filter(|&l| l != BACKGROUND)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Grid indices carrying `label`.
    pub fn members(&self, label: u32) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|&(_, &l)| l == label)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Label every point of `grid`.
///
/// # Errors
///
/// [`Error::Configuration`] if the atlas and grid coordinate systems differ.
pub fn assign_parcels(
    atlas: &Atlas,
    grid: &SourceModel,
    method: Interpolation,
) -> Result<ParcelAssignment> {
    ensure_same_coordsys(&atlas.coordsys, &grid.coordsys, "atlas vs source model")?;
    let labels: Vec<u32> = (0..grid.n_points())
        .into_par_iter()
        .map(|i| atlas.label_at(grid.point(i), method))
        .collect();
    let assigned = labels.iter().filter(|&&l| l != BACKGROUND).count();
    log::info!(
        "atlas: {assigned} of {} grid points labelled, {:?} lookup",
        labels.len(),
        method
    );
    Ok(ParcelAssignment { labels, grid_fingerprint: grid.fingerprint() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// 4×1×1 volume, 10 mm voxels, voxel 0 centred at x = 0.
    fn strip(labels: [u32; 4]) -> Atlas {
        let vol = Array3::from_shape_vec((4, 1, 1), labels.to_vec()).unwrap();
        let affine = Affine::from_row_slice(&[
            10.0, 0.0, 0.0, 0.0,
            0.0, 10.0, 0.0, 0.0,
            0.0, 0.0, 10.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ])
        .unwrap();
        let names = BTreeMap::from([(1, "left".to_string()), (2, "right".to_string())]);
        Atlas::new(vol, affine, names, CoordSys::new("mni")).unwrap()
    }

    #[test]
    fn nearest_voxel_rounds() {
        let atlas = strip([1, 1, 2, 2]);
        assert_eq!(atlas.nearest_voxel([14.9, 0.0, 0.0]), Some([1, 0, 0]));
        assert_eq!(atlas.nearest_voxel([15.1, 0.0, 0.0]), Some([2, 0, 0]));
        assert_eq!(atlas.nearest_voxel([-6.0, 0.0, 0.0]), None);
        assert_eq!(atlas.nearest_voxel([0.0, 6.0, 0.0]), None);
    }

    #[test]
    fn outside_points_are_background() {
        let atlas = strip([1, 1, 2, 2]);
        let grid = SourceModel::new(
            array![[0.0, 0.0, 0.0], [31.0, 0.0, 0.0], [100.0, 0.0, 0.0]],
            CoordSys::new("mni"),
        )
        .unwrap();
        let a = assign_parcels(&atlas, &grid, Interpolation::Nearest).unwrap();
        assert_eq!(a.labels, vec![1, 2, BACKGROUND]);
        assert_eq!(a.parcels(), vec![1, 2]);
        assert_eq!(a.members(2), vec![1]);
    }

    #[test]
    fn majority_skips_background_and_breaks_ties_low() {
        let atlas = strip([0, 2, 0, 1]);
        let grid = SourceModel::new(array![[20.0, 0.0, 0.0]], CoordSys::new("mni")).unwrap();
        let nearest = assign_parcels(&atlas, &grid, Interpolation::Nearest).unwrap();
        assert_eq!(nearest.labels, vec![BACKGROUND]);
        let major = assign_parcels(&atlas, &grid, Interpolation::Majority { radius: 1 }).unwrap();
        assert_eq!(major.labels, vec![1]);
    }

    #[test]
    fn majority_radius_larger_than_volume() {
        let atlas = strip([2, 1, 1, 0]);
        let grid = SourceModel::new(array![[30.0, 0.0, 0.0]], CoordSys::new("mni")).unwrap();
        let a = assign_parcels(&atlas, &grid, Interpolation::Majority { radius: usize::MAX })
            .unwrap();
        assert_eq!(a.labels, vec![1]);
    }

    #[test]
    fn coordsys_mismatch_rejected() {
        let atlas = strip([1, 1, 2, 2]);
        let grid = SourceModel::new(array![[0.0, 0.0, 0.0]], CoordSys::new("ctf")).unwrap();
        assert!(matches!(
            assign_parcels(&atlas, &grid, Interpolation::Nearest),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn unnamed_labels_get_fallback_name() {
        let atlas = strip([1, 1, 2, 7]);
        assert_eq!(atlas.name_of(2), "right");
        assert_eq!(atlas.name_of(7), "label_7");
    }
}
