//! Sensor array description and trial-segmented sensor data.
use ndarray::{Array2, Array3, Axis};

use crate::error::{Error, Result};
use crate::geometry::{Affine, CoordSys};

/// MEG sensor array: coils plus the channel×coil weighting that turns coil
/// fluxes into channel readings.
///
/// A magnetometer is one coil with weight 1. An axial gradiometer is two
/// coaxial coils with weights `+1, −1`. Planar gradiometers use the
/// baseline-normalised pair `+1/b, −1/b`.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorArray {
    pub labels: Vec<String>,
    /// `[K, 3]` coil centres.
    pub coil_pos: Array2<f64>,
    /// `[K, 3]` unit coil normals.
    pub coil_ori: Array2<f64>,
    /// `[C, K]` channel weights.
    pub tra: Array2<f64>,
    pub coordsys: CoordSys,
}

impl SensorArray {
    pub fn new(
        labels: Vec<String>,
        coil_pos: Array2<f64>,
        coil_ori: Array2<f64>,
        tra: Array2<f64>,
        coordsys: CoordSys,
    ) -> Result<Self> {
        if coil_pos.ncols() != 3 || coil_ori.dim() != coil_pos.dim() {
            return Err(Error::config(format!(
                "coil positions {:?} and orientations {:?} must both be [K, 3]",
                coil_pos.dim(),
                coil_ori.dim()
            )));
        }
        if tra.dim() != (labels.len(), coil_pos.nrows()) {
            return Err(Error::config(format!(
                "tra is {:?}, expected [{} channels, {} coils]",
                tra.dim(),
                labels.len(),
                coil_pos.nrows()
            )));
        }
        Ok(Self { labels, coil_pos, coil_ori, tra, coordsys })
    }

    /// One magnetometer coil per channel.
    pub fn magnetometers(
        labels: Vec<String>,
        pos: Array2<f64>,
        ori: Array2<f64>,
        coordsys: CoordSys,
    ) -> Result<Self> {
        let n = labels.len();
        Self::new(labels, pos, ori, Array2::eye(n), coordsys)
    }

    pub fn n_channels(&self) -> usize {
        self.labels.len()
    }

    pub fn n_coils(&self) -> usize {
        self.coil_pos.nrows()
    }

    /// Copy of this array moved into `target` space.
    pub fn aligned(&self, xfm: &Affine, target: &CoordSys) -> Result<Self> {
        xfm.validate()?;
        Ok(Self {
            labels: self.labels.clone(),
            coil_pos: xfm.transform_points(&self.coil_pos)?,
            coil_ori: xfm.transform_directions(&self.coil_ori)?,
            tra: self.tra.clone(),
            coordsys: target.clone(),
        })
    }
}

/// Fail unless both label lists are identical, element by element.
pub fn ensure_same_channels(a: &[String], b: &[String], what: &str) -> Result<()> {
    if a.len() != b.len() {
        return Err(Error::config(format!(
            "{what}: channel count differs ({} vs {})",
            a.len(),
            b.len()
        )));
    }
    if let Some(i) = a.iter().zip(b).position(|(x, y)| x != y) {
        return Err(Error::config(format!(
            "{what}: channel order differs at index {i} ({} vs {})",
            a[i], b[i]
        )));
    }
    Ok(())
}

/// Trial-segmented MEG recording, `[trials, channels, samples]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorData {
    pub trials: Array3<f64>,
    pub sfreq: f64,
    pub grad: SensorArray,
}

impl SensorData {
    pub fn new(trials: Array3<f64>, sfreq: f64, grad: SensorArray) -> Result<Self> {
        let (n_tr, n_ch, n_t) = trials.dim();
        if n_ch != grad.n_channels() {
            return Err(Error::config(format!(
                "data has {n_ch} channels, sensor array has {}",
                grad.n_channels()
            )));
        }
        if n_tr == 0 || n_t < 2 {
            return Err(Error::config(format!(
                "need at least one trial of two samples, got [{n_tr}, {n_ch}, {n_t}]"
            )));
        }
        if !(sfreq.is_finite() && sfreq > 0.0) {
            return Err(Error::config(format!("invalid sampling rate {sfreq}")));
        }
        Ok(Self { trials, sfreq, grad })
    }

    pub fn labels(&self) -> &[String] {
        &self.grad.labels
    }

    pub fn n_trials(&self) -> usize {
        self.trials.len_of(Axis(0))
    }

    pub fn n_channels(&self) -> usize {
        self.trials.len_of(Axis(1))
    }

    pub fn n_samples(&self) -> usize {
        self.trials.len_of(Axis(2))
    }

    pub fn coordsys(&self) -> &CoordSys {
        &self.grad.coordsys
    }

    /// Derived copy with the sensor geometry moved into `target` space.
    pub fn aligned(&self, xfm: &Affine, target: &CoordSys) -> Result<Self> {
        Ok(Self {
            trials: self.trials.clone(),
            sfreq: self.sfreq,
            grad: self.grad.aligned(xfm, target)?,
        })
    }
}
