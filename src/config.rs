//! Pipeline configuration.
//!
//! [`PipelineConfig`] holds every tunable parameter of a subject run. All
//! fields have defaults matching the standard resting-state analysis
//! (1–80 Hz, λ = 5 %, rank-2 leadfields, unit-noise-gain LCMV,
//! nearest-neighbour atlas lookup, first-PC parcel reduction).
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Filter weight normalisation applied after the LCMV solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightNorm {
    /// Plain unit-gain LCMV weights.
    None,
    /// Scale each filter so `w · N · wᵀ = 1` for the noise covariance `N`.
    UnitNoiseGain,
}

/// Rule for reading an atlas label at a continuous grid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Label of the nearest voxel.
    Nearest,
    /// Most frequent non-background label within ±`radius` voxels of the
    /// nearest voxel; ties go to the smaller label.
    Majority { radius: usize },
}

/// Per-parcel reduction of many point timecourses to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// First principal component across points.
    FirstPrincipalComponent,
    /// Arithmetic mean across points.
    Mean,
}

/// Resource ceiling for one subject job. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Budget {
    /// Wall-clock ceiling in seconds.
    pub max_seconds: Option<f64>,
    /// Ceiling on the estimated size of the largest intermediate arrays.
    pub max_memory_bytes: Option<usize>,
}

impl Budget {
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_seconds.map(Duration::from_secs_f64)
    }
}

/// Configuration for one subject's source-reconstruction run.
///
/// All fields are `pub` so you can construct one with struct-update syntax:
///
/// ```
/// use megparc::PipelineConfig;
///
/// let cfg = PipelineConfig {
///     band: (8.0, 13.0),       // alpha band only
///     lambda_percent: 10.0,
///     ..PipelineConfig::default()
/// };
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pass band `(low, high)` in Hz for the zero-phase FIR band-pass.
    ///
    /// Default: `(1.0, 80.0)`.
    pub band: (f64, f64),

    /// Diagonal loading in percent of the mean covariance eigenvalue.
    ///
    /// Default: `5.0`.
    pub lambda_percent: f64,

    /// Dipole orientation components kept per grid point (1..=3).
    ///
    /// The default of 2 discards the component planar/axial MEG sensors
    /// are blind to (radial in a spherical head).
    pub leadfield_rank: usize,

    /// Scale every leadfield column to unit norm (depth bias correction).
    ///
    /// Default: `true`.
    pub normalize_leadfield: bool,

    /// Standardised log-spectrum drop that marks the kappa cutoff.
    ///
    /// Default: `5.0`.
    pub kappa_threshold: f64,

    /// Collapse each point's filter to the maximum-power orientation.
    ///
    /// Default: `true`.
    pub fixed_orientation: bool,

    /// Default: [`WeightNorm::UnitNoiseGain`].
    pub weight_norm: WeightNorm,

    /// Default: [`Interpolation::Nearest`].
    pub interpolation: Interpolation,

    /// Default: [`Reduction::FirstPrincipalComponent`].
    pub reduction: Reduction,

    /// Cut continuous recordings into trials of this many seconds.
    /// Ignored for data that is already trial-segmented.
    ///
    /// Default: `Some(2.0)`.
    pub trial_duration: Option<f64>,

    /// Recompute even if the subject's outputs already exist.
    ///
    /// Default: `false`.
    pub overwrite: bool,

    /// Seed of the job-queue shuffle.
    ///
    /// Default: `0`.
    pub seed: u64,

    /// Per-subject resource ceiling. Default: unlimited.
    pub budget: Budget,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            band: (1.0, 80.0),
            lambda_percent: 5.0,
            leadfield_rank: 2,
            normalize_leadfield: true,
            kappa_threshold: 5.0,
            fixed_orientation: true,
            weight_norm: WeightNorm::UnitNoiseGain,
            interpolation: Interpolation::Nearest,
            reduction: Reduction::FirstPrincipalComponent,
            trial_duration: Some(2.0),
            overwrite: false,
            seed: 0,
            budget: Budget::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values no stage can work with.
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = self.band;
        if !(lo > 0.0 && hi > lo) {
            return Err(Error::config(format!("band ({lo}, {hi}) must satisfy 0 < low < high")));
        }
        if !(self.lambda_percent >= 0.0 && self.lambda_percent.is_finite()) {
            return Err(Error::config(format!(
                "lambda must be a non-negative percentage, got {}",
                self.lambda_percent
            )));
        }
        if !(1..=3).contains(&self.leadfield_rank) {
            return Err(Error::config(format!(
                "leadfield rank must be 1, 2 or 3, got {}",
                self.leadfield_rank
            )));
        }
        if !(self.kappa_threshold > 0.0) {
            return Err(Error::config(format!(
                "kappa threshold must be positive, got {}",
                self.kappa_threshold
            )));
        }
        if let Some(d) = self.trial_duration {
            if !(d > 0.0) {
                return Err(Error::config(format!("trial duration must be positive, got {d}")));
            }
        }
        if let Some(s) = self.budget.max_seconds {
            if !(s > 0.0 && s.is_finite()) {
                return Err(Error::config(format!("time budget must be positive, got {s}")));
            }
        }
        Ok(())
    }

    /// Regularisation λ as a fraction.
    pub fn lambda(&self) -> f64 {
        self.lambda_percent / 100.0
    }
}
