//! # megparc — MEG source reconstruction and atlas parcellation in pure Rust
//!
//! `megparc` turns trial-segmented MEG recordings into one timecourse per
//! anatomical parcel. Sources are reconstructed with a rank-regularised LCMV
//! beamformer on a template-space grid; the grid is labelled by a volumetric
//! atlas and each parcel's virtual channels are reduced to one signal.
//!
//! ## Pipeline overview
//!
//! ```text
//! <subject>.safetensors   (native head space)
//!   │
//!   ├─ geometry::align_*      native → template (MNI) space
//!   ├─ condition::condition   zero-phase FIR band-pass, demean, covariances
//!   ├─ kappa::select_kappa    effective rank from the eigenspectrum drop
//!   ├─ leadfield              Sarvas sphere gains, rank-2, unit-norm columns
//!   ├─ beamformer             LCMV, fixed orientation, unit-noise-gain
//!   ├─ atlas::assign_parcels  nearest-voxel label per grid point
//!   └─ parcellate             per-trial filters, first PC per parcel
//!        │
//!        └─→ [trials, parcels, samples] f64
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use megparc::{io, run_subject, PipelineConfig, SharedContext};
//! use std::path::Path;
//!
//! let cfg    = PipelineConfig::default();
//! let atlas  = io::load_atlas(Path::new("atlas/aal.safetensors")).unwrap();
//! let ctx    = SharedContext::new(atlas, cfg.clone()).unwrap();
//! let inputs = io::load_subject(Path::new("data/sub-01.safetensors"), "sub-01", &cfg).unwrap();
//!
//! let out = run_subject(&ctx, inputs).unwrap();
//! println!("kappa {}, parcels {:?}", out.kappa.kappa, out.parcels.data.dim());
//! ```
//!
//! ## Running individual stages
//!
//! ```no_run
//! use megparc::{condition, select_kappa, build_leadfield, beamform};
//! use megparc::{BeamformerOptions, LeadfieldOptions, WeightNorm};
//! # fn demo(data: &megparc::SensorData, head: &megparc::HeadModel, grid: &megparc::SourceModel)
//! #     -> megparc::Result<()> {
//! let cond  = condition(data, (1.0, 80.0))?;
//! let kappa = select_kappa(&cond.avg_cov, 5.0)?;
//! let lf    = build_leadfield(head, grid, &cond.data.grad, LeadfieldOptions::default())?;
//! let est   = beamform(&cond.avg_cov, &cond.average, &lf, &BeamformerOptions {
//!     kappa: kappa.kappa,
//!     lambda: 0.05,
//!     fixed_orientation: true,
//!     weight_norm: WeightNorm::UnitNoiseGain,
//!     noise_cov: None,
//! })?;
//! # let _ = est; Ok(()) }
//! ```

pub mod atlas;
pub mod beamformer;
pub mod condition;
pub mod config;
pub mod epoch;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod io;
pub mod kappa;
pub mod leadfield;
pub mod linalg;
pub mod normalize;
pub mod parcellate;
pub mod pipeline;
pub mod sensors;

// ── Crate-root re-exports ─────────────────────────────────────────────────

// errors + config
pub use error::{Error, Result};
pub use config::{Budget, Interpolation, PipelineConfig, Reduction, WeightNorm};

// geometry + sensors
pub use geometry::{
    align_head_model, align_source_model,
    Affine, CoordSys, HeadModel, SourceModel, VolumeConductor,
};
pub use sensors::{SensorArray, SensorData};

// stages
pub use condition::{condition, Conditioned, Covariance, TrialCovariance};
pub use kappa::{select_kappa, KappaSelection};
pub use leadfield::{build_leadfield, forward_gain, Leadfield, LeadfieldOptions, PointLeadfield};
pub use beamformer::{beamform, compute_filters, BeamformerOptions, SourceEstimate, SpatialFilters};
pub use atlas::{assign_parcels, Atlas, ParcelAssignment, BACKGROUND};
pub use parcellate::{parcellate, ParcelTimeseries};

// filter — design helpers + convolution
pub use filter::{design_bandpass, design_highpass, filter_1d, filter_trials};

// epoch
pub use epoch::segment;

// io — safetensors helpers
pub use io::{StFile, StWriter};

// jobs
pub use pipeline::{
    run_jobs, run_subject,
    JobOutcome, JobQueue, OutputStore, SharedContext, SubjectInputs, SubjectOutputs,
};
