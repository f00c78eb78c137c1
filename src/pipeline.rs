//! Subject runs and the multi-subject job runner.
//!
//! ```text
//! SubjectInputs (native space)
//!   ├─ align        sensors, head model, grid → template space
//!   ├─ condition    band-pass, demean, average, covariances
//!   ├─ kappa        effective rank of the averaged covariance
//!   ├─ leadfield    rank-reduced, unit-norm gains per inside point
//!   ├─ beamform     LCMV filters + averaged source estimate
//!   ├─ atlas        one label per grid point (shared atlas)
//!   └─ parcellate   per-trial filters → [E, P, T]
//!        │
//!        └─→ <subject>_source.safetensors, <subject>_parcels.safetensors
//! ```
//!
//! Stages within a subject run strictly in order. Subjects are independent:
//! the [`JobQueue`] fixes a seeded processing order and [`run_jobs`] works
//! through it on a bounded rayon pool. A failed subject never affects
//! another, and nothing is written for it.
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::atlas::{assign_parcels, Atlas};
use crate::beamformer::{beamform, BeamformerOptions, SourceEstimate};
use crate::condition::condition;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::geometry::{align_head_model, align_source_model, Affine, CoordSys, HeadModel, SourceModel};
use crate::io::{parcel_writer, parcels_path, source_path, source_writer};
use crate::kappa::{select_kappa, KappaSelection};
use crate::leadfield::{build_leadfield, LeadfieldOptions};
use crate::parcellate::{parcellate, ParcelTimeseries};
use crate::sensors::SensorData;

/// Everything one subject run needs, in the subject's native space.
#[derive(Debug, Clone)]
pub struct SubjectInputs {
    pub subject: String,
    pub sensors: SensorData,
    /// Native → template transform.
    pub transform: Affine,
    /// Coordinate system the transform lands in; must match the atlas.
    pub target: CoordSys,
    pub head: HeadModel,
    pub source: SourceModel,
}

/// Results of a successful subject run.
#[derive(Debug, Clone)]
pub struct SubjectOutputs {
    pub subject: String,
    pub kappa: KappaSelection,
    pub source: SourceEstimate,
    pub parcels: ParcelTimeseries,
}

/// Read-only state built once per run and shared by every job.
#[derive(Debug, Clone)]
pub struct SharedContext {
    pub atlas: Arc<Atlas>,
    pub config: PipelineConfig,
}

impl SharedContext {
    pub fn new(atlas: Atlas, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { atlas: Arc::new(atlas), config })
    }
}

// ── Budget enforcement ────────────────────────────────────────────────────────

struct Meter {
    start: Instant,
    limit: Option<Duration>,
    max_bytes: Option<usize>,
}

impl Meter {
    fn new(cfg: &PipelineConfig) -> Self {
        Self {
            start: Instant::now(),
            limit: cfg.budget.max_duration(),
            max_bytes: cfg.budget.max_memory_bytes,
        }
    }

    fn check_time(&self, stage: &'static str) -> Result<()> {
        match self.limit {
            Some(limit) if self.start.elapsed() > limit => {
                Err(Error::timeout(stage, self.start.elapsed(), limit))
            }
            _ => Ok(()),
        }
    }

    /// Check the clock, then the estimated size of `shapes` f64 arrays.
    fn enter(&self, stage: &'static str, shapes: &[&[usize]]) -> Result<()> {
        self.check_time(stage)?;
        let needed = shapes
            .iter()
            .map(|s| s.iter().fold(8usize, |acc, &d| acc.saturating_mul(d)))
            .fold(0usize, usize::saturating_add);
        match self.max_bytes {
            Some(limit) if needed > limit => Err(Error::memory(stage, needed, limit)),
            _ => {
                log::debug!("{stage}: ~{needed} bytes");
                Ok(())
            }
        }
    }
}

/// Run every stage for one subject.
///
/// # Errors
///
/// Any stage error, or [`Error::ResourceExhaustion`] when the configured
/// budget runs out between stages or a stage's estimated footprint exceeds
/// it.
pub fn run_subject(ctx: &SharedContext, inputs: SubjectInputs) -> Result<SubjectOutputs> {
    let cfg = &ctx.config;
    let meter = Meter::new(cfg);
    let SubjectInputs { subject, sensors, transform, target, head, source } = inputs;
    let (n_e, n_c, n_t) = sensors.trials.dim();
    let n_pts = source.n_points();
    let k = if cfg.fixed_orientation { 1 } else { cfg.leadfield_rank };

    meter.enter("align", &[])?;
    let sensors = sensors.aligned(&transform, &target)?;
    let head = align_head_model(&head, &transform, &target)?;
    let source = align_source_model(&source, &transform, &target)?;
    log::debug!("{subject}: aligned to {target}");

    meter.enter("condition", &[&[2, n_e, n_c, n_t], &[n_e, n_c, n_c]])?;
    let cond = condition(&sensors, cfg.band)?;

    meter.enter("kappa", &[&[n_c, n_c]])?;
    let kappa = select_kappa(&cond.avg_cov, cfg.kappa_threshold)?;
    log::info!("{subject}: kappa = {} of {n_c} channels", kappa.kappa);

    meter.enter("leadfield", &[&[n_pts, n_c, 3]])?;
    let lf = build_leadfield(
        &head,
        &source,
        &cond.data.grad,
        LeadfieldOptions { rank: cfg.leadfield_rank, normalize: cfg.normalize_leadfield },
    )?;

    meter.enter("beamform", &[&[n_pts, k, n_c], &[n_pts, k, n_t]])?;
    let opts = BeamformerOptions {
        kappa: kappa.kappa,
        lambda: cfg.lambda(),
        fixed_orientation: cfg.fixed_orientation,
        weight_norm: cfg.weight_norm,
        noise_cov: None,
    };
    let est = beamform(&cond.avg_cov, &cond.average, &lf, &opts)?;

    meter.enter("atlas", &[])?;
    let assignment = assign_parcels(&ctx.atlas, &source, cfg.interpolation)?;
    let n_parcels = assignment.parcels().len();

    meter.enter("parcellate", &[&[n_e, n_parcels, n_t], &[n_e.min(rayon::current_num_threads()), n_pts, k, n_t]])?;
    let parcels = parcellate(&cond.data, &est.filters, &assignment, cfg.reduction)?
        .with_names(&ctx.atlas);
    meter.check_time("parcellate")?;

    Ok(SubjectOutputs { subject, kappa, source: est, parcels })
}

// ── Job queue ─────────────────────────────────────────────────────────────────

/// Seeded, immutable processing order over subject ids.
///
/// Ids are sorted and de-duplicated before the shuffle, so the order
/// depends only on the id set and the seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueue {
    order: Vec<String>,
}

impl JobQueue {
    pub fn new(mut ids: Vec<String>, seed: u64) -> Self {
        ids.sort();
        ids.dedup();
        let mut rng = StdRng::seed_from_u64(seed);
        ids.shuffle(&mut rng);
        Self { order: ids }
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-subject artifact locations under one output directory.
#[derive(Debug, Clone)]
pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn source_path(&self, subject: &str) -> PathBuf {
        source_path(&self.dir, subject)
    }

    pub fn parcels_path(&self, subject: &str) -> PathBuf {
        parcels_path(&self.dir, subject)
    }

    /// Both artifacts of `subject` are present.
    pub fn is_complete(&self, subject: &str) -> bool {
        self.source_path(subject).is_file() && self.parcels_path(subject).is_file()
    }

    /// Write both artifacts. Both are staged before either is published, so
    /// a failed write leaves any previous pair untouched. Publishing clears
    /// the old pair first; a subject never holds one old and one new file.
    pub fn persist(&self, out: &SubjectOutputs) -> Result<()> {
        let src = source_writer(&out.subject, &out.source).stage(&self.source_path(&out.subject))?;
        let par = parcel_writer(&out.subject, &out.parcels).stage(&self.parcels_path(&out.subject))?;

        remove_if_present(par.path())?;
        let src_path = src.path().to_path_buf();
        src.commit()?;
        if let Err(e) = par.commit() {
            let _ = std::fs::remove_file(&src_path);
            return Err(e);
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(Error::io(path, e)),
        _ => Ok(()),
    }
}

/// How one job ended.
#[derive(Debug)]
pub enum JobOutcome {
    Completed { kappa: usize, n_parcels: usize, elapsed: Duration },
    /// Outputs already existed and overwrite was off.
    Skipped,
    Failed(Error),
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, JobOutcome::Skipped)
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            JobOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

fn run_job<F>(ctx: &SharedContext, store: &OutputStore, subject: &str, load: &F) -> JobOutcome
where
    F: Fn(&str) -> Result<SubjectInputs> + Sync,
{
    if !ctx.config.overwrite && store.is_complete(subject) {
        log::info!("{subject}: outputs exist, skipping");
        return JobOutcome::Skipped;
    }
    let start = Instant::now();
    let result = load(subject)
        .and_then(|inputs| run_subject(ctx, inputs))
        .and_then(|out| store.persist(&out).map(|_| out));
    match result {
        Ok(out) => {
            let elapsed = start.elapsed();
            log::info!(
                "{subject}: done in {:.1} s ({} parcels × {} trials)",
                elapsed.as_secs_f64(),
                out.parcels.n_parcels(),
                out.parcels.n_trials()
            );
            JobOutcome::Completed {
                kappa: out.kappa.kappa,
                n_parcels: out.parcels.n_parcels(),
                elapsed,
            }
        }
        Err(e) => {
            log::error!("{subject}: {e}");
            JobOutcome::Failed(e)
        }
    }
}

/// Process every subject of `queue` on a pool of `workers` threads.
///
/// `load` turns a subject id into its inputs. Outcomes come back in queue
/// order. Failures are reported per subject and never retried.
///
/// # Errors
///
/// Only if the thread pool cannot be built.
pub fn run_jobs<F>(
    ctx: &SharedContext,
    queue: &JobQueue,
    store: &OutputStore,
    workers: usize,
    load: F,
) -> Result<Vec<(String, JobOutcome)>>
where
    F: Fn(&str) -> Result<SubjectInputs> + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| Error::config(format!("cannot build worker pool: {e}")))?;
    log::info!("{} subjects, {} workers, seed {}", queue.len(), workers.max(1), ctx.config.seed);

    let outcomes: Vec<(String, JobOutcome)> = pool.install(|| {
        queue
            .order()
            .par_iter()
            .map(|id| (id.clone(), run_job(ctx, store, id, &load)))
            .collect()
    });

    let done = outcomes.iter().filter(|(_, o)| o.is_completed()).count();
    let skipped = outcomes.iter().filter(|(_, o)| o.is_skipped()).count();
    log::info!(
        "finished: {done} completed, {skipped} skipped, {} failed",
        outcomes.len() - done - skipped
    );
    Ok(outcomes)
}
