use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use megparc::{
    io, run_jobs, Interpolation, JobOutcome, JobQueue, OutputStore, PipelineConfig, Reduction,
    SharedContext, WeightNorm,
};

#[derive(Clone, Copy, clap::ValueEnum)]
enum ReductionArg {
    Pca,
    Mean,
}

#[derive(Parser)]
#[command(name = "megparc", about = "MEG LCMV source reconstruction + atlas parcellation")]
struct Args {
    /// Directory holding one <subject>.safetensors input bundle per subject
    #[arg(long)]
    input_dir: PathBuf,

    /// Directory for <subject>_source / <subject>_parcels artifacts
    #[arg(long)]
    output_dir: PathBuf,

    /// Atlas bundle (labels, affine, label_values, label_names)
    #[arg(long)]
    atlas: PathBuf,

    /// Subject ids to process (comma-separated; default: every bundle in input_dir)
    #[arg(long, default_value = "")]
    subjects: String,

    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Band-pass low edge in Hz
    #[arg(long)]
    l_freq: Option<f64>,

    /// Band-pass high edge in Hz
    #[arg(long)]
    h_freq: Option<f64>,

    /// Covariance regularisation in percent of the mean eigenvalue
    #[arg(long)]
    lambda: Option<f64>,

    /// Leadfield rank (1..=3)
    #[arg(long)]
    rank: Option<usize>,

    /// Standardised eigenspectrum drop that selects kappa
    #[arg(long)]
    kappa_threshold: Option<f64>,

    /// Keep every leadfield orientation instead of the maximum-power one
    #[arg(long)]
    free_orientation: bool,

    /// Skip leadfield column normalisation
    #[arg(long)]
    no_normalize: bool,

    /// Plain unit-gain filters instead of unit-noise-gain
    #[arg(long)]
    unit_gain: bool,

    /// Majority-vote atlas lookup within this many voxels (default: nearest voxel)
    #[arg(long)]
    majority_radius: Option<usize>,

    /// Parcel reduction
    #[arg(long, value_enum)]
    reduction: Option<ReductionArg>,

    /// Trial length in seconds for continuous recordings
    #[arg(long)]
    trial_duration: Option<f64>,

    /// Job-queue shuffle seed
    #[arg(long)]
    seed: Option<u64>,

    /// Per-subject wall-clock budget in seconds
    #[arg(long)]
    max_seconds: Option<f64>,

    /// Per-subject ceiling on the estimated working set, in bytes
    #[arg(long)]
    max_memory: Option<usize>,

    /// Recompute subjects whose outputs already exist
    #[arg(long)]
    overwrite: bool,

    /// Concurrent subjects (default: 1)
    #[arg(long, default_value_t = 1)]
    workers: usize,
}

fn discover_subjects(dir: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "safetensors") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
    }
    Ok(ids)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(p) => PipelineConfig::from_json_file(p)?,
        None => PipelineConfig::default(),
    };
    if let Some(l) = args.l_freq { cfg.band.0 = l; }
    if let Some(h) = args.h_freq { cfg.band.1 = h; }
    if let Some(l) = args.lambda { cfg.lambda_percent = l; }
    if let Some(r) = args.rank { cfg.leadfield_rank = r; }
    if let Some(t) = args.kappa_threshold { cfg.kappa_threshold = t; }
    if args.free_orientation { cfg.fixed_orientation = false; }
    if args.no_normalize { cfg.normalize_leadfield = false; }
    if args.unit_gain { cfg.weight_norm = WeightNorm::None; }
    if let Some(radius) = args.majority_radius {
        cfg.interpolation = Interpolation::Majority { radius };
    }
    match args.reduction {
        Some(ReductionArg::Pca) => cfg.reduction = Reduction::FirstPrincipalComponent,
        Some(ReductionArg::Mean) => cfg.reduction = Reduction::Mean,
        None => {}
    }
    if let Some(d) = args.trial_duration { cfg.trial_duration = Some(d); }
    if let Some(s) = args.seed { cfg.seed = s; }
    if let Some(s) = args.max_seconds { cfg.budget.max_seconds = Some(s); }
    if let Some(b) = args.max_memory { cfg.budget.max_memory_bytes = Some(b); }
    cfg.overwrite |= args.overwrite;

    let atlas = io::load_atlas(&args.atlas)?;
    let ctx = SharedContext::new(atlas, cfg)?;
    let store = OutputStore::new(&args.output_dir)?;

    let ids: Vec<String> = if args.subjects.is_empty() {
        discover_subjects(&args.input_dir)?
    } else {
        args.subjects.split(',').map(str::to_string).collect()
    };
    let queue = JobQueue::new(ids, ctx.config.seed);
    println!("Queued {} subjects (seed {})", queue.len(), ctx.config.seed);

    let input_dir = args.input_dir.clone();
    let outcomes = run_jobs(&ctx, &queue, &store, args.workers, |id| {
        io::load_subject(&input_dir.join(format!("{id}.safetensors")), id, &ctx.config)
    })?;

    let mut failed = 0;
    for (id, outcome) in &outcomes {
        match outcome {
            JobOutcome::Completed { kappa, n_parcels, elapsed } => println!(
                "{id}: ok  kappa={kappa}  parcels={n_parcels}  {:.1}s",
                elapsed.as_secs_f64()
            ),
            JobOutcome::Skipped => println!("{id}: skipped (outputs exist)"),
            JobOutcome::Failed(e) => {
                failed += 1;
                println!("{id}: FAILED  {e}");
            }
        }
    }
    println!("Written → {}", store.dir().display());

    if failed > 0 {
        bail!("{failed} of {} subjects failed", outcomes.len());
    }
    Ok(())
}
