use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use vifit::catalog::Catalog;
use vifit::checkpoint_manager::CheckpointStore;
use vifit::config::{DEFAULT_STATE_DIR, RunConfig, parse_year_range};
use vifit::fit::{FitParams, HarmonicFactory};
use vifit::orchestrator::Orchestrator;
use vifit::series::{SeriesTable, SliceWindows};
use vifit::work_unit::Phase;
use vifit::VifitError;

#[derive(Parser)]
#[command(name = "vifit")]
#[command(about = "Resumable batch fitting of vegetation-index time series", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit every unit of a phase, resuming from the checkpoint if one exists
    Run(RunArgs),
    /// Show checkpoint counters and how much work is left
    Status(InputArgs),
    /// Show catalog sizes for every phase
    Catalog(CatalogArgs),
}

#[derive(Args)]
struct InputArgs {
    #[arg(long, value_enum, env = "VIFIT_PHASE", default_value = "climatology")]
    phase: Phase,
    /// JSON-lines observation file
    #[arg(long, env = "VIFIT_INPUT")]
    input: PathBuf,
    #[arg(long, env = "VIFIT_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,
    /// Year range for year curves, e.g. 2001-2013
    #[arg(long, env = "VIFIT_YEARS", value_parser = parse_year_range)]
    years: Option<(u16, u16)>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    input: InputArgs,
    /// Output CSV; failures and summary are written next to it
    #[arg(long, env = "VIFIT_OUTPUT")]
    output: PathBuf,
    #[arg(long, env = "VIFIT_CHECKPOINT_INTERVAL", default_value_t = 500)]
    checkpoint_interval: u64,
    #[arg(long, env = "VIFIT_BATCH_SIZE", default_value_t = 8)]
    batch_size: usize,
    #[arg(long, env = "VIFIT_WORKERS", default_value_t = 4)]
    workers: usize,
    #[arg(long, env = "VIFIT_BATCHES_PER_WAVE", default_value_t = 250)]
    batches_per_wave: usize,
    #[arg(long, env = "VIFIT_REPORT_EVERY", default_value_t = 50)]
    report_every: u64,
    #[arg(long, env = "VIFIT_MIN_OBSERVATIONS", default_value_t = 6)]
    min_observations: usize,
    #[arg(long, env = "VIFIT_MAX_ITERATIONS", default_value_t = 50)]
    max_iterations: usize,
    #[arg(long, env = "VIFIT_TOLERANCE", default_value_t = 1e-6)]
    tolerance: f64,
    #[arg(long, env = "VIFIT_YEAR_PAD_DAYS", default_value_t = 30)]
    year_pad_days: u16,
    #[arg(long, env = "VIFIT_DAILY_HALF_WIDTH", default_value_t = 7)]
    daily_half_width: u16,
    /// Treat recorded failures as final instead of retrying them on resume
    #[arg(long, env = "VIFIT_SKIP_FAILED")]
    skip_failed: bool,
    /// Stop after this many checkpoint saves
    #[arg(long, env = "VIFIT_STOP_AFTER_CHECKPOINTS")]
    stop_after_checkpoints: Option<usize>,
}

#[derive(Args)]
struct CatalogArgs {
    #[arg(long, env = "VIFIT_INPUT")]
    input: PathBuf,
    #[arg(long, env = "VIFIT_YEARS", value_parser = parse_year_range)]
    years: Option<(u16, u16)>,
}

fn run(args: RunArgs) -> Result<(), VifitError> {
    let windows = SliceWindows {
        year_pad_days: args.year_pad_days,
        daily_half_width: args.daily_half_width,
    };
    let mut config = RunConfig::custom(
        args.input.phase,
        args.input.state_dir,
        args.input.input,
        args.output,
    );
    config.checkpoint_interval = args.checkpoint_interval;
    config.batch_size = args.batch_size;
    config.workers = args.workers;
    config.batches_per_wave = args.batches_per_wave;
    config.report_every = args.report_every;
    config.fit = FitParams {
        min_observations: args.min_observations,
        max_iterations: args.max_iterations,
        tolerance: args.tolerance,
    };
    config.windows = windows;
    config.retry_failed = !args.skip_failed;
    config.stop_after_checkpoints = args.stop_after_checkpoints;
    config.years = args.input.years;
    config.validate()?;

    println!("[vifit] Phase: {}", config.phase);
    println!("[vifit] Input: {}", config.input.display());
    println!("[vifit] State dir: {}", config.state_dir.display());

    let table = SeriesTable::load_jsonl(&config.input, config.windows)?;
    let catalog = Catalog::from_series(config.phase, &table, config.years)?;
    let summary = Orchestrator::new(config, &catalog, &table, HarmonicFactory).run()?;

    println!(
        "[vifit] {} succeeded, {} failed, {} remaining ({})",
        summary.succeeded,
        summary.failed,
        summary.remaining,
        if summary.completed { "complete" } else { "stopped; rerun to resume" }
    );
    Ok(())
}

fn status(args: InputArgs) -> Result<(), VifitError> {
    let table = SeriesTable::load_jsonl(&args.input, SliceWindows::default())?;
    let catalog = Catalog::from_series(args.phase, &table, args.years)?;
    let checkpoint_dir = CheckpointStore::checkpoint_dir(&args.state_dir, args.phase);

    // A run may be writing this directory right now; inspect never modifies it.
    match CheckpointStore::inspect(&args.state_dir, args.phase)? {
        None => println!("[vifit] No checkpoint for {} ({} keys in catalog)", args.phase, catalog.len()),
        Some(report) => {
            let state = &report.state;
            let remaining = catalog.remaining(&state.completed_keys()).len();
            println!("[vifit] Checkpoint: {}", checkpoint_dir.display());
            println!("[vifit] Saved at: {}", state.saved_at.as_deref().unwrap_or("unknown"));
            println!(
                "[vifit] Attempted {}, succeeded {}, failed {}",
                state.counters.attempted_count, state.counters.succeeded_count, state.counters.failed_count
            );
            println!(
                "[vifit] Rows {}, failed keys {}, remaining {} of {}{}",
                state.rows.len(),
                state.failures.len(),
                remaining,
                catalog.len(),
                if state.sealed { " (sealed, awaiting merge)" } else { "" }
            );
            if report.uncommitted_segments > 0 {
                println!(
                    "[vifit] {} uncommitted segment(s) present (save in progress or interrupted)",
                    report.uncommitted_segments
                );
            }
            if report.legacy {
                println!("[vifit] Format version 1, migrated on the next save");
            }
        }
    }
    Ok(())
}

fn catalog(args: CatalogArgs) -> Result<(), VifitError> {
    let table = SeriesTable::load_jsonl(&args.input, SliceWindows::default())?;
    println!("[vifit] {} observations", table.len());
    for phase in [Phase::Climatology, Phase::YearCurve, Phase::DailyAnomaly] {
        let catalog = Catalog::from_series(phase, &table, args.years)?;
        println!("[vifit] {:<14} {:>10} keys", phase.name(), catalog.len());
    }
    Ok(())
}

fn main() -> Result<(), VifitError> {
    dotenv().ok();
    vifit::init_tracing("vifit");

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Status(args) => status(args),
        Commands::Catalog(args) => catalog(args),
    }
}
