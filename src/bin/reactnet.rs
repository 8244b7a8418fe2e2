use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use reactnet::error::EXIT_INPUT;
use reactnet::ensemble::run_ensemble;
use reactnet::pool::{self, PoolReport};
use reactnet::snapshot::{JsonLinesSink, Snapshot, SnapshotSink};
use reactnet::{Params, SimError, StopSignal, WorkerContext};

#[derive(Parser)]
#[command(name = "reactnet")]
#[command(
    about = "Rule-driven stochastic simulation of chemical reaction networks",
    long_about = None
)]
struct Cli {
    /// Log filter (e.g. debug, reactnet=trace); RUST_LOG is used otherwise
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a parameter file, single worker or pool
    Run {
        /// JSON parameter file
        params: PathBuf,

        /// Override the number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Override the seed
        #[arg(long)]
        seed: Option<u64>,

        /// Directory receiving one JSON-lines snapshot file per worker
        #[arg(long, value_name = "DIR")]
        snapshots: Option<PathBuf>,

        /// Resume a single-worker run from the last snapshot of this file
        #[arg(long, value_name = "FILE")]
        resume: Option<PathBuf>,

        /// Write the full report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run independent replicates and print their final populations
    Ensemble {
        params: PathBuf,

        #[arg(short = 'n', long, default_value_t = 10)]
        trajectories: usize,

        /// Compounds to report (comma-separated); defaults to `save`, then `init`
        #[arg(long, value_delimiter = ',')]
        names: Vec<String>,

        #[arg(long)]
        threads: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print the initial reaction network as JSON
    Graph { params: PathBuf },
}

fn init_logging(level: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.parse_filters(level);
    }
    builder.format_timestamp_millis().init();
}

fn load(path: &Path) -> Result<Params> {
    Params::from_file(path).with_context(|| format!("reading parameters from {}", path.display()))
}

fn snapshot_sink(
    dir: &Path,
    name: &str,
    rank: usize,
) -> Result<Box<dyn SnapshotSink + Send>, SimError> {
    let sink = JsonLinesSink::create(&dir.join(format!("{name}-{rank}.jsonl")))?;
    Ok(Box::new(sink))
}

fn print_report(report: &PoolReport) {
    for worker in &report.workers {
        println!(
            "worker {}: {} after {} events at t={:.6}",
            worker.rank, worker.summary.cause, worker.summary.events, worker.summary.time
        );
    }
    for (name, pop) in &report.populations {
        println!("{name}\t{pop}");
    }
}

fn run(
    path: &Path,
    workers: Option<usize>,
    seed: Option<u64>,
    snapshots: Option<&Path>,
    resume: Option<&Path>,
    output: Option<&Path>,
) -> Result<i32> {
    let mut params = load(path)?;
    if let Some(workers) = workers {
        params.workers = workers;
    }
    if seed.is_some() {
        params.seed = seed;
    }
    params.validate()?;
    if let Some(dir) = snapshots {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let stop = StopSignal::new();

    let report = match resume {
        Some(file) => {
            if params.workers != 1 {
                bail!(SimError::InvalidArgument(
                    "resuming is only supported for a single worker".into()
                ));
            }
            let snapshot = Snapshot::read_last(file)
                .with_context(|| format!("resuming from {}", file.display()))?;
            let context = WorkerContext::single();
            let rng = ChaCha8Rng::seed_from_u64(params.seed_for(context));
            let mut engine = params.resume_engine(&snapshot, context, rng)?.with_stop_signal(stop);
            if let Some(dir) = snapshots {
                engine = engine.with_sink(snapshot_sink(dir, &params.name, 0)?);
            }
            pool::run_engines(&params, vec![engine])?
        }
        None => pool::run_pool(&params, &stop, |rank| match snapshots {
            Some(dir) => snapshot_sink(dir, &params.name, rank).map(Some),
            None => Ok(None),
        })?,
    };

    print_report(&report);
    if let Some(output) = output {
        let text = serde_json::to_string_pretty(&report)?;
        fs::write(output, text).with_context(|| format!("writing {}", output.display()))?;
    }
    Ok(report.exit_code())
}

fn ensemble(
    path: &Path,
    trajectories: usize,
    names: Vec<String>,
    threads: Option<usize>,
    seed: Option<u64>,
) -> Result<i32> {
    let params = load(path)?;
    let names = if !names.is_empty() {
        names
    } else if !params.save.is_empty() {
        params.save.clone()
    } else {
        params.init.keys().cloned().collect()
    };
    let output = run_ensemble(&params, &names, trajectories, threads, seed)?;
    println!("{}", output.names.join("\t"));
    for idx in 0..output.n_trajectories() {
        let row: Vec<String> = output.trajectory(idx).iter().map(u64::to_string).collect();
        println!("{}", row.join("\t"));
    }
    Ok(output
        .summaries
        .iter()
        .map(|summary| summary.cause.exit_code())
        .max()
        .unwrap_or(0))
}

fn graph(path: &Path) -> Result<i32> {
    let params = load(path)?;
    let context = WorkerContext::single();
    let network = params.build_network(context, &params.partition(context))?;
    println!("{}", serde_json::to_string_pretty(&network.view())?);
    Ok(0)
}

fn execute(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            params,
            workers,
            seed,
            snapshots,
            resume,
            output,
        } => run(
            &params,
            workers,
            seed,
            snapshots.as_deref(),
            resume.as_deref(),
            output.as_deref(),
        ),
        Commands::Ensemble {
            params,
            trajectories,
            names,
            threads,
            seed,
        } => ensemble(&params, trajectories, names, threads, seed),
        Commands::Graph { params } => graph(&params),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    match execute(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            log::error!("{err:#}");
            let code = err
                .downcast_ref::<SimError>()
                .map_or(EXIT_INPUT, SimError::exit_code);
            ExitCode::from(code as u8)
        }
    }
}
