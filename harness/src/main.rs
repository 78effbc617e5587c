//! inctune CLI
//!
//! Runs tuning workers, spawns swarms of them against a shared checkpoint
//! directory, and reports on the directory's state.

use std::{path::Path, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use inctune_config::EnsemblerKind;
use inctune_harness::{
    TuningEngine,
    agent::build_agent,
    config::TuneConfig,
    engine::{BuildReport, BuildStatus},
    ensemble::build_ensembler,
    runner::{ProgressUpdate, RunResult, Runner},
    store::CheckpointStore,
};
use tokio::sync::watch;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "inctune", about = "Incremental tuning engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one tuning worker
    Run {
        /// Path to tune.toml config file
        #[arg(short, long, default_value = "tune.toml")]
        config: String,

        /// Worker index, perturbs the visiting order
        #[arg(long, default_value = "0")]
        worker_id: usize,

        /// Override `[tune] time_limit_secs`
        #[arg(long)]
        time_limit: Option<f64>,

        /// Override `[tune] ensembler`
        #[arg(long)]
        ensembler: Option<EnsemblerKind>,
    },

    /// Spawn workers sharing one checkpoint directory
    Swarm {
        /// Path to tune.toml config file
        #[arg(short, long, default_value = "tune.toml")]
        config: String,

        /// Number of workers (defaults to `[swarm] workers`)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Path to inctune binary (auto-detected if not specified)
        #[arg(long)]
        inctune_binary: Option<String>,
    },

    /// Show the state of a checkpoint directory
    Status {
        /// Checkpoint directory
        #[arg(short, long)]
        dir: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            worker_id,
            time_limit,
            ensembler,
        } => {
            let mut tune_config = TuneConfig::load(&config)?;
            if time_limit.is_some() {
                tune_config.tune.time_limit_secs = time_limit;
            }
            if let Some(kind) = ensembler {
                tune_config.tune.ensembler = kind;
            }
            run_worker(&tune_config, worker_id)?;
        }

        Commands::Swarm {
            config,
            workers,
            inctune_binary,
        } => {
            let tune_config = TuneConfig::load(&config)?;
            let dir = tune_config
                .tune
                .checkpoint_dir
                .clone()
                .ok_or("swarm requires [tune] checkpoint_dir")?;
            let inctune_binary = inctune_binary
                .or_else(Runner::find_inctune_binary)
                .ok_or("Could not find inctune binary. Please specify --inctune-binary")?;
            let workers = workers.unwrap_or(tune_config.swarm.workers).max(1);

            let runner = Arc::new(Runner::new(
                inctune_binary,
                &config,
                Path::new(&dir).join("logs"),
                tune_config.swarm.rust_log.clone(),
            ));
            let store = CheckpointStore::new(&dir);

            println!("Starting {workers} workers on {dir}");
            let mut results = run_swarm(&runner, 0..workers).await?;

            if !store.is_run_done() {
                tracing::info!("no worker finalized the run, starting a finishing worker");
                results.extend(run_swarm(&runner, workers..=workers).await?);
            }

            println!();
            println!("=== Swarm Complete ===");
            for result in &results {
                let outcome = if result.success { "ok" } else { "FAILED" };
                println!(
                    "worker {}: {outcome} ({})",
                    result.worker_id,
                    result.status.as_deref().unwrap_or("no status")
                );
                if let Some(error) = &result.error {
                    for line in error.lines() {
                        println!("  {line}");
                    }
                }
            }

            match store.read_report::<BuildReport>()? {
                Some(report) if store.is_run_done() => print_report(&report),
                _ => return Err("run was not finalized".into()),
            }
        }

        Commands::Status { dir } => {
            let store = CheckpointStore::new(&dir);
            let status = store.status()?;

            if status.candidates.is_empty() {
                println!("No candidates in {dir}.");
                return Ok(());
            }

            println!("=== Candidate Status ===");
            println!();

            for candidate in &status.candidates {
                let state = if candidate.done {
                    "DONE"
                } else if candidate.locked {
                    "RUNNING"
                } else if candidate.has_artifact {
                    "PARTIAL"
                } else {
                    "PENDING"
                };

                print!("{}: {state}", candidate.name);

                if let Some(score) = candidate.score {
                    print!(" [score: {score:.4}]");
                }

                if let Some(usage) = candidate.usage {
                    print!(
                        " [time: {:.1?}, peak: {:.1} MiB]",
                        usage.elapsed,
                        usage.peak_bytes as f64 / (1024.0 * 1024.0)
                    );
                }

                println!();
            }

            println!();
            if status.finalized {
                println!("Run finalized.");
                if let Some(report) = store.read_report::<BuildReport>()? {
                    print_report(&report);
                }
            } else {
                println!("Run not finalized.");
            }
        }
    }

    Ok(())
}

/// Build once in this process and print progress and a summary to stdout.
fn run_worker(config: &TuneConfig, worker_id: usize) -> Result<(), Box<dyn std::error::Error>> {
    let data = config.dataset()?;
    let shuffle_seed = config.tune.seed.wrapping_add(worker_id as u64);
    let agent = build_agent(&config.tune, config.build_candidates(), shuffle_seed)?;
    let ensembler = build_ensembler(config.tune.ensembler);

    let mut engine = TuningEngine::new(config.tune.clone(), agent, ensembler)
        .with_observer(|event| println!("{event}"));
    let status = engine.build(&data)?;

    println!("status: {status}");
    if status != BuildStatus::Done {
        return Ok(());
    }

    let correct = data
        .iter()
        .filter(|(features, label)| {
            engine
                .classify(features)
                .is_ok_and(|predicted| predicted == *label)
        })
        .count();

    print_report(&engine.report());
    println!(
        "training accuracy: {:.4} ({correct}/{})",
        correct as f64 / data.len().max(1) as f64,
        data.len()
    );
    Ok(())
}

fn print_report(report: &BuildReport) {
    println!("members: {}", report.members.len());
    for member in &report.members {
        println!(
            "  {:20} weight {:.4}  score {:.4}",
            member.name, member.weight, member.score
        );
    }
    println!("score: {:.4}", report.score);
    println!(
        "usage: {:.1?}, peak {:.1} MiB",
        report.usage.elapsed,
        report.usage.peak_bytes as f64 / (1024.0 * 1024.0)
    );
}

/// Spawn one worker per id and wait for all of them, with a spinner each.
async fn run_swarm(
    runner: &Arc<Runner>,
    ids: impl Iterator<Item = usize>,
) -> Result<Vec<RunResult>, Box<dyn std::error::Error>> {
    let multi = MultiProgress::new();
    let style = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?;

    let mut tasks = Vec::new();
    for worker_id in ids {
        let pb = multi.add(ProgressBar::new_spinner());
        pb.set_style(style.clone());
        pb.set_message(format!("worker {worker_id:2}: starting..."));

        let handle = match runner.spawn(worker_id) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("{e}");
                pb.finish_with_message(format!("worker {worker_id:2}: spawn failed"));
                continue;
            }
        };
        pb.set_message(format!("worker {worker_id:2}: started (PID {})", handle.pid));
        pb.enable_steady_tick(Duration::from_millis(100));

        let (progress_tx, mut progress_rx) = watch::channel(ProgressUpdate::default());
        let progress_tx = Arc::new(progress_tx);

        // Task to update progress bar
        let pb_clone = pb.clone();
        tokio::spawn(async move {
            while progress_rx.changed().await.is_ok() {
                let p = progress_rx.borrow();
                pb_clone.set_message(format!(
                    "worker {worker_id:2}: step {:4} {:20} {}",
                    p.step, p.candidate, p.outcome
                ));
            }
        });

        let runner = Arc::clone(runner);
        tasks.push(tokio::spawn(async move {
            let result = runner.wait(handle, Some(progress_tx)).await;
            pb.finish_with_message(format!(
                "worker {worker_id:2}: {}",
                match (&result.status, result.success) {
                    (Some(status), true) => status.clone(),
                    (None, true) => "completed".to_string(),
                    (_, false) => "failed".to_string(),
                }
            ));
            result
        }));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await?);
    }
    Ok(results)
}
