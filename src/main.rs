//! parsefuzz: coverage-guided greybox fuzzer for text-input parsers
//!
//! Usage:
//!   parsefuzz run --target json-decoder --scheduler heap --iterations 1000 --seed 42
//!   parsefuzz run --target cidrize-runner --scheduler ucb_tree --workers 4 --hours 2.0
//!   parsefuzz corpus --corpus-dir seed_corpus
//!
//! The `run` command drives one fuzzing campaign: seeds come from the
//! corpus, a power schedule assigns per-seed mutation budgets, mutations
//! run against the target subprocess, and interesting inputs are promoted
//! back into the scheduler.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parsefuzz::config::{Budget, FuzzConfig, SubsystemVersions, DEFAULT_TIMEOUT_SECS};
use parsefuzz::controller::Campaign;
use parsefuzz::corpus::SeedCorpus;
use parsefuzz::mutator::MutatorKind;
use parsefuzz::power;
use parsefuzz::scheduler::SchedulerKind;
use parsefuzz::target::{CommandTarget, TargetRegistry};

#[derive(Parser)]
#[command(name = "parsefuzz")]
#[command(about = "Coverage-guided greybox fuzzer for text-input parsers")]
#[command(version = "1.0.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a fuzzing campaign
    Run {
        /// Target name (see `targets.yaml` / built-in registry)
        #[arg(long, default_value = "json-decoder")]
        target: String,

        /// Seed scheduler: queue, heap, ucb_tree
        #[arg(long, default_value = "heap")]
        scheduler: String,

        /// Mutation mode: auto (infer from target), json, ip
        #[arg(long, default_value = "auto")]
        mutator: String,

        /// Maximum number of fuzzing iterations
        #[arg(long, conflicts_with = "hours")]
        iterations: Option<u64>,

        /// Wall-clock budget in hours
        #[arg(long)]
        hours: Option<f64>,

        /// Per-run timeout in seconds
        #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout: f64,

        /// RNG seed for reproducible campaigns
        #[arg(long)]
        seed: Option<u64>,

        /// Worker count; 1 runs the in-thread loop
        #[arg(long, default_value_t = 1)]
        workers: usize,

        /// Run store path
        #[arg(long, default_value = "fuzz_runs.sqlite")]
        db: PathBuf,

        /// Seed corpus directory (holds manifest.json)
        #[arg(long, default_value = "seed_corpus")]
        corpus_dir: PathBuf,

        /// Base directory containing target harnesses
        #[arg(long, default_value = "targets")]
        targets_dir: PathBuf,

        /// Optional YAML file overriding the target registry
        #[arg(long)]
        targets_file: Option<PathBuf>,

        /// Promotion threshold override (defaults: 0.5 single, 0.0 multi)
        #[arg(long)]
        promote_threshold: Option<f64>,

        /// Minimum per-seed energy
        #[arg(long, default_value_t = power::DEFAULT_MIN_ENERGY)]
        min_energy: u32,

        /// Maximum per-seed energy
        #[arg(long, default_value_t = power::DEFAULT_MAX_ENERGY)]
        max_energy: u32,

        /// Interestingness implementation version
        #[arg(long, default_value = "base")]
        isinteresting_version: String,

        /// Mutator implementation version
        #[arg(long, default_value = "base")]
        mutator_version: String,

        /// Parser implementation version
        #[arg(long, default_value = "base")]
        parser_version: String,

        /// Power scheduler implementation version
        #[arg(long, default_value = "base")]
        power_scheduler_version: String,

        /// Seed corpus implementation version
        #[arg(long, default_value = "base")]
        seed_corpus_version: String,
    },

    /// Summarize the seed corpus
    Corpus {
        /// Seed corpus directory (holds manifest.json)
        #[arg(long, default_value = "seed_corpus")]
        corpus_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            target,
            scheduler,
            mutator,
            iterations,
            hours,
            timeout,
            seed,
            workers,
            db,
            corpus_dir,
            targets_dir,
            targets_file,
            promote_threshold,
            min_energy,
            max_energy,
            isinteresting_version,
            mutator_version,
            parser_version,
            power_scheduler_version,
            seed_corpus_version,
        } => {
            let scheduler_kind: SchedulerKind =
                scheduler.parse().map_err(|e| anyhow::anyhow!("{}", e))?;
            let mutator_kind: MutatorKind =
                mutator.parse().map_err(|e| anyhow::anyhow!("{}", e))?;
            let budget = Budget::from_args(iterations, hours)?;
            let config = FuzzConfig {
                target,
                scheduler_kind,
                mutator_kind,
                budget,
                timeout_secs: timeout,
                rng_seed: seed,
                workers,
                db_path: db,
                corpus_dir,
                targets_dir,
                targets_file,
                promote_threshold,
                min_energy,
                max_energy,
                versions: SubsystemVersions {
                    isinteresting: isinteresting_version,
                    mutator: mutator_version,
                    parser: parser_version,
                    power_scheduler: power_scheduler_version,
                    seed_corpus: seed_corpus_version,
                },
            };
            run_campaign(config)
        }

        Commands::Corpus { corpus_dir } => summarize_corpus(&corpus_dir),
    }
}

fn run_campaign(config: FuzzConfig) -> Result<()> {
    config.validate()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("failed to install shutdown handler")?;
    }

    let registry = match &config.targets_file {
        Some(path) => TargetRegistry::with_overrides(path)?,
        None => TargetRegistry::builtin(),
    };
    let runner = CommandTarget::new(
        registry,
        &config.targets_dir,
        &config.target,
        Duration::from_secs_f64(config.timeout_secs),
    )?;

    let Some(mut campaign) = Campaign::new(config, Arc::new(runner), shutdown)? else {
        println!("No seeds available for target; nothing to do.");
        return Ok(());
    };

    let summary = campaign.run()?;
    println!("Campaign completed: {}", summary.stop);
    println!("  iterations: {}", summary.iterations);
    println!("  runs_recorded: {}", summary.runs_recorded);
    println!("  promotions: {}", summary.promotions);
    Ok(())
}

fn summarize_corpus(corpus_dir: &std::path::Path) -> Result<()> {
    let corpus = SeedCorpus::load(corpus_dir)
        .with_context(|| format!("failed to load corpus from {}", corpus_dir.display()))?;
    for summary in corpus.summary() {
        let counts: Vec<String> = summary
            .bucket_counts
            .iter()
            .map(|(bucket, count)| format!("{}={}", bucket, count))
            .collect();
        println!(
            "{}: total={} buckets={{ {} }}",
            summary.family,
            summary.total_seeds,
            counts.join(", ")
        );
    }
    Ok(())
}
