//! Command-line interface for annokit.
//!
//! Provides commands for managing tasks, generating and serving
//! annotation requests, recording answers, and reporting agreement,
//! contention and exported corpora.

use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{self, ResolvedConfig, StoreBackend};
use crate::domain::AnnotationContext;
use crate::engine::{
    render_matrix, write_jsonl, Engine, FailurePolicy, GenerateOptions, StaleSweeper, UnitFailure,
};
use crate::store::open_store;

pub mod task;

/// annokit - annotation consensus and agreement engine
#[derive(Parser, Debug)]
#[command(name = "annokit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Store backend override (jsonl, sqlite, memory)
    #[arg(long, global = true)]
    pub store: Option<String>,

    /// Stop at the first failing unit instead of reporting and continuing
    #[arg(long, global = true)]
    pub fail_fast: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage tasks
    Task {
        #[command(subcommand)]
        command: task::TaskCommands,
    },

    /// Import JSONL data files into a task
    Import {
        task_id: String,

        /// Files or glob patterns
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Generate annotation requests for an annotator
    Generate {
        task_id: String,

        annotator: String,

        /// Entity type to request labels for
        #[arg(short, long)]
        entity_type: Option<String>,

        /// Max new requests for this annotator
        #[arg(long, env = "ANNOKIT_MAX_PER_ANNOTATOR")]
        max_per_annotator: Option<usize>,

        /// Max outstanding requests per (entity, label)
        #[arg(long, env = "ANNOKIT_MAX_PER_DATAPOINT")]
        max_per_datapoint: Option<usize>,
    },

    /// Show the next pending request for an annotator
    Next {
        task_id: String,

        annotator: String,

        /// Request currently on screen; the scan starts after it
        #[arg(short, long)]
        current: Option<String>,
    },

    /// Record an annotation (-1 negative, 0 unsure, 1 positive)
    Annotate {
        task_id: String,

        annotator: String,

        request_id: String,

        #[arg(allow_negative_numbers = true)]
        value: i32,

        /// Vote weight
        #[arg(short, long)]
        weight: Option<f64>,

        /// Extra context as a JSON object
        #[arg(long)]
        context: Option<String>,
    },

    /// Mark requests outside the task's labels stale
    Sweep {
        task_id: String,
    },

    /// Delete stale requests
    Purge {
        task_id: String,
    },

    /// Show pairwise Cohen's kappa per label
    Agreement {
        task_id: String,

        /// Only this label (all task labels if not specified)
        #[arg(short, long)]
        label: Option<String>,
    },

    /// Export the labeled corpus as JSONL
    Export {
        task_id: String,

        /// Weighted snapshot for a single label
        #[arg(short, long)]
        label: Option<String>,

        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show annotation statistics
    Stats {
        task_id: String,
    },

    /// Show per-entity answers, contention and majority vote for a label
    Contention {
        task_id: String,

        label: String,

        /// Maximum number of rows to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Run the stale sweeper until interrupted
    Sweeper {
        /// Tasks to sweep (all tasks if not specified)
        #[arg(short, long, value_delimiter = ',')]
        tasks: Vec<String>,

        /// Seconds between passes (config value if not specified)
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let mut cfg = config::config()?.clone();
        if let Some(ref backend) = self.store {
            cfg.store_backend = backend.parse::<StoreBackend>()?;
        }

        if let Commands::Config = self.command {
            return show_config(&cfg);
        }

        let store = open_store(&cfg)
            .with_context(|| format!("Failed to open {} store", cfg.store_backend))?;
        let engine = Engine::new(store);
        let policy = if self.fail_fast {
            FailurePolicy::FailFast
        } else {
            FailurePolicy::Isolate
        };

        match self.command {
            Commands::Task { command } => task::execute(&engine, command, self.fail_fast).await,
            Commands::Import { task_id, patterns } => {
                import(&engine, &task_id, &patterns, policy).await
            }
            Commands::Generate {
                task_id,
                annotator,
                entity_type,
                max_per_annotator,
                max_per_datapoint,
            } => {
                let options = GenerateOptions {
                    max_per_annotator: max_per_annotator.unwrap_or(cfg.assignment.max_per_annotator),
                    max_per_datapoint: max_per_datapoint.unwrap_or(cfg.assignment.max_per_datapoint),
                    entity_type,
                };
                let created = engine.generate_requests(&task_id, &annotator, &options).await?;
                println!("Generated {} requests for {}", created, annotator);
                Ok(())
            }
            Commands::Next {
                task_id,
                annotator,
                current,
            } => next(&engine, &task_id, &annotator, current.as_deref()).await,
            Commands::Annotate {
                task_id,
                annotator,
                request_id,
                value,
                weight,
                context,
            } => {
                let context = context
                    .map(|raw| serde_json::from_str::<AnnotationContext>(&raw))
                    .transpose()
                    .context("Invalid --context JSON")?;
                let record = engine
                    .record_annotation(&task_id, &annotator, &request_id, value, weight, context)
                    .await?;
                println!(
                    "Recorded {} = {} for {} ({})",
                    record.label, record.value, record.entity, record.annotator_id
                );
                Ok(())
            }
            Commands::Sweep { task_id } => {
                let swept = engine.sweep_stale(&task_id).await?;
                println!("Marked {} requests stale", swept);
                Ok(())
            }
            Commands::Purge { task_id } => {
                let purged = engine.purge_stale(&task_id).await?;
                println!("Purged {} stale requests", purged);
                Ok(())
            }
            Commands::Agreement { task_id, label } => {
                agreement(&engine, &task_id, label.as_deref(), policy).await
            }
            Commands::Export {
                task_id,
                label,
                output,
            } => export(&engine, &task_id, label.as_deref(), output, policy).await,
            Commands::Stats { task_id } => {
                let stats = engine.annotation_statistics(&task_id).await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
                Ok(())
            }
            Commands::Contention {
                task_id,
                label,
                limit,
            } => contention(&engine, &task_id, &label, limit, policy).await,
            Commands::Sweeper { tasks, interval } => {
                let interval = interval
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| cfg.sweep.interval());
                run_sweeper(engine, tasks, interval).await
            }
            Commands::Config => show_config(&cfg),
        }
    }
}

/// Expand file arguments that may be glob patterns
pub(crate) fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for pattern in patterns {
        let matches: Vec<PathBuf> = glob::glob(pattern)
            .with_context(|| format!("Invalid pattern: {}", pattern))?
            .filter_map(|entry| entry.ok())
            .collect();

        if matches.is_empty() {
            // Not a pattern (or nothing matched): keep the literal path so
            // the import reports it
            files.push(PathBuf::from(pattern));
        } else {
            files.extend(matches);
        }
    }

    Ok(files)
}

/// Print unit failures to stderr
pub(crate) fn report_failures(failures: &[UnitFailure]) {
    if failures.is_empty() {
        return;
    }
    eprintln!("{} units failed:", failures.len());
    for failure in failures {
        eprintln!("  {}: {}", failure.unit, failure.reason);
    }
}

async fn import(
    engine: &Engine,
    task_id: &str,
    patterns: &[String],
    policy: FailurePolicy,
) -> Result<()> {
    for file in expand_patterns(patterns)? {
        let outcome = engine
            .import_datapoints(task_id, &file, policy)
            .await
            .with_context(|| format!("Failed to import {}", file.display()))?;
        println!("{}: {} datapoints", file.display(), outcome.value);
        report_failures(&outcome.failures);
    }
    Ok(())
}

async fn next(engine: &Engine, task_id: &str, annotator: &str, current: Option<&str>) -> Result<()> {
    let Some(request) = engine.next_request(task_id, annotator, current).await? else {
        println!("No pending requests for {}", annotator);
        return Ok(());
    };

    println!("Request: {}", request.request_id);
    println!("Entity:  {} ({})", request.entity, request.entity_type);
    if let Some(name) = &request.name {
        println!("Name:    {}", name);
    }
    println!("Label:   {}", request.label);
    if let Some(text) = &request.context.text {
        println!();
        println!("{}", text);
    }
    Ok(())
}

async fn agreement(
    engine: &Engine,
    task_id: &str,
    label: Option<&str>,
    policy: FailurePolicy,
) -> Result<()> {
    let outcomes = match label {
        Some(label) => vec![engine.agreement_for_task(task_id, label, policy).await?],
        None => engine.agreement_report(task_id, policy).await?,
    };

    for outcome in outcomes {
        println!("{}", render_matrix(&outcome.value));
        report_failures(&outcome.failures);
    }
    Ok(())
}

async fn export(
    engine: &Engine,
    task_id: &str,
    label: Option<&str>,
    output: Option<PathBuf>,
    policy: FailurePolicy,
) -> Result<()> {
    let outcome = match label {
        Some(label) => engine.export_for_label(task_id, label, policy).await?,
        None => engine.export_labeled_corpus(task_id, policy).await?,
    };

    match output {
        Some(path) => {
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_jsonl(&outcome.value, BufWriter::new(file))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {} examples to {}", outcome.value.len(), path.display());
        }
        None => {
            write_jsonl(&outcome.value, io::stdout().lock()).context("Failed to write to stdout")?;
        }
    }

    report_failures(&outcome.failures);
    Ok(())
}

async fn contention(
    engine: &Engine,
    task_id: &str,
    label: &str,
    limit: usize,
    policy: FailurePolicy,
) -> Result<()> {
    let outcome = engine.contention_report(task_id, label, policy).await?;

    if outcome.value.is_empty() {
        println!("No annotations for {}", label);
    } else {
        println!("{:<32} {:>8} {:>9}  {}", "ENTITY", "ENTROPY", "MAJORITY", "VALUES");
        println!("{}", "-".repeat(80));
        for row in outcome.value.iter().take(limit) {
            let values: Vec<String> = row
                .values
                .iter()
                .map(|(annotator, value)| format!("{}={}", annotator, value))
                .collect();
            let majority = row
                .majority_vote
                .map(|v| v.to_string())
                .unwrap_or_default();
            println!(
                "{:<32} {:>8.3} {:>9}  {}",
                row.entity,
                row.entropy,
                majority,
                values.join(" ")
            );
        }
    }

    report_failures(&outcome.failures);
    Ok(())
}

async fn run_sweeper(engine: Engine, tasks: Vec<String>, interval: Duration) -> Result<()> {
    let handle = StaleSweeper::new(engine, interval).with_tasks(tasks).spawn();
    eprintln!("Sweeping every {}s; press Ctrl-C to stop", interval.as_secs());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let report = handle.stop().await?;
    eprintln!(
        "Stopped after {} passes: {} swept, {} purged, {} errors",
        report.passes, report.swept, report.purged, report.errors
    );
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("annokit configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Task logs: {}", cfg.tasks_dir().display());
    println!("  Database:  {}", cfg.database_path().display());
    println!();
    println!("Store backend: {}", cfg.store_backend);
    println!();
    println!("Assignment:");
    println!("  Max per annotator: {}", cfg.assignment.max_per_annotator);
    println!("  Max per datapoint: {}", cfg.assignment.max_per_datapoint);
    println!();
    println!("Sweep interval: {}s", cfg.sweep.interval_seconds);

    Ok(())
}
