//! Task CLI subcommands: create, inspect and relabel tasks.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use super::{expand_patterns, report_failures};
use crate::domain::Task;
use crate::engine::{Engine, FailurePolicy};

/// Task-related subcommands
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Create a task and import its data files
    Create {
        /// Task name
        name: String,

        /// Kind of entity being labeled (e.g. "company")
        #[arg(short, long)]
        entity_type: String,

        /// Labels to annotate (comma-separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        labels: Vec<String>,

        /// Annotator ids (comma-separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        annotators: Vec<String>,

        /// JSONL data files or glob patterns
        #[arg(short, long, required = true)]
        data: Vec<String>,

        /// Explicit task id (generated if not specified)
        #[arg(long)]
        id: Option<String>,
    },

    /// Show a task
    Show {
        task_id: String,
    },

    /// List tasks
    List,

    /// Replace a task's label set
    SetLabels {
        task_id: String,

        /// New labels (comma-separated)
        #[arg(value_delimiter = ',', required = true)]
        labels: Vec<String>,
    },
}

pub async fn execute(engine: &Engine, command: TaskCommands, fail_fast: bool) -> Result<()> {
    match command {
        TaskCommands::Create {
            name,
            entity_type,
            labels,
            annotators,
            data,
            id,
        } => {
            let files = expand_patterns(&data)?;
            create(engine, name, entity_type, labels, annotators, files, id, fail_fast).await
        }
        TaskCommands::Show { task_id } => show(engine, &task_id).await,
        TaskCommands::List => list(engine).await,
        TaskCommands::SetLabels { task_id, labels } => {
            let task = engine.set_task_labels(&task_id, labels).await?;
            println!("Labels for {}: {}", task.id, task.labels.join(", "));
            println!("Run `annokit sweep {}` to retire requests for dropped labels.", task.id);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn create(
    engine: &Engine,
    name: String,
    entity_type: String,
    labels: Vec<String>,
    annotators: Vec<String>,
    files: Vec<PathBuf>,
    id: Option<String>,
    fail_fast: bool,
) -> Result<()> {
    let mut task = Task::new(name, entity_type)
        .with_labels(labels)
        .with_annotators(annotators)
        .with_data_files(files.iter().map(|p| p.display().to_string()));
    if let Some(id) = id {
        task = task.with_id(id);
    }

    let task = engine.create_task(task).await?;
    println!("Created task {} ({})", task.id, task.name);

    let policy = if fail_fast {
        FailurePolicy::FailFast
    } else {
        FailurePolicy::Isolate
    };
    for file in &files {
        let outcome = engine
            .import_datapoints(&task.id, file, policy)
            .await
            .with_context(|| format!("Failed to import {}", file.display()))?;
        println!("  {}: {} datapoints", file.display(), outcome.value);
        report_failures(&outcome.failures);
    }

    Ok(())
}

async fn show(engine: &Engine, task_id: &str) -> Result<()> {
    let task = engine.task(task_id).await?;

    println!("Task ID:     {}", task.id);
    println!("Name:        {}", task.name);
    println!("Entity type: {}", task.entity_type);
    println!("Labels:      {}", task.labels.join(", "));
    println!("Annotators:  {}", task.annotators.join(", "));
    println!("Data files:");
    for file in &task.data_files {
        println!("  {}", file);
    }
    println!("Created:     {}", task.created_at);

    Ok(())
}

async fn list(engine: &Engine) -> Result<()> {
    let tasks = engine.list_tasks().await?;

    if tasks.is_empty() {
        println!("No tasks found");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<12} {:<6}", "TASK ID", "NAME", "ENTITY", "LABELS");
    println!("{}", "-".repeat(82));
    for task in tasks {
        println!(
            "{:<38} {:<24} {:<12} {:<6}",
            task.id,
            task.name,
            task.entity_type,
            task.labels.len()
        );
    }

    Ok(())
}
