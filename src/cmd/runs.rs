//! Offline run inspection: `studio runs`.

use std::sync::Arc;

use anyhow::{Context, Result};

use super::super::RunsCommands;
use brand_studio::config::{StorageBackend, StudioConfig};
use brand_studio::studio::models::{RunId, RunRecord, RunStatus};
use brand_studio::studio::store::{RunStore, open_store};

/// How many trailing log lines `runs show` prints.
const SHOW_LOG_TAIL: usize = 20;

pub async fn cmd_runs(
    project_dir: &std::path::Path,
    verbose: bool,
    command: Option<RunsCommands>,
) -> Result<()> {
    let config = StudioConfig::new(project_dir.to_path_buf())?;
    let _guard = if verbose {
        brand_studio::telemetry::init(&config.toml.logging, true)?
    } else {
        None
    };

    let storage = &config.toml.storage;
    if storage.backend == StorageBackend::Memory {
        println!("The memory backend keeps no runs between processes.");
        return Ok(());
    }
    if !storage.db_path.exists() {
        println!("No runs recorded yet ({} does not exist).", storage.db_path.display());
        return Ok(());
    }
    let store = open_store(storage)?;

    match command.unwrap_or(RunsCommands::List {
        status: None,
        json: false,
    }) {
        RunsCommands::List { status, json } => list(&store, status.as_deref(), json).await,
        RunsCommands::Show { id, json } => show(&store, &id, json).await,
    }
}

async fn list(store: &Arc<dyn RunStore>, status: Option<&str>, json: bool) -> Result<()> {
    let runs = match status {
        Some(raw) => {
            let status: RunStatus = raw.parse().map_err(anyhow::Error::msg)?;
            store.list_by_status(&[status]).await?
        }
        None => store.list().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<7}  {:<12}  CREATED",
        "RUN ID", "CLIENT", "MODE", "STATUS"
    );
    for run in &runs {
        println!(
            "{:<36}  {:<20}  {:<7}  {:<12}  {}",
            run.run_id,
            run.client_id,
            run.mode.as_str(),
            run.status.as_str(),
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn show(store: &Arc<dyn RunStore>, id: &str, json: bool) -> Result<()> {
    let run_id: RunId = id.parse().map_err(anyhow::Error::msg)?;
    let run = store
        .get(run_id)
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }
    Ok(())
}

fn print_run(run: &RunRecord) {
    println!("Run {}", run.run_id);
    println!("  client:  {}", run.client_id);
    println!("  mode:    {}", run.mode);
    println!("  status:  {}", run.status);
    println!("  created: {}", run.created_at.to_rfc3339());
    if let Some(ended) = run.ended_at {
        println!("  ended:   {}", ended.to_rfc3339());
    }
    if let Some(error) = &run.error {
        println!("  error:   {}", error);
    }

    println!();
    println!("Stages:");
    for stage in &run.stages {
        match &stage.message {
            Some(msg) => println!("  {:<13} {:<10} {}", stage.label, stage.status.as_str(), msg),
            None => println!("  {:<13} {}", stage.label, stage.status.as_str()),
        }
    }

    if let Some(review) = &run.review_state {
        println!();
        println!(
            "Review: {} (required: {})",
            review.status.as_str(),
            review.required
        );
    }

    if !run.artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for artifact in &run.artifacts {
            println!("  [{}] {}  {}", artifact.kind.as_str(), artifact.name, artifact.path);
        }
    }

    if !run.logs.is_empty() {
        println!();
        println!("Log (last {}):", SHOW_LOG_TAIL.min(run.logs.len()));
        let skip = run.logs.len().saturating_sub(SHOW_LOG_TAIL);
        for entry in run.logs.iter().skip(skip) {
            println!(
                "  {} {:<5} [{}] {}",
                entry.time.format("%H:%M:%S"),
                entry.level.as_str(),
                entry.stage,
                entry.message
            );
        }
    }
}
