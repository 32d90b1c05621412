mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use edgeflow::domain::types::WorkflowId;
use edgeflow::event_store::{FileBackend, StorageBackend, WorkflowEventStore};
use edgeflow::recovery::CheckpointStore;
use edgeflow::EngineConfig;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::ValidateConfig { path, print } => validate_config(&path, print),
        Command::Replay {
            dir,
            workflow,
            events,
        } => replay(&dir, workflow.map(WorkflowId::from), events).await,
    }
}

fn validate_config(path: &Path, print: bool) -> Result<()> {
    let config = EngineConfig::load(path)?;
    println!("{}: ok", path.display());
    if print {
        let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
        print!("{yaml}");
    }
    Ok(())
}

async fn replay(dir: &Path, workflow: Option<WorkflowId>, show_events: bool) -> Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("Event log directory not found: {}", dir.display());
    }
    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(dir));
    let store = WorkflowEventStore::new(backend.clone(), 0);

    let Some(workflow_id) = workflow else {
        return list_workflows(&store).await;
    };

    if show_events {
        let events = store
            .read(&workflow_id, 1)
            .await
            .with_context(|| format!("Failed to read events of {workflow_id}"))?;
        for record in events {
            println!(
                "{:>6}  {}  {}",
                record.sequence, record.recorded_at, record.event_type
            );
        }
    }

    let snapshot = store
        .replay(&workflow_id)
        .await
        .with_context(|| format!("Failed to replay {workflow_id}"))?
        .with_context(|| format!("Workflow {workflow_id} has no events in {}", dir.display()))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    let checkpoints = CheckpointStore::new(backend, EngineConfig::default().recovery.checkpoints_kept)
        .list(&workflow_id)
        .await
        .with_context(|| format!("Failed to read checkpoints of {workflow_id}"))?;
    for checkpoint in checkpoints {
        println!(
            "checkpoint {}  sequence {}  {}",
            checkpoint.id, checkpoint.sequence, checkpoint.label
        );
    }
    Ok(())
}

async fn list_workflows(store: &WorkflowEventStore) -> Result<()> {
    let mut ids = store.workflow_ids().await?;
    ids.sort();

    for workflow_id in ids {
        match store.replay(&workflow_id).await {
            Ok(Some(snapshot)) => println!(
                "{workflow_id}  {}  sequence {}",
                snapshot.status(),
                snapshot.sequence
            ),
            Ok(None) => println!("{workflow_id}  (empty)"),
            Err(err) => println!("{workflow_id}  unreadable: {err}"),
        }
    }
    Ok(())
}
