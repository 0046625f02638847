//! airlift — cloud batch orchestrator CLI.
//!
//! Loads a run configuration, provisions instances, deploys environments
//! and payloads, launches the jobs and waits for them to finish. The
//! binary ships with the in-memory backend for local dry runs; vendor
//! backends plug in through the `airlift-remote` traits when embedding
//! the engine as a library.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use airlift_core::config::AirliftConfig;
use airlift_core::entity::StateMask;
use airlift_engine::Orchestrator;
use airlift_remote::{MemoryCloud, MemoryExecutor};

#[derive(Parser)]
#[command(
    name = "airlift",
    about = "Airlift — provisions instances, deploys environments and fans jobs out over them",
    version,
)]
struct Cli {
    /// Path to the run configuration.
    #[arg(short, long, default_value = "airlift.toml")]
    config: PathBuf,

    /// Snapshot file used to resume runs across invocations.
    #[arg(long, default_value = "airlift-state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Provision, deploy, launch and wait for every job (default).
    Run,
    /// Restore the previous run from the snapshot and wait for it.
    Wait,
    /// Clear remote deployment markers so the next run re-uploads.
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,airlift=debug".parse().expect("static filter")),
        )
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Configuration errors and phase failures end up here; they
            // are fatal and never retried.
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = AirliftConfig::from_file(&cli.config)?;
    let backend = MemoryCloud::new();
    let executor = MemoryExecutor::new();
    let mut orch = Orchestrator::new(config, backend, executor)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&mut orch, &cli.state).await,
        Command::Wait => wait(&mut orch, &cli.state).await,
        Command::Reset => reset(&mut orch, &cli.state).await,
    }
}

async fn run(
    orch: &mut Orchestrator<MemoryCloud, MemoryExecutor>,
    state: &Path,
) -> anyhow::Result<()> {
    orch.try_restore(state).await;

    info!("starting instances");
    orch.start().await?;
    orch.wait_ready().await?;

    info!("assigning jobs");
    orch.assign().await?;

    info!("deploying");
    orch.deploy().await?;

    info!("launching jobs");
    orch.run().await?;
    orch.save_state(state).await?;

    info!("waiting for completion");
    orch.wait(StateMask::FINISHED).await?;
    orch.save_state(state).await?;

    info!(processes = orch.processes().len(), "run finished");
    Ok(())
}

async fn wait(
    orch: &mut Orchestrator<MemoryCloud, MemoryExecutor>,
    state: &Path,
) -> anyhow::Result<()> {
    if !orch.try_restore(state).await {
        anyhow::bail!("no usable snapshot at {}", state.display());
    }
    if orch.processes().is_empty() {
        info!("snapshot tracks no processes, nothing to wait for");
        return Ok(());
    }
    orch.wait(StateMask::FINISHED).await?;
    orch.save_state(state).await?;
    info!("all tracked processes finished");
    Ok(())
}

async fn reset(
    orch: &mut Orchestrator<MemoryCloud, MemoryExecutor>,
    state: &Path,
) -> anyhow::Result<()> {
    orch.try_restore(state).await;
    orch.start().await?;
    orch.wait_ready().await?;
    orch.reset().await?;
    info!("deployment markers cleared");
    Ok(())
}
