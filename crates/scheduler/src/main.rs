mod aggregator;
mod error;
mod scheduler;
#[cfg(test)]
mod testing;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use common::registry::{HttpRegistry, MemoryRegistry};
use common::{now_millis, Registry};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::scheduler::JobRequest;
use crate::watcher::TaskWatcher;

#[derive(Debug, Parser)]
#[command(name = "devicelab-scheduler")]
#[command(about = "Creates test jobs and tracks their tasks to completion", version)]
struct Cli {
    /// Registry base URL, or `memory` for an in-process registry
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    registry_url: String,
    /// Seconds between two timeout sweeps
    #[arg(long, global = true, default_value_t = 60)]
    sweep_interval_secs: u64,
    /// Deadline given to new tasks
    #[arg(long, global = true, default_value_t = 3600)]
    task_timeout_secs: u64,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch task updates and sweep timed out tasks (default)
    Serve,
    /// Create a job for a debug artifact
    CreateJob {
        /// Artifact reference, e.g. applications/app/versions/v1/artifacts/apk
        artifact: String,
        /// Device id to include (repeatable)
        #[arg(long = "device")]
        devices: Vec<String>,
        /// Device group to include (repeatable)
        #[arg(long = "group")]
        groups: Vec<String>,
        /// Number of tasks; 0 runs on every candidate device
        #[arg(long, default_value_t = 0)]
        count: usize,
    },
    /// Run a single timeout sweep and exit
    Sweep,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let registry = open_registry(&cli.registry_url);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            serve(registry, Duration::from_secs(cli.sweep_interval_secs.max(1))).await
        }
        Commands::CreateJob { artifact, devices, groups, count } => {
            let request = JobRequest { artifact, devices, groups, devices_count: count };
            let created = scheduler::create_job(
                registry.as_ref(),
                &request,
                Duration::from_secs(cli.task_timeout_secs),
            )
            .await?;
            println!("job {} created with {} task(s)", created.job_id, created.task_ids.len());
            Ok(())
        }
        Commands::Sweep => {
            let count = aggregator::check_task_timeout(registry.as_ref(), now_millis()).await?;
            println!("{count} task(s) timed out");
            Ok(())
        }
    }
}

fn open_registry(url: &str) -> Arc<dyn Registry> {
    if url == "memory" {
        Arc::new(MemoryRegistry::new())
    } else {
        Arc::new(HttpRegistry::new(url))
    }
}

async fn serve(registry: Arc<dyn Registry>, sweep_every: Duration) -> anyhow::Result<()> {
    let watcher = tokio::spawn(TaskWatcher::new(registry.clone()).with_retry_interval(sweep_every).run());

    let mut tick = tokio::time::interval(sweep_every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = setup_shutdown_handler();
    tokio::pin!(shutdown);

    info!(sweep_every=?sweep_every, "scheduler running");
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = aggregator::check_task_timeout(registry.as_ref(), now_millis()).await {
                    warn!(error=%e, "timeout sweep failed");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping scheduler");
                break;
            }
        }
    }
    watcher.abort();
    Ok(())
}

async fn setup_shutdown_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error=%e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
