mod action;
mod auth;
mod bridge;
mod context;
mod controller;
mod error;
mod handshake;
mod pipeline;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use common::registry::{fields, HttpRegistry, MemoryRegistry};
use common::{Registry, AGENTS};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::KeypairTokenIssuer;
use crate::bridge::AdbBridge;
use crate::context::AgentContext;
use crate::controller::Controller;
use crate::state::{AgentSettings, AgentStatus};

#[derive(Debug, Parser)]
#[command(name = "devicelab-agent")]
#[command(about = "Enrolls and supervises the Android devices attached to this host", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent (default when no subcommand is given)
    Run {
        /// Registry base URL, or `memory` for an in-process registry
        #[arg(long)]
        registry_url: Option<String>,
    },
    /// Update persistent agent settings
    Configure {
        #[arg(long)]
        auto_enroll: Option<bool>,
        #[arg(long)]
        enable_tcp: Option<bool>,
        #[arg(long)]
        registry_url: Option<String>,
        #[arg(long)]
        service_apk: Option<PathBuf>,
        #[arg(long)]
        adb_path: Option<PathBuf>,
    },
    /// Print the agent id and signing key
    Whoami,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run { registry_url: None }) {
        Commands::Run { registry_url } => {
            let shutdown = setup_shutdown_handler();
            run_agent(registry_url, shutdown).await
        }
        Commands::Configure { auto_enroll, enable_tcp, registry_url, service_apk, adb_path } => {
            let mut settings = state::load_settings();
            if let Some(v) = auto_enroll {
                settings.auto_enroll = v;
            }
            if let Some(v) = enable_tcp {
                settings.enable_tcp = v;
            }
            if registry_url.is_some() {
                settings.registry_url = registry_url;
            }
            if service_apk.is_some() {
                settings.service_apk = service_apk;
            }
            if adb_path.is_some() {
                settings.adb_path = adb_path;
            }
            state::save_settings(&settings)?;
            println!("settings saved to {}", state::agent_data_dir().join("agent.toml").display());
            Ok(())
        }
        Commands::Whoami => {
            let keys = state::load_or_create_keypair()?;
            println!("agent id:   {}", state::load_or_create_agent_id());
            println!("public key: {}", keys.public_bs58);
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

async fn run_agent(registry_url: Option<String>, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
    let mut settings: AgentSettings = state::load_settings();
    if registry_url.is_some() {
        settings.registry_url = registry_url;
    }
    let agent_id = state::load_or_create_agent_id();
    let keypair = state::load_or_create_keypair()?;
    let bridge = Arc::new(AdbBridge::locate(settings.adb_path.as_deref())?);

    let Some(url) = settings.registry_url.clone() else {
        warn!("no registry configured; run `devicelab-agent configure --registry-url <url>`");
        return Ok(());
    };
    let registry = open_registry(&url);

    let ctx = Arc::new(AgentContext {
        agent_id: agent_id.clone(),
        tokens: Arc::new(KeypairTokenIssuer::new(keypair, agent_id.clone(), settings.device_token_ttl_secs)),
        settings,
        bridge,
        registry: registry.clone(),
    });

    let (status_tx, status_rx) = watch::channel(AgentStatus::NotLogged);
    let controller = Controller::new(ctx.clone());
    tokio::spawn(controller.clone().run(status_rx));
    tokio::spawn(log_device_views(controller.subscribe()));

    let session = async {
        loop {
            status_tx.send_replace(AgentStatus::Configuring);
            match announce_agent(registry.as_ref(), &agent_id, "online").await {
                Ok(()) => {
                    info!(agent=%agent_id, registry=%url, "agent registered");
                    status_tx.send_replace(AgentStatus::Ready);
                    return;
                }
                Err(e) => {
                    warn!(error=%e, "agent registration failed, retrying");
                    status_tx.send_replace(AgentStatus::NotLogged);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    };

    tokio::pin!(shutdown);
    tokio::select! {
        _ = session => {}
        _ = &mut shutdown => {
            info!("Shutdown signal received before registration completed");
            return Ok(());
        }
    }

    (&mut shutdown).await;
    info!("Shutdown signal received, stopping agent gracefully");
    status_tx.send_replace(AgentStatus::NotLogged);
    if let Err(e) = announce_agent(registry.as_ref(), &agent_id, "offline").await {
        warn!(error=%e, "failed to mark agent offline");
    }
    Ok(())
}

async fn announce_agent(registry: &dyn Registry, agent_id: &str, status: &str) -> Result<(), common::RegistryError> {
    let name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    registry
        .set(AGENTS, agent_id, fields(json!({"name": name, "status": status})), true)
        .await
}

async fn log_device_views(mut views: watch::Receiver<Vec<controller::DeviceView>>) {
    while views.changed().await.is_ok() {
        let snapshot = views.borrow_and_update().clone();
        for view in &snapshot {
            let last = view.action.as_ref().and_then(|a| a.last_entry()).map(|e| e.text);
            let observed = view.observed.as_ref();
            debug!(
                device=%view.label(),
                connection=?observed.map(|o| o.handle.kind),
                identity=?observed.and_then(|o| o.logs.back()),
                action=?view.action_type,
                running=view.action.as_ref().is_some_and(|a| !a.is_terminal()),
                last=?last,
                "device view"
            );
        }
    }
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
