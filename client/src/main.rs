use anyhow::{Context, Result};
use burrow::config::BurrowConfig;
use burrow::credentials::{CredentialResolver, VercelCredentials};
use burrow::provision::ProvisioningService;
use burrow::sandbox::SandboxApi;
use burrow::session::SessionManager;
use burrow::store::{FileSessionStore, SessionStore};
use burrow::tunnel::{validate_port, Tunnel, TunnelOptions};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burrow")]
#[command(author = "Burrow Team")]
#[command(version)]
#[command(about = "Expose a local HTTP service through a Vercel Sandbox", long_about = None)]
struct Cli {
    /// Local port to expose
    port: u32,

    /// Leave the tunnel running (start) or tear down a running one (stop)
    #[arg(value_enum)]
    action: Option<Action>,

    /// Path to burrow.yml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Action {
    Start,
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "burrow=debug" } else { "burrow=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let port = validate_port(cli.port)?;
    let config = BurrowConfig::resolve(cli.config.as_deref())?;

    let credentials = VercelCredentials::discover()?.resolve()?;
    let provisioner: Arc<dyn ProvisioningService> =
        Arc::new(SandboxApi::new(&config.api_url, credentials)?);
    let store: Arc<dyn SessionStore> = Arc::new(match &config.session_file {
        Some(path) => FileSessionStore::new(path.clone()),
        None => FileSessionStore::default(),
    });

    match cli.action {
        Some(Action::Stop) => stop(port, &config, provisioner, store).await,
        Some(Action::Start) => run(port, false, &config, provisioner, store).await,
        None => run(port, true, &config, provisioner, store).await,
    }
}

async fn stop(
    port: u16,
    config: &BurrowConfig,
    provisioner: Arc<dyn ProvisioningService>,
    store: Arc<dyn SessionStore>,
) -> Result<()> {
    let mut session = SessionManager::new(provisioner, store, config.context_spec());
    match session
        .stop_port(port)
        .await
        .with_context(|| format!("Failed to stop tunnel for port {}", port))?
    {
        Some(id) => println!("Stopped sandbox {} for port {}", id, port),
        None => println!("No tunnel running for port {}", port),
    }
    Ok(())
}

async fn run(
    port: u16,
    auto_shutdown: bool,
    config: &BurrowConfig,
    provisioner: Arc<dyn ProvisioningService>,
    store: Arc<dyn SessionStore>,
) -> Result<()> {
    let options = TunnelOptions { port, auto_shutdown };
    let mut tunnel = Tunnel::open(options, config, provisioner, store)
        .await
        .context("Failed to open tunnel")?;

    print_banner(tunnel.url(), port, tunnel.session().reused);
    if auto_shutdown {
        println!("Press Ctrl+C to stop the tunnel\n");
    } else {
        println!("Started at {}", tunnel.url());
        println!("Run `burrow {} stop` to tear it down\n", port);
    }

    let ended = tokio::select! {
        _ = shutdown_signal() => None,
        end = tunnel.supervise() => Some(end),
    };

    match ended {
        None if auto_shutdown => {
            info!("Shutting down...");
            tunnel.shutdown().await.context("Failed to stop sandbox")?;
            Ok(())
        }
        None => {
            info!("Detaching; the sandbox keeps running");
            Ok(())
        }
        Some(end) => {
            let end = end.context("Failed to stop sandbox")?;
            if !auto_shutdown {
                warn!("Sandbox left running; run `burrow {} stop` to tear it down", port);
            }
            error!("Tunnel closed: {}", end);
            anyhow::bail!("Tunnel closed: {}", end)
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_banner(url: &str, port: u16, reused: bool) {
    let sandbox = if reused { "reused" } else { "new" };
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  Burrow Active                                               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Public URL: {:<47} ║", url);
    println!("║  Local:      http://localhost:{:<30} ║", port);
    println!("║  Sandbox:    {:<47} ║", sandbox);
    println!("╚══════════════════════════════════════════════════════════════╝\n");
}
