//! Run the honeypot until interrupted.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{Config, ServerConfig, TransportKind};
use crate::sandbox::{DockerRuntime, SandboxPool, SandboxRuntime};
use crate::server::{AuthenticationManager, SshTransport, TcpTransport, Transport};
use crate::session::SessionOrchestrator;

pub(crate) async fn run(config: Config) -> Result<()> {
    info!("sandtrap v{} starting", env!("CARGO_PKG_VERSION"));

    let docker = DockerRuntime::connect(&config.docker)
        .await
        .context("Docker is not available")?;
    docker
        .ensure_image(&config.container_pool.image)
        .await
        .context("Sandbox image is not available")?;
    let runtime: Arc<dyn SandboxRuntime> = Arc::new(docker);

    let pool = SandboxPool::new(runtime, config.container_pool.clone());
    if let Err(e) = pool.initialize().await {
        error!("{}", e);
        pool.shutdown().await;
        return Err(e).context("Failed to start sandbox pool");
    }

    let orchestrator = Arc::new(SessionOrchestrator::new(
        pool.clone(),
        config.recording.clone(),
        config.session_timeout(),
    ));
    let auth = Arc::new(AuthenticationManager::new(&config.authentication));
    let mut transport = build_transport(&config.server, auth);
    transport.set_session_handler(orchestrator.clone());

    if let Err(e) = transport.start().await {
        pool.shutdown().await;
        return Err(e);
    }

    let listen = transport.local_addr().map_or_else(
        || format!("{}:{}", config.server.host, config.server.port),
        |addr| addr.to_string(),
    );
    info!(
        "sandtrap ready on {} ({} sandboxes warm, recordings in {})",
        listen,
        config.container_pool.size,
        if config.recording.enabled {
            config.recording.output_dir.display().to_string()
        } else {
            "nowhere (disabled)".to_string()
        }
    );

    wait_for_shutdown().await?;
    info!("Shutting down...");

    orchestrator.close_sessions();
    transport.stop().await?;
    pool.shutdown().await;

    let preserved = pool.stopped().await;
    for retired in &preserved {
        info!(
            "Preserved {} (stopped {})",
            retired.sandbox,
            retired.stopped_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    let stats = pool.stats().await;
    info!(
        "sandtrap stopped ({} of {} sandboxes preserved for analysis)",
        preserved.len(),
        stats.total
    );
    Ok(())
}

fn build_transport(config: &ServerConfig, auth: Arc<AuthenticationManager>) -> Box<dyn Transport> {
    match config.transport {
        TransportKind::Ssh => Box::new(SshTransport::new(config.clone(), auth)),
        TransportKind::Tcp => Box::new(TcpTransport::new(config.clone(), auth)),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
