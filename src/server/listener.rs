//! Accept loop shared by the transports.
//!
//! Binds the listener, caps live connections with a semaphore and, on
//! shutdown, stops accepting and gives live connections a grace period to
//! finish before aborting whatever is left.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Serves one accepted connection until it ends.
#[async_trait]
pub(crate) trait ConnectionService: Send + Sync + 'static {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> Result<()>;
}

/// A running accept loop.
pub(crate) struct Listening {
    local_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Listening {
    /// Bind `host:port` and start accepting.
    pub async fn bind(
        host: &str,
        port: u16,
        max_connections: usize,
        grace: Duration,
        service: Arc<dyn ConnectionService>,
    ) -> Result<Self> {
        let bind_addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind {bind_addr}"))?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        let (stop, stopped) = oneshot::channel();
        let acceptor = Acceptor {
            listener,
            service,
            permits: Arc::new(Semaphore::new(max_connections)),
            grace,
        };
        let task = tokio::spawn(acceptor.run(stopped));

        Ok(Self {
            local_addr,
            stop,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for live connections to drain.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            log_task_failure(&e, "Accept loop");
        }
    }
}

struct Acceptor {
    listener: TcpListener,
    service: Arc<dyn ConnectionService>,
    permits: Arc<Semaphore>,
    grace: Duration,
}

impl Acceptor {
    async fn run(self, mut stopped: oneshot::Receiver<()>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut stopped => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                        warn!("Connection limit reached, rejecting {}", peer);
                        continue;
                    };

                    let service = Arc::clone(&self.service);
                    connections.spawn(async move {
                        if let Err(e) = service.serve(stream, peer).await {
                            debug!("Connection from {} ended: {:#}", peer, e);
                        }
                        drop(permit);
                    });
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        log_task_failure(&e, "Connection task");
                    }
                }
            }
        }

        drop(self.listener);
        drain(&mut connections, self.grace).await;
    }
}

/// Wait up to `grace` for connections to finish, then abort the rest.
async fn drain(connections: &mut JoinSet<()>, grace: Duration) {
    if connections.is_empty() {
        return;
    }
    info!(
        "Waiting up to {:?} for {} connections to close",
        grace,
        connections.len()
    );

    let drained = tokio::time::timeout(grace, async {
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                log_task_failure(&e, "Connection task");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            "Aborting {} connections still open after {:?}",
            connections.len(),
            grace
        );
        connections.shutdown().await;
    }
}

fn log_task_failure(e: &JoinError, task: &str) {
    if e.is_panic() {
        error!("{} panicked", task);
    }
}
