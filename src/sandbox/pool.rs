//! Pool of pre-warmed sandboxes handed out to sessions.
//!
//! Every sandbox the pool has created lives in exactly one of three places:
//! the ready queue, the active map (bound to one session), or the stopped
//! archive. Sandboxes are never reused: `release` stops the sandbox and
//! archives it so the attacker's filesystem survives for forensics.
//!
//! The collections are only touched while holding `state`; container
//! create/stop calls happen outside the lock.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::security::{build_sandbox_spec, generate_sandbox_name, SecurityError};
use super::{Sandbox, SandboxError, SandboxRuntime, SandboxStatus};
use crate::config::ContainerPoolConfig;

/// Delay before the single retry of a failed creation.
const CREATE_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Errors surfaced by pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// At least one sandbox failed during `initialize`.
    #[error("Sandbox pool initialization failed: {source}")]
    Initialization {
        #[source]
        source: ProvisionError,
    },

    /// No ready sandbox and on-demand creation failed.
    #[error("Sandbox allocation failed for session {session_id}: {source}")]
    Allocation {
        session_id: String,
        #[source]
        source: ProvisionError,
    },

    /// The session already holds a sandbox.
    #[error("Session {session_id} already has a sandbox")]
    SessionActive { session_id: String },

    /// The pool is shutting down.
    #[error("Sandbox pool is shut down")]
    ShutDown,
}

/// Why a single sandbox could not be provisioned.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Profile(#[from] SecurityError),

    #[error("failed after retry: {0}")]
    Runtime(#[from] SandboxError),
}

impl ProvisionError {
    /// The last attempt ran past `spawn_timeout`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Runtime(e) if e.is_timeout())
    }
}

/// A retired sandbox and when it was stopped.
#[derive(Debug, Clone)]
pub(crate) struct StoppedSandbox {
    pub sandbox: Sandbox,
    pub stopped_at: DateTime<Utc>,
}

/// Point-in-time collection sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolStats {
    pub ready: usize,
    pub active: usize,
    pub stopped: usize,
    pub total: usize,
}

#[derive(Default)]
struct PoolState {
    ready: Vec<Sandbox>,
    active: HashMap<String, Sandbox>,
    stopped: Vec<StoppedSandbox>,
}

impl PoolState {
    fn archive(&mut self, sandbox: Sandbox) {
        self.stopped.push(StoppedSandbox {
            sandbox,
            stopped_at: Utc::now(),
        });
    }
}

struct PoolInner {
    runtime: Arc<dyn SandboxRuntime>,
    config: ContainerPoolConfig,
    retry_backoff: Duration,
    state: Mutex<PoolState>,
    shutdown: AtomicBool,
    replacements: Mutex<JoinSet<()>>,
}

/// Hands out pre-warmed sandboxes and retires them after use.
///
/// Cloning is cheap; all clones share one pool.
#[derive(Clone)]
pub(crate) struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: ContainerPoolConfig) -> Self {
        info!(
            "Sandbox pool configured (target size: {}, image: {})",
            config.size, config.image
        );
        Self {
            inner: Arc::new(PoolInner {
                runtime,
                config,
                retry_backoff: CREATE_RETRY_BACKOFF,
                state: Mutex::new(PoolState::default()),
                shutdown: AtomicBool::new(false),
                replacements: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Override the retry backoff. Only meaningful before the pool is shared.
    #[cfg(test)]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry_backoff = backoff;
        }
        self
    }

    /// Runtime the pool creates sandboxes with.
    pub fn runtime(&self) -> Arc<dyn SandboxRuntime> {
        Arc::clone(&self.inner.runtime)
    }

    /// Fill the ready queue with `size` sandboxes, created concurrently.
    ///
    /// All-or-nothing: if any creation fails, every sandbox created here is
    /// stopped and archived and the ready queue stays empty.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        let size = self.inner.config.size;
        info!("Initializing sandbox pool with {} sandboxes...", size);
        let started = Instant::now();

        let results =
            futures_util::future::join_all((0..size).map(|_| self.inner.create_sandbox())).await;

        let mut created = Vec::with_capacity(size);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(sandbox) => created.push(sandbox),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(source) = first_error {
            error!("Failed to initialize sandbox pool: {}", source);
            for sandbox in &created {
                self.inner.stop_quietly(sandbox).await;
            }
            let mut state = self.inner.state.lock().await;
            for sandbox in created {
                state.archive(sandbox);
            }
            return Err(PoolError::Initialization { source });
        }

        self.inner.state.lock().await.ready.extend(created);
        info!(
            "Sandbox pool initialized in {:.2}s ({} sandboxes ready)",
            started.elapsed().as_secs_f64(),
            size
        );
        Ok(())
    }

    /// Bind a sandbox to `session_id`.
    ///
    /// Pops a ready sandbox, or creates one on demand when the queue is
    /// empty. Either way a background replacement is scheduled.
    pub async fn allocate(&self, session_id: &str) -> Result<Sandbox, PoolError> {
        let popped = {
            let mut state = self.inner.state.lock().await;
            if self.inner.is_shut_down() {
                return Err(PoolError::ShutDown);
            }
            if state.active.contains_key(session_id) {
                return Err(PoolError::SessionActive {
                    session_id: session_id.to_string(),
                });
            }
            let popped = state.ready.pop();
            if let Some(ref sandbox) = popped {
                state
                    .active
                    .insert(session_id.to_string(), sandbox.clone());
                debug!("Allocated sandbox from pool: {}", sandbox);
            }
            popped
        };

        let sandbox = match popped {
            Some(sandbox) => sandbox,
            None => self.allocate_on_demand(session_id).await?,
        };

        self.spawn_replacement().await;

        match self.inner.runtime.inspect(&sandbox).await {
            Ok(SandboxStatus::Running) => {}
            Ok(status) => warn!(
                "Sandbox {} allocated to session {} is not running ({:?})",
                sandbox, session_id, status
            ),
            Err(e) => warn!("Failed to inspect sandbox {}: {}", sandbox, e),
        }

        let stats = self.stats().await;
        info!(
            "Sandbox {} allocated to session {} (ready: {}, active: {})",
            sandbox, session_id, stats.ready, stats.active
        );
        Ok(sandbox)
    }

    async fn allocate_on_demand(&self, session_id: &str) -> Result<Sandbox, PoolError> {
        warn!(
            "Sandbox pool empty! Creating on-demand for session {}",
            session_id
        );

        let sandbox = self.inner.create_sandbox().await.map_err(|source| {
            error!("Failed to create on-demand sandbox: {}", source);
            PoolError::Allocation {
                session_id: session_id.to_string(),
                source,
            }
        })?;

        let mut state = self.inner.state.lock().await;
        if self.inner.is_shut_down() {
            drop(state);
            self.inner.stop_quietly(&sandbox).await;
            self.inner.state.lock().await.archive(sandbox);
            return Err(PoolError::ShutDown);
        }
        if state.active.contains_key(session_id) {
            // Lost a race with a concurrent allocate for the same id; the
            // fresh sandbox was never handed out, so it can serve as ready.
            state.ready.push(sandbox);
            return Err(PoolError::SessionActive {
                session_id: session_id.to_string(),
            });
        }
        state
            .active
            .insert(session_id.to_string(), sandbox.clone());
        Ok(sandbox)
    }

    /// Unbind and retire the sandbox held by `session_id`.
    ///
    /// Unknown ids are a logged no-op. Stop failures are logged and the
    /// sandbox is archived anyway.
    pub async fn release(&self, session_id: &str) {
        let Some(sandbox) = self.inner.state.lock().await.active.remove(session_id) else {
            warn!("Attempted to release unknown session: {}", session_id);
            return;
        };

        debug!("Stopping sandbox {} for session {}", sandbox, session_id);
        self.inner.stop_quietly(&sandbox).await;

        let mut state = self.inner.state.lock().await;
        state.archive(sandbox.clone());
        info!(
            "Sandbox {} released from session {} (stopped sandboxes: {})",
            sandbox,
            session_id,
            state.stopped.len()
        );
    }

    /// Stop everything the pool still holds.
    ///
    /// In-flight replacement spawns are awaited first; they observe the
    /// shutdown flag and archive what they created instead of queueing it.
    pub async fn shutdown(&self) {
        info!("Shutting down sandbox pool...");
        self.inner.shutdown.store(true, Ordering::SeqCst);

        let mut replacements = std::mem::take(&mut *self.inner.replacements.lock().await);
        while let Some(result) = replacements.join_next().await {
            if let Err(e) = result {
                warn!("Replacement spawn ended abnormally: {}", e);
            }
        }

        let to_stop: Vec<Sandbox> = {
            let mut state = self.inner.state.lock().await;
            let mut sandboxes: Vec<Sandbox> = state.active.drain().map(|(_, sb)| sb).collect();
            sandboxes.append(&mut state.ready);
            sandboxes
        };

        for sandbox in &to_stop {
            self.inner.stop_quietly(sandbox).await;
        }

        let mut state = self.inner.state.lock().await;
        for sandbox in to_stop {
            state.archive(sandbox);
        }
        info!(
            "Sandbox pool shutdown complete (stopped sandboxes preserved: {})",
            state.stopped.len()
        );
    }

    /// Current collection sizes
    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        let (ready, active, stopped) = (state.ready.len(), state.active.len(), state.stopped.len());
        PoolStats {
            ready,
            active,
            stopped,
            total: ready + active + stopped,
        }
    }

    /// Snapshot of the forensic archive
    pub async fn stopped(&self) -> Vec<StoppedSandbox> {
        self.inner.state.lock().await.stopped.clone()
    }

    /// Schedule one background creation to top the ready queue back up.
    async fn spawn_replacement(&self) {
        if self.inner.is_shut_down() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let mut replacements = self.inner.replacements.lock().await;
        // Reap finished spawns so the set does not grow without bound
        while replacements.try_join_next().is_some() {}
        replacements.spawn(async move { inner.replenish().await });
    }
}

impl PoolInner {
    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Create and start one sandbox, retrying once after a short backoff.
    ///
    /// Each attempt uses a freshly named spec, so a container left behind
    /// by the first attempt never collides with the retry.
    async fn create_sandbox(&self) -> Result<Sandbox, ProvisionError> {
        match self.try_create().await {
            Ok(sandbox) => Ok(sandbox),
            Err(e @ ProvisionError::Profile(_)) => Err(e),
            Err(e) => {
                if e.is_timeout() {
                    warn!(
                        "Sandbox creation timed out after {}s, retrying",
                        self.config.spawn_timeout
                    );
                } else {
                    warn!("Sandbox creation failed, retrying: {}", e);
                }
                tokio::time::sleep(self.retry_backoff).await;
                let sandbox = self.try_create().await.map_err(|retry_error| {
                    error!("Sandbox creation failed after retry: {}", retry_error);
                    retry_error
                })?;
                info!("Sandbox created successfully on retry: {}", sandbox);
                Ok(sandbox)
            }
        }
    }

    /// One creation attempt bounded by `spawn_timeout`.
    ///
    /// A container that was created but failed to start in time is stopped
    /// and archived, so every container the runtime made stays accounted for.
    async fn try_create(&self) -> Result<Sandbox, ProvisionError> {
        let now = Utc::now();
        let name = generate_sandbox_name(now);
        let spec = build_sandbox_spec(&self.config.security, &self.config.image, &name, now)?;

        let timeout = self.config.spawn_timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        let sandbox = tokio::time::timeout_at(deadline, self.runtime.create(&spec))
            .await
            .map_err(|_| SandboxError::timeout(timeout))??;

        let started = match tokio::time::timeout_at(deadline, self.runtime.start(&sandbox)).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::timeout(timeout)),
        };
        if let Err(e) = started {
            warn!("Sandbox {} failed to start, retiring it: {}", sandbox, e);
            self.stop_quietly(&sandbox).await;
            self.state.lock().await.archive(sandbox);
            return Err(e.into());
        }

        debug!("Sandbox created and started: {}", sandbox);
        Ok(sandbox)
    }

    /// Background task body: add one sandbox to the ready queue.
    async fn replenish(&self) {
        if self.is_shut_down() {
            return;
        }

        let sandbox = match self.create_sandbox().await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                error!("Failed to spawn replacement sandbox: {}", e);
                return;
            }
        };

        {
            let mut state = self.state.lock().await;
            if !self.is_shut_down() {
                state.ready.push(sandbox.clone());
                debug!(
                    "Replacement sandbox spawned: {} (ready: {})",
                    sandbox,
                    state.ready.len()
                );
                return;
            }
        }

        debug!("Shutdown during replacement spawn, retiring {}", sandbox);
        self.stop_quietly(&sandbox).await;
        self.state.lock().await.archive(sandbox);
    }

    async fn stop_quietly(&self, sandbox: &Sandbox) {
        if let Err(e) = self.runtime.stop(sandbox).await {
            error!("Failed to stop sandbox {}: {}", sandbox, e);
        }
    }
}
