//! Disposable Docker sandboxes that attacker sessions are bound to.
//!
//! The [`SandboxRuntime`] trait is the seam between the pool/proxy and the
//! container engine. [`DockerRuntime`] is the production implementation;
//! tests use the in-memory runtime from `mock`.

mod docker;
mod error;
#[cfg(test)]
pub(crate) mod mock;
mod network;
pub(crate) mod pool;
pub(crate) mod security;

pub(crate) use docker::DockerRuntime;
pub(crate) use error::SandboxError;
pub(crate) use network::NetworkMode;
pub(crate) use pool::SandboxPool;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::pin::Pin;
use tokio::io::AsyncWrite;

use security::SandboxSpec;

/// Handle to one isolated execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Sandbox {
    /// Runtime identifier (the Docker container id).
    pub id: String,
    /// Human-readable name the sandbox was created under.
    pub name: String,
}

impl Sandbox {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Abbreviated id for log lines.
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(12)
            .map_or(self.id.len(), |(idx, _)| idx);
        &self.id[..end]
    }
}

impl std::fmt::Display for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.short_id(), self.name)
    }
}

/// Coarse run state reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SandboxStatus {
    Running,
    Stopped,
    Unknown,
}

/// Parameters for the interactive process started inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecRequest {
    pub cmd: Vec<String>,
    pub tty: bool,
    pub env: Vec<(String, String)>,
    pub user: String,
    pub working_dir: String,
}

impl ExecRequest {
    /// Interactive root shell sized to the client's terminal.
    pub fn interactive_shell(term: &str, width: u32, height: u32) -> Self {
        Self {
            cmd: vec!["/bin/bash".to_string()],
            tty: true,
            env: vec![
                ("TERM".to_string(), term.to_string()),
                ("COLUMNS".to_string(), width.to_string()),
                ("LINES".to_string(), height.to_string()),
            ],
            user: "root".to_string(),
            working_dir: "/root".to_string(),
        }
    }
}

/// Raw duplex byte channel to a process running inside a sandbox.
pub(crate) struct ExecChannel {
    /// Bytes produced by the process. Ends when the process exits.
    pub output: BoxStream<'static, std::io::Result<Bytes>>,
    /// Bytes fed to the process's stdin.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for ExecChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecChannel").finish_non_exhaustive()
    }
}

/// Operations the pool and proxy need from a container engine.
#[async_trait]
pub(crate) trait SandboxRuntime: Send + Sync {
    /// Creates (but does not start) a sandbox from translated parameters.
    async fn create(&self, spec: &SandboxSpec) -> Result<Sandbox, SandboxError>;

    /// Starts a created sandbox.
    async fn start(&self, sandbox: &Sandbox) -> Result<(), SandboxError>;

    /// Starts an interactive process and returns its byte channel.
    async fn exec(
        &self,
        sandbox: &Sandbox,
        request: &ExecRequest,
    ) -> Result<ExecChannel, SandboxError>;

    /// Stops a sandbox, preserving its filesystem.
    async fn stop(&self, sandbox: &Sandbox) -> Result<(), SandboxError>;

    /// Reads the sandbox's current run state.
    async fn inspect(&self, sandbox: &Sandbox) -> Result<SandboxStatus, SandboxError>;
}
