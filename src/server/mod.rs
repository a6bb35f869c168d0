//! Transport seam between the network front end and the session core.
//!
//! A [`Transport`] accepts connections, authenticates them and hands every
//! interactive session to the registered [`SessionHandler`] together with
//! the byte streams of that session.

pub(crate) mod auth;
mod listener;
mod ssh;
mod tcp;

pub(crate) use auth::AuthenticationManager;
pub(crate) use ssh::{load_host_key, SshTransport};
pub(crate) use tcp::TcpTransport;

use anyhow::Result;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};

/// Bytes typed by the remote client. `Sync` so a proxy holding it can be
/// borrowed across awaits inside a `Send` session future.
pub(crate) type SessionInput = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Writer back to the remote client, shared so the orchestrator can send
/// notices while the proxy owns the data path.
pub(crate) type SessionOutput = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Connection facts gathered by the transport.
#[derive(Debug, Clone)]
pub(crate) struct SessionInfo {
    pub session_id: String,
    pub username: String,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub authenticated: bool,
    pub failed_attempts: u32,
}

/// Negotiated terminal parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PtyRequest {
    pub term_type: String,
    pub width: u32,
    pub height: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term_type: "xterm".to_string(),
            width: 80,
            height: 24,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl PtyRequest {
    /// Build from what the client reported, falling back to xterm 80x24.
    pub fn negotiated(term_type: Option<&str>, width: u32, height: u32) -> Self {
        let defaults = Self::default();
        Self {
            term_type: term_type
                .filter(|term| !term.is_empty())
                .map_or(defaults.term_type, str::to_string),
            width: if width == 0 { defaults.width } else { width },
            height: if height == 0 { defaults.height } else { height },
            ..defaults
        }
    }
}

/// Streams of one interactive session.
pub(crate) struct SessionChannel {
    pub input: SessionInput,
    pub output: SessionOutput,
    /// Terminal resizes reported by the client as `(width, height)`.
    pub resizes: mpsc::Receiver<(u32, u32)>,
}

impl SessionChannel {
    pub fn new(
        input: impl AsyncRead + Send + Sync + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
        resizes: mpsc::Receiver<(u32, u32)>,
    ) -> Self {
        Self {
            input: Box::new(input),
            output: Arc::new(Mutex::new(Box::new(output))),
            resizes,
        }
    }
}

/// Called by a transport for every interactive session.
#[async_trait]
pub(crate) trait SessionHandler: Send + Sync {
    /// Runs the session to completion. Must not return errors to the
    /// transport; all failures are handled and logged inside.
    async fn handle(&self, info: SessionInfo, pty: PtyRequest, channel: SessionChannel);
}

/// Network front end that produces sessions.
#[async_trait]
pub(crate) trait Transport: Send + Sync {
    /// Registers the handler that receives accepted sessions.
    fn set_session_handler(&mut self, handler: Arc<dyn SessionHandler>);

    /// Binds and starts accepting connections.
    async fn start(&mut self) -> Result<()>;

    /// Stops accepting connections and waits, up to the shutdown grace
    /// period, for live connections to finish.
    async fn stop(&mut self) -> Result<()>;

    /// Checks one credential attempt for a connection.
    fn authenticate(&self, connection_id: &str, username: &str, password: &str) -> bool;

    /// Address the listener is bound to, once started.
    fn local_addr(&self) -> Option<SocketAddr>;
}
