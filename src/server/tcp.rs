//! Plain TCP login front end.
//!
//! Presents a `login:` / `Password:` prompt, checks credentials with the
//! [`AuthenticationManager`] and hands the raw connection to the session
//! handler once a login succeeds. Clients get the default terminal
//! geometry and cannot resize.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use super::listener::{ConnectionService, Listening};
use super::{
    AuthenticationManager, PtyRequest, SessionChannel, SessionHandler, SessionInfo, Transport,
};
use crate::config::ServerConfig;

/// Longest accepted username or password line.
const MAX_LINE: u64 = 256;

/// Time a client gets to complete the login dialogue.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(60);

const LOGIN_PROMPT: &[u8] = b"login: ";
const PASSWORD_PROMPT: &[u8] = b"Password: ";
const LOGIN_INCORRECT: &[u8] = b"\r\nLogin incorrect\r\n";
const TOO_MANY_FAILURES: &[u8] = b"\r\nToo many authentication failures\r\n";

pub(crate) struct TcpTransport {
    config: ServerConfig,
    auth: Arc<AuthenticationManager>,
    handler: Option<Arc<dyn SessionHandler>>,
    listening: Option<Listening>,
}

impl TcpTransport {
    pub fn new(config: ServerConfig, auth: Arc<AuthenticationManager>) -> Self {
        Self {
            config,
            auth,
            handler: None,
            listening: None,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn set_session_handler(&mut self, handler: Arc<dyn SessionHandler>) {
        self.handler = Some(handler);
        info!("Session handler registered");
    }

    async fn start(&mut self) -> Result<()> {
        if self.listening.is_some() {
            bail!("Transport already started");
        }
        let handler = self
            .handler
            .clone()
            .context("No session handler registered")?;

        let service = Arc::new(LoginService {
            auth: Arc::clone(&self.auth),
            handler,
            max_auth_attempts: self.config.max_auth_attempts,
        });
        let listening = Listening::bind(
            &self.config.host,
            self.config.port,
            self.config.max_concurrent_sessions,
            self.config.shutdown_grace(),
            service,
        )
        .await?;
        self.listening = Some(listening);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(listening) = self.listening.take() {
            listening.shutdown().await;
            info!("Transport stopped");
        }
        Ok(())
    }

    fn authenticate(&self, connection_id: &str, username: &str, password: &str) -> bool {
        self.auth.validate(connection_id, username, password)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.as_ref().map(Listening::local_addr)
    }
}

/// Runs the login dialogue on each accepted connection.
struct LoginService {
    auth: Arc<AuthenticationManager>,
    handler: Arc<dyn SessionHandler>,
    max_auth_attempts: u32,
}

#[async_trait]
impl ConnectionService for LoginService {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        handle_connection(
            stream,
            peer,
            &self.auth,
            Arc::clone(&self.handler),
            self.max_auth_attempts,
        )
        .await
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    auth: &AuthenticationManager,
    handler: Arc<dyn SessionHandler>,
    max_auth_attempts: u32,
) -> Result<()> {
    let connection_id = Uuid::new_v4().to_string();
    info!("Connection {} from {}", connection_id, peer);

    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let outcome = tokio::time::timeout(
        LOGIN_TIMEOUT,
        login(&mut reader, &mut writer, auth, &connection_id, max_auth_attempts),
    )
    .await;
    auth.cleanup_connection(&connection_id);

    let (username, failed_attempts) = match outcome {
        Ok(result) => match result? {
            Some(login) => login,
            None => {
                info!("Connection {} closed without logging in", connection_id);
                return Ok(());
            }
        },
        Err(_) => {
            info!("Connection {} timed out at login", connection_id);
            return Ok(());
        }
    };

    let info = SessionInfo {
        session_id: connection_id,
        username,
        source_ip: peer.ip(),
        source_port: peer.port(),
        authenticated: true,
        failed_attempts,
    };

    // No resize channel on a raw TCP stream
    let (_, resizes) = mpsc::channel(1);
    let channel = SessionChannel::new(reader, writer, resizes);
    handler.handle(info, PtyRequest::default(), channel).await;
    Ok(())
}

/// Run the login dialogue. Returns the username and number of failures,
/// or `None` if the client gave up or ran out of attempts.
async fn login<R, W>(
    reader: &mut R,
    writer: &mut W,
    auth: &AuthenticationManager,
    connection_id: &str,
    max_auth_attempts: u32,
) -> Result<Option<(String, u32)>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut failures = 0;
    while failures < max_auth_attempts {
        let Some(username) = prompt(reader, writer, LOGIN_PROMPT).await? else {
            return Ok(None);
        };
        let Some(password) = prompt(reader, writer, PASSWORD_PROMPT).await? else {
            return Ok(None);
        };

        if auth.validate(connection_id, &username, &password) {
            info!(
                "Authentication succeeded for {} on {}",
                username, connection_id
            );
            writer.write_all(b"\r\n").await?;
            return Ok(Some((username, failures)));
        }

        failures += 1;
        writer.write_all(LOGIN_INCORRECT).await?;
    }

    warn!("Too many authentication failures on {}", connection_id);
    writer.write_all(TOO_MANY_FAILURES).await?;
    writer.flush().await?;
    Ok(None)
}

async fn prompt<R, W>(reader: &mut R, writer: &mut W, text: &[u8]) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(text).await?;
    writer.flush().await?;

    let mut line = String::new();
    let read = reader.take(MAX_LINE).read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}
