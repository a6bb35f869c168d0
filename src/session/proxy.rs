//! Bidirectional byte pump between a client session and a sandbox shell.
//!
//! `start` launches the shell and spawns two loops: one copying client
//! input into the shell, one copying shell output back to the client. The
//! loops never return errors. Whichever ends first fires the completion
//! signal; `stop` aborts and awaits both before closing the shell's stdin.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::recorder::SessionRecorder;
use crate::sandbox::{ExecRequest, Sandbox, SandboxError, SandboxRuntime};
use crate::server::{PtyRequest, SessionInput, SessionOutput};

/// Largest chunk read from either side in one go.
const CHUNK_SIZE: usize = 4096;

/// Pause before retrying a would-block read or write.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Upper bound on one wait for sandbox output.
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

type ExecInput = Arc<Mutex<Pin<Box<dyn AsyncWrite + Send>>>>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The shell could not be launched in an allocated sandbox.
    #[error("Failed to start shell in sandbox {sandbox}: {source}")]
    ExecSetup {
        sandbox: String,
        #[source]
        source: SandboxError,
    },

    #[error("Proxy cannot start from state {0:?}")]
    InvalidState(ProxyState),
}

/// Lifecycle of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Created,
    Started,
    Running,
    Stopping,
    Stopped,
}

/// One-shot completion flag shared by both loops.
///
/// Only the first `fire` has an effect.
#[derive(Debug, Clone)]
pub(crate) struct CompletionSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl CompletionSignal {
    /// Returns true if this call set the flag.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once fired
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Fires the signal when a loop exits, including by abort or panic.
struct FireOnDrop(CompletionSignal);

impl Drop for FireOnDrop {
    fn drop(&mut self) {
        self.0.fire();
    }
}

/// Streams one session's bytes to and from one sandbox shell.
pub(crate) struct SandboxProxy {
    runtime: Arc<dyn SandboxRuntime>,
    sandbox: Sandbox,
    session_id: String,
    pty: PtyRequest,
    recorder: Option<Arc<SessionRecorder>>,
    session_input: Option<SessionInput>,
    session_output: SessionOutput,
    exec_input: Option<ExecInput>,
    tasks: Vec<JoinHandle<()>>,
    completion: CompletionSignal,
    state: ProxyState,
}

impl SandboxProxy {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        sandbox: Sandbox,
        session_id: impl Into<String>,
        pty: PtyRequest,
        (input, output): (SessionInput, SessionOutput),
    ) -> Self {
        Self {
            runtime,
            sandbox,
            session_id: session_id.into(),
            pty,
            recorder: None,
            session_input: Some(input),
            session_output: output,
            exec_input: None,
            tasks: Vec::new(),
            completion: CompletionSignal::default(),
            state: ProxyState::Created,
        }
    }

    /// Attach a recorder fed by both loops.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<SessionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Current state. A running proxy whose loops have ended reports `Stopping`.
    pub fn state(&self) -> ProxyState {
        if self.state == ProxyState::Running && self.completion.is_fired() {
            ProxyState::Stopping
        } else {
            self.state
        }
    }

    /// Launch the shell and spawn both loops.
    pub async fn start(&mut self) -> Result<(), ProxyError> {
        if self.state != ProxyState::Created {
            return Err(ProxyError::InvalidState(self.state));
        }
        let input = self
            .session_input
            .take()
            .ok_or(ProxyError::InvalidState(self.state))?;

        let request =
            ExecRequest::interactive_shell(&self.pty.term_type, self.pty.width, self.pty.height);
        let channel = self
            .runtime
            .exec(&self.sandbox, &request)
            .await
            .map_err(|source| {
                error!(
                    "Failed to start shell in {} for session {}: {}",
                    self.sandbox, self.session_id, source
                );
                ProxyError::ExecSetup {
                    sandbox: self.sandbox.short_id().to_string(),
                    source,
                }
            })?;
        self.state = ProxyState::Started;
        debug!(
            "Shell started in {} ({}, {}x{})",
            self.sandbox, self.pty.term_type, self.pty.width, self.pty.height
        );

        let exec_input: ExecInput = Arc::new(Mutex::new(channel.input));
        self.exec_input = Some(Arc::clone(&exec_input));

        self.tasks.push(tokio::spawn(session_to_sandbox(
            input,
            exec_input,
            self.recorder.clone(),
            self.session_id.clone(),
            FireOnDrop(self.completion.clone()),
        )));
        self.tasks.push(tokio::spawn(sandbox_to_session(
            channel.output,
            Arc::clone(&self.session_output),
            self.recorder.clone(),
            self.session_id.clone(),
            FireOnDrop(self.completion.clone()),
        )));

        self.state = ProxyState::Running;
        info!("Sandbox proxy started for session {}", self.session_id);
        Ok(())
    }

    /// Record a client resize. The running shell keeps its geometry.
    pub fn handle_resize(&self, width: u32, height: u32) {
        debug!(
            "Terminal resize to {}x{} for session {} (not applied to sandbox)",
            width, height, self.session_id
        );
        if let Some(recorder) = &self.recorder {
            recorder.record_resize(width, height);
        }
    }

    /// Wait until either loop has ended.
    pub async fn wait_completion(&self) {
        self.completion.wait().await;
    }

    /// Abort and await both loops, then close the shell's stdin.
    pub async fn stop(&mut self) {
        match self.state {
            ProxyState::Stopped => return,
            ProxyState::Created => {
                self.state = ProxyState::Stopped;
                return;
            }
            _ => {}
        }

        info!("Stopping sandbox proxy for session {}", self.session_id);
        self.state = ProxyState::Stopping;

        for task in self.tasks.drain(..) {
            task.abort();
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("Proxy loop for session {} panicked", self.session_id);
                }
            }
        }

        if let Some(exec_input) = self.exec_input.take() {
            let mut writer = exec_input.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(
                    "Error closing shell input for session {}: {}",
                    self.session_id, e
                );
            }
        }

        self.completion.fire();
        self.state = ProxyState::Stopped;
        info!("Sandbox proxy stopped for session {}", self.session_id);
    }
}

impl Drop for SandboxProxy {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted
    )
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}

/// Write to the shell, retrying once after a would-block. The retry resumes
/// after the bytes the shell already accepted.
async fn write_to_sandbox(exec_input: &ExecInput, chunk: &[u8]) -> std::io::Result<()> {
    let mut writer = exec_input.lock().await;
    let mut written = 0;
    let mut retried = false;
    while written < chunk.len() {
        match writer.write(&chunk[written..]).await {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock && !retried => {
                retried = true;
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
    writer.flush().await
}

async fn session_to_sandbox(
    mut input: SessionInput,
    exec_input: ExecInput,
    recorder: Option<Arc<SessionRecorder>>,
    session_id: String,
    _done: FireOnDrop,
) {
    debug!("Session to sandbox loop started (session: {})", session_id);
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = match input.read(&mut buf).await {
            Ok(0) => {
                info!("Client closed input (session: {})", session_id);
                break;
            }
            Ok(n) => n,
            Err(e) if is_disconnect(&e) => {
                info!("Client connection reset (session: {})", session_id);
                break;
            }
            Err(e) => {
                error!("Error reading from client (session: {}): {}", session_id, e);
                break;
            }
        };

        let chunk = &buf[..n];
        if let Some(recorder) = &recorder {
            recorder.record_input(chunk);
        }

        if let Err(e) = write_to_sandbox(&exec_input, chunk).await {
            if is_disconnect(&e) {
                info!("Sandbox shell closed (session: {})", session_id);
            } else {
                error!("Error writing to sandbox (session: {}): {}", session_id, e);
            }
            break;
        }
    }

    debug!("Session to sandbox loop ended (session: {})", session_id);
}

async fn sandbox_to_session(
    mut output: BoxStream<'static, std::io::Result<Bytes>>,
    session_output: SessionOutput,
    recorder: Option<Arc<SessionRecorder>>,
    session_id: String,
    _done: FireOnDrop,
) {
    debug!("Sandbox to session loop started (session: {})", session_id);

    loop {
        let chunk = match tokio::time::timeout(OUTPUT_POLL_INTERVAL, output.next()).await {
            Err(_) => continue,
            Ok(None) => {
                info!("Sandbox shell ended (session: {})", session_id);
                break;
            }
            Ok(Some(Ok(chunk))) if chunk.is_empty() => {
                info!("Sandbox shell ended (session: {})", session_id);
                break;
            }
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) if e.kind() == ErrorKind::WouldBlock => {
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
            Ok(Some(Err(e))) if is_disconnect(&e) => {
                info!("Sandbox connection reset (session: {})", session_id);
                break;
            }
            Ok(Some(Err(e))) => {
                error!("Error reading from sandbox (session: {}): {}", session_id, e);
                break;
            }
        };

        if let Some(recorder) = &recorder {
            recorder.record_output(&chunk);
        }

        // Hold the writer until the client accepted the chunk
        let mut writer = session_output.lock().await;
        if let Err(e) = write_chunk(&mut **writer, &chunk).await {
            if is_disconnect(&e) {
                info!("Client disconnected (session: {})", session_id);
            } else {
                error!("Error writing to client (session: {}): {}", session_id, e);
            }
            break;
        }
    }

    debug!("Sandbox to session loop ended (session: {})", session_id);
}
