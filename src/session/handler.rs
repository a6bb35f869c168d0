//! Runs one client session against a freshly allocated sandbox.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::proxy::SandboxProxy;
use super::recorder::{Metadata, SessionRecorder};
use crate::config::RecordingConfig;
use crate::sandbox::{Sandbox, SandboxPool};
use crate::server::{PtyRequest, SessionChannel, SessionHandler, SessionInfo, SessionOutput};

/// Shown to the client when no working sandbox could be provided.
pub(crate) const SESSION_ERROR_NOTICE: &[u8] = b"\r\nSession error: unable to start session\r\n";

/// Shown to the client when the session outlived its time limit.
pub(crate) const SESSION_TIMEOUT_NOTICE: &[u8] = b"\r\nSession timeout: connection closed\r\n";

/// Shown to the client when the server shuts down mid-session.
pub(crate) const SERVER_SHUTDOWN_NOTICE: &[u8] = b"\r\nConnection closed by server\r\n";

/// Upper bound on delivering a notice to a client that stopped reading.
const NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

enum Outcome {
    Completed,
    TimedOut,
    ExecFailed,
    Interrupted,
}

/// Binds sessions to sandboxes: allocate, record, proxy, release.
pub(crate) struct SessionOrchestrator {
    pool: SandboxPool,
    recording: RecordingConfig,
    session_timeout: Duration,
    closing: watch::Sender<bool>,
}

impl SessionOrchestrator {
    pub fn new(pool: SandboxPool, recording: RecordingConfig, session_timeout: Duration) -> Self {
        Self {
            pool,
            recording,
            session_timeout,
            closing: watch::channel(false).0,
        }
    }

    /// Ends every live session: each one tells its client, stops its proxy,
    /// releases its sandbox and finishes its recording. Sessions that start
    /// afterwards end as soon as their proxy is up.
    pub fn close_sessions(&self) {
        if !self.closing.send_replace(true) {
            info!("Closing live sessions");
        }
    }

    fn recorder_for(
        &self,
        info: &SessionInfo,
        pty: &PtyRequest,
        sandbox: &Sandbox,
        started_at: chrono::DateTime<Utc>,
    ) -> Option<Arc<SessionRecorder>> {
        if !self.recording.enabled {
            return None;
        }

        let metadata: Metadata = [
            ("session_id", json!(info.session_id)),
            ("username", json!(info.username)),
            ("source_ip", json!(info.source_ip.to_string())),
            ("source_port", json!(info.source_port)),
            ("authenticated", json!(info.authenticated)),
            ("failed_attempts", json!(info.failed_attempts)),
            ("sandbox_id", json!(sandbox.id)),
            ("sandbox_name", json!(sandbox.name)),
            ("term", json!(pty.term_type)),
            ("width", json!(pty.width)),
            ("height", json!(pty.height)),
            ("pixel_width", json!(pty.pixel_width)),
            ("pixel_height", json!(pty.pixel_height)),
            ("started_at", json!(started_at.to_rfc3339())),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();

        let recorder = SessionRecorder::new(
            self.recording.clone(),
            &info.session_id,
            pty.width,
            pty.height,
            metadata,
        );
        recorder.start();
        Some(Arc::new(recorder))
    }
}

#[async_trait]
impl SessionHandler for SessionOrchestrator {
    async fn handle(&self, info: SessionInfo, pty: PtyRequest, channel: SessionChannel) {
        let session_id = info.session_id.clone();
        info!(
            "Session {} started: {}@{}:{} ({} {}x{})",
            session_id,
            info.username,
            info.source_ip,
            info.source_port,
            pty.term_type,
            pty.width,
            pty.height
        );

        let SessionChannel {
            input,
            output,
            mut resizes,
        } = channel;

        let sandbox = match self.pool.allocate(&session_id).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                error!("Failed to allocate sandbox for session {}: {}", session_id, e);
                send_notice(&output, SESSION_ERROR_NOTICE).await;
                return;
            }
        };

        let started_at = Utc::now();
        let recorder = self.recorder_for(&info, &pty, &sandbox, started_at);

        let mut proxy = SandboxProxy::new(
            self.pool.runtime(),
            sandbox,
            session_id.clone(),
            pty,
            (input, Arc::clone(&output)),
        );
        if let Some(recorder) = &recorder {
            proxy = proxy.with_recorder(Arc::clone(recorder));
        }

        let mut closing = self.closing.subscribe();
        let outcome = match proxy.start().await {
            Ok(()) => {
                let run = run_until_complete(&proxy, &mut resizes, &mut closing);
                tokio::time::timeout(self.session_timeout, run)
                    .await
                    .unwrap_or(Outcome::TimedOut)
            }
            Err(e) => {
                error!("Session {} could not start: {}", session_id, e);
                Outcome::ExecFailed
            }
        };

        proxy.stop().await;

        match outcome {
            Outcome::Completed => {}
            Outcome::TimedOut => {
                warn!(
                    "Session {} timed out after {}s",
                    session_id,
                    self.session_timeout.as_secs()
                );
                send_notice(&output, SESSION_TIMEOUT_NOTICE).await;
            }
            Outcome::ExecFailed => send_notice(&output, SESSION_ERROR_NOTICE).await,
            Outcome::Interrupted => {
                info!("Session {} closed by server shutdown", session_id);
                send_notice(&output, SERVER_SHUTDOWN_NOTICE).await;
            }
        }

        self.pool.release(&session_id).await;

        if let Some(recorder) = recorder {
            let ended_at = Utc::now();
            let duration = (ended_at - started_at).num_milliseconds() as f64 / 1000.0;
            recorder.insert_metadata("ended_at", ended_at.to_rfc3339());
            recorder.insert_metadata("duration_secs", duration);
            recorder.stop();
            recorder.write_metadata();
        }

        info!("Session {} ended", session_id);
    }
}

/// Wait for the proxy to finish, forwarding client resizes meanwhile.
/// Returns early if the server starts closing sessions.
async fn run_until_complete(
    proxy: &SandboxProxy,
    resizes: &mut mpsc::Receiver<(u32, u32)>,
    closing: &mut watch::Receiver<bool>,
) -> Outcome {
    let mut resizes_open = true;
    let mut closing_open = true;
    loop {
        tokio::select! {
            () = proxy.wait_completion() => return Outcome::Completed,
            resize = resizes.recv(), if resizes_open => match resize {
                Some((width, height)) => proxy.handle_resize(width, height),
                None => resizes_open = false,
            },
            closed = async { closing.wait_for(|closed| *closed).await.is_ok() }, if closing_open => {
                if closed {
                    return Outcome::Interrupted;
                }
                closing_open = false;
            }
        }
    }
}

async fn send_notice(output: &SessionOutput, notice: &[u8]) {
    let write = async {
        let mut writer = output.lock().await;
        writer.write_all(notice).await?;
        writer.flush().await
    };
    match tokio::time::timeout(NOTICE_TIMEOUT, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to send notice to client: {}", e),
        Err(_) => warn!("Timed out sending notice to client"),
    }
}
