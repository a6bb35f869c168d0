//! In-memory sandbox runtime for tests.
//!
//! Hands out sandboxes with sequential ids, can be told to fail specific
//! operations, and gives tests the far end of every exec channel so they
//! can play the part of the shell inside the sandbox.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::security::SandboxSpec;
use super::{ExecChannel, ExecRequest, Sandbox, SandboxError, SandboxRuntime, SandboxStatus};

/// Test-side end of an exec channel.
pub(crate) struct ExecPeer {
    /// Send bytes as if the shell printed them. Drop to end the process.
    pub output: mpsc::UnboundedSender<std::io::Result<Bytes>>,
    /// Bytes the proxy wrote to the shell's stdin.
    pub input: DuplexStream,
    pub request: ExecRequest,
}

#[derive(Default)]
struct MockState {
    /// Scripted outcomes for `create`, consumed front to back; empty means succeed.
    create_script: VecDeque<bool>,
    /// Scripted outcomes for `start`, same convention as `create_script`.
    start_script: VecDeque<bool>,
    fail_all_creates: bool,
    fail_exec: bool,
    fail_stop: bool,
    created: Vec<Sandbox>,
    stopped: Vec<Sandbox>,
    peers: Vec<ExecPeer>,
}

/// A sandbox runtime that never touches Docker.
#[derive(Default)]
pub(crate) struct MockRuntime {
    state: Mutex<MockState>,
    next_id: AtomicUsize,
    create_delay: Mutex<Option<Duration>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `create` call fails.
    pub fn failing_creates() -> Self {
        let runtime = Self::new();
        runtime.state.lock().unwrap().fail_all_creates = true;
        runtime
    }

    /// Script the next `create` outcomes (`true` = succeed).
    pub fn script_creates(&self, outcomes: &[bool]) {
        self.state
            .lock()
            .unwrap()
            .create_script
            .extend(outcomes.iter().copied());
    }

    /// Script the next `start` outcomes (`true` = succeed).
    pub fn script_starts(&self, outcomes: &[bool]) {
        self.state
            .lock()
            .unwrap()
            .start_script
            .extend(outcomes.iter().copied());
    }

    pub fn set_fail_all_creates(&self, fail: bool) {
        self.state.lock().unwrap().fail_all_creates = fail;
    }

    pub fn set_fail_exec(&self, fail: bool) {
        self.state.lock().unwrap().fail_exec = fail;
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.state.lock().unwrap().fail_stop = fail;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn created(&self) -> Vec<Sandbox> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn stopped(&self) -> Vec<Sandbox> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Take the test-side end of the oldest unclaimed exec channel.
    pub fn take_peer(&self) -> Option<ExecPeer> {
        let mut state = self.state.lock().unwrap();
        if state.peers.is_empty() {
            None
        } else {
            Some(state.peers.remove(0))
        }
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<Sandbox, SandboxError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        let succeed = state.create_script.pop_front().unwrap_or(true) && !state.fail_all_creates;
        if !succeed {
            return Err(SandboxError::create_failed("mock create failure"));
        }

        let sandbox = Sandbox::new(format!("mock{n:08}"), spec.name.clone());
        state.created.push(sandbox.clone());
        Ok(sandbox)
    }

    async fn start(&self, _sandbox: &Sandbox) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        if state.start_script.pop_front().unwrap_or(true) {
            Ok(())
        } else {
            Err(SandboxError::create_failed("mock start failure"))
        }
    }

    async fn exec(
        &self,
        _sandbox: &Sandbox,
        request: &ExecRequest,
    ) -> Result<ExecChannel, SandboxError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_exec {
            return Err(SandboxError::exec_failed("mock exec failure"));
        }

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (proxy_side, peer_side) = tokio::io::duplex(64 * 1024);

        state.peers.push(ExecPeer {
            output: output_tx,
            input: peer_side,
            request: request.clone(),
        });

        let output = futures_util::stream::unfold(output_rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed();

        Ok(ExecChannel {
            output,
            input: Box::pin(proxy_side),
        })
    }

    async fn stop(&self, sandbox: &Sandbox) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.stopped.push(sandbox.clone());
        if state.fail_stop {
            return Err(SandboxError::stop_failed("mock stop failure"));
        }
        Ok(())
    }

    async fn inspect(&self, sandbox: &Sandbox) -> Result<SandboxStatus, SandboxError> {
        let state = self.state.lock().unwrap();
        if state.stopped.contains(sandbox) {
            Ok(SandboxStatus::Stopped)
        } else {
            Ok(SandboxStatus::Running)
        }
    }
}
