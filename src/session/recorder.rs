//! Session transcripts in asciicast v2 format.
//!
//! Every event is written and flushed as it happens, so a transcript is
//! readable up to the last byte even if the process dies mid-session.
//! Recording failures are logged and swallowed; they never reach the
//! session that is being recorded.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{info, warn};

use super::transcript::{EventKind, TRANSCRIPT_VERSION};
use crate::config::RecordingConfig;

/// Caller-supplied key/value pairs stored in the header and the sidecar.
pub(crate) type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Serialize)]
struct HeaderLine<'a> {
    version: u32,
    width: u32,
    height: u32,
    timestamp: i64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    env: &'a Metadata,
}

#[derive(Default)]
struct RecorderState {
    file: Option<File>,
    started: Option<Instant>,
    event_count: u64,
}

/// Records one session's terminal I/O.
///
/// Shared between the two proxy loops; writes are serialized by an
/// internal lock so event times stay in file order.
pub(crate) struct SessionRecorder {
    config: RecordingConfig,
    session_id: String,
    width: u32,
    height: u32,
    metadata: Mutex<Metadata>,
    state: Mutex<RecorderState>,
}

impl SessionRecorder {
    pub fn new(
        config: RecordingConfig,
        session_id: impl Into<String>,
        width: u32,
        height: u32,
        metadata: Metadata,
    ) -> Self {
        Self {
            config,
            session_id: session_id.into(),
            width,
            height,
            metadata: Mutex::new(metadata),
            state: Mutex::new(RecorderState::default()),
        }
    }

    /// Path of the `.cast` transcript.
    pub fn transcript_path(&self) -> PathBuf {
        self.config
            .output_dir
            .join(format!("{}.cast", self.session_id))
    }

    /// Path of the `.json` metadata sidecar.
    pub fn metadata_path(&self) -> PathBuf {
        self.config
            .output_dir
            .join(format!("{}.json", self.session_id))
    }

    /// True while the transcript file is open.
    pub fn active(&self) -> bool {
        self.lock_state().file.is_some()
    }

    /// Number of events written so far.
    pub fn event_count(&self) -> u64 {
        self.lock_state().event_count
    }

    /// Add or replace a metadata entry before `write_metadata`.
    pub fn insert_metadata(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.lock_metadata().insert(key.into(), value.into());
    }

    /// Open the transcript and write its header. No-op if disabled.
    pub fn start(&self) {
        if !self.config.enabled {
            return;
        }

        let path = self.transcript_path();
        let mut state = self.lock_state();
        match self.open_transcript() {
            Ok(file) => {
                state.file = Some(file);
                state.started = Some(Instant::now());
                info!("Recording started: {}", path.display());
            }
            Err(e) => {
                warn!(
                    "Failed to start recording for {}: {}",
                    self.session_id, e
                );
                state.file = None;
            }
        }
    }

    fn open_transcript(&self) -> std::io::Result<File> {
        fs::create_dir_all(&self.config.output_dir)?;
        let mut file = File::create(self.transcript_path())?;

        let metadata = self.lock_metadata();
        let header = HeaderLine {
            version: TRANSCRIPT_VERSION,
            width: self.width,
            height: self.height,
            timestamp: chrono::Utc::now().timestamp(),
            env: &metadata,
        };
        let mut line = serde_json::to_string(&header)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    /// Record bytes sent from the sandbox to the client.
    pub fn record_output(&self, data: &[u8]) {
        self.record_event(EventKind::Output, &String::from_utf8_lossy(data));
    }

    /// Record bytes typed by the client.
    pub fn record_input(&self, data: &[u8]) {
        self.record_event(EventKind::Input, &String::from_utf8_lossy(data));
    }

    /// Record a terminal resize.
    pub fn record_resize(&self, width: u32, height: u32) {
        self.record_event(EventKind::Resize, &format!("{width}x{height}"));
    }

    fn record_event(&self, kind: EventKind, data: &str) {
        let mut state = self.lock_state();
        let Some(started) = state.started else {
            return;
        };
        let Some(file) = state.file.as_mut() else {
            return;
        };

        let elapsed = (started.elapsed().as_secs_f64() * 1e6).round() / 1e6;
        let written = serde_json::to_string(&(elapsed, kind, data))
            .map_err(std::io::Error::from)
            .and_then(|mut line| {
                line.push('\n');
                file.write_all(line.as_bytes())?;
                file.flush()
            });

        match written {
            Ok(()) => state.event_count += 1,
            Err(e) => warn!(
                "Failed to record {} event for {}: {}",
                kind, self.session_id, e
            ),
        }
    }

    /// Close the transcript. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        if let Some(mut file) = state.file.take() {
            if let Err(e) = file.flush() {
                warn!("Error closing recording for {}: {}", self.session_id, e);
            }
            info!(
                "Recording stopped for {}: {} events",
                self.session_id, state.event_count
            );
        }
    }

    /// Write the metadata sidecar. No-op if disabled.
    pub fn write_metadata(&self) {
        if !self.config.enabled {
            return;
        }

        let path = self.metadata_path();
        let written = serde_json::to_string_pretty(&*self.lock_metadata())
            .map_err(std::io::Error::from)
            .and_then(|json| fs::write(&path, json));

        if let Err(e) = written {
            warn!("Failed to write metadata for {}: {}", self.session_id, e);
        }
    }

    // A panic while holding either lock leaves plain data behind, so a
    // poisoned lock is still usable.
    fn lock_state(&self) -> MutexGuard<'_, RecorderState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_metadata(&self) -> MutexGuard<'_, Metadata> {
        self.metadata
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::transcript::Transcript;
    use serde_json::json;
    use tempfile::tempdir;

    fn recording_config(dir: &std::path::Path, enabled: bool) -> RecordingConfig {
        RecordingConfig {
            enabled,
            output_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_records_events_in_order() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(
            recording_config(dir.path(), true),
            "sess-1",
            80,
            24,
            Metadata::new(),
        );

        recorder.start();
        assert!(recorder.active());
        recorder.record_output(b"hi");
        recorder.record_input(b"cmd\n");
        recorder.record_resize(100, 30);
        recorder.stop();
        assert!(!recorder.active());

        let transcript = Transcript::load(&dir.path().join("sess-1.cast")).unwrap();
        let kinds: Vec<_> = transcript.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Output, EventKind::Input, EventKind::Resize]
        );
        assert_eq!(transcript.events[0].data, "hi");
        assert_eq!(transcript.events[1].data, "cmd\n");
        assert_eq!(transcript.events[2].data, "100x30");
        assert_eq!(recorder.event_count(), 3);
    }

    #[test]
    fn test_header_round_trip() {
        let dir = tempdir().unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("username".to_string(), json!("root"));
        metadata.insert("source_port".to_string(), json!(40022));

        let recorder = SessionRecorder::new(
            recording_config(dir.path(), true),
            "sess-2",
            132,
            43,
            metadata.clone(),
        );
        let before = chrono::Utc::now().timestamp();
        recorder.start();
        for i in 0..5 {
            recorder.record_output(format!("line {i}\r\n").as_bytes());
        }
        recorder.stop();

        let transcript = Transcript::load(&recorder.transcript_path()).unwrap();
        assert_eq!(transcript.header.version, 2);
        assert_eq!(transcript.header.width, 132);
        assert_eq!(transcript.header.height, 43);
        assert!(transcript.header.timestamp >= before);
        assert_eq!(transcript.header.env, metadata);
        assert_eq!(transcript.events.len(), 5);
    }

    #[test]
    fn test_header_omits_empty_env() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(
            recording_config(dir.path(), true),
            "sess-3",
            80,
            24,
            Metadata::new(),
        );
        recorder.start();
        recorder.stop();

        let content = fs::read_to_string(recorder.transcript_path()).unwrap();
        let header = content.lines().next().unwrap();
        assert!(header.starts_with(r#"{"version":2,"width":80,"height":24,"timestamp":"#));
        assert!(!header.contains("env"));
    }

    #[test]
    fn test_elapsed_times_are_monotonic() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(
            recording_config(dir.path(), true),
            "sess-4",
            80,
            24,
            Metadata::new(),
        );
        recorder.start();
        for i in 0..50 {
            if i % 2 == 0 {
                recorder.record_input(b"x");
            } else {
                recorder.record_output(b"y");
            }
        }
        recorder.stop();

        let transcript = Transcript::load(&recorder.transcript_path()).unwrap();
        for pair in transcript.events.windows(2) {
            assert!(pair[1].elapsed >= pair[0].elapsed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_loops_keep_elapsed_monotonic() {
        let dir = tempdir().unwrap();
        let recorder = std::sync::Arc::new(SessionRecorder::new(
            recording_config(dir.path(), true),
            "sess-concurrent",
            80,
            24,
            Metadata::new(),
        ));
        recorder.start();

        let input = {
            let recorder = std::sync::Arc::clone(&recorder);
            tokio::spawn(async move {
                for _ in 0..200 {
                    recorder.record_input(b"k");
                    tokio::task::yield_now().await;
                }
            })
        };
        let output = {
            let recorder = std::sync::Arc::clone(&recorder);
            tokio::spawn(async move {
                for _ in 0..200 {
                    recorder.record_output(b"echo");
                    tokio::task::yield_now().await;
                }
            })
        };
        input.await.unwrap();
        output.await.unwrap();
        recorder.stop();

        let transcript = Transcript::load(&recorder.transcript_path()).unwrap();
        assert_eq!(transcript.events.len(), 400);
        for pair in transcript.events.windows(2) {
            assert!(pair[1].elapsed >= pair[0].elapsed);
        }
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(
            recording_config(dir.path(), true),
            "sess-5",
            80,
            24,
            Metadata::new(),
        );
        recorder.start();
        recorder.record_output(&[b'o', b'k', 0xff, 0xfe]);
        recorder.stop();

        let transcript = Transcript::load(&recorder.transcript_path()).unwrap();
        assert_eq!(transcript.events[0].data, "ok\u{fffd}\u{fffd}");
    }

    #[test]
    fn test_disabled_recorder_writes_nothing() {
        let dir = tempdir().unwrap();
        let output_dir = dir.path().join("recordings");
        let recorder = SessionRecorder::new(
            recording_config(&output_dir, false),
            "sess-6",
            80,
            24,
            Metadata::new(),
        );

        recorder.start();
        recorder.record_output(b"ignored");
        recorder.record_input(b"ignored");
        recorder.record_resize(1, 1);
        recorder.stop();
        recorder.write_metadata();

        assert!(!recorder.active());
        assert!(!output_dir.exists());
    }

    #[test]
    fn test_events_before_start_are_dropped() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(
            recording_config(dir.path(), true),
            "sess-7",
            80,
            24,
            Metadata::new(),
        );
        recorder.record_output(b"early");
        recorder.stop();
        recorder.stop();
        assert_eq!(recorder.event_count(), 0);
        assert!(!recorder.transcript_path().exists());
    }

    #[test]
    fn test_start_failure_leaves_recorder_inactive() {
        let dir = tempdir().unwrap();
        // A file where the output directory should be
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();

        let recorder = SessionRecorder::new(
            recording_config(&blocker, true),
            "sess-8",
            80,
            24,
            Metadata::new(),
        );
        recorder.start();
        assert!(!recorder.active());
        recorder.record_output(b"dropped");
        recorder.write_metadata();
        recorder.stop();
    }

    #[test]
    fn test_write_metadata_sidecar() {
        let dir = tempdir().unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("sandbox_id".to_string(), json!("abc123"));
        let recorder = SessionRecorder::new(
            recording_config(dir.path(), true),
            "sess-9",
            80,
            24,
            metadata,
        );
        recorder.insert_metadata("duration_secs", 12.5);
        recorder.write_metadata();

        let sidecar: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(recorder.metadata_path()).unwrap()).unwrap();
        assert_eq!(sidecar["sandbox_id"], "abc123");
        assert_eq!(sidecar["duration_secs"], 12.5);
    }
}
