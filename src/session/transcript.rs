//! Reading asciicast v2 transcripts back.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// asciicast format version written by the recorder.
pub(crate) const TRANSCRIPT_VERSION: u32 = 2;

/// Event type tag in a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum EventKind {
    #[serde(rename = "o")]
    Output,
    #[serde(rename = "i")]
    Input,
    #[serde(rename = "r")]
    Resize,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            EventKind::Output => "o",
            EventKind::Input => "i",
            EventKind::Resize => "r",
        };
        f.write_str(tag)
    }
}

/// First line of a transcript.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TranscriptHeader {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    pub timestamp: i64,
    #[serde(default)]
    pub env: BTreeMap<String, serde_json::Value>,
}

/// One `[elapsed, kind, data]` line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TranscriptEvent {
    pub elapsed: f64,
    pub kind: EventKind,
    pub data: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Transcript {
    pub header: TranscriptHeader,
    pub events: Vec<TranscriptEvent>,
}

impl Transcript {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read transcript {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid transcript {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = content.lines().filter(|line| !line.trim().is_empty());

        let header_line = lines.next().context("Transcript is empty")?;
        let header: TranscriptHeader =
            serde_json::from_str(header_line).context("Failed to parse transcript header")?;
        if header.version != TRANSCRIPT_VERSION {
            bail!("Unsupported transcript version {}", header.version);
        }

        let events = lines
            .enumerate()
            .map(|(idx, line)| {
                let (elapsed, kind, data): (f64, EventKind, String) = serde_json::from_str(line)
                    .with_context(|| format!("Failed to parse event on line {}", idx + 2))?;
                Ok(TranscriptEvent {
                    elapsed,
                    kind,
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { header, events })
    }

    /// Total recorded duration in seconds.
    pub fn duration(&self) -> f64 {
        self.events.last().map_or(0.0, |event| event.elapsed)
    }

    /// Everything the client saw, concatenated.
    pub fn output(&self) -> String {
        self.events
            .iter()
            .filter(|event| event.kind == EventKind::Output)
            .map(|event| event.data.as_str())
            .collect()
    }
}
