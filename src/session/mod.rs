//! Per-session machinery: orchestration, I/O proxying and transcripts.

mod handler;
pub(crate) mod proxy;
pub(crate) mod recorder;
pub(crate) mod transcript;

pub(crate) use handler::SessionOrchestrator;
pub(crate) use transcript::Transcript;
