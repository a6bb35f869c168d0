//! Play a recorded session back in the terminal.

use anyhow::{bail, Result};
use colored::Colorize;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::session::transcript::{EventKind, TranscriptEvent};
use crate::session::Transcript;

pub(crate) async fn run(file: &Path, speed: f64, max_idle: Option<f64>) -> Result<()> {
    if !(speed > 0.0 && speed.is_finite()) {
        bail!("--speed must be a positive number");
    }
    if max_idle.is_some_and(|idle| idle < 0.0) {
        bail!("--max-idle must not be negative");
    }

    let transcript = Transcript::load(file)?;
    debug!(
        "Replaying {} ({} events, {:.1}s)",
        file.display(),
        transcript.events.len(),
        transcript.duration()
    );

    eprintln!(
        "{} {} ({}x{}, {:.1}s)",
        "▶".green().bold(),
        file.display().to_string().cyan(),
        transcript.header.width,
        transcript.header.height,
        transcript.duration()
    );

    let mut stdout = std::io::stdout();
    for (delay, data) in playback_schedule(&transcript.events, speed, max_idle) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        stdout.write_all(data.as_bytes())?;
        stdout.flush()?;
    }

    eprintln!("\n{} Replay finished", "■".blue());
    Ok(())
}

/// Output chunks paired with the pause before each one.
///
/// Pauses are measured between output events; input and resize events
/// only advance the clock. Each pause is capped at `max_idle` seconds
/// (before speed scaling) and divided by `speed`.
fn playback_schedule(
    events: &[TranscriptEvent],
    speed: f64,
    max_idle: Option<f64>,
) -> Vec<(Duration, &str)> {
    let mut previous = 0.0_f64;
    let mut schedule = Vec::new();

    for event in events {
        if event.kind != EventKind::Output {
            continue;
        }
        let mut gap = (event.elapsed - previous).max(0.0);
        if let Some(idle) = max_idle {
            gap = gap.min(idle);
        }
        previous = event.elapsed;
        schedule.push((Duration::from_secs_f64(gap / speed), event.data.as_str()));
    }

    schedule
}
