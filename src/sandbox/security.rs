//! Translation of a declarative [`SecurityProfile`] into concrete sandbox
//! creation parameters.
//!
//! Everything here is pure: the same profile, image, name and timestamp
//! always produce the same [`SandboxSpec`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::SecurityProfile;

/// CFS scheduler period Docker uses for CPU quotas, in microseconds.
pub(crate) const CPU_PERIOD: i64 = 100_000;

/// Errors raised for profiles that cannot be translated.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Invalid memory limit format: {limit}. Expected <number>[k|m|g] (e.g., '256m')")]
    InvalidMemoryLimit { limit: String },
}

/// Concrete parameters for creating one sandbox.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub network_mode: String,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub pids_limit: i64,
    pub tmpfs: HashMap<String, String>,
    pub security_opt: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
}

/// Build creation parameters for a sandbox named `name` running `image`.
pub(crate) fn build_sandbox_spec(
    profile: &SecurityProfile,
    image: &str,
    name: &str,
    created_at: DateTime<Utc>,
) -> Result<SandboxSpec, SecurityError> {
    let memory_bytes = parse_memory_limit(&profile.memory_limit)?;

    #[allow(clippy::cast_possible_truncation)]
    let cpu_quota = (profile.cpu_quota * CPU_PERIOD as f64) as i64;

    debug!(
        "Building sandbox spec: memory={}, cpu_quota={}/{} ({}), pids={}, network={}",
        profile.memory_limit,
        cpu_quota,
        CPU_PERIOD,
        format_cpu_quota(profile.cpu_quota),
        profile.pids_limit,
        profile.network_mode
    );

    if profile.cpu_quota > 2.0 {
        warn!(
            "High CPU quota configured: {} cores. Consider reducing to prevent resource exhaustion.",
            profile.cpu_quota
        );
    }
    if profile.pids_limit < 50 {
        warn!(
            "Very low PIDs limit: {}. Sandbox may fail to spawn necessary processes.",
            profile.pids_limit
        );
    }

    let labels = HashMap::from([
        ("sandtrap.role".to_string(), "target".to_string()),
        (
            "sandtrap.version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
        ("sandtrap.created".to_string(), created_at.to_rfc3339()),
    ]);

    let tmpfs = HashMap::from([(
        "/tmp".to_string(),
        format!("size={}", profile.tmpfs_size),
    )]);

    Ok(SandboxSpec {
        name: name.to_string(),
        image: image.to_string(),
        labels,
        network_mode: profile.network_mode.to_string(),
        memory_bytes,
        cpu_quota,
        cpu_period: CPU_PERIOD,
        pids_limit: profile.pids_limit,
        tmpfs,
        security_opt: profile.security_opt.clone(),
        cap_add: profile.capabilities.add.clone(),
        cap_drop: profile.capabilities.drop.clone(),
    })
}

/// Generate a unique sandbox name: `sandtrap-target-<id>-<timestamp>`.
pub(crate) fn generate_sandbox_name(now: DateTime<Utc>) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "sandtrap-target-{}-{}",
        &id[..8],
        now.format("%Y%m%d-%H%M%S")
    )
}

/// Parse memory limit string (e.g., "256m", "1g", "512k") to bytes
pub(crate) fn parse_memory_limit(limit: &str) -> Result<i64, SecurityError> {
    let invalid = || SecurityError::InvalidMemoryLimit {
        limit: limit.to_string(),
    };

    let lower = limit.to_lowercase();
    let (number, multiplier) = if let Some(num) = lower.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = lower.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = lower.strip_suffix('k') {
        (num, 1024)
    } else {
        return Err(invalid());
    };

    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let value: i64 = number.parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Human-readable CPU quota, e.g. "0.5 cores (50% of 1 core)".
pub(crate) fn format_cpu_quota(cores: f64) -> String {
    if (cores - 1.0).abs() < f64::EPSILON {
        "1 core".to_string()
    } else if cores < 1.0 {
        #[allow(clippy::cast_possible_truncation)]
        let percent = (cores * 100.0).round() as i64;
        format!("{cores} cores ({percent}% of 1 core)")
    } else {
        format!("{cores} cores")
    }
}
