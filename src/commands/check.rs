//! Validate the configuration, the host key and Docker without serving.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;

use crate::config::{Config, TransportKind};
use crate::sandbox::security::{
    build_sandbox_spec, format_cpu_quota, generate_sandbox_name, SandboxSpec,
};
use crate::sandbox::{DockerRuntime, SandboxError};
use crate::server::load_host_key;

pub(crate) async fn run(config_path: &Path, config: &Config, offline: bool) -> Result<()> {
    let now = chrono::Utc::now();
    let spec = build_sandbox_spec(
        &config.container_pool.security,
        &config.container_pool.image,
        &generate_sandbox_name(now),
        now,
    )
    .context("Security profile is invalid")?;

    print!("{}", format_summary(config_path, config, &spec));

    if config.server.transport == TransportKind::Ssh {
        let key_path = &config.server.host_key_path;
        if let Err(e) = load_host_key(key_path) {
            println!("\n{} {:#}", "✗".red().bold(), e);
            return Err(e);
        }
        println!(
            "\n{} Host key {} loaded",
            "✓".green().bold(),
            key_path.display().to_string().cyan()
        );
    }

    if offline {
        println!("\n{} Docker check skipped", "ℹ".blue());
        return Ok(());
    }

    let docker = match DockerRuntime::connect(&config.docker).await {
        Ok(docker) => docker,
        Err(e) => {
            println!("\n{} {}", "✗".red().bold(), e);
            let advice = hint(&e);
            return Err(e).context(advice);
        }
    };
    println!("\n{} Docker daemon reachable", "✓".green().bold());

    if let Err(e) = docker.ensure_image(&config.container_pool.image).await {
        println!("{} {}", "✗".red().bold(), e);
        let advice = hint(&e);
        return Err(e).context(advice);
    }
    println!(
        "{} Image {} present",
        "✓".green().bold(),
        config.container_pool.image.cyan()
    );

    Ok(())
}

fn hint(e: &SandboxError) -> &'static str {
    if e.is_docker_unavailable() {
        "Is the Docker daemon running and is [docker] configured correctly?"
    } else if e.is_image_not_found() {
        "Build or pull the sandbox image named in [container_pool] image"
    } else {
        "Docker check failed"
    }
}

/// Human-readable summary of the effective configuration.
fn format_summary(config_path: &Path, config: &Config, spec: &SandboxSpec) -> String {
    let mut out = String::new();
    let pool = &config.container_pool;
    let security = &pool.security;

    let _ = writeln!(out, "\n{}", "━".repeat(50).dimmed());
    let _ = writeln!(out, "{}", "   sandtrap configuration".yellow().bold());
    let _ = writeln!(out, "{}", "━".repeat(50).dimmed());
    let _ = writeln!(out, "  Config:      {}", config_path.display().to_string().cyan());
    let _ = writeln!(
        out,
        "  Listen:      {} ({})",
        format!("{}:{}", config.server.host, config.server.port).cyan(),
        match config.server.transport {
            TransportKind::Ssh => "ssh",
            TransportKind::Tcp => "tcp",
        }
    );
    let _ = writeln!(
        out,
        "  Sessions:    {} max, {}s timeout",
        config.server.max_concurrent_sessions,
        config.session_timeout().as_secs()
    );
    let accept_all = match config.authentication.accept_all_after_failures {
        0 => "never".to_string(),
        n => format!("after {n} failures"),
    };
    let _ = writeln!(
        out,
        "  Auth:        {} credentials, accept-all {}",
        config.authentication.static_credentials.len(),
        accept_all
    );
    let _ = writeln!(
        out,
        "  Pool:        {} x {}",
        pool.size,
        pool.image.cyan()
    );

    let _ = writeln!(out, "\n{}", "Sandbox limits:".yellow().bold());
    let network = if security.network_mode.is_isolated() {
        spec.network_mode.green()
    } else {
        spec.network_mode.red()
    };
    let _ = writeln!(out, "  Network:     {network}");
    let _ = writeln!(
        out,
        "  Memory:      {} ({} bytes)",
        security.memory_limit, spec.memory_bytes
    );
    let _ = writeln!(
        out,
        "  CPU:         {} (quota {}/{})",
        format_cpu_quota(security.cpu_quota),
        spec.cpu_quota,
        spec.cpu_period
    );
    let _ = writeln!(out, "  PIDs:        {}", spec.pids_limit);
    let _ = writeln!(out, "  Cap drop:    {}", spec.cap_drop.join(", "));
    let _ = writeln!(out, "  Cap add:     {}", spec.cap_add.join(", "));
    let _ = writeln!(out, "  Options:     {}", spec.security_opt.join(", "));

    let recording = if config.recording.enabled {
        config.recording.output_dir.display().to_string().cyan()
    } else {
        "disabled".red()
    };
    let _ = writeln!(out, "\n  Recording:   {recording}");
    let _ = writeln!(out, "{}", "━".repeat(50).dimmed());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_lists_limits() {
        colored::control::set_override(false);
        let config = Config::default();
        let spec = build_sandbox_spec(
            &config.container_pool.security,
            &config.container_pool.image,
            "sandtrap-target-test",
            chrono::Utc::now(),
        )
        .unwrap();

        let summary = format_summary(Path::new("sandtrap.toml"), &config, &spec);
        assert!(summary.contains("0.0.0.0:2222"));
        assert!(summary.contains("Network:     none"));
        assert!(summary.contains("268435456 bytes"));
        assert!(summary.contains("quota 50000/100000"));
        assert!(summary.contains("Cap drop:    ALL"));
        assert!(summary.contains("accept-all after 3 failures"));
    }

    #[test]
    fn test_summary_shows_disabled_recording() {
        colored::control::set_override(false);
        let mut config = Config::default();
        config.recording.enabled = false;
        config.authentication.accept_all_after_failures = 0;
        let spec = build_sandbox_spec(
            &config.container_pool.security,
            &config.container_pool.image,
            "sandtrap-target-test",
            chrono::Utc::now(),
        )
        .unwrap();

        let summary = format_summary(Path::new("sandtrap.toml"), &config, &spec);
        assert!(summary.contains("Recording:   disabled"));
        assert!(summary.contains("accept-all never"));
    }
}
