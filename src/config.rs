use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::NetworkMode;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "sandtrap.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
    #[serde(default)]
    pub container_pool: ContainerPoolConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub docker: DockerConfig,
}

/// Listener configuration for the attacker-facing transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on simultaneously proxied sessions
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,

    /// Session timeout in seconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,

    /// Login attempts a connection gets before it is dropped
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,

    /// Front end presented to clients
    #[serde(default)]
    pub transport: TransportKind,

    /// Private host key for the SSH transport (OpenSSH format)
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,

    /// Seconds live sessions get to finish on shutdown before they are aborted
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

/// Which front end accepts attacker connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// SSH with password authentication
    #[default]
    Ssh,
    /// Plain `login:` / `Password:` prompt over TCP
    Tcp,
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_concurrent_sessions: default_max_sessions(),
            session_timeout: default_session_timeout(),
            max_auth_attempts: default_max_auth_attempts(),
            transport: TransportKind::default(),
            host_key_path: default_host_key_path(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    /// Username/password pairs that are always accepted
    #[serde(default)]
    pub static_credentials: Vec<Credential>,

    /// Accept any credentials once a connection has failed this many times (0 disables)
    #[serde(default = "default_accept_all_after")]
    pub accept_all_after_failures: u32,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            static_credentials: Vec::new(),
            accept_all_after_failures: default_accept_all_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    #[serde(default = "default_cap_drop")]
    pub drop: Vec<String>,
    #[serde(default = "default_cap_add")]
    pub add: Vec<String>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            drop: default_cap_drop(),
            add: default_cap_add(),
        }
    }
}

/// Resource and isolation policy applied to every sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityProfile {
    #[serde(default)]
    pub network_mode: NetworkMode,

    /// Memory limit (e.g., "256m")
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    /// CPU quota in cores
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: f64,

    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Size of the in-memory /tmp mount
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,

    #[serde(default)]
    pub capabilities: CapabilityConfig,

    #[serde(default = "default_security_opt")]
    pub security_opt: Vec<String>,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            network_mode: NetworkMode::default(),
            memory_limit: default_memory_limit(),
            cpu_quota: default_cpu_quota(),
            pids_limit: default_pids_limit(),
            tmpfs_size: default_tmpfs_size(),
            capabilities: CapabilityConfig::default(),
            security_opt: default_security_opt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerPoolConfig {
    /// Number of ready sandboxes to keep warm
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Timeout for creating and starting one sandbox, in seconds
    #[serde(default = "default_spawn_timeout")]
    pub spawn_timeout: u64,

    /// Image the sandboxes run
    #[serde(default = "default_image")]
    pub image: String,

    /// Hard cap on a single session, in seconds
    #[serde(default = "default_max_session_duration")]
    pub max_session_duration: u64,

    #[serde(default)]
    pub security: SecurityProfile,
}

impl Default for ContainerPoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            spawn_timeout: default_spawn_timeout(),
            image: default_image(),
            max_session_duration: default_max_session_duration(),
            security: SecurityProfile::default(),
        }
    }
}

impl ContainerPoolConfig {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Enable/disable transcript recording
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory receiving `.cast` transcripts and `.json` sidecars
    #[serde(default = "default_recording_dir")]
    pub output_dir: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: default_recording_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for the sandtrap target
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Also write daily-rolled log files here
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Unix socket of the Docker daemon
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Explicit daemon URL (`unix://`, `tcp://` or `http://`), overrides the socket path
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            base_url: None,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2222
}

fn default_max_sessions() -> usize {
    10
}

fn default_session_timeout() -> u64 {
    3600
}

fn default_max_auth_attempts() -> u32 {
    6
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("/data/keys/ssh_host_ed25519_key")
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_accept_all_after() -> u32 {
    3
}

fn default_cap_drop() -> Vec<String> {
    vec!["ALL".to_string()]
}

fn default_cap_add() -> Vec<String> {
    vec![
        "CHOWN".to_string(),
        "SETUID".to_string(),
        "SETGID".to_string(),
    ]
}

fn default_memory_limit() -> String {
    "256m".to_string()
}

fn default_cpu_quota() -> f64 {
    0.5
}

fn default_pids_limit() -> i64 {
    100
}

fn default_tmpfs_size() -> String {
    "50m".to_string()
}

fn default_security_opt() -> Vec<String> {
    vec![
        "no-new-privileges:true".to_string(),
        "seccomp=default".to_string(),
    ]
}

fn default_pool_size() -> usize {
    3
}

fn default_spawn_timeout() -> u64 {
    30
}

fn default_image() -> String {
    "sandtrap-target-ubuntu:latest".to_string()
}

fn default_max_session_duration() -> u64 {
    3600
}

fn default_recording_dir() -> PathBuf {
    PathBuf::from("/data/recordings")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.server.host_key_path = expand_path(&config.server.host_key_path)?;
        config.recording.output_dir = expand_path(&config.recording.output_dir)?;
        if let Some(dir) = config.logging.output_dir.take() {
            config.logging.output_dir = Some(expand_path(&dir)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Enforce the value ranges the rest of the system relies on
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be between 1 and 65535");
        }
        if self.server.max_concurrent_sessions == 0 {
            bail!("server.max_concurrent_sessions must be at least 1");
        }
        if self.server.session_timeout < 60 {
            bail!("server.session_timeout must be at least 60 seconds");
        }
        if self.server.max_auth_attempts == 0 {
            bail!("server.max_auth_attempts must be at least 1");
        }
        if self.server.shutdown_grace > 600 {
            bail!("server.shutdown_grace must be at most 600 seconds");
        }

        let pool = &self.container_pool;
        if pool.size == 0 {
            bail!("container_pool.size must be at least 1");
        }
        if pool.spawn_timeout < 5 {
            bail!("container_pool.spawn_timeout must be at least 5 seconds");
        }
        if pool.max_session_duration < 60 {
            bail!("container_pool.max_session_duration must be at least 60 seconds");
        }

        let security = &pool.security;
        if !(0.1..=8.0).contains(&security.cpu_quota) {
            bail!(
                "container_pool.security.cpu_quota must be between 0.1 and 8.0 (got {})",
                security.cpu_quota
            );
        }
        if security.pids_limit < 10 {
            bail!("container_pool.security.pids_limit must be at least 10");
        }

        Ok(())
    }

    /// Effective per-session limit: the tighter of the server and pool caps
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(
            self.server
                .session_timeout
                .min(self.container_pool.max_session_duration),
        )
    }
}

/// Expand a leading `~/` to the home directory
fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir().context("Could not determine home directory")?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.recording.enabled);
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.server.transport, TransportKind::Ssh);
        assert_eq!(config.server.shutdown_grace, 30);
        assert_eq!(config.container_pool.size, 3);
        assert_eq!(config.container_pool.security.network_mode, NetworkMode::None);
        assert_eq!(config.container_pool.security.capabilities.drop, vec!["ALL"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 2022
session_timeout = 600
transport = "tcp"
host_key_path = "/etc/sandtrap/host_key"
shutdown_grace = 5

[[authentication.static_credentials]]
username = "root"
password = "toor"

[container_pool]
size = 5
image = "honeypot:latest"

[container_pool.security]
network_mode = "bridge"
memory_limit = "512m"
cpu_quota = 1.5

[container_pool.security.capabilities]
add = ["NET_RAW"]

[recording]
enabled = false
output_dir = "/tmp/casts"

[logging]
format = "json"
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.server.port, 2022);
        assert_eq!(config.server.transport, TransportKind::Tcp);
        assert_eq!(
            config.server.host_key_path,
            PathBuf::from("/etc/sandtrap/host_key")
        );
        assert_eq!(config.server.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.authentication.static_credentials.len(), 1);
        assert_eq!(config.container_pool.size, 5);
        assert_eq!(config.container_pool.image, "honeypot:latest");
        assert_eq!(
            config.container_pool.security.network_mode,
            NetworkMode::Bridge
        );
        assert_eq!(config.container_pool.security.capabilities.add, vec!["NET_RAW"]);
        // Unspecified list keeps its default
        assert_eq!(config.container_pool.security.capabilities.drop, vec!["ALL"]);
        assert!(!config.recording.enabled);
        assert_eq!(config.recording.output_dir, PathBuf::from("/tmp/casts"));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(Config::parse("[container_pool]\nsize = 0\n").is_err());
        assert!(Config::parse("[container_pool]\nspawn_timeout = 1\n").is_err());
        assert!(Config::parse("[container_pool.security]\ncpu_quota = 9.0\n").is_err());
        assert!(Config::parse("[container_pool.security]\npids_limit = 5\n").is_err());
        assert!(Config::parse("[server]\nsession_timeout = 10\n").is_err());
        assert!(Config::parse("[server]\nport = 0\n").is_err());
        assert!(Config::parse("[server]\nshutdown_grace = 601\n").is_err());
        assert!(Config::parse("[server]\ntransport = \"telnet\"\n").is_err());
    }

    #[test]
    fn test_session_timeout_uses_tighter_limit() {
        let mut config = Config::default();
        config.server.session_timeout = 900;
        config.container_pool.max_session_duration = 300;
        assert_eq!(config.session_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.container_pool.size, 3);
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(
            expand_path(Path::new("/data/recordings")).unwrap(),
            PathBuf::from("/data/recordings")
        );

        if dirs::home_dir().is_some() {
            let expanded = expand_path(Path::new("~/casts")).unwrap();
            assert!(!expanded.starts_with("~"));
            assert!(expanded.ends_with("casts"));
        }
    }
}
