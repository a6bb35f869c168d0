//! Embedded templates for generated files.

/// Default `sandtrap.toml` configuration.
pub(crate) const SANDTRAP_TOML: &str = include_str!("sandtrap.toml");

/// Dockerfile for the default sandbox image.
pub(crate) const TARGET_DOCKERFILE: &str = include_str!("target.Dockerfile");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_default_template_parses() {
        let config = Config::parse(SANDTRAP_TOML).unwrap();
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.container_pool.size, 3);
        assert_eq!(config.authentication.static_credentials.len(), 2);
        assert!(config.container_pool.security.network_mode.is_isolated());
        assert!(config.recording.enabled);
    }
}
