//! Network isolation modes for sandbox containers.

use serde::{Deserialize, Serialize};

/// Docker network mode a sandbox is attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub(crate) enum NetworkMode {
    /// No network interface besides loopback
    #[default]
    None,
    /// Default bridge network
    Bridge,
    /// Share the host network stack
    Host,
    /// A user-defined Docker network, e.g. one routed through a tarpit
    Named(String),
}

impl NetworkMode {
    /// Returns true if the sandbox has no route out.
    pub fn is_isolated(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl From<String> for NetworkMode {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "none" => Self::None,
            "bridge" => Self::Bridge,
            "host" => Self::Host,
            _ => Self::Named(value),
        }
    }
}

impl From<NetworkMode> for String {
    fn from(mode: NetworkMode) -> Self {
        mode.to_string()
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Bridge => write!(f, "bridge"),
            Self::Host => write!(f, "host"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_mode_display() {
        assert_eq!(format!("{}", NetworkMode::None), "none");
        assert_eq!(format!("{}", NetworkMode::Bridge), "bridge");
        assert_eq!(format!("{}", NetworkMode::Host), "host");
        assert_eq!(
            format!("{}", NetworkMode::Named("tarpit".to_string())),
            "tarpit"
        );
    }

    #[test]
    fn test_network_mode_from_string() {
        assert_eq!(NetworkMode::from("NONE".to_string()), NetworkMode::None);
        assert_eq!(NetworkMode::from("bridge".to_string()), NetworkMode::Bridge);
        assert_eq!(
            NetworkMode::from("honeynet".to_string()),
            NetworkMode::Named("honeynet".to_string())
        );
    }

    #[test]
    fn test_only_none_is_isolated() {
        assert!(NetworkMode::None.is_isolated());
        assert!(!NetworkMode::Bridge.is_isolated());
        assert!(!NetworkMode::Named("x".to_string()).is_isolated());
    }
}
