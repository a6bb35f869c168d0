//! Domain-specific error types for sandbox runtime operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::time::Duration;

/// Errors that can occur while talking to the sandbox runtime.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Sandbox image was not found.
    #[error("Sandbox image not found: {image}")]
    ImageNotFound { image: String },

    /// Operation exceeded the configured timeout.
    #[error("Sandbox operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// Creating or starting the sandbox failed.
    #[error("Sandbox creation failed: {message}")]
    CreateFailed { message: String },

    /// The interactive process could not be created inside the sandbox.
    #[error("Sandbox exec failed: {message}")]
    ExecFailed { message: String },

    /// Stopping the sandbox failed.
    #[error("Sandbox stop failed: {message}")]
    StopFailed { message: String },

    /// Sandbox state could not be read.
    #[error("Sandbox inspect failed: {message}")]
    InspectFailed { message: String },
}

impl SandboxError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates a `CreateFailed` error.
    pub fn create_failed(message: impl Into<String>) -> Self {
        Self::CreateFailed {
            message: message.into(),
        }
    }

    /// Creates an `ExecFailed` error.
    pub fn exec_failed(message: impl Into<String>) -> Self {
        Self::ExecFailed {
            message: message.into(),
        }
    }

    /// Creates a `StopFailed` error.
    pub fn stop_failed(message: impl Into<String>) -> Self {
        Self::StopFailed {
            message: message.into(),
        }
    }

    /// Creates an `InspectFailed` error.
    pub fn inspect_failed(message: impl Into<String>) -> Self {
        Self::InspectFailed {
            message: message.into(),
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this is a Docker unavailability error.
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }

    /// Returns true if this is an image not found error.
    pub fn is_image_not_found(&self) -> bool {
        matches!(self, Self::ImageNotFound { .. })
    }
}
