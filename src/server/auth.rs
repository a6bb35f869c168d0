//! Credential checks with an accept-all fallback.
//!
//! Attackers that keep guessing are eventually let in: once a connection
//! has failed `accept_all_after_failures` times, its next attempt succeeds
//! whatever the credentials. A threshold of 0 disables the fallback.

use dashmap::DashMap;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::AuthenticationConfig;

/// Tracks failed attempts per connection id.
#[derive(Debug)]
pub(crate) struct AuthenticationManager {
    credentials: HashMap<String, String>,
    accept_all_after_failures: u32,
    failed_attempts: DashMap<String, u32>,
}

impl AuthenticationManager {
    pub fn new(config: &AuthenticationConfig) -> Self {
        // Later entries for the same username win
        let credentials: HashMap<_, _> = config
            .static_credentials
            .iter()
            .map(|cred| (cred.username.clone(), cred.password.clone()))
            .collect();

        info!("Loaded {} static credentials", credentials.len());
        if config.accept_all_after_failures == 0 {
            info!("Accept-all mode disabled");
        } else {
            info!(
                "Accept-all mode after {} failures",
                config.accept_all_after_failures
            );
        }

        Self {
            credentials,
            accept_all_after_failures: config.accept_all_after_failures,
            failed_attempts: DashMap::new(),
        }
    }

    /// Check one attempt. Success clears the connection's failure count.
    pub fn validate(&self, connection_id: &str, username: &str, password: &str) -> bool {
        // The entry guard holds the shard lock, so concurrent attempts on
        // one connection are counted one at a time.
        let mut failures = self
            .failed_attempts
            .entry(connection_id.to_string())
            .or_insert(0);

        let accepted = if self.accept_all_after_failures > 0
            && *failures >= self.accept_all_after_failures
        {
            info!(
                "Accept-all mode active for {} (username: {})",
                connection_id, username
            );
            true
        } else if self
            .credentials
            .get(username)
            .is_some_and(|expected| expected == password)
        {
            info!("Valid credentials for {} from {}", username, connection_id);
            true
        } else {
            *failures += 1;
            warn!(
                "Invalid credentials for {} from {} (attempt {})",
                username, connection_id, *failures
            );
            false
        };

        drop(failures);
        if accepted {
            self.failed_attempts.remove(connection_id);
        }
        accepted
    }

    /// Current failure count for a connection.
    #[cfg(test)]
    pub fn failed_attempts(&self, connection_id: &str) -> u32 {
        self.failed_attempts
            .get(connection_id)
            .map_or(0, |count| *count)
    }

    /// Number of connections with outstanding failures.
    #[cfg(test)]
    pub fn tracked_connections(&self) -> usize {
        self.failed_attempts.len()
    }

    /// Forget a disconnected connection.
    pub fn cleanup_connection(&self, connection_id: &str) {
        self.failed_attempts.remove(connection_id);
    }
}
