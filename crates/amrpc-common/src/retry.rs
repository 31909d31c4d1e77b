// Copyright 2025 AMRPC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reconnect backoff policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for reconnect attempts with exponential backoff.
///
/// When the server's receive loop hits a transport failure it waits
/// `backoff_for(attempt)` and reconnects, giving up once `max_attempts`
/// consecutive attempts have failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of consecutive connection attempts
    ///
    /// `None` retries forever.
    /// Default: None
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnect, in milliseconds
    ///
    /// Default: 1000ms
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds
    ///
    /// Exponential backoff is capped at this value.
    /// Default: 30000ms
    pub max_backoff_ms: u64,
    /// Exponential backoff multiplier
    ///
    /// Each retry waits: previous_backoff * multiplier
    /// Default: 2.0 (doubles each time)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A constant delay with no growth, retrying forever.
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            max_attempts: None,
            initial_backoff_ms: delay_ms,
            max_backoff_ms: delay_ms,
            backoff_multiplier: 1.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay to wait before reconnect number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = self.backoff_multiplier.max(1.0);
        let backoff = self.initial_backoff_ms as f64 * multiplier.powi(exponent);
        let capped = backoff.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Returns true if connection attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.backoff_for(1), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let config = RetryConfig {
            max_attempts: None,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(4), Duration::from_millis(800));
        assert_eq!(config.backoff_for(5), Duration::from_millis(1000));
        assert_eq!(config.backoff_for(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_fixed_delay() {
        let config = RetryConfig::fixed(250);
        assert_eq!(config.backoff_for(1), Duration::from_millis(250));
        assert_eq!(config.backoff_for(10), Duration::from_millis(250));
        assert!(config.allows(u32::MAX));
    }

    #[test]
    fn test_attempt_cap() {
        let config = RetryConfig::default().with_max_attempts(3);
        assert!(config.allows(1));
        assert!(config.allows(3));
        assert!(!config.allows(4));
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_attempts": 2}"#).unwrap();
        assert_eq!(config.max_attempts, Some(2));
        assert_eq!(config.max_backoff_ms, 30_000);
    }
}
