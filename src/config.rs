//! Transport configuration for the FireworksAI HTTP sender.
//!
//! Provider credentials and model settings live on the model descriptors;
//! this module only covers how requests are sent.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`HttpSender`](crate::HttpSender).
///
/// Every field has a default, so a partial document is enough.
///
/// # Example
///
/// ```rust
/// use fireworks_inference::SenderConfig;
/// use serde_json::json;
///
/// let config: SenderConfig = serde_json::from_value(json!({
///     "timeout_seconds": 30,
///     "max_retries": 5
/// }))
/// .unwrap();
///
/// assert_eq!(config.timeout_seconds, 30);
/// assert_eq!(config.max_concurrent_requests, 300);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Client-wide request timeout in seconds
    pub timeout_seconds: u64,
    /// Maximum number of requests in flight at once
    pub max_concurrent_requests: usize,
    /// Retries for rate limited, server error and connection failures
    pub max_retries: usize,
    /// Times an oversized request is truncated and resent
    pub max_truncation_attempts: usize,
    /// `User-Agent` header sent with every request
    pub user_agent: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 90,
            max_concurrent_requests: 300,
            max_retries: 3,
            max_truncation_attempts: 3,
            user_agent: concat!("fireworks-inference/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl SenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}
