//! Broker and consumer configuration
//!
//! The broker endpoint comes from `RABBITMQ_URL`, optionally populated from a
//! `.env` file in the working directory. Consumers are tuned through
//! [`ConsumeOptions`], whose defaults match what every producer/consumer pair in
//! the fleet expects.

use tracing::warn;

use crate::error::{LogBusError, Result};

/// Environment variable holding the AMQP endpoint URI.
pub const BROKER_URL_ENV: &str = "RABBITMQ_URL";
/// Optional client-provided connection name shown in the broker's management UI.
pub const CONNECTION_NAME_ENV: &str = "LOG_BUS_CONNECTION_NAME";
/// Prefetch applied when the caller does not choose one.
pub const DEFAULT_PREFETCH_COUNT: u16 = 50;

#[derive(Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub connection_name: Option<String>,
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("url", &mask_url(&self.url))
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_name: None,
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Load `.env` (if present) into the process environment, then read the
    /// broker settings from it.
    ///
    /// # Errors
    ///
    /// Returns [`LogBusError::ConfigurationError`] when `RABBITMQ_URL` is unset
    /// or empty.
    pub fn load() -> Result<Self> {
        load_env_file();
        Self::from_env()
    }

    /// Read the broker settings from the process environment only.
    ///
    /// # Errors
    ///
    /// Returns [`LogBusError::ConfigurationError`] when `RABBITMQ_URL` is unset
    /// or empty.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the settings from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`LogBusError::ConfigurationError`] when the URL key is missing
    /// or blank.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup(BROKER_URL_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                LogBusError::ConfigurationError(format!(
                    "{BROKER_URL_ENV} must be set in the environment variables or .env file"
                ))
            })?;

        let connection_name = lookup(CONNECTION_NAME_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(Self {
            url,
            connection_name,
        })
    }

    /// URL with any credentials replaced, safe for logs.
    pub fn redacted_url(&self) -> String {
        mask_url(&self.url)
    }
}

/// Load `.env` from the working directory; absence is not an error.
pub fn load_env_file() {
    if let Err(e) = dotenvy::dotenv() {
        warn!(error = %e, "Could not load .env file, using environment variables from the host");
    }
}

fn mask_url(url: &str) -> String {
    match (url.split_once("://"), url.rfind('@')) {
        (Some((scheme, _)), Some(at_pos)) => {
            let host_part = url.get(at_pos..).unwrap_or_default();
            format!("{scheme}://***:***{host_part}")
        }
        (Some(_), None) => url.to_string(),
        _ => "***".to_string(),
    }
}

/// What the consume loop does with a delivery whose body is not a valid record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeFailurePolicy {
    /// Log and leave the delivery unacknowledged. The broker hands it out again
    /// once this consumer's channel closes.
    #[default]
    LeavePending,
    /// Log and reject without requeue. The broker drops the message, or
    /// dead-letters it when the queue has a dead-letter exchange policy.
    Reject,
}

/// Settings for one consume call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Consumer tag; the record kind's default tag when `None`.
    pub consumer_name: Option<String>,
    /// Maximum unacknowledged deliveries outstanding to this consumer.
    /// Zero means no limit.
    pub prefetch_count: u16,
    pub on_decode_failure: DecodeFailurePolicy,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            consumer_name: None,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            on_decode_failure: DecodeFailurePolicy::default(),
        }
    }
}

impl ConsumeOptions {
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_decode_failure_policy(mut self, policy: DecodeFailurePolicy) -> Self {
        self.on_decode_failure = policy;
        self
    }

    pub(crate) fn consumer_tag_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.consumer_name.as_deref().unwrap_or(default)
    }
}
