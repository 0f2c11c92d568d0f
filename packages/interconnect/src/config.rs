use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::metrics::MAX_RATE_BUCKETS;
use crate::request::DEFAULT_REQUEST_TIMEOUT;

/// Tuning knobs for an interconnect instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterconnectConfig {
    /// Default deadline for `request`.
    pub request_timeout: Duration,
    /// Capacity of the subscription broadcast buffer.
    pub event_buffer: usize,
    /// Span of the events-per-second estimator.
    pub rate_window: Duration,
    /// Number of buckets the rate window is split into.
    pub rate_buckets: usize,
}

impl Default for InterconnectConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            event_buffer: 1024,
            rate_window: Duration::from_secs(1),
            rate_buckets: 10,
        }
    }
}

impl InterconnectConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let rate_buckets = parse_or(&lookup, "INTERCONNECT_RATE_BUCKETS")?
            .unwrap_or(defaults.rate_buckets);
        if !(1..=MAX_RATE_BUCKETS).contains(&rate_buckets) {
            anyhow::bail!(
                "INTERCONNECT_RATE_BUCKETS must be between 1 and {}, got {}",
                MAX_RATE_BUCKETS,
                rate_buckets
            );
        }

        Ok(Self {
            request_timeout: parse_or(&lookup, "INTERCONNECT_REQUEST_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            event_buffer: parse_or(&lookup, "INTERCONNECT_EVENT_BUFFER")?
                .unwrap_or(defaults.event_buffer),
            rate_window: parse_or(&lookup, "INTERCONNECT_RATE_WINDOW_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.rate_window),
            rate_buckets,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn with_rate_window(mut self, window: Duration, buckets: usize) -> Self {
        self.rate_window = window;
        self.rate_buckets = buckets;
        self
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be a valid number, got {:?}", key, raw)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = InterconnectConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, InterconnectConfig::default());
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let config = InterconnectConfig::from_lookup(lookup(&[
            ("INTERCONNECT_REQUEST_TIMEOUT_MS", "250"),
            ("INTERCONNECT_EVENT_BUFFER", "16"),
            ("INTERCONNECT_RATE_BUCKETS", " 4 "),
        ]))
        .unwrap();

        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.event_buffer, 16);
        assert_eq!(config.rate_buckets, 4);
        assert_eq!(config.rate_window, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_number_names_the_variable() {
        let err = InterconnectConfig::from_lookup(lookup(&[("INTERCONNECT_EVENT_BUFFER", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("INTERCONNECT_EVENT_BUFFER"));
    }

    #[test]
    fn test_rate_buckets_out_of_range() {
        for raw in ["0", "1001", "4294967296"] {
            let err =
                InterconnectConfig::from_lookup(lookup(&[("INTERCONNECT_RATE_BUCKETS", raw)]))
                    .unwrap_err();
            assert!(err.to_string().contains("INTERCONNECT_RATE_BUCKETS"), "{}", raw);
        }
    }
}
