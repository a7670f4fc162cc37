use std::env;
use std::time::Duration;

use crate::DEFAULT_TIMEOUT;

/// Environment variable overriding [`PortConfig::rpc_timeout`], in milliseconds.
pub const RPC_TIMEOUT_ENV: &str = "LLMPORT_RPC_TIMEOUT_MS";
/// Environment variable enabling the channel inactivity watchdog, in milliseconds.
pub const INACTIVITY_TIMEOUT_ENV: &str = "LLMPORT_INACTIVITY_TIMEOUT_MS";
/// Environment variable overriding the maximum frame length, in bytes.
pub const MAX_FRAME_LENGTH_ENV: &str = "LLMPORT_MAX_FRAME_LENGTH";

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    rpc_timeout: Duration,
    inactivity_timeout: Option<Duration>,
    max_frame_length: usize,
    validate_outgoing: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_TIMEOUT,
            inactivity_timeout: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            validate_outgoing: true,
        }
    }
}

impl PortConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with any overrides found in the process environment.
    /// Unparsable or non-positive values are ignored.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = lookup(RPC_TIMEOUT_ENV).as_deref().and_then(parse_positive) {
            self.rpc_timeout = Duration::from_millis(ms as u64);
        }
        if let Some(ms) = lookup(INACTIVITY_TIMEOUT_ENV)
            .as_deref()
            .and_then(parse_positive)
        {
            self.inactivity_timeout = Some(Duration::from_millis(ms as u64));
        }
        if let Some(len) = lookup(MAX_FRAME_LENGTH_ENV)
            .as_deref()
            .and_then(parse_positive)
        {
            self.max_frame_length = len;
        }
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Synthesizes a `cancel` when a channel stays silent this long.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn with_max_frame_length(mut self, len: usize) -> Self {
        self.max_frame_length = len;
        self
    }

    pub fn with_validate_outgoing(mut self, validate: bool) -> Self {
        self.validate_outgoing = validate;
        self
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    pub fn validate_outgoing(&self) -> bool {
        self.validate_outgoing
    }
}

fn parse_positive(raw: &str) -> Option<usize> {
    let value = raw.trim().parse::<usize>().ok()?;
    (value > 0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parse_positive_rejects_invalid_values() {
        assert_eq!(parse_positive("0"), None);
        assert_eq!(parse_positive("-1"), None);
        assert_eq!(parse_positive("abc"), None);
    }

    #[test]
    fn parse_positive_accepts_positive_values() {
        assert_eq!(parse_positive("250"), Some(250));
        assert_eq!(parse_positive(" 4 "), Some(4));
    }

    #[test]
    fn defaults() {
        let config = PortConfig::new();
        assert_eq!(config.rpc_timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.inactivity_timeout(), None);
        assert_eq!(config.max_frame_length(), 16 * 1024 * 1024);
        assert!(config.validate_outgoing());
    }

    #[test]
    fn builder_overrides() {
        let config = PortConfig::new()
            .with_rpc_timeout(Duration::from_secs(5))
            .with_inactivity_timeout(Duration::from_millis(300))
            .with_max_frame_length(1024)
            .with_validate_outgoing(false);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
        assert_eq!(config.inactivity_timeout(), Some(Duration::from_millis(300)));
        assert_eq!(config.max_frame_length(), 1024);
        assert!(!config.validate_outgoing());
    }

    #[test]
    fn environment_overrides_skip_bad_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (RPC_TIMEOUT_ENV, "1500"),
            (INACTIVITY_TIMEOUT_ENV, "0"),
            (MAX_FRAME_LENGTH_ENV, "lots"),
        ]);
        let config =
            PortConfig::default().with_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.rpc_timeout(), Duration::from_millis(1500));
        assert_eq!(config.inactivity_timeout(), None);
        assert_eq!(config.max_frame_length(), DEFAULT_MAX_FRAME_LENGTH);
    }
}
