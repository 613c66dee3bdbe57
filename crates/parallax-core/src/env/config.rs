//! Monitor configuration.

use std::time::Duration;

/// Environment variable overriding the poll interval, in milliseconds.
pub const POLL_INTERVAL_ENV: &str = "PARALLAX_POLL_INTERVAL_MS";

/// Environment variable enabling progress logging (`1`, `true`, `yes`).
pub const PROGRESS_ENV: &str = "PARALLAX_PROGRESS";

/// How an environment watches running units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Sleep between prunes for Poll backends.
    pub poll_interval: Duration,
    /// Log `completed/total` after every prune.
    pub progress: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            progress: false,
        }
    }
}

impl MonitorConfig {
    /// Defaults overridden by `PARALLAX_POLL_INTERVAL_MS` and `PARALLAX_PROGRESS`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(POLL_INTERVAL_ENV) {
            match value.trim().parse::<u64>() {
                Ok(ms) => config.poll_interval = Duration::from_millis(ms),
                Err(e) => tracing::warn!("Ignoring {}={:?}: {}", POLL_INTERVAL_ENV, value, e),
            }
        }

        if let Some(value) = lookup(PROGRESS_ENV) {
            config.progress = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        config
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
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
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::from_lookup(lookup(&[]));
        assert_eq!(config, MonitorConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(!config.progress);
    }

    #[test]
    fn test_env_overrides() {
        let config = MonitorConfig::from_lookup(lookup(&[
            (POLL_INTERVAL_ENV, "250"),
            (PROGRESS_ENV, "Yes"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(config.progress);
    }

    #[test]
    fn test_bad_interval_ignored() {
        let config = MonitorConfig::from_lookup(lookup(&[(POLL_INTERVAL_ENV, "soon")]));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }
}
