//! # Logging setup helper.
//!
//! The framework logs through the [`tracing`] facade everywhere; embedding
//! applications install whatever subscriber they want. [`LogConfig`] is a
//! convenience for binaries that just need a formatted stdout subscriber.

use tracing_subscriber::EnvFilter;

/// Minimal subscriber configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, e.g. `"info"` or `"chassis=debug"`.
    pub level: String,
}

impl LogConfig {
    /// Reads `LOG_LEVEL` (default `"info"`).
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }

    /// Installs a formatted stdout subscriber.
    ///
    /// A no-op when a global subscriber is already set, so it is safe to call
    /// from tests and libraries alike.
    pub fn init(&self) {
        let filter = EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
