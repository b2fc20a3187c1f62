//! Runtime configuration loaded from the environment.
//!
//! SYSTEM CONTEXT
//! ==============
//! Startup reads this once and threads it through `AppState`; nothing else
//! touches `std::env`, so tests can build configs directly.

use std::time::Duration;

const DEFAULT_PORT: u16 = 4000;
const DEFAULT_EMPTY_WORKSPACE_RETENTION_MS: u64 = 120_000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WS listen port.
    pub port: u16,
    /// How long an empty workspace is retained before teardown.
    pub empty_workspace_retention: Duration,
    /// Production deployments refuse the dev-fallback ticket secret.
    pub production: bool,
}

impl Config {
    /// Load from `PORT`, `COLAB_EMPTY_WORKSPACE_RETENTION_MS`, and `NODE_ENV`.
    ///
    /// Invalid or negative values fall back to defaults rather than aborting
    /// startup; the retention override accepts non-negative integers only.
    #[must_use]
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let retention_ms = std::env::var("COLAB_EMPTY_WORKSPACE_RETENTION_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_EMPTY_WORKSPACE_RETENTION_MS);

        let production = std::env::var("NODE_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);

        Self {
            port,
            empty_workspace_retention: Duration::from_millis(retention_ms),
            production,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            empty_workspace_retention: Duration::from_millis(DEFAULT_EMPTY_WORKSPACE_RETENTION_MS),
            production: false,
        }
    }
}
