use serde::{Deserialize, Serialize};

/// Cadence configuration for materialized view refreshes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RefreshConfig {
    /// Minimum interval, in milliseconds, between two refreshes of the same view.
    ///
    /// Requests arriving inside the cooldown are deferred to the next allowed
    /// instant, not dropped. Zero disables the cooldown.
    #[serde(default = "default_refresh_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl RefreshConfig {
    /// Default minimum inter-refresh interval (one minute).
    pub const DEFAULT_COOLDOWN_MS: u64 = 60_000;
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_refresh_cooldown_ms(),
        }
    }
}

fn default_refresh_cooldown_ms() -> u64 {
    RefreshConfig::DEFAULT_COOLDOWN_MS
}
