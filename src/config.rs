//! Runtime configuration parsed from environment variables.
//!
//! Every knob has a default; a missing or unparseable value falls back to it
//! rather than failing startup.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3002;
pub const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 2000;
pub const DEFAULT_POSITION_THROTTLE_MS: u64 = 50;
pub const DEFAULT_TURN_IDLE_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_TURN_SWEEP_INTERVAL_MS: u64 = 10_000;

/// Timing knobs for coalescing and drawing-turn arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiet period before a debounced save fires.
    pub save_debounce: Duration,
    /// Minimum spacing between accepted position updates for one note.
    pub position_throttle: Duration,
    /// Idle time after which a held drawing turn is force-released.
    pub turn_idle_timeout: Duration,
    /// How often the turn sweeper checks for an idle holder.
    pub turn_sweep_interval: Duration,
}

impl SyncConfig {
    /// Read timing knobs from the environment.
    ///
    /// Optional:
    /// - `SAVE_DEBOUNCE_MS`: default 2000
    /// - `POSITION_THROTTLE_MS`: default 50
    /// - `TURN_IDLE_TIMEOUT_MS`: default 20000
    /// - `TURN_SWEEP_INTERVAL_MS`: default 10000
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            save_debounce: Duration::from_millis(env_parse("SAVE_DEBOUNCE_MS", DEFAULT_SAVE_DEBOUNCE_MS)),
            position_throttle: Duration::from_millis(env_parse("POSITION_THROTTLE_MS", DEFAULT_POSITION_THROTTLE_MS)),
            turn_idle_timeout: Duration::from_millis(env_parse("TURN_IDLE_TIMEOUT_MS", DEFAULT_TURN_IDLE_TIMEOUT_MS)),
            turn_sweep_interval: Duration::from_millis(env_parse(
                "TURN_SWEEP_INTERVAL_MS",
                DEFAULT_TURN_SWEEP_INTERVAL_MS,
            )),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(DEFAULT_SAVE_DEBOUNCE_MS),
            position_throttle: Duration::from_millis(DEFAULT_POSITION_THROTTLE_MS),
            turn_idle_timeout: Duration::from_millis(DEFAULT_TURN_IDLE_TIMEOUT_MS),
            turn_sweep_interval: Duration::from_millis(DEFAULT_TURN_SWEEP_INTERVAL_MS),
        }
    }
}

/// Process-level settings: listener port, optional database, and sync timing.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub sync: SyncConfig,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            sync: SyncConfig::from_env(),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
