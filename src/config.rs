//! Monitoring configuration from environment variables
//!
//! Thresholds and debounce intervals are global, not per-client. All values
//! have defaults matching the deployed detector tuning, so an empty
//! environment yields a working configuration.

use crate::types::AlertType;
use std::env;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How long records are retained in the per-client rolling window (seconds).
    pub retention_s: i64,

    /// Stuck alert fires after this many seconds without a clear-path signal.
    pub stuck_alert_s: i64,

    /// Minimum gap for a stuck interval in aggregation (seconds).
    pub stuck_min_s: i64,

    /// Danger surge fires at this many stop-tagged records within the window.
    pub danger_stop_count: usize,

    /// Danger surge lookback window (seconds).
    pub danger_window_s: i64,

    /// Inactivity alert fires after this many seconds without any record.
    pub inactivity_s: i64,

    /// Maneuvering alert fires at this many direction changes within the window.
    pub maneuver_count: usize,

    /// Maneuvering lookback window (seconds).
    pub maneuver_window_s: i64,

    /// Near-miss distance threshold (meters).
    pub crash_near_m: f64,

    /// Minimum detection confidence for hazard metrics.
    pub conf_min: f64,

    /// Per-alert-type debounce intervals (seconds).
    pub debounce_stuck_s: i64,
    pub debounce_accident_s: i64,
    pub debounce_default_s: i64,

    /// Inactivity tick interval for the background scheduler (milliseconds).
    pub tick_interval_ms: u64,

    /// Ingestion channel buffer size (records).
    pub channel_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            retention_s: 600,
            stuck_alert_s: 300,
            stuck_min_s: 120,
            danger_stop_count: 10,
            danger_window_s: 60,
            inactivity_s: 600,
            maneuver_count: 9,
            maneuver_window_s: 60,
            crash_near_m: 0.6,
            conf_min: 0.6,
            debounce_stuck_s: 900,
            debounce_accident_s: 7200,
            debounce_default_s: 300,
            tick_interval_ms: 5_000,
            channel_buffer: 10_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl MonitorConfig {
    /// Load configuration from `PATHSENSE_*` environment variables.
    ///
    /// Unset or unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            retention_s: env_parse("PATHSENSE_RETENTION_S", d.retention_s),
            stuck_alert_s: env_parse("PATHSENSE_STUCK_ALERT_S", d.stuck_alert_s),
            stuck_min_s: env_parse("PATHSENSE_STUCK_MIN_S", d.stuck_min_s),
            danger_stop_count: env_parse("PATHSENSE_DANGER_STOP_COUNT", d.danger_stop_count),
            danger_window_s: env_parse("PATHSENSE_DANGER_WINDOW_S", d.danger_window_s),
            inactivity_s: env_parse("PATHSENSE_INACTIVITY_S", d.inactivity_s),
            maneuver_count: env_parse("PATHSENSE_MANEUVER_COUNT", d.maneuver_count),
            maneuver_window_s: env_parse("PATHSENSE_MANEUVER_WINDOW_S", d.maneuver_window_s),
            crash_near_m: env_parse("PATHSENSE_CRASH_NEAR_M", d.crash_near_m),
            conf_min: env_parse("PATHSENSE_CONF_MIN", d.conf_min),
            debounce_stuck_s: env_parse("PATHSENSE_DEBOUNCE_STUCK_S", d.debounce_stuck_s),
            debounce_accident_s: env_parse("PATHSENSE_DEBOUNCE_ACCIDENT_S", d.debounce_accident_s),
            debounce_default_s: env_parse("PATHSENSE_DEBOUNCE_DEFAULT_S", d.debounce_default_s),
            tick_interval_ms: env_parse("PATHSENSE_TICK_INTERVAL_MS", d.tick_interval_ms),
            channel_buffer: env_parse("PATHSENSE_CHANNEL_BUFFER", d.channel_buffer),
        }
    }

    /// Cooldown interval after an emission of the given alert type.
    pub fn debounce_for(&self, alert_type: AlertType) -> i64 {
        match alert_type {
            AlertType::Stuck => self.debounce_stuck_s,
            AlertType::Accident => self.debounce_accident_s,
            _ => self.debounce_default_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.retention_s, 600);
        assert_eq!(config.stuck_alert_s, 300);
        assert_eq!(config.danger_stop_count, 10);
        assert_eq!(config.maneuver_count, 9);
        assert_eq!(config.crash_near_m, 0.6);
    }

    #[test]
    fn test_debounce_per_type() {
        let config = MonitorConfig::default();
        assert_eq!(config.debounce_for(AlertType::Stuck), 900);
        assert_eq!(config.debounce_for(AlertType::Accident), 7200);
        assert_eq!(config.debounce_for(AlertType::DangerSurge), 300);
        assert_eq!(config.debounce_for(AlertType::Inactivity), 300);
    }

    #[test]
    fn test_env_override() {
        env::set_var("PATHSENSE_STUCK_ALERT_S", "120");
        env::set_var("PATHSENSE_CRASH_NEAR_M", "0.8");

        let config = MonitorConfig::from_env();
        assert_eq!(config.stuck_alert_s, 120);
        assert_eq!(config.crash_near_m, 0.8);

        env::remove_var("PATHSENSE_STUCK_ALERT_S");
        env::remove_var("PATHSENSE_CRASH_NEAR_M");
    }
}
