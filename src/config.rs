//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `monitor.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     environment overrides (ENVMON_API_URL, ENVMON_TOKEN, ENVMON_LOCATION).
//!
//! structure:
//!     - BackendConfig: where the rest api lives (push url is derived from it).
//!     - SessionConfig: bearer token / token file and the initial location.
//!     - LivenessConfig: soft/strict/category windows and tick periods.
//!     - PollingConfig: fleet status poll period.
//!     - HistoryConfig: rolling history length.
//!     - ServerConfig / LoggingConfig: snapshot server and log output.
//!
//! ==============================================================================

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::EngineConfig;
use crate::liveness::LivenessWindows;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub backend: BackendConfig,
    pub session: SessionConfig,
    pub liveness: LivenessConfig,
    pub polling: PollingConfig,
    pub history: HistoryConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub api_url: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub location_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LivenessConfig {
    pub soft_window_ms: u64,
    pub strict_window_ms: u64,
    pub category_window_ms: u64,
    pub soft_tick_ms: u64,
    pub strict_tick_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { api_url: "http://localhost:8000".to_string(), request_timeout_ms: 4_000 }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            soft_window_ms: 20_000,
            strict_window_ms: 30_000,
            category_window_ms: 30_000,
            soft_tick_ms: 1_000,
            strict_tick_ms: 2_000,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_ms: 5_000 }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: crate::series::DEFAULT_CAPACITY }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:3000".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

/// outcome of the config file search
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: MonitorConfig,
    /// file the config came from; None means built-in defaults
    pub source: Option<PathBuf>,
    /// files that exist but could not be used, with the reason
    pub rejected: Vec<(PathBuf, String)>,
}

impl LoadedConfig {
    pub fn log(&self) {
        for (path, error) in &self.rejected {
            warn!(path = %path.display(), error = %error, "config rejected");
        }
        match &self.source {
            Some(path) => info!(path = %path.display(), "config loaded"),
            None => warn!("no usable config file found, using defaults"),
        }
        self.config.log_summary();
    }
}

impl MonitorConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: MonitorConfig = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback, then apply environment overrides.
    /// runs before logging is set up, so nothing is logged here; call
    /// `LoadedConfig::log` once a subscriber is installed.
    pub fn load_or_default() -> LoadedConfig {
        let paths = [
            PathBuf::from("config").join("monitor.toml"),
            PathBuf::from("..").join("config").join("monitor.toml"),
        ];
        let mut loaded = Self::load_first(&paths);
        loaded.config.apply_env(|key| std::env::var(key).ok());
        loaded
    }

    /// first file among `paths` that exists and parses; files that exist but
    /// fail are recorded, not skipped silently
    pub fn load_first(paths: &[PathBuf]) -> LoadedConfig {
        let mut rejected = Vec::new();
        for path in paths.iter().filter(|p| p.exists()) {
            match Self::load(path) {
                Ok(config) => {
                    return LoadedConfig { config, source: Some(path.clone()), rejected };
                }
                Err(e) => rejected.push((path.clone(), format!("{:#}", e))),
            }
        }
        LoadedConfig { config: Self::default(), source: None, rejected }
    }

    /// overrides come through a lookup fn so tests don't touch the process env
    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(url) = lookup("ENVMON_API_URL") {
            self.backend.api_url = url;
        }
        if let Some(token) = lookup("ENVMON_TOKEN") {
            self.session.token = Some(token);
        }
        if let Some(location) = lookup("ENVMON_LOCATION") {
            self.session.location_id = Some(location);
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        let l = &self.liveness;
        anyhow::ensure!(l.soft_tick_ms > 0 && l.strict_tick_ms > 0, "liveness ticks must be non-zero");
        anyhow::ensure!(self.polling.interval_ms > 0, "polling.interval_ms must be non-zero");
        anyhow::ensure!(self.history.capacity > 0, "history.capacity must be non-zero");
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.request_timeout_ms)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let l = &self.liveness;
        EngineConfig {
            windows: LivenessWindows {
                soft: Duration::from_millis(l.soft_window_ms),
                strict: Duration::from_millis(l.strict_window_ms),
                category: Duration::from_millis(l.category_window_ms),
            },
            soft_tick: Duration::from_millis(l.soft_tick_ms),
            strict_tick: Duration::from_millis(l.strict_tick_ms),
            poll_interval: Duration::from_millis(self.polling.interval_ms),
            history_capacity: self.history.capacity,
        }
    }

    /// Print configuration summary
    pub fn log_summary(&self) {
        info!(
            api_url = %self.backend.api_url,
            location = self.session.location_id.as_deref().unwrap_or("<auto>"),
            authenticated = self.session.token.is_some() || self.session.token_file.is_some(),
            poll_ms = self.polling.interval_ms,
            soft_ms = self.liveness.soft_window_ms,
            strict_ms = self.liveness.strict_window_ms,
            history = self.history.capacity,
            bind = %self.server.bind,
            "monitor configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_dashboard_timings() {
        let engine = MonitorConfig::default().engine_config();
        assert_eq!(engine, EngineConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = MonitorConfig::parse(
            r#"
            [backend]
            api_url = "http://192.168.1.7:8000"

            [session]
            location_id = "YELAHANKA_BOREWELL_01"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.api_url, "http://192.168.1.7:8000");
        assert_eq!(config.backend.request_timeout_ms, 4_000);
        assert_eq!(config.session.location_id.as_deref(), Some("YELAHANKA_BOREWELL_01"));
        assert_eq!(config.polling.interval_ms, 5_000);
    }

    #[test]
    fn shipped_file_is_the_defaults() {
        let config = MonitorConfig::parse(include_str!("../config/monitor.toml")).unwrap();
        assert_eq!(config, MonitorConfig::default());
    }

    #[test]
    fn rejects_zero_intervals() {
        assert!(MonitorConfig::parse("[polling]\ninterval_ms = 0\n").is_err());
        assert!(MonitorConfig::parse("[history]\ncapacity = 0\n").is_err());
    }

    #[test]
    fn env_overrides_win() {
        let mut config = MonitorConfig::default();
        config.apply_env(|key| match key {
            "ENVMON_TOKEN" => Some("t1".to_string()),
            "ENVMON_LOCATION" => Some("loc-1".to_string()),
            _ => None,
        });
        assert_eq!(config.session.token.as_deref(), Some("t1"));
        assert_eq!(config.session.location_id.as_deref(), Some("loc-1"));
        assert_eq!(config.backend.api_url, "http://localhost:8000");
    }

    #[test]
    fn broken_file_is_reported_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        let good = dir.path().join("monitor.toml");
        std::fs::write(&broken, "[polling\ninterval_ms = 5000\n").unwrap();
        std::fs::write(&good, "[history]\ncapacity = 20\n").unwrap();

        let loaded = MonitorConfig::load_first(&[broken.clone(), good.clone()]);
        assert_eq!(loaded.source.as_deref(), Some(good.as_path()));
        assert_eq!(loaded.config.history.capacity, 20);
        assert_eq!(loaded.rejected.len(), 1);
        assert_eq!(loaded.rejected[0].0, broken);
        assert!(loaded.rejected[0].1.contains("failed to parse config"));
    }

    #[test]
    fn falls_back_to_defaults_with_rejections_kept() {
        let dir = tempfile::tempdir().unwrap();
        let invalid = dir.path().join("monitor.toml");
        std::fs::write(&invalid, "[history]\ncapacity = 0\n").unwrap();

        let loaded = MonitorConfig::load_first(&[dir.path().join("missing.toml"), invalid]);
        assert_eq!(loaded.source, None);
        assert_eq!(loaded.config, MonitorConfig::default());
        assert_eq!(loaded.rejected.len(), 1);
        assert!(loaded.rejected[0].1.contains("capacity"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.toml");
        std::fs::write(&path, "[history]\ncapacity = 50\n").unwrap();
        assert_eq!(MonitorConfig::load(&path).unwrap().history.capacity, 50);
        assert!(MonitorConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
