use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};

use crate::channel::ReconnectPolicy;
use crate::client::DEFAULT_URL;
use crate::session::SessionConfig;

const APP_NAME: &str = "haiku-studio";
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding [`StudioConfig::base_url`].
pub const URL_ENV: &str = "HAIKU_STUDIO_URL";
/// Environment variable overriding [`StudioConfig::stale_action_timeout_secs`].
pub const STALE_ENV: &str = "HAIKU_STUDIO_STALE_ACTION_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    /// HTTP base URL of the server. The push channel URL is derived from it.
    pub base_url: String,
    /// Seconds after which an action without a visible result is reported
    /// as having an unknown outcome.
    pub stale_action_timeout_secs: u64,
    /// How often pending actions are checked for staleness between snapshots.
    pub expiry_sweep_interval_ms: u64,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub grow_factor: f64,
    pub jitter_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_URL.to_string(),
            stale_action_timeout_secs: 30,
            expiry_sweep_interval_ms: 1000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1000,
            max_delay_ms: 10_000,
            grow_factor: 1.3,
            jitter_ms: 4000,
            connect_timeout_ms: 4000,
        }
    }
}

impl StudioConfig {
    /// Load configuration from the user's config directory, then apply
    /// environment overrides.
    pub fn load() -> Self {
        let config = match get_config_path() {
            Ok(path) => Self::load_from(&path),
            Err(e) => {
                tracing::warn!("Failed to locate config, using defaults: {}", e);
                Self::default()
            }
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    /// Load configuration from `path`.
    /// Returns default config if file doesn't exist or fails to parse.
    pub fn load_from(path: &Path) -> Self {
        match Self::try_load_from(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config, using defaults: {:#}", e);
                Self::default()
            }
        }
    }

    fn try_load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;

        let config = serde_json::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Apply overrides looked up by environment variable name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(raw) = lookup(STALE_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.stale_action_timeout_secs = secs,
                Err(_) => tracing::warn!("Ignoring invalid {}={:?}", STALE_ENV, raw),
            }
        }
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let r = &self.reconnect;
        ReconnectPolicy {
            min_delay: Duration::from_millis(r.min_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms.max(r.min_delay_ms)),
            grow_factor: if r.grow_factor.is_finite() {
                r.grow_factor.max(1.0)
            } else {
                1.0
            },
            jitter: Duration::from_millis(r.jitter_ms),
            connect_timeout: Duration::from_millis(r.connect_timeout_ms.max(1)),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            stale_after: Duration::from_secs(self.stale_action_timeout_secs),
            sweep_interval: Duration::from_millis(self.expiry_sweep_interval_ms.max(1)),
        }
    }
}

fn get_config_path() -> Result<PathBuf> {
    let mut path =
        config_dir().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    path.push(APP_NAME);
    path.push(CONFIG_FILE);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StudioConfig::load_from(&dir.path().join("absent.json"));
        assert_eq!(config, StudioConfig::default());
    }

    #[test]
    fn unparseable_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();
        assert_eq!(StudioConfig::load_from(&path), StudioConfig::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "base_url": "http://studio:9000", "reconnect": { "max_delay_ms": 2000 } }"#,
        )
        .unwrap();

        let config = StudioConfig::load_from(&path);
        assert_eq!(config.base_url, "http://studio:9000");
        assert_eq!(config.stale_action_timeout_secs, 30);
        assert_eq!(config.reconnect.max_delay_ms, 2000);
        assert_eq!(config.reconnect.min_delay_ms, 1000);
    }

    #[test]
    fn environment_overrides_file_values() {
        let config = StudioConfig::default().with_overrides(env(&[
            (URL_ENV, " http://remote:8000 "),
            (STALE_ENV, "12"),
        ]));
        assert_eq!(config.base_url, "http://remote:8000");
        assert_eq!(config.stale_action_timeout_secs, 12);
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let config =
            StudioConfig::default().with_overrides(env(&[(URL_ENV, ""), (STALE_ENV, "soon")]));
        assert_eq!(config, StudioConfig::default());
    }

    #[test]
    fn policy_is_sanitised() {
        let config = StudioConfig {
            reconnect: ReconnectConfig {
                min_delay_ms: 500,
                max_delay_ms: 100,
                grow_factor: f64::NAN,
                jitter_ms: 0,
                connect_timeout_ms: 0,
            },
            ..StudioConfig::default()
        };
        let policy = config.reconnect_policy();
        assert_eq!(policy.max_delay, Duration::from_millis(500));
        assert_eq!(policy.grow_factor, 1.0);
        assert_eq!(policy.connect_timeout, Duration::from_millis(1));
    }
}
