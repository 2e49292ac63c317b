use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use tracing::warn;

use crate::pricing::{ModelRate, PricingSource};
use crate::providers::EventSources;

#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub sources: SourcesConfig,
    pub sync: SyncConfig,
    pub alerts: AlertsConfig,
    pub pricing_source: Option<PricingSource>,
    pub pricing: PricingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SourcesConfig {
    /// Runtime state directory. Defaults to `$OPENCLAW_HOME` or `~/.openclaw`.
    pub state_dir: Option<PathBuf>,
    pub gateway_log: Option<PathBuf>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_hours: u64,
    pub lookback_days: u32,
    pub outcome_retention: usize,
    pub watch: bool,
    pub debounce_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_hours: 6,
            lookback_days: 30,
            outcome_retention: 200,
            watch: false,
            debounce_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertsConfig {
    pub session_cost_warning_usd: f64,
    pub session_token_warning: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            session_cost_warning_usd: 5.0,
            session_token_warning: 100_000,
        }
    }
}

#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    /// `[pricing.models."kimi-k2.5"]` rate overrides.
    pub models: BTreeMap<String, ModelRate>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.sources.state_dir {
            return dir.clone();
        }
        if let Some(home) = std::env::var_os("OPENCLAW_HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(home);
        }
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join(".openclaw")
    }

    pub fn event_sources(&self) -> EventSources {
        EventSources {
            state_dir: self.state_dir(),
            gateway_log: self.sources.gateway_log.clone(),
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "clawmeter").map(|d| d.config_dir().join("config.toml"))
}

/// Missing file means defaults. An invalid file is reported and ignored.
pub fn load_config_from(path: &Path) -> Config {
    let Ok(data) = fs::read_to_string(path) else {
        return Config::default();
    };

    match toml::from_str(&data) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            Config::default()
        }
    }
}

pub fn load_config() -> Config {
    match config_path() {
        Some(path) => load_config_from(&path),
        None => Config::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().expect("temp dir");
        let config = load_config_from(&dir.path().join("config.toml"));
        assert_eq!(config, Config::default());
        assert_eq!(config.sync.interval_hours, 6);
        assert_eq!(config.sync.lookback_days, 30);
        assert_eq!(config.alerts.session_token_warning, 100_000);
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
pricing_source = "litellm"

[sources]
state_dir = "/srv/openclaw"

[sync]
interval_hours = 1

[pricing.models."kimi-k2.5"]
input_per_m = 0.5
output_per_m = 2.5

[logging]
format = "json"
"#,
        )
        .expect("write config");

        let config = load_config_from(&path);
        assert_eq!(config.pricing_source, Some(PricingSource::Litellm));
        assert_eq!(config.state_dir(), PathBuf::from("/srv/openclaw"));
        assert_eq!(config.sync.interval_hours, 1);
        assert_eq!(config.sync.outcome_retention, 200);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.pricing.models["kimi-k2.5"].output_per_m, 2.5);
        assert_eq!(config.alerts, AlertsConfig::default());
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[sync]\ninterval_hours = \"often\"\n").expect("write config");
        assert_eq!(load_config_from(&path), Config::default());
    }

    #[test]
    fn sessions_live_under_agents() {
        let config = Config {
            sources: SourcesConfig {
                state_dir: Some(PathBuf::from("/x")),
                gateway_log: None,
            },
            ..Config::default()
        };
        assert_eq!(
            config.event_sources().sessions_root(),
            PathBuf::from("/x/agents")
        );
    }
}
