//! Configuration loading — TOML file with environment variable overrides.
//!
//! Looks for `itemhub.toml` in the working directory. Every field has a
//! sensible default so the file is optional. Environment variables take
//! precedence over file values.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use itemhub_adapter_fs::config_watcher::ConfigWatcherSettings;
use itemhub_adapter_fs::module_loader::ModuleLoaderSettings;
use itemhub_adapter_plugin_process::ProcessSettings;
use itemhub_app::command_executor::ExecutorSettings;
use itemhub_app::hub::HubSettings;
use itemhub_app::state_sync::SyncSettings;
use itemhub_app::watchdog::WatchdogSettings;
use itemhub_domain::tracking::{ParameterScope, TrackingRules};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hub: HubConfig,
    pub modules: ModulesConfig,
    pub configs: ConfigsConfig,
    pub commands: CommandsConfig,
    pub transform: TransformConfig,
    pub connection: ConnectionConfig,
    pub logging: LoggingConfig,
    /// Per-item tracking rules, keyed by item id.
    pub tracking: BTreeMap<String, TrackingConfig>,
}

/// State polling.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub poll_interval_ms: u64,
}

/// Plugin bundles.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Watched directory, one sub-directory per bundle.
    pub dir: PathBuf,
    /// Where bundles are copied before being started.
    pub staging_dir: PathBuf,
    pub settle_delay_ms: u64,
    pub unload_tries: u32,
    pub unload_interval_ms: u64,
    /// File extensions treated as plugin executables.
    pub extensions: Vec<String>,
    pub request_timeout_ms: u64,
}

/// Item config documents.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConfigsConfig {
    pub dir: PathBuf,
    pub scan_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub max_tries: u32,
    pub failover_interval_s: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub timeout_ms: u64,
}

/// Connection status thresholds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Watchdog: silence before an item turns Unstable.
    pub non_stable_timeout_ms: u64,
    /// Watchdog: silence before an item turns Lost.
    pub lost_timeout_ms: u64,
    /// Consecutive failed polls before Unstable.
    pub unstable_after: u32,
    /// Consecutive failed polls before Lost.
    pub lost_after: u32,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

/// Tracking rules of one item.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Suppress every event of the item.
    pub untracked: bool,
    /// Suppress events of these parameters only.
    pub untracked_parameters: Vec<String>,
    /// Keep these parameters out of the published snapshot.
    pub uncached: Vec<String>,
}

impl Config {
    /// Load configuration from `itemhub.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or if the
    /// resulting configuration is inconsistent.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file("itemhub.toml")?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("ITEMHUB_MODULES_DIR") {
            self.modules.dir = val.into();
        }
        if let Some(val) = var("ITEMHUB_CONFIGS_DIR") {
            self.configs.dir = val.into();
        }
        if let Some(val) = var("ITEMHUB_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.hub.poll_interval_ms = ms;
            }
        }
        if let Some(val) = var("ITEMHUB_LOG") {
            self.logging.filter = val;
        }
        if let Some(val) = var("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("hub.poll_interval_ms", self.hub.poll_interval_ms),
            ("modules.unload_interval_ms", self.modules.unload_interval_ms),
            ("modules.request_timeout_ms", self.modules.request_timeout_ms),
            ("configs.scan_interval_ms", self.configs.scan_interval_ms),
            ("commands.failover_interval_s", self.commands.failover_interval_s),
            ("transform.timeout_ms", self.transform.timeout_ms),
            ("connection.non_stable_timeout_ms", self.connection.non_stable_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Validation(format!("{name} must be non-zero")));
        }
        if self.modules.unload_tries == 0 {
            return Err(ConfigError::Validation(
                "modules.unload_tries must be non-zero".to_string(),
            ));
        }
        if self.commands.max_tries == 0 {
            return Err(ConfigError::Validation(
                "commands.max_tries must be non-zero".to_string(),
            ));
        }
        if self.modules.extensions.is_empty() {
            return Err(ConfigError::Validation(
                "modules.extensions must not be empty".to_string(),
            ));
        }
        if self.connection.lost_timeout_ms <= self.connection.non_stable_timeout_ms {
            return Err(ConfigError::Validation(
                "connection.lost_timeout_ms must exceed connection.non_stable_timeout_ms"
                    .to_string(),
            ));
        }
        if self.connection.unstable_after == 0
            || self.connection.lost_after <= self.connection.unstable_after
        {
            return Err(ConfigError::Validation(
                "connection.lost_after must exceed a non-zero connection.unstable_after"
                    .to_string(),
            ));
        }
        if self.modules.staging_dir.starts_with(&self.modules.dir) {
            return Err(ConfigError::Validation(
                "modules.staging_dir must not live inside modules.dir".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            sync: SyncSettings {
                interval: Duration::from_millis(self.hub.poll_interval_ms),
                unstable_after: self.connection.unstable_after,
                lost_after: self.connection.lost_after,
            },
            commands: ExecutorSettings {
                max_tries: self.commands.max_tries,
                failover_interval: Duration::from_secs(self.commands.failover_interval_s),
            },
            transform_timeout: Duration::from_millis(self.transform.timeout_ms),
        }
    }

    #[must_use]
    pub fn watchdog(&self) -> WatchdogSettings {
        WatchdogSettings {
            non_stable_timeout: Duration::from_millis(self.connection.non_stable_timeout_ms),
            lost_timeout: Duration::from_millis(self.connection.lost_timeout_ms),
        }
    }

    #[must_use]
    pub fn tracking_rules(&self) -> TrackingRules {
        self.tracking
            .iter()
            .fold(TrackingRules::new(), |rules, (item_id, tracking)| {
                let rules = if tracking.untracked {
                    rules.untrack(item_id.as_str(), ParameterScope::All)
                } else if tracking.untracked_parameters.is_empty() {
                    rules
                } else {
                    let parameters = tracking.untracked_parameters.iter().cloned().collect();
                    rules.untrack(item_id.as_str(), ParameterScope::Only(parameters))
                };
                if tracking.uncached.is_empty() {
                    rules
                } else {
                    rules.uncache(item_id.as_str(), tracking.uncached.iter().cloned())
                }
            })
    }

    #[must_use]
    pub fn config_watcher_settings(&self) -> ConfigWatcherSettings {
        ConfigWatcherSettings {
            scan_interval: Duration::from_millis(self.configs.scan_interval_ms),
            ..ConfigWatcherSettings::new(&self.configs.dir)
        }
    }

    #[must_use]
    pub fn module_loader_settings(&self) -> ModuleLoaderSettings {
        ModuleLoaderSettings {
            settle_delay: Duration::from_millis(self.modules.settle_delay_ms),
            unload_tries: self.modules.unload_tries,
            unload_interval: Duration::from_millis(self.modules.unload_interval_ms),
            ..ModuleLoaderSettings::new(&self.modules.dir, &self.modules.staging_dir)
        }
    }

    #[must_use]
    pub fn process_settings(&self) -> ProcessSettings {
        ProcessSettings {
            extensions: self.modules.extensions.clone(),
            request_timeout: Duration::from_millis(self.modules.request_timeout_ms),
            watchdog: self.watchdog(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("modules"),
            staging_dir: PathBuf::from(".itemhub/staging"),
            settle_delay_ms: 5_000,
            unload_tries: 8,
            unload_interval_ms: 500,
            extensions: vec!["plugin".to_string()],
            request_timeout_ms: 5_000,
        }
    }
}

impl Default for ConfigsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("configs"),
            scan_interval_ms: 5_000,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            max_tries: 3,
            failover_interval_s: 5,
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self { timeout_ms: 1_000 }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            non_stable_timeout_ms: 30_000,
            lost_timeout_ms: 120_000,
            unstable_after: 3,
            lost_after: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "itemhubd=info,itemhub=info".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn should_produce_sensible_defaults() {
        let config = Config::default();
        assert_eq!(config.hub.poll_interval_ms, 500);
        assert_eq!(config.modules.dir, PathBuf::from("modules"));
        assert_eq!(config.modules.extensions, vec!["plugin".to_string()]);
        assert_eq!(config.commands.max_tries, 3);
        assert!(config.tracking.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_parse_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.configs.scan_interval_ms, 5_000);
    }

    #[test]
    fn should_parse_full_toml() {
        let toml = "
            [hub]
            poll_interval_ms = 250

            [modules]
            dir = '/srv/itemhub/modules'
            staging_dir = '/var/cache/itemhub'
            settle_delay_ms = 100
            unload_tries = 4
            unload_interval_ms = 50
            extensions = ['plugin', 'exe']
            request_timeout_ms = 2000

            [configs]
            dir = '/srv/itemhub/configs'
            scan_interval_ms = 1000

            [commands]
            max_tries = 5
            failover_interval_s = 2

            [transform]
            timeout_ms = 300

            [connection]
            non_stable_timeout_ms = 1000
            lost_timeout_ms = 5000
            unstable_after = 2
            lost_after = 4

            [logging]
            filter = 'debug'

            [tracking.porch]
            untracked = true

            [tracking.meter]
            untracked_parameters = ['raw']
            uncached = ['samples']
        ";
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.hub.poll_interval_ms, 250);
        assert_eq!(config.modules.staging_dir, PathBuf::from("/var/cache/itemhub"));
        assert_eq!(config.modules.extensions.len(), 2);
        assert_eq!(config.configs.dir, PathBuf::from("/srv/itemhub/configs"));
        assert_eq!(config.commands.failover_interval_s, 2);
        assert_eq!(config.transform.timeout_ms, 300);
        assert_eq!(config.connection.lost_after, 4);
        assert_eq!(config.logging.filter, "debug");
        assert!(config.tracking["porch"].untracked);
        assert_eq!(config.tracking["meter"].uncached, vec!["samples".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_return_default_when_file_not_found() {
        let config = Config::from_file("nonexistent.toml").unwrap();
        assert_eq!(config.hub.poll_interval_ms, 500);
    }

    #[test]
    fn should_report_parse_error_for_invalid_toml() {
        let result: Result<Config, _> = toml::from_str("invalid {{{");
        assert!(result.is_err());
    }

    #[test]
    fn should_let_environment_win_over_file() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ITEMHUB_MODULES_DIR", "/opt/modules"),
            ("ITEMHUB_CONFIGS_DIR", "/opt/configs"),
            ("ITEMHUB_POLL_INTERVAL_MS", "100"),
            ("ITEMHUB_LOG", "itemhubd=debug"),
        ]);
        let mut config = Config::default();

        config.apply_overrides(|name| vars.get(name).map(ToString::to_string));

        assert_eq!(config.modules.dir, PathBuf::from("/opt/modules"));
        assert_eq!(config.configs.dir, PathBuf::from("/opt/configs"));
        assert_eq!(config.hub.poll_interval_ms, 100);
        assert_eq!(config.logging.filter, "itemhubd=debug");
    }

    #[test]
    fn should_prefer_rust_log_over_itemhub_log() {
        let mut config = Config::default();
        config.apply_overrides(|name| match name {
            "ITEMHUB_LOG" => Some("info".to_string()),
            "RUST_LOG" => Some("trace".to_string()),
            _ => None,
        });
        assert_eq!(config.logging.filter, "trace");
    }

    #[test]
    fn should_ignore_unparsable_poll_interval() {
        let mut config = Config::default();
        config.apply_overrides(|name| {
            (name == "ITEMHUB_POLL_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert_eq!(config.hub.poll_interval_ms, 500);
    }

    #[test]
    fn should_reject_zero_interval() {
        let mut config = Config::default();
        config.configs.scan_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("configs.scan_interval_ms"));
    }

    #[test]
    fn should_reject_zero_tries() {
        let mut config = Config::default();
        config.commands.max_tries = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.modules.unload_tries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn should_reject_non_increasing_watchdog_timeouts() {
        let mut config = Config::default();
        config.connection.lost_timeout_ms = config.connection.non_stable_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn should_reject_inconsistent_failure_thresholds() {
        let mut config = Config::default();
        config.connection.lost_after = 2;
        config.connection.unstable_after = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn should_reject_staging_inside_modules_dir() {
        let mut config = Config::default();
        config.modules.staging_dir = config.modules.dir.join(".staging");
        assert!(config.validate().is_err());
    }

    #[test]
    fn should_convert_to_hub_settings() {
        let mut config = Config::default();
        config.hub.poll_interval_ms = 250;
        config.commands.failover_interval_s = 7;

        let settings = config.hub_settings();

        assert_eq!(settings.sync.interval, Duration::from_millis(250));
        assert_eq!(settings.sync.unstable_after, 3);
        assert_eq!(settings.commands.failover_interval, Duration::from_secs(7));
        assert_eq!(settings.transform_timeout, Duration::from_secs(1));
    }

    #[test]
    fn should_build_tracking_rules_per_item() {
        let config: Config = toml::from_str(
            "
            [tracking.porch]
            untracked = true

            [tracking.meter]
            uncached = ['samples']
            ",
        )
        .unwrap();

        let rules = config.tracking_rules();

        assert!(!rules.is_empty());
        assert!(
            rules
                .uncached_parameters("meter")
                .is_some_and(|parameters| parameters.contains("samples"))
        );
        assert!(rules.uncached_parameters("porch").is_none());
    }

    #[test]
    fn should_share_watchdog_with_plugin_items() {
        let config = Config::default();
        let settings = config.process_settings();
        assert_eq!(settings.watchdog.lost_timeout, Duration::from_secs(120));
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
    }
}
