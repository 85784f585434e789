use std::net::IpAddr;
use std::time::Duration;
use std::{env, fmt, fs, path};

use logger::LogFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::availability::AvailabilityConfig;
use crate::item::{ItemDescriptor, PollerType};

/// One hour
const MAX_CYCLE_INTERVAL_MS: u64 = 3_600_000;
/// One day
const MAX_STAT_INTERVAL_SECONDS: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    ReadFailed { path: path::PathBuf, source: std::io::Error },
    #[error("cannot write {}: {source}", path.display())]
    WriteFailed { path: path::PathBuf, source: std::io::Error },
    #[error("cannot parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("cannot serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config path available, set XDG_CONFIG_HOME or HOME")]
    ConfigPathUnavailable,
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub poller: PollerSettings,
    pub availability: AvailabilityConfig,
    pub logging: Logging,
    pub items: Vec<StaticItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub poller_type: PollerType,
    pub timeout_seconds: u64,
    pub cycle_interval_ms: u64,
    /// Upper bound on items dispatched per cycle
    pub max_batch: usize,
    pub max_http_transfers: usize,
    pub stat_interval_seconds: u64,
    /// Local address outgoing connections are bound to
    pub source_ip: Option<IpAddr>,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poller_type: PollerType::Agent,
            timeout_seconds: 3,
            cycle_interval_ms: 1000,
            max_batch: 1000,
            max_http_transfers: 256,
            stat_interval_seconds: 5,
            source_ip: None,
        }
    }
}

impl PollerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn stat_interval(&self) -> Duration {
        Duration::from_secs(self.stat_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    /// `compact` or `json`; `RUST_LOG_FORMAT` decides when unset
    pub format: Option<String>,
}

impl Default for Logging {
    fn default() -> Self {
        Self { level: "info".into(), format: None }
    }
}

impl Logging {
    pub fn level(&self) -> Result<LevelFilter, ConfigError> {
        self.level.parse::<LevelFilter>().map_err(|e| invalid("logging.level", e.to_string()))
    }

    pub fn format(&self) -> Result<Option<LogFormat>, ConfigError> {
        self.format
            .as_deref()
            .map(|format| format.parse::<LogFormat>().map_err(|e| invalid("logging.format", e)))
            .transpose()
    }
}

/// Item served by the standalone scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticItem {
    /// Seconds between two checks of this item
    pub delay_seconds: u64,
    #[serde(flatten)]
    pub item: ItemDescriptor,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/uppe/poller.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("uppe/poller.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);
        let write_2 = write_indented(2);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Poller")?;
        write_1(f, "Type", &self.poller.poller_type)?;
        write_1(f, "Timeout (s)", &self.poller.timeout_seconds)?;
        write_1(f, "Cycle Interval (ms)", &self.poller.cycle_interval_ms)?;
        write_1(f, "Max Batch", &self.poller.max_batch)?;
        write_1(f, "Max HTTP Transfers", &self.poller.max_http_transfers)?;
        write_1(f, "Status Interval (s)", &self.poller.stat_interval_seconds)?;
        match &self.poller.source_ip {
            Some(source_ip) => write_1(f, "Source IP", source_ip)?,
            None => write_1(f, "Source IP", &"any")?,
        }

        write_title_1(f, "Availability")?;
        write_1(f, "Unavailable Delay (s)", &self.availability.unavailable_delay)?;
        write_1(f, "Unreachable Period (s)", &self.availability.unreachable_period)?;
        write_1(f, "Unreachable Delay (s)", &self.availability.unreachable_delay)?;

        write_title_1(f, "Logging")?;
        write_1(f, "Level", &self.logging.level)?;
        match &self.logging.format {
            Some(format) => write_1(f, "Format", format)?,
            None => write_1(f, "Format", &"from environment")?,
        }

        write_title_1(f, "Items")?;
        for entry in &self.items {
            write_1(f, "Item", &entry.item.item_id)?;
            write_2(f, "Host", &entry.item.host.name)?;
            write_2(f, "Key", &entry.item.key_orig)?;
            write_2(f, "Interface", &format!("{}:{}", entry.item.interface.addr, entry.item.interface.port))?;
            write_2(f, "Delay (s)", &entry.delay_seconds)?;
        }

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/uppe/poller.toml
    ///  or the specified path, if one does not exist
    ///
    /// ```no_run
    /// use uppe_poller::config::Config;
    ///
    /// let cfg = Config::from_config(None::<&std::path::Path>).unwrap();
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;
        let write_failed = |source| ConfigError::WriteFailed { path: path.to_path_buf(), source };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_failed)?;
        }

        fs::write(path, config_str).map_err(write_failed)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=600).contains(&self.poller.timeout_seconds) {
            return Err(invalid("poller.timeout_seconds", "must be between 1 and 600"));
        }
        if !(1..=MAX_CYCLE_INTERVAL_MS).contains(&self.poller.cycle_interval_ms) {
            return Err(invalid("poller.cycle_interval_ms", format!("must be between 1 and {MAX_CYCLE_INTERVAL_MS}")));
        }
        if self.poller.max_batch == 0 {
            return Err(invalid("poller.max_batch", "must be positive"));
        }
        if self.poller.max_http_transfers == 0 {
            return Err(invalid("poller.max_http_transfers", "must be positive"));
        }
        if !(1..=MAX_STAT_INTERVAL_SECONDS).contains(&self.poller.stat_interval_seconds) {
            return Err(invalid(
                "poller.stat_interval_seconds",
                format!("must be between 1 and {MAX_STAT_INTERVAL_SECONDS}"),
            ));
        }
        if let Some(entry) = self.items.iter().find(|entry| entry.delay_seconds == 0) {
            return Err(invalid("items.delay_seconds", format!("item {} has no delay", entry.item.item_id)));
        }

        self.logging.level()?;
        self.logging.format()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::CheckKind;

    #[test]
    fn writes_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/poller");

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.poller.timeout_seconds, 3);
        assert_eq!(config.poller.max_batch, 1000);
        assert!(dir.path().join("nested/poller.toml").exists());

        let reloaded = Config::from_config(Some(dir.path().join("nested/poller.toml"))).unwrap();
        assert_eq!(reloaded.availability, AvailabilityConfig::default());
        assert_eq!(reloaded.logging.format().unwrap(), None);
    }

    #[test]
    fn reads_items_and_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poller.toml");
        fs::write(
            &path,
            r#"
                [poller]
                poller_type = "http_agent"
                timeout_seconds = 5
                source_ip = "192.0.2.100"

                [logging]
                format = "json"

                [[items]]
                delay_seconds = 30
                item_id = 1
                key_orig = "web.status"

                [items.host]
                id = 1
                name = "web01"

                [items.interface]
                id = 1
                addr = "192.0.2.10"
                port = 80

                [items.check]
                type = "http"
                url = "http://192.0.2.10/status"
            "#,
        )
        .unwrap();

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.poller.poller_type, PollerType::HttpAgent);
        assert_eq!(config.poller.timeout(), Duration::from_secs(5));
        assert_eq!(config.poller.cycle_interval_ms, 1000);
        assert_eq!(config.logging.format().unwrap(), Some(LogFormat::Json));
        assert_eq!(config.items.len(), 1);
        assert_eq!(config.items[0].delay_seconds, 30);
        assert!(matches!(config.items[0].item.check, CheckKind::Http(_)));
        assert!(config.to_string().contains("web.status"));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = Config::default();
        config.poller.timeout_seconds = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "poller.timeout_seconds", .. })));

        let mut config = Config::default();
        config.logging.level = "chatty".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.poller.stat_interval_seconds = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "poller.stat_interval_seconds", .. })
        ));

        let mut config = Config::default();
        config.poller.cycle_interval_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "poller.cycle_interval_ms", .. })));

        let mut config = Config::default();
        config.poller.cycle_interval_ms = MAX_CYCLE_INTERVAL_MS;
        config.poller.stat_interval_seconds = MAX_STAT_INTERVAL_SECONDS;
        assert!(config.validate().is_ok());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[poller\n").unwrap();
        assert!(matches!(Config::from_config(Some(&path)), Err(ConfigError::ParseFailed(_))));
    }
}
