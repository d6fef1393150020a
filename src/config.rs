use std::collections::HashSet;
use std::error::Error;
use std::ffi::OsString;
use std::fmt::{Display, Formatter};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::report::ReportFormat;

const CONFIG_FILE: &str = "config.json";

/// Valid 7-bit addresses, excluding the reserved ranges at either end.
const ADDRESS_RANGE: std::ops::RangeInclusive<u8> = 0x03..=0x77;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub index: u8,
    pub address: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExporterConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
    #[serde(with = "human_duration")]
    pub staleness_timeout: Duration,
    #[serde(with = "human_duration")]
    pub sweep_interval: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            staleness_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bus_path: PathBuf,
    pub bus_clock_hz: u32,
    /// Output tty for reports. Reports go to stdout when unset.
    pub report_device: Option<PathBuf>,
    pub report_baud: u32,
    #[serde(with = "human_duration")]
    pub poll_interval: Duration,
    pub format: ReportFormat,
    pub devices: Vec<DeviceConfig>,
    pub exporter: ExporterConfig,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus_path: PathBuf::from("/dev/i2c-1"),
            bus_clock_hz: 100_000,
            report_device: None,
            report_baud: 115_200,
            poll_interval: Duration::from_millis(2000),
            format: ReportFormat::Text,
            devices: vec![
                DeviceConfig { index: 1, address: 0x38 },
                DeviceConfig { index: 2, address: 0x39 },
            ],
            exporter: ExporterConfig::default(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Per-user config file location, if a home directory can be determined.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "psu-prometheus").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load `path`, or the per-user file if it exists, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Apply overrides from environment-style `(name, value)` pairs.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            let invalid = || ConfigError::InvalidEnv(key.to_string(), value.to_string());
            match key {
                "PSU_BUS" => self.bus_path = PathBuf::from(value),
                "PSU_POLL_INTERVAL" => {
                    self.poll_interval = humantime::parse_duration(value).map_err(|_| invalid())?
                }
                "EXPORTER_PORT" => {
                    let port = u16::from_str(value).map_err(|_| invalid())?;
                    self.exporter.listen.set_port(port);
                }
                "STALENESS_TIMEOUT" => {
                    // Bare numbers are seconds.
                    self.exporter.staleness_timeout = match u64::from_str(value) {
                        Ok(secs) => Duration::from_secs(secs),
                        Err(_) => humantime::parse_duration(value).map_err(|_| invalid())?,
                    }
                }
                "PSU_LOG_LEVEL" => self.log_level = value.to_string(),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn level(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", self.log_level)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("no devices configured".to_string()));
        }

        let mut indexes = HashSet::new();
        let mut addresses = HashSet::new();
        for device in &self.devices {
            if !ADDRESS_RANGE.contains(&device.address) {
                return Err(ConfigError::Invalid(format!(
                    "PSU #{}: address {:#04x} is not a valid 7-bit device address",
                    device.index, device.address
                )));
            }
            if !indexes.insert(device.index) {
                return Err(ConfigError::Invalid(format!("duplicate PSU index {}", device.index)));
            }
            if !addresses.insert(device.address) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate PSU address {:#04x}",
                    device.address
                )));
            }
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".to_string()));
        }
        if self.exporter.staleness_timeout.is_zero() || self.exporter.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "exporter staleness_timeout and sweep_interval must be positive".to_string(),
            ));
        }
        self.level()?;
        Ok(())
    }
}

/// Environment pairs that are valid Unicode. Anything else can't name a
/// setting, so it is skipped.
pub fn unicode_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, serde_json::Error),
    InvalidEnv(String, String),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Can't read config {}: {}", path.display(), e),
            ConfigError::Parse(path, e) => write!(f, "Invalid config {}: {}", path.display(), e),
            ConfigError::InvalidEnv(key, value) => {
                write!(f, "Invalid value '{}' for environment variable {}", value, key)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid config: {}", reason),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(_, e) => Some(e),
            ConfigError::Parse(_, e) => Some(e),
            _ => None,
        }
    }
}
