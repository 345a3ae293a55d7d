use config::{Config, ConfigError, Environment, File};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{DEFAULT_HOST, DEFAULT_POLL_INTERVAL, DEFAULT_PORT};
use crate::types::TriggerMode;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub acquisition: AcquisitionConfig,
    pub selection: SelectionConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.port == 0 {
            return Err(ConfigError::Message("device.port must be non-zero".into()));
        }
        if self.device.write_timeout_ms == Some(0) {
            return Err(ConfigError::Message(
                "device.write_timeout_ms must be at least 1 when set".into(),
            ));
        }
        if self.device.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "device.poll_interval_ms must be at least 1".into(),
            ));
        }
        self.acquisition.validate()
    }
}

/// Where the Logic application listens and how the link is paced.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceConfig {
    pub host_ip: String,
    pub port: u16,
    /// Unbounded when unset
    pub connect_timeout_ms: Option<u64>,
    /// Blocking writes never time out when unset
    pub write_timeout_ms: Option<u64>,
    pub poll_interval_ms: u64,
}

impl DeviceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host_ip: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: None,
            write_timeout_ms: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

/// Parameters of one acquisition run.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AcquisitionConfig {
    /// Analog channels recorded, exported as channels `0..channel_count`
    pub channel_count: u32,
    /// Digital channel used as trigger source
    pub trigger_channel: u32,
    pub trigger_mode: TriggerMode,
    /// Requested samples at the analog rate
    pub sample_count: u64,
    pub pretrigger_size: u64,
    pub digital_rate: f64,
    pub analog_rate: f64,
    /// Base export path; the channel number is inserted before the extension
    pub output_path: String,
    pub repeat: bool,
}

impl AcquisitionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_count == 0 {
            return Err(ConfigError::Message(
                "acquisition.channel_count must be at least 1".into(),
            ));
        }
        if self.digital_rate < 0.0 || self.analog_rate < 0.0 {
            return Err(ConfigError::Message(
                "acquisition sample rates must not be negative".into(),
            ));
        }
        if self.output_path.trim().is_empty() {
            return Err(ConfigError::Message(
                "acquisition.output_path must not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            channel_count: 1,
            trigger_channel: 0,
            trigger_mode: TriggerMode::default(),
            sample_count: 1000,
            pretrigger_size: 0,
            digital_rate: 0.0,
            analog_rate: 0.0,
            output_path: "capture.001".to_string(),
            repeat: false,
        }
    }
}

/// Entries picked from the device-provided lists on headless runs.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SelectionConfig {
    /// Substring of the device entry; first listed device when unset
    pub device: Option<String>,
    /// `digital,analog` pair; first listed rate when unset
    pub sample_rate: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Record every frame sent and received as JSONL
    pub wire_log: bool,
    pub log_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            wire_log: false,
            log_path: "./logs".to_string(),
        }
    }
}

/// Live acquisition settings shared between the operator and the session.
///
/// The session reads a fresh copy at every step, so edits made while a
/// sequence is running apply from the next command on.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<AcquisitionConfig>>,
}

impl SharedConfig {
    pub fn new(config: AcquisitionConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> AcquisitionConfig {
        self.inner.read().clone()
    }

    pub fn update<F: FnOnce(&mut AcquisitionConfig)>(&self, f: F) {
        f(&mut self.inner.write());
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["logic.toml", "config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // Environment overrides, e.g. RUSTY_LOGIC__DEVICE__PORT=10430
    builder = builder.add_source(
        Environment::with_prefix("RUSTY_LOGIC")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
