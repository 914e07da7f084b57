//! Stand Configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults (pan id 1 and tilt id 2 on `/dev/ttyUSB0` at 57600 baud)
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `SERVO_STAND_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SERVO_STAND_BUS__PORT=/dev/ttyACM0
//! SERVO_STAND_APPLICATION__LOG_LEVEL=debug
//! SERVO_STAND_HOMING__TIMEOUT_MS=5000
//! ```
//!
//! # Example
//!
//! ```toml
//! [bus]
//! port = "/dev/ttyUSB0"
//! baud_rate = 57600
//!
//! [homing]
//! tolerance = 10
//!
//! [[servos]]
//! name = "pan"
//! id = 1
//!
//! [[servos]]
//! name = "tilt"
//! id = 2
//! home_position = 512
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hardware::dynamixel::HomingConfig;
use crate::hardware::protocol::{DeviceId, DEFAULT_BAUD_RATE, DEFAULT_HOME_POSITION};

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "SERVO_STAND_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A provider failed to parse or extract.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// An explicitly requested file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    MissingFile(PathBuf),
    /// Values parsed but are not usable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level stand configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial bus settings
    #[serde(default)]
    pub bus: BusConfig,
    /// Homing loop settings shared by all servos
    #[serde(default)]
    pub homing: HomingSettings,
    /// Servos on the bus
    #[serde(default = "default_servos")]
    pub servos: Vec<ServoDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level used when neither RUST_LOG nor -v is given
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Serial bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Serial port (e.g., "/dev/ttyUSB0")
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate negotiated by every session
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Status packet timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

/// Homing loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomingSettings {
    /// Delay between position reads in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Acceptance half-width around the goal, in encoder units
    #[serde(default = "default_tolerance")]
    pub tolerance: u16,
    /// Give up after this many milliseconds (absent = wait forever)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Goal used by `home` without an explicit target
    #[serde(default = "default_home_position")]
    pub home_position: u16,
}

/// One servo on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoDefinition {
    /// Unique servo name (e.g., "pan")
    pub name: String,
    /// Bus address (1-253)
    pub id: u8,
    /// Enable torque on connect and disable it on disconnect
    #[serde(default = "default_enabled")]
    pub enable_torque_on_connect: bool,
    /// Per-servo override of `homing.home_position`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_position: Option<u16>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "servo-stand".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout() -> u64 {
    100
}

fn default_poll_interval() -> u64 {
    100
}

fn default_tolerance() -> u16 {
    10
}

fn default_home_position() -> u16 {
    DEFAULT_HOME_POSITION
}

fn default_enabled() -> bool {
    true
}

fn default_servos() -> Vec<ServoDefinition> {
    vec![
        ServoDefinition::new("pan", 1),
        ServoDefinition::new("tilt", 2),
    ]
}

impl Default for StandConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            bus: BusConfig::default(),
            homing: HomingSettings::default(),
            servos: default_servos(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl Default for HomingSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            tolerance: default_tolerance(),
            timeout_ms: None,
            home_position: default_home_position(),
        }
    }
}

impl ServoDefinition {
    /// Servo with torque enabled on connect and the shared home position.
    pub fn new(name: impl Into<String>, id: u8) -> Self {
        Self {
            name: name.into(),
            id,
            enable_torque_on_connect: default_enabled(),
            home_position: None,
        }
    }

    /// Validated bus address.
    pub fn device_id(&self) -> Result<DeviceId, ConfigError> {
        DeviceId::new(self.id).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "Servo '{}': id {} is outside 1-253",
                self.name, self.id
            ))
        })
    }
}

impl BusConfig {
    /// Status packet timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl StandConfig {
    /// Load defaults overridden by the environment, plus `path` when given.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if:
    /// - `path` is given but does not exist
    /// - The file or an environment override cannot be parsed
    /// - Configuration validation fails
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(StandConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load(Some(path.as_ref()))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Port is set and baud rate, poll interval and tolerance are non-zero
    /// - At least one servo is defined
    /// - Servo ids are in range and unique, servo names are unique
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.bus.port.is_empty() {
            return Err(ConfigError::ValidationError(
                "bus.port cannot be empty".to_string(),
            ));
        }
        if self.bus.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "bus.baud_rate must be > 0".to_string(),
            ));
        }
        if self.homing.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "homing.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.homing.tolerance == 0 {
            return Err(ConfigError::ValidationError(
                "homing.tolerance must be > 0".to_string(),
            ));
        }

        if self.servos.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one servo must be defined".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for servo in &self.servos {
            servo.device_id()?;
            if !ids.insert(servo.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate servo id: {}",
                    servo.id
                )));
            }
            if !names.insert(servo.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate servo name: '{}'",
                    servo.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a servo by bus address
    pub fn servo_by_id(&self, id: DeviceId) -> Option<&ServoDefinition> {
        self.servos.iter().find(|servo| servo.id == id.get())
    }

    /// Homing parameters for `servo`, applying its home position override.
    pub fn homing_for(&self, servo: Option<&ServoDefinition>) -> HomingConfig {
        HomingConfig {
            poll_interval: Duration::from_millis(self.homing.poll_interval_ms),
            tolerance: self.homing.tolerance,
            timeout: self.homing.timeout_ms.map(Duration::from_millis),
            home_position: servo
                .and_then(|servo| servo.home_position)
                .unwrap_or(self.homing.home_position),
        }
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StandConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bus.port, "/dev/ttyUSB0");
        assert_eq!(config.bus.baud_rate, 57600);
        let pan = DeviceId::new(1).and_then(|id| config.servo_by_id(id));
        let tilt = DeviceId::new(2).and_then(|id| config.servo_by_id(id));
        assert_eq!(pan.map(|s| s.name.as_str()), Some("pan"));
        assert_eq!(tilt.map(|s| s.name.as_str()), Some("tilt"));
        assert_eq!(config.homing_for(None), HomingConfig::default());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = StandConfig::default();
        config.application.log_level = "verbose".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_duplicate_servo_id() {
        let mut config = StandConfig::default();
        config.servos.push(ServoDefinition::new("spare", 2));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate servo id: 2"));
    }

    #[test]
    fn test_broadcast_id_rejected() {
        let mut config = StandConfig::default();
        config.servos = vec![ServoDefinition::new("pan", 254)];

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("outside 1-253"));
    }

    #[test]
    fn test_zero_tolerance_rejected() {
        let mut config = StandConfig::default();
        config.homing.tolerance = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_home_position_override() {
        let mut config = StandConfig::default();
        config.homing.home_position = 100;
        config.homing.timeout_ms = Some(2500);
        let mut tilt = ServoDefinition::new("tilt", 2);
        tilt.home_position = Some(512);

        let homing = config.homing_for(Some(&tilt));
        assert_eq!(homing.home_position, 512);
        assert_eq!(homing.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.homing_for(None).home_position, 100);
    }

    #[test]
    fn test_load_from_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "stand.toml",
                r#"
[bus]
port = "/dev/ttyACM3"

[homing]
timeout_ms = 3000

[[servos]]
name = "pan"
id = 7
enable_torque_on_connect = false
"#,
            )?;

            let config = StandConfig::load_from("stand.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.bus.port, "/dev/ttyACM3");
            assert_eq!(config.bus.baud_rate, 57600);
            assert_eq!(config.homing.timeout_ms, Some(3000));
            assert_eq!(config.homing.tolerance, 10);
            assert_eq!(config.servos.len(), 1);
            assert!(!config.servos[0].enable_torque_on_connect);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = StandConfig::load_from(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::MissingFile(_))));
    }

    #[test]
    fn test_environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "stand.toml",
                r#"
[application]
log_level = "info"

[bus]
port = "/dev/ttyUSB1"
"#,
            )?;
            jail.set_env("SERVO_STAND_BUS__PORT", "/dev/ttyUSB2");
            jail.set_env("SERVO_STAND_HOMING__TOLERANCE", "4");

            let config = StandConfig::load_from("stand.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.application.log_level, "info");
            assert_eq!(config.bus.port, "/dev/ttyUSB2");
            assert_eq!(config.homing.tolerance, 4);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_environment_value_fails_validation() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SERVO_STAND_APPLICATION__LOG_LEVEL", "chatty");
            let result = StandConfig::load(None);
            assert!(matches!(result, Err(ConfigError::ValidationError(_))));
            Ok(())
        });
    }

    #[test]
    fn test_to_toml_round_trips_through_load() {
        figment::Jail::expect_with(|jail| {
            let mut config = StandConfig::default();
            config.bus.port = "/dev/ttyS9".to_string();
            let text = config.to_toml().map_err(|e| e.to_string())?;
            assert!(text.contains("/dev/ttyS9"));
            assert!(!text.contains("timeout_ms"));

            jail.create_file("effective.toml", &text)?;
            let loaded = StandConfig::load_from("effective.toml").map_err(|e| e.to_string())?;
            assert_eq!(loaded, config);
            Ok(())
        });
    }
}
