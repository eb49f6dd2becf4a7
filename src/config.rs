//! Configuration management for Bankwarden
//!
//! This module handles loading, validation, and management of the supervisor
//! configuration from YAML files. The core only ever sees a validated
//! [`Config`]; all structural checks happen in [`Config::validate`].

use crate::banks::{BankLayout, RelayTable};
use crate::error::{BmsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "BANKWARDEN_CONFIG";

/// Upper bound on temperature read attempts per cycle
pub const MAX_TEMPERATURE_RETRIES: u32 = 10;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Temperature endpoint and anomaly thresholds
    pub temperature: TemperatureConfig,

    /// Channel-to-bank layout and relay patterns
    pub banks: BanksConfig,

    /// Balancing thresholds and timing
    pub balance: BalanceConfig,

    /// Shared hardware bus addressing
    pub bus: BusConfig,

    /// Voltage meter conversion parameters
    pub adc: AdcConfig,

    /// GPIO output pins
    pub gpio: GpioConfig,

    /// Startup self-test
    pub self_test: SelfTestConfig,

    /// Persisted calibration
    pub calibration: CalibrationConfig,

    /// Alert notification throttling
    pub alerts: AlertsConfig,

    /// Hardware watchdog petting
    pub watchdog: WatchdogConfig,

    /// Web server binding configuration
    pub web: WebConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Temperature acquisition and anomaly thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureConfig {
    /// Host of the Modbus RTU-over-TCP temperature gateway
    pub host: String,

    /// TCP port of the gateway
    pub port: u16,

    /// Seconds between acquisition cycles
    pub poll_interval_secs: u64,

    /// Maximum rise between consecutive cycles (degrees)
    pub rise_threshold: f64,

    /// Maximum relative deviation from the bank median
    pub deviation_threshold: f64,

    /// Maximum difference between a channel's rise and its bank's median rise
    pub disconnection_lag_threshold: f64,

    /// Upper absolute limit (degrees)
    pub high_threshold: f64,

    /// Lower absolute limit (degrees)
    pub low_threshold: f64,

    /// Maximum absolute deviation from the bank median (degrees)
    pub abs_deviation_threshold: f64,

    /// Raw register value divisor
    pub scaling_factor: f64,

    /// Readings at or below this value are treated as disconnected sensors
    pub valid_min: f64,

    /// Attempts per acquisition
    pub max_retries: u32,

    /// Exponential backoff base in seconds
    pub retry_backoff_base: f64,

    /// Settle delay between sending the query and reading the response
    pub query_delay_secs: f64,

    /// Number of sensor channels
    pub num_channels: u16,

    /// Connect/read timeout in seconds
    pub io_timeout_secs: u64,
}

/// One explicit relay pattern entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPatternEntry {
    pub source: usize,
    pub dest: usize,
    pub mask: u8,
}

/// Bank layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanksConfig {
    /// Number of banks
    pub count: usize,

    /// Inclusive channel ranges, one per bank
    pub ranges: Vec<[usize; 2]>,

    /// Explicit relay patterns; generated when absent
    pub relay_patterns: Option<Vec<RelayPatternEntry>>,
}

/// Balancing thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// Minimum max-min spread (volts) that triggers a session
    pub voltage_difference_to_balance: f64,

    /// Length of one transfer in seconds
    pub duration_secs: u64,

    /// Minimum time between the end of one session and the next start
    pub rest_period_secs: u64,

    /// Seconds between main-loop checks
    pub sleep_between_checks_secs: u64,

    /// Bank voltage below which a low-voltage alert is raised
    pub low_voltage_threshold: f64,

    /// Bank voltage above which a high-voltage alert is raised
    pub high_voltage_threshold: f64,

    /// Progress sampling period while transferring
    pub progress_poll_ms: u64,
}

/// Shared bus addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// I2C bus number
    pub i2c_bus: u8,

    /// Multiplexer address
    pub multiplexer_address: u16,

    /// Voltage meter (ADC) address
    pub voltage_meter_address: u16,

    /// Relay expander address
    pub relay_address: u16,

    /// Relay expander output register
    pub relay_register: u8,

    /// Multiplexer channel of the relay expander
    pub relay_mux_channel: u8,

    /// Multiplexer channel per bank
    pub bank_mux_channels: Vec<u8>,

    /// Maximum wait for the bus lock
    pub lock_timeout_ms: u64,
}

/// Voltage meter parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    pub config_register: u8,
    pub conversion_register: u8,
    pub continuous_mode: u16,
    pub sample_rate: u16,
    pub gain: u16,

    /// Full-scale input voltage for the configured gain
    pub reference_fullscale: f64,

    /// Largest positive conversion code
    pub max_code: f64,

    /// Resistor divider ratio in front of the ADC
    pub divider_ratio: f64,

    /// Per-bank correction factors
    pub calibration_factors: Vec<f64>,

    /// Wait after triggering a conversion
    pub conversion_delay_ms: u64,
}

/// GPIO outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub dc_dc_pin: u8,
    pub alarm_pin: u8,
}

/// Startup self-test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfTestConfig {
    pub enabled: bool,

    /// Transfer duration per bank pair
    pub test_duration_secs: u64,

    /// Sampling interval during a pair test
    pub test_read_interval_secs: u64,

    /// Minimum voltage change a pair must produce on both banks
    pub min_voltage_delta: f64,

    /// Wait before retrying a failed self-test
    pub retry_cooldown_secs: u64,

    /// Rest between pair tests
    pub pair_rest_secs: u64,
}

/// Persisted calibration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Path of the offsets text file
    pub offsets_file: String,
}

/// Alert notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Minimum seconds between two notifications
    pub notify_interval_secs: u64,

    /// Notification subject line
    pub subject: String,
}

/// Watchdog petting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub device: String,
    pub interval_secs: u64,

    /// Snapshot age after which petting stops
    pub stall_timeout_secs: u64,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,

    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (DEBUG, INFO, WARNING, ERROR, CRITICAL)
    pub level: String,

    /// Path to log file
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            host: "192.168.15.240".to_string(),
            port: 10001,
            poll_interval_secs: 10,
            rise_threshold: 2.0,
            deviation_threshold: 0.1,
            disconnection_lag_threshold: 0.5,
            high_threshold: 60.0,
            low_threshold: 0.0,
            abs_deviation_threshold: 2.0,
            scaling_factor: 100.0,
            valid_min: 0.0,
            max_retries: 3,
            retry_backoff_base: 1.0,
            query_delay_secs: 0.25,
            num_channels: 24,
            io_timeout_secs: 3,
        }
    }
}

impl TemperatureConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn query_delay(&self) -> Duration {
        Duration::from_secs_f64(self.query_delay_secs.max(0.0))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl Default for BanksConfig {
    fn default() -> Self {
        Self {
            count: 3,
            ranges: vec![[1, 8], [9, 16], [17, 24]],
            relay_patterns: None,
        }
    }
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            voltage_difference_to_balance: 0.1,
            duration_secs: 10,
            rest_period_secs: 30,
            sleep_between_checks_secs: 5,
            low_voltage_threshold: 3.0,
            high_voltage_threshold: 4.2,
            progress_poll_ms: 250,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            i2c_bus: 1,
            multiplexer_address: 0x70,
            voltage_meter_address: 0x48,
            relay_address: 0x10,
            relay_register: 0x11,
            relay_mux_channel: 3,
            bank_mux_channels: vec![0, 1, 2],
            lock_timeout_ms: 5000,
        }
    }
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            config_register: 0x01,
            conversion_register: 0x00,
            continuous_mode: 0x4000,
            sample_rate: 0x1400,
            gain: 0x2000,
            reference_fullscale: 6.144,
            max_code: 32767.0,
            divider_ratio: 0.01592,
            calibration_factors: vec![1.0, 1.0, 1.0],
            conversion_delay_ms: 50,
        }
    }
}

impl AdcConfig {
    /// Configuration word written before each conversion
    pub const fn config_word(&self) -> u16 {
        self.continuous_mode | self.sample_rate | self.gain
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            dc_dc_pin: 17,
            alarm_pin: 27,
        }
    }
}

impl Default for SelfTestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            test_duration_secs: 15,
            test_read_interval_secs: 2,
            min_voltage_delta: 0.01,
            retry_cooldown_secs: 120,
            pair_rest_secs: 5,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            offsets_file: "offsets.txt".to_string(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            notify_interval_secs: 300,
            subject: "Battery Monitor Alert".to_string(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: "/dev/watchdog".to_string(),
            interval_secs: 10,
            stall_timeout_secs: 120,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/tmp/bankwarden.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first location that exists
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::from_file(path);
        }

        let default_paths = ["bankwarden.yaml", "/etc/bankwarden/config.yaml"];
        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let t = &self.temperature;
        if t.host.is_empty() {
            return Err(BmsError::validation(
                "temperature.host",
                "Host cannot be empty",
            ));
        }
        if t.port == 0 {
            return Err(BmsError::validation(
                "temperature.port",
                "Port must be greater than 0",
            ));
        }
        if t.poll_interval_secs == 0 {
            return Err(BmsError::validation(
                "temperature.poll_interval_secs",
                "Must be greater than 0",
            ));
        }
        if t.scaling_factor <= 0.0 {
            return Err(BmsError::validation(
                "temperature.scaling_factor",
                "Must be positive",
            ));
        }
        if t.max_retries == 0 || t.max_retries > MAX_TEMPERATURE_RETRIES {
            return Err(BmsError::validation(
                "temperature.max_retries",
                format!("Must be between 1 and {}", MAX_TEMPERATURE_RETRIES),
            ));
        }
        if t.retry_backoff_base < 1.0 {
            return Err(BmsError::validation(
                "temperature.retry_backoff_base",
                "Must be at least 1",
            ));
        }
        if t.num_channels == 0 || t.num_channels > 125 {
            return Err(BmsError::validation(
                "temperature.num_channels",
                "Must be between 1 and 125",
            ));
        }
        if t.low_threshold >= t.high_threshold {
            return Err(BmsError::validation(
                "temperature.low_threshold",
                "Must be below high_threshold",
            ));
        }

        if self.banks.count == 0 || self.banks.count != self.banks.ranges.len() {
            return Err(BmsError::validation(
                "banks.count",
                "Must be non-zero and match the number of ranges",
            ));
        }
        BankLayout::from_ranges(&self.banks.ranges, usize::from(t.num_channels))?;
        RelayTable::from_config(&self.banks)?;

        if self.bus.bank_mux_channels.len() != self.banks.count {
            return Err(BmsError::validation(
                "bus.bank_mux_channels",
                "One multiplexer channel per bank is required",
            ));
        }
        if self.bus.bank_mux_channels.iter().any(|&c| c > 7) || self.bus.relay_mux_channel > 7 {
            return Err(BmsError::validation(
                "bus.bank_mux_channels",
                "Multiplexer channels must be 0-7",
            ));
        }

        if self.adc.divider_ratio <= 0.0 {
            return Err(BmsError::validation(
                "adc.divider_ratio",
                "Must be positive",
            ));
        }
        if self.adc.max_code <= 0.0 || self.adc.reference_fullscale <= 0.0 {
            return Err(BmsError::validation(
                "adc.max_code",
                "Conversion scale must be positive",
            ));
        }
        if self.adc.calibration_factors.len() != self.banks.count {
            return Err(BmsError::validation(
                "adc.calibration_factors",
                "One calibration factor per bank is required",
            ));
        }

        if self.balance.voltage_difference_to_balance <= 0.0 {
            return Err(BmsError::validation(
                "balance.voltage_difference_to_balance",
                "Must be positive",
            ));
        }
        if self.balance.progress_poll_ms == 0 {
            return Err(BmsError::validation(
                "balance.progress_poll_ms",
                "Must be greater than 0",
            ));
        }
        if self.balance.low_voltage_threshold >= self.balance.high_voltage_threshold {
            return Err(BmsError::validation(
                "balance.low_voltage_threshold",
                "Must be below high_voltage_threshold",
            ));
        }

        if self.self_test.test_read_interval_secs == 0 {
            return Err(BmsError::validation(
                "self_test.test_read_interval_secs",
                "Must be greater than 0",
            ));
        }

        if self.watchdog.enabled && self.watchdog.interval_secs == 0 {
            return Err(BmsError::validation(
                "watchdog.interval_secs",
                "Must be greater than 0",
            ));
        }

        if self.web.enabled && self.web.port == 0 {
            return Err(BmsError::validation(
                "web.port",
                "Port must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.temperature.port, 10001);
        assert_eq!(config.temperature.num_channels, 24);
        assert_eq!(config.banks.count, 3);
        assert_eq!(config.adc.config_word(), 0x7400);
        assert!(config.self_test.enabled);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.temperature.host = String::new();
        assert!(config.validate().is_err());

        config = Config::default();
        config.temperature.retry_backoff_base = 0.5;
        assert!(config.validate().is_err());

        config = Config::default();
        config.banks.ranges = vec![[1, 8], [10, 16], [17, 24]];
        assert!(config.validate().is_err());

        config = Config::default();
        config.adc.calibration_factors = vec![1.0, 1.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.temperature.port, deserialized.temperature.port);
        assert_eq!(config.banks.ranges, deserialized.banks.ranges);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "temperature:\n  host: 10.0.0.9\nbalance:\n  duration_secs: 3\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.temperature.host, "10.0.0.9");
        assert_eq!(config.temperature.port, 10001);
        assert_eq!(config.balance.duration_secs, 3);
        assert_eq!(config.balance.rest_period_secs, 30);
        assert!(config.validate().is_ok());
    }
}
