//! Configuration management for the pwmfand daemon.
//!
//! Handles loading, parsing, and validation of the YAML configuration file
//! that defines fans, speed curves, temperature sensors and global control
//! behavior.

use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

/// Main configuration structure for the pwmfand daemon.
///
/// Deserialized from the YAML configuration file.
///
/// # Example
///
/// ```yaml
/// version: 1
/// data_dir: /var/lib/pwmfand
/// rpm_polling_rate_ms: 1000
///
/// sensors:
///   - kind: hwmon-temp
///     id: cpu_temp
///     input: /sys/class/hwmon/hwmon0/temp1_input
///
/// curves:
///   - kind: linear
///     id: cpu_curve
///     sensor: cpu_temp
///     min_temp: 40
///     max_temp: 80
///
/// fans:
///   - kind: hwmon
///     id: cpu_fan
///     pwm_output: /sys/class/hwmon/hwmon3/pwm1
///     index: 1
///     rpm_input: /sys/class/hwmon/hwmon3/fan1_input
///     curve: cpu_curve
///     never_stop: true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Directory holding persisted characterization data.
    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,

    /// Interval between RPM monitor samples, in milliseconds.
    #[serde(default = "defaults::rpm_polling_rate_ms")]
    pub rpm_polling_rate_ms: u64,

    /// Polling rate of the temperature sensors feeding the curves,
    /// in milliseconds.
    #[serde(default = "defaults::temp_sensor_polling_rate_ms")]
    pub temp_sensor_polling_rate_ms: u64,

    /// Window size of the RPM moving average.
    #[serde(default = "defaults::rpm_rolling_window_size")]
    pub rpm_rolling_window_size: usize,

    /// Settling threshold used while measuring the RPM curve.
    #[serde(default = "defaults::max_rpm_diff_for_settled_fan")]
    pub max_rpm_diff_for_settled_fan: f64,

    /// Whether fans may characterize concurrently on first start.
    #[serde(default)]
    pub run_fan_initialization_in_parallel: bool,

    /// Fans to control.
    #[serde(default)]
    pub fans: Vec<FanCfg>,

    /// Speed curve definitions.
    #[serde(default)]
    pub curves: Vec<CurveCfg>,

    /// Temperature sensor definitions.
    #[serde(default)]
    pub sensors: Vec<SensorCfg>,
}

/// Per-fan configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanCfg {
    /// Unique identifier, also the key for persisted data.
    pub id: String,

    /// Id of the speed curve driving this fan.
    pub curve: String,

    /// Raise min PWM at runtime rather than let this fan stop.
    #[serde(default)]
    pub never_stop: bool,

    /// Lower PWM bound override.
    #[serde(default)]
    pub min_pwm: Option<i32>,

    /// Upper PWM bound override.
    #[serde(default)]
    pub max_pwm: Option<i32>,

    /// Interval between control-loop ticks, in milliseconds.
    #[serde(default = "defaults::update_rate_ms")]
    pub update_rate_ms: u64,

    /// PID gains for the control loop.
    #[serde(default)]
    pub pid: PidCfg,

    /// Hardware backend of this fan.
    #[serde(flatten)]
    pub backend: FanBackendCfg,
}

/// Fan hardware backend variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FanBackendCfg {
    /// hwmon sysfs fan: `pwmN` output plus optional `fanN_input`.
    #[serde(rename = "hwmon")]
    HwMon {
        /// Absolute path to the `pwmN` file.
        pwm_output: PathBuf,
        /// PWM channel index, used to derive the `pwmN_enable` path.
        index: u32,
        /// Absolute path to the `fanN_input` file, when present.
        #[serde(default)]
        rpm_input: Option<PathBuf>,
    },
    /// Plain integer-file fan without a hwmon device directory.
    File {
        pwm_path: PathBuf,
        #[serde(default)]
        rpm_path: Option<PathBuf>,
    },
}

/// PID gains; defaults match the conservative values the control loop was
/// tuned against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PidCfg {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

impl Default for PidCfg {
    fn default() -> Self {
        Self {
            p: 0.03,
            i: 0.002,
            d: 0.0005,
        }
    }
}

/// Speed curve configuration variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CurveCfg {
    /// Fixed target PWM regardless of sensor input.
    Constant { id: String, value: i32 },
    /// Linear ramp from 0 at `min_temp` to 255 at `max_temp`.
    Linear {
        id: String,
        sensor: String,
        min_temp: f64,
        max_temp: f64,
    },
}

impl CurveCfg {
    pub fn id(&self) -> &str {
        match self {
            CurveCfg::Constant { id, .. } | CurveCfg::Linear { id, .. } => id,
        }
    }
}

/// Temperature sensor configuration variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SensorCfg {
    /// hwmon `tempN_input` file reporting millidegrees Celsius.
    #[serde(rename = "hwmon-temp")]
    HwMonTemp { id: String, input: PathBuf },
}

impl SensorCfg {
    pub fn id(&self) -> &str {
        match self {
            SensorCfg::HwMonTemp { id, .. } => id,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            data_dir: defaults::data_dir(),
            rpm_polling_rate_ms: defaults::rpm_polling_rate_ms(),
            temp_sensor_polling_rate_ms: defaults::temp_sensor_polling_rate_ms(),
            rpm_rolling_window_size: defaults::rpm_rolling_window_size(),
            max_rpm_diff_for_settled_fan: defaults::max_rpm_diff_for_settled_fan(),
            run_fan_initialization_in_parallel: false,
            fans: Vec::new(),
            curves: Vec::new(),
            sensors: Vec::new(),
        }
    }
}

impl Config {
    pub fn rpm_polling_rate(&self) -> Duration {
        Duration::from_millis(self.rpm_polling_rate_ms)
    }

    pub fn temp_sensor_polling_rate(&self) -> Duration {
        Duration::from_millis(self.temp_sensor_polling_rate_ms)
    }

    /// Checks internal consistency of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.rpm_rolling_window_size < 1 {
            bail!("rpm_rolling_window_size must be at least 1");
        }
        if self.max_rpm_diff_for_settled_fan <= 0.0 {
            bail!("max_rpm_diff_for_settled_fan must be positive");
        }

        let mut curve_ids = std::collections::HashSet::new();
        for curve in &self.curves {
            if !curve_ids.insert(curve.id()) {
                bail!("duplicate curve id '{}'", curve.id());
            }
            if let CurveCfg::Linear {
                id,
                sensor,
                min_temp,
                max_temp,
            } = curve
            {
                if max_temp <= min_temp {
                    bail!("curve '{id}': max_temp must be above min_temp");
                }
                if !self.sensors.iter().any(|s| s.id() == sensor) {
                    bail!("curve '{id}' references unknown sensor '{sensor}'");
                }
            }
        }

        let mut fan_ids = std::collections::HashSet::new();
        for fan in &self.fans {
            if !fan_ids.insert(fan.id.as_str()) {
                bail!("duplicate fan id '{}'", fan.id);
            }
            if !curve_ids.contains(fan.curve.as_str()) {
                bail!("fan '{}' references unknown curve '{}'", fan.id, fan.curve);
            }
            if fan.update_rate_ms == 0 {
                bail!("fan '{}': update_rate_ms must be positive", fan.id);
            }
            if let (Some(min), Some(max)) = (fan.min_pwm, fan.max_pwm) {
                if min > max {
                    bail!("fan '{}': min_pwm must not exceed max_pwm", fan.id);
                }
            }
            for bound in [fan.min_pwm, fan.max_pwm].into_iter().flatten() {
                if !(0..=255).contains(&bound) {
                    bail!("fan '{}': pwm bounds must lie in 0..=255", fan.id);
                }
            }
        }

        let mut sensor_ids = std::collections::HashSet::new();
        for sensor in &self.sensors {
            if !sensor_ids.insert(sensor.id()) {
                bail!("duplicate sensor id '{}'", sensor.id());
            }
        }

        Ok(())
    }
}

impl FanCfg {
    pub fn update_rate(&self) -> Duration {
        Duration::from_millis(self.update_rate_ms)
    }
}

/// Loads configuration from the given path or the standard locations.
///
/// Search order:
/// 1. Provided path parameter
/// 2. `PWMFAND_CONFIG` environment variable
/// 3. `$XDG_CONFIG_HOME/pwmfand/config.yml` or `~/.config/pwmfand/config.yml`
/// 4. `/etc/pwmfand/config.yml`
pub fn load(path: Option<PathBuf>) -> Result<Config> {
    let path = match path {
        Some(p) => p,
        None => locate_config().context("No configuration file found")?,
    };

    info!("Loading config from: {}", path.display());
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

    if config.version != 1 {
        bail!(
            "Unsupported config version {} in file: {}",
            config.version,
            path.display()
        );
    }

    config
        .validate()
        .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

    Ok(config)
}

fn locate_config() -> Option<PathBuf> {
    if let Ok(path) = env::var("PWMFAND_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| env::var("HOME").ok().map(|home| PathBuf::from(home).join(".config")));
    if let Some(dir) = config_home {
        let path = dir.join("pwmfand/config.yml");
        if path.exists() {
            return Some(path);
        }
    }

    let system = PathBuf::from("/etc/pwmfand/config.yml");
    system.exists().then_some(system)
}

mod defaults {
    use std::path::PathBuf;

    pub fn data_dir() -> PathBuf {
        PathBuf::from("/var/lib/pwmfand")
    }

    pub fn rpm_polling_rate_ms() -> u64 {
        1000
    }

    pub fn temp_sensor_polling_rate_ms() -> u64 {
        200
    }

    pub fn rpm_rolling_window_size() -> usize {
        10
    }

    pub fn max_rpm_diff_for_settled_fan() -> f64 {
        10.0
    }

    pub fn update_rate_ms() -> u64 {
        200
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
version: 1
data_dir: /tmp/pwmfand
rpm_polling_rate_ms: 500

sensors:
  - kind: hwmon-temp
    id: cpu_temp
    input: /sys/class/hwmon/hwmon0/temp1_input

curves:
  - kind: linear
    id: cpu_curve
    sensor: cpu_temp
    min_temp: 40
    max_temp: 80
  - kind: constant
    id: fixed
    value: 128

fans:
  - kind: hwmon
    id: cpu_fan
    pwm_output: /sys/class/hwmon/hwmon3/pwm1
    index: 1
    rpm_input: /sys/class/hwmon/hwmon3/fan1_input
    curve: cpu_curve
    never_stop: true
    min_pwm: 30
  - kind: file
    id: aux_fan
    pwm_path: /run/fans/aux
    curve: fixed
"#;

    #[test]
    fn parses_sample_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.rpm_polling_rate(), Duration::from_millis(500));
        // omitted keys fall back to defaults
        assert_eq!(config.rpm_rolling_window_size, 10);
        assert_eq!(config.temp_sensor_polling_rate(), Duration::from_millis(200));

        assert_eq!(config.fans.len(), 2);
        let cpu_fan = &config.fans[0];
        assert!(cpu_fan.never_stop);
        assert_eq!(cpu_fan.min_pwm, Some(30));
        assert_eq!(cpu_fan.pid, PidCfg::default());
        assert!(matches!(cpu_fan.backend, FanBackendCfg::HwMon { .. }));
        assert!(matches!(
            config.fans[1].backend,
            FanBackendCfg::File { .. }
        ));
    }

    #[test]
    fn rejects_unknown_curve_reference() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.fans[0].curve = "missing".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_sensor_reference() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.sensors.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_degenerate_window_and_bounds() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.rpm_rolling_window_size = 0;
        assert!(config.validate().is_err());

        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.fans[0].min_pwm = Some(200);
        config.fans[0].max_pwm = Some(100);
        assert!(config.validate().is_err());

        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.fans[0].max_pwm = Some(300);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let duplicate = config.fans[0].clone();
        config.fans.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_version() {
        let bumped = SAMPLE.replace("version: 1", "version: 9");
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), bumped).unwrap();
        assert!(load(Some(file.path().to_path_buf())).is_err());
    }

    #[test]
    fn load_reads_and_validates_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), SAMPLE).unwrap();
        let config = load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.fans.len(), 2);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let reparsed: Config = serde_yaml::from_str(&serialized).unwrap();
        assert_eq!(config.fans, reparsed.fans);
        assert_eq!(config.curves, reparsed.curves);
    }
}
