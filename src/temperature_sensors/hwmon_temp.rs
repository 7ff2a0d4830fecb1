//! hwmon temperature sensor integration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::sensors::TemperatureSensor;

/// Temperature sensor backed by a hwmon `tempN_input` file.
///
/// The kernel reports millidegrees Celsius; readings are converted to
/// degrees before being handed to the curve subsystem.
pub struct HwMonTempSensor {
    key: String,
    input_path: PathBuf,
}

impl HwMonTempSensor {
    pub fn new(key: impl Into<String>, input_path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            input_path: input_path.into(),
        }
    }
}

#[async_trait]
impl TemperatureSensor for HwMonTempSensor {
    fn key(&self) -> String {
        self.key.clone()
    }

    async fn read_temperature(&self) -> Result<f64> {
        let text = tokio::fs::read_to_string(&self.input_path)
            .await
            .with_context(|| format!("reading sensor {}", self.input_path.display()))?;
        let millidegrees: i64 = text
            .trim()
            .parse()
            .with_context(|| format!("parsing sensor value {:?}", text.trim()))?;
        Ok(millidegrees as f64 / 1000.0)
    }
}
