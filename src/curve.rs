//! Speed curves mapping sensor inputs to a target PWM in 0..=255.
//!
//! The control loop only consumes the [`SpeedCurve`] trait; concrete curve
//! kinds are built from configuration into a registry keyed by curve id.
//! The registry is read-only once built.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::CurveCfg;
use crate::fans::{MAX_PWM_VALUE, MIN_PWM_VALUE};
use crate::sensors::TemperatureSensor;

/// A pure target-PWM producer, evaluated once per control tick.
///
/// Implementations report values in `0..=255`; callers clamp defensively.
#[async_trait]
pub trait SpeedCurve: Send + Sync {
    fn id(&self) -> &str;
    async fn evaluate(&self) -> Result<i32>;
}

/// Registry of all configured curves, owned by the curve subsystem.
pub type CurveRegistry = HashMap<String, Arc<dyn SpeedCurve>>;

/// Fixed-value curve.
pub struct ConstantCurve {
    id: String,
    value: i32,
}

impl ConstantCurve {
    pub fn new(id: impl Into<String>, value: i32) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

#[async_trait]
impl SpeedCurve for ConstantCurve {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self) -> Result<i32> {
        Ok(self.value)
    }
}

/// Linear interpolation between a low and a high temperature.
///
/// At or below `min_temp` the curve yields 0, at or above `max_temp` it
/// yields 255.
pub struct LinearCurve {
    id: String,
    sensor: Arc<dyn TemperatureSensor>,
    min_temp: f64,
    max_temp: f64,
}

impl LinearCurve {
    pub fn new(
        id: impl Into<String>,
        sensor: Arc<dyn TemperatureSensor>,
        min_temp: f64,
        max_temp: f64,
    ) -> Self {
        Self {
            id: id.into(),
            sensor,
            min_temp,
            max_temp,
        }
    }
}

#[async_trait]
impl SpeedCurve for LinearCurve {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self) -> Result<i32> {
        let temp = self
            .sensor
            .read_temperature()
            .await
            .with_context(|| format!("curve '{}' sensor read", self.id))?;

        let ratio = (temp - self.min_temp) / (self.max_temp - self.min_temp);
        let target = ratio * f64::from(MAX_PWM_VALUE);
        Ok((target.round() as i32).clamp(MIN_PWM_VALUE, MAX_PWM_VALUE))
    }
}

/// Builds the curve registry from configuration.
///
/// Fails on duplicate curve ids, references to unknown sensors, and
/// degenerate temperature ranges.
pub fn build_registry(
    curves: &[CurveCfg],
    sensors: &HashMap<String, Arc<dyn TemperatureSensor>>,
) -> Result<CurveRegistry> {
    let mut registry = CurveRegistry::new();

    for cfg in curves {
        let (id, curve): (&str, Arc<dyn SpeedCurve>) = match cfg {
            CurveCfg::Constant { id, value } => (
                id,
                Arc::new(ConstantCurve {
                    id: id.clone(),
                    value: *value,
                }),
            ),
            CurveCfg::Linear {
                id,
                sensor,
                min_temp,
                max_temp,
            } => {
                if max_temp <= min_temp {
                    bail!("curve '{id}': max_temp must be above min_temp");
                }
                let sensor = sensors
                    .get(sensor)
                    .with_context(|| format!("curve '{id}' references unknown sensor '{sensor}'"))?
                    .clone();
                (
                    id,
                    Arc::new(LinearCurve {
                        id: id.clone(),
                        sensor,
                        min_temp: *min_temp,
                        max_temp: *max_temp,
                    }),
                )
            }
        };

        if registry.insert(id.to_string(), curve).is_some() {
            bail!("duplicate curve id '{id}'");
        }
    }

    Ok(registry)
}
