//! Persistence gateway for learned fan data.
//!
//! Stores the measured RPM-vs-PWM curve and the requested-to-actual PWM map
//! per fan id. Load failures are surfaced to the caller, which treats them
//! as "not found" and recomputes (the data is always recoverable by
//! re-characterizing).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_rpm_curve(&self, fan_id: &str) -> Result<Option<BTreeMap<i32, f64>>>;
    async fn save_rpm_curve(&self, fan_id: &str, curve: &BTreeMap<i32, f64>) -> Result<()>;
    async fn load_pwm_map(&self, fan_id: &str) -> Result<Option<BTreeMap<i32, i32>>>;
    async fn save_pwm_map(&self, fan_id: &str, map: &BTreeMap<i32, i32>) -> Result<()>;
}

/// JSON-file persistence under a data directory, one file per fan and
/// record kind.
pub struct FilePersistence {
    data_dir: PathBuf,
}

impl FilePersistence {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn record_path(&self, fan_id: &str, kind: &str) -> PathBuf {
        self.data_dir.join(format!("{fan_id}_{kind}.json"))
    }

    async fn load<T: DeserializeOwned>(&self, fan_id: &str, kind: &str) -> Result<Option<T>> {
        let path = self.record_path(fan_id, kind);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let value =
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    async fn save<T: Serialize>(&self, fan_id: &str, kind: &str, value: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("creating {}", self.data_dir.display()))?;
        let path = self.record_path(fan_id, kind);
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn load_rpm_curve(&self, fan_id: &str) -> Result<Option<BTreeMap<i32, f64>>> {
        self.load(fan_id, "rpm_curve").await
    }

    async fn save_rpm_curve(&self, fan_id: &str, curve: &BTreeMap<i32, f64>) -> Result<()> {
        self.save(fan_id, "rpm_curve", curve).await
    }

    async fn load_pwm_map(&self, fan_id: &str) -> Result<Option<BTreeMap<i32, i32>>> {
        self.load(fan_id, "pwm_map").await
    }

    async fn save_pwm_map(&self, fan_id: &str, map: &BTreeMap<i32, i32>) -> Result<()> {
        self.save(fan_id, "pwm_map", map).await
    }
}

/// In-memory persistence used by the test suites.
#[derive(Default)]
pub struct MemoryPersistence {
    rpm_curves: Mutex<HashMap<String, BTreeMap<i32, f64>>>,
    pwm_maps: Mutex<HashMap<String, BTreeMap<i32, i32>>>,
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load_rpm_curve(&self, fan_id: &str) -> Result<Option<BTreeMap<i32, f64>>> {
        Ok(self.rpm_curves.lock().await.get(fan_id).cloned())
    }

    async fn save_rpm_curve(&self, fan_id: &str, curve: &BTreeMap<i32, f64>) -> Result<()> {
        self.rpm_curves
            .lock()
            .await
            .insert(fan_id.to_string(), curve.clone());
        Ok(())
    }

    async fn load_pwm_map(&self, fan_id: &str) -> Result<Option<BTreeMap<i32, i32>>> {
        Ok(self.pwm_maps.lock().await.get(fan_id).cloned())
    }

    async fn save_pwm_map(&self, fan_id: &str, map: &BTreeMap<i32, i32>) -> Result<()> {
        self.pwm_maps
            .lock()
            .await
            .insert(fan_id.to_string(), map.clone());
        Ok(())
    }
}
