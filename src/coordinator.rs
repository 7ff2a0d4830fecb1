//! Coordinator owning one supervisor task per configured fan.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio::sync::{Mutex, RwLock};

use crate::config::{Config, FanBackendCfg, FanCfg, SensorCfg};
use crate::controller::{ControllerSettings, FanController, FanHandle};
use crate::curve;
use crate::drivers::{FileFan, HwMonFan};
use crate::fans::FanState;
use crate::persistence::{FilePersistence, Persistence};
use crate::pid::PidLoop;
use crate::sensors::TemperatureSensor;
use crate::task_manager::TaskManager;
use crate::temperature_sensors::hwmon_temp::HwMonTempSensor;

/// Builds the fan, curve and persistence objects from configuration and
/// runs one [`FanController`] per fan until shutdown.
///
/// When `run_fan_initialization_in_parallel` is disabled, the coordinator
/// hands every controller the same characterization lock so only one fan
/// probes its hardware at a time.
pub struct FanCoordinator {
    config: Config,
    task_manager: TaskManager,
}

impl FanCoordinator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            task_manager: TaskManager::new(),
        }
    }

    /// Spawns a supervisor task for every configured fan.
    pub fn start_controllers(&mut self) -> Result<()> {
        let sensors = build_sensors(&self.config);
        let curves = curve::build_registry(&self.config.curves, &sensors)
            .context("Failed to build curve registry")?;
        let persistence: Arc<dyn Persistence> =
            Arc::new(FilePersistence::new(&self.config.data_dir));

        let init_lock = (!self.config.run_fan_initialization_in_parallel)
            .then(|| Arc::new(Mutex::new(())));

        for fan_cfg in &self.config.fans {
            let curve = curves
                .get(&fan_cfg.curve)
                .with_context(|| {
                    format!(
                        "fan '{}' references unknown curve '{}'",
                        fan_cfg.id, fan_cfg.curve
                    )
                })?
                .clone();

            let settings = ControllerSettings {
                update_rate: fan_cfg.update_rate(),
                rpm_polling_rate: self.config.rpm_polling_rate(),
                temp_sensor_polling_rate: self.config.temp_sensor_polling_rate(),
                rpm_rolling_window_size: self.config.rpm_rolling_window_size,
                max_rpm_diff_for_settled_fan: self.config.max_rpm_diff_for_settled_fan,
            };
            let pid = PidLoop::new(fan_cfg.pid.p, fan_cfg.pid.i, fan_cfg.pid.d);

            let mut controller =
                FanController::new(build_fan(fan_cfg), curve, persistence.clone(), pid, settings);
            if let Some(lock) = &init_lock {
                controller = controller.with_init_lock(lock.clone());
            }

            self.task_manager
                .spawn_task(format!("fan-{}", fan_cfg.id), move |token| {
                    controller.run(token)
                });
        }

        info!("Started {} fan controllers", self.config.fans.len());
        Ok(())
    }

    /// Blocks until a shutdown signal arrives, then stops every controller.
    pub async fn run_main_loop(&mut self) -> Result<()> {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Received Ctrl+C, initiating graceful shutdown...");
        self.shutdown().await
    }

    /// Cancels all supervisors and waits for hardware restoration.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.task_manager.shutdown_all().await?;
        info!("Shutdown complete");
        Ok(())
    }

    pub fn running_controllers(&self) -> usize {
        self.task_manager.active_count()
    }
}

fn build_fan(cfg: &FanCfg) -> FanHandle {
    let state = FanState::new(
        &cfg.id,
        &cfg.curve,
        cfg.never_stop,
        cfg.min_pwm,
        cfg.max_pwm,
    );
    match &cfg.backend {
        FanBackendCfg::HwMon {
            pwm_output,
            index,
            rpm_input,
        } => Arc::new(RwLock::new(Box::new(HwMonFan::new(
            state,
            pwm_output,
            *index,
            rpm_input.clone(),
        )))),
        FanBackendCfg::File { pwm_path, rpm_path } => Arc::new(RwLock::new(Box::new(
            FileFan::new(state, pwm_path, rpm_path.clone()),
        ))),
    }
}

fn build_sensors(config: &Config) -> HashMap<String, Arc<dyn TemperatureSensor>> {
    config
        .sensors
        .iter()
        .map(|cfg| match cfg {
            SensorCfg::HwMonTemp { id, input } => (
                id.clone(),
                Arc::new(HwMonTempSensor::new(id, input)) as Arc<dyn TemperatureSensor>,
            ),
        })
        .collect()
}
