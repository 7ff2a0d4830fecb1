//! hwmon sysfs fan backend.
//!
//! One fan maps to three integer-file endpoints inside a hwmon device
//! directory: `pwmN` (read/write, 0..=255), `pwmN_enable` (read/write mode
//! selector, optional) and `fanN_input` (read-only RPM, optional). The
//! presence of the optional files determines the capability set.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;

use crate::error::{ControlError, Result};
use crate::fans::{Capability, ControlMode, Fan, FanKind, FanState};
use crate::util::{read_int_from_file, write_int_to_file};

#[derive(Debug)]
pub struct HwMonFan {
    state: FanState,
    pwm_path: PathBuf,
    pwm_enable_path: Option<PathBuf>,
    rpm_path: Option<PathBuf>,
}

impl HwMonFan {
    /// Builds a hwmon fan from its `pwmN` endpoint.
    ///
    /// The mode selector path is derived as `pwm{index}_enable` next to the
    /// PWM output; the capability is advertised only when that file exists.
    pub fn new(
        state: FanState,
        pwm_path: impl Into<PathBuf>,
        index: u32,
        rpm_path: Option<PathBuf>,
    ) -> Self {
        let pwm_path = pwm_path.into();
        let enable_path = pwm_path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(format!("pwm{index}_enable"));
        let pwm_enable_path = enable_path.exists().then_some(enable_path);

        Self {
            state,
            pwm_path,
            pwm_enable_path,
            rpm_path,
        }
    }

    fn enable_path(&self) -> Result<&PathBuf> {
        self.pwm_enable_path
            .as_ref()
            .ok_or(ControlError::Unsupported(Capability::ControlMode))
    }
}

#[async_trait]
impl Fan for HwMonFan {
    fn state(&self) -> &FanState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut FanState {
        &mut self.state
    }

    fn kind(&self) -> FanKind {
        FanKind::HwMon
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::RpmSensor => self.rpm_path.is_some(),
            Capability::ControlMode => self.pwm_enable_path.is_some(),
        }
    }

    async fn get_pwm(&mut self) -> Result<i32> {
        let value = read_int_from_file(&self.pwm_path)?;
        self.state.note_pwm(value);
        Ok(value)
    }

    async fn set_pwm(&mut self, pwm: i32) -> Result<()> {
        debug!("Setting PWM of '{}' to {pwm}", self.id());
        write_int_to_file(pwm, &self.pwm_path)
    }

    async fn get_rpm(&mut self) -> Result<i32> {
        let path = self
            .rpm_path
            .as_ref()
            .ok_or(ControlError::Unsupported(Capability::RpmSensor))?;
        let value = read_int_from_file(path)?;
        self.state.note_rpm(value);
        Ok(value)
    }

    async fn get_control_mode(&self) -> Result<ControlMode> {
        read_int_from_file(self.enable_path()?).map(ControlMode::from_raw)
    }

    async fn set_control_mode(&mut self, mode: ControlMode) -> Result<()> {
        let path = self.enable_path()?.clone();
        write_int_to_file(mode.as_raw(), &path)?;

        match read_int_from_file(&path) {
            Ok(current) if current == mode.as_raw() => Ok(()),
            Ok(current) => Err(ControlError::ModeStuck {
                requested: mode.as_raw(),
                actual: current,
            }),
            Err(_) => Err(ControlError::ModeStuck {
                requested: mode.as_raw(),
                actual: -1,
            }),
        }
    }
}
