//! Plain integer-file fan backend.
//!
//! Covers fans exposed through bare value files without a hwmon device
//! directory: a writable PWM file and, optionally, a readable RPM file.
//! There is no control-mode endpoint, so the backend never advertises the
//! control-mode capability and skips characterization on first start.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{ControlError, Result};
use crate::fans::{Capability, ControlMode, Fan, FanKind, FanState};
use crate::util::{read_int_from_file, write_int_to_file};

#[derive(Debug)]
pub struct FileFan {
    state: FanState,
    pwm_path: PathBuf,
    rpm_path: Option<PathBuf>,
}

impl FileFan {
    pub fn new(state: FanState, pwm_path: impl Into<PathBuf>, rpm_path: Option<PathBuf>) -> Self {
        Self {
            state,
            pwm_path: pwm_path.into(),
            rpm_path,
        }
    }
}

#[async_trait]
impl Fan for FileFan {
    fn state(&self) -> &FanState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut FanState {
        &mut self.state
    }

    fn kind(&self) -> FanKind {
        FanKind::File
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::RpmSensor => self.rpm_path.is_some(),
            Capability::ControlMode => false,
        }
    }

    async fn get_pwm(&mut self) -> Result<i32> {
        let value = read_int_from_file(&self.pwm_path)?;
        self.state.note_pwm(value);
        Ok(value)
    }

    async fn set_pwm(&mut self, pwm: i32) -> Result<()> {
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
        Err(ControlError::Unsupported(Capability::ControlMode))
    }

    async fn set_control_mode(&mut self, _mode: ControlMode) -> Result<()> {
        Err(ControlError::Unsupported(Capability::ControlMode))
    }
}
