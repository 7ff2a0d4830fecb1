//! Fan handle abstraction over one physical fan.
//!
//! A [`Fan`] exposes the hardware endpoints (PWM output, RPM input, control
//! mode selector) together with the mutable state learned about the fan at
//! runtime. Backends are tagged variants in [`crate::drivers`]; capability
//! flags are explicit set membership, never probed via reflection.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;

use crate::characterization::pwm_boundaries;
use crate::error::{ControlError, Result};

/// Lowest PWM value accepted by the hardware register.
pub const MIN_PWM_VALUE: i32 = 0;
/// Highest PWM value accepted by the hardware register.
pub const MAX_PWM_VALUE: i32 = 255;

/// Optional capabilities a fan backend may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// The fan has a tachometer input (`fanN_input`).
    RpmSensor,
    /// The fan has a control-mode selector (`pwmN_enable`).
    ControlMode,
}

/// Backend kind of a fan handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanKind {
    /// hwmon sysfs backed fan; characterized on first start.
    HwMon,
    /// Plain integer-file backed fan.
    File,
}

/// The hardware's selector for who drives the PWM output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// No control, typically resulting in full speed.
    Disabled,
    /// Manual software PWM control.
    Manual,
    /// Automatic control by the motherboard or firmware; carries the raw
    /// selector value so it can be restored faithfully.
    Auto(i32),
}

impl ControlMode {
    pub fn from_raw(value: i32) -> Self {
        match value {
            0 => Self::Disabled,
            1 => Self::Manual,
            other => Self::Auto(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::Disabled => 0,
            Self::Manual => 1,
            Self::Auto(raw) => raw,
        }
    }
}

/// Mutable per-fan state shared by all backends.
///
/// Created from configuration at process start and mutated by the
/// characterization sequence, the RPM monitor and the control loop.
#[derive(Debug, Clone)]
pub struct FanState {
    id: String,
    curve_id: String,
    never_stop: bool,
    start_pwm: Option<i32>,
    min_pwm: Option<i32>,
    max_pwm: Option<i32>,
    rpm_avg: f64,
    last_pwm: i32,
    last_rpm: i32,
    rpm_curve: BTreeMap<i32, f64>,
}

impl FanState {
    pub fn new(
        id: impl Into<String>,
        curve_id: impl Into<String>,
        never_stop: bool,
        min_pwm: Option<i32>,
        max_pwm: Option<i32>,
    ) -> Self {
        Self {
            id: id.into(),
            curve_id: curve_id.into(),
            never_stop,
            start_pwm: None,
            min_pwm,
            max_pwm,
            rpm_avg: 0.0,
            last_pwm: 0,
            last_rpm: 0,
            rpm_curve: BTreeMap::new(),
        }
    }

    pub(crate) fn note_pwm(&mut self, pwm: i32) {
        self.last_pwm = pwm;
    }

    pub(crate) fn note_rpm(&mut self, rpm: i32) {
        self.last_rpm = rpm;
    }
}

/// Abstraction over one physical fan.
///
/// Hardware operations may fail with an I/O error kind; state accessors are
/// infallible. Implementations are used behind `Box<dyn Fan>` guarded by a
/// single lock per handle, so none of the methods need internal locking.
#[async_trait]
pub trait Fan: Send + Sync + Debug {
    fn state(&self) -> &FanState;
    fn state_mut(&mut self) -> &mut FanState;

    fn kind(&self) -> FanKind;
    fn supports(&self, capability: Capability) -> bool;

    /// Reads the current PWM output (0..=255).
    async fn get_pwm(&mut self) -> Result<i32>;

    /// Writes the requested PWM value.
    async fn set_pwm(&mut self, pwm: i32) -> Result<()>;

    /// Reads the current RPM; fails when [`Capability::RpmSensor`] is absent.
    async fn get_rpm(&mut self) -> Result<i32>;

    /// Reads the control-mode selector; fails when
    /// [`Capability::ControlMode`] is absent.
    async fn get_control_mode(&self) -> Result<ControlMode>;

    /// Writes the control-mode selector, re-reads it, and fails with
    /// [`ControlError::ModeStuck`] when the readback differs.
    async fn set_control_mode(&mut self, mode: ControlMode) -> Result<()>;

    fn id(&self) -> &str {
        &self.state().id
    }

    fn curve_id(&self) -> &str {
        &self.state().curve_id
    }

    fn should_never_stop(&self) -> bool {
        self.state().never_stop
    }

    /// Lowest PWM at which the fan starts spinning from standstill.
    /// Defaults to [`MAX_PWM_VALUE`] until learned.
    fn start_pwm(&self) -> i32 {
        self.state().start_pwm.unwrap_or(MAX_PWM_VALUE)
    }

    fn set_start_pwm(&mut self, pwm: i32) {
        self.state_mut().start_pwm = Some(pwm);
    }

    /// Lower PWM bound used by the control loop.
    ///
    /// Fans not marked never-stop always report [`MIN_PWM_VALUE`], ignoring
    /// any configured override.
    fn min_pwm(&self) -> i32 {
        if self.should_never_stop() {
            self.state().min_pwm.unwrap_or(MIN_PWM_VALUE)
        } else {
            MIN_PWM_VALUE
        }
    }

    fn set_min_pwm(&mut self, pwm: i32) {
        self.state_mut().min_pwm = Some(pwm);
    }

    fn max_pwm(&self) -> i32 {
        self.state().max_pwm.unwrap_or(MAX_PWM_VALUE)
    }

    fn set_max_pwm(&mut self, pwm: i32) {
        self.state_mut().max_pwm = Some(pwm);
    }

    /// Last PWM value read back from the hardware.
    fn last_pwm(&self) -> i32 {
        self.state().last_pwm
    }

    /// Last RPM value read from the tachometer.
    fn last_rpm(&self) -> i32 {
        self.state().last_rpm
    }

    fn rpm_avg(&self) -> f64 {
        self.state().rpm_avg
    }

    fn set_rpm_avg(&mut self, avg: f64) {
        self.state_mut().rpm_avg = avg;
    }

    fn rpm_curve(&self) -> &BTreeMap<i32, f64> {
        &self.state().rpm_curve
    }

    /// Records a runtime RPM sample, refining the learned curve.
    fn record_rpm_sample(&mut self, pwm: i32, rpm: f64) {
        self.state_mut().rpm_curve.insert(pwm, rpm);
    }

    /// Attaches measured RPM curve data and derives the fan's boundaries
    /// from it: start and min PWM become the lowest value at which the fan
    /// spins, max PWM the start of the RPM plateau.
    fn attach_rpm_curve(&mut self, curve: BTreeMap<i32, f64>) -> Result<()> {
        if curve.is_empty() {
            return Err(ControlError::EmptyCurveData);
        }
        let (start, max) = pwm_boundaries(&curve);
        let state = self.state_mut();
        state.rpm_curve = curve;
        state.start_pwm = Some(start);
        state.max_pwm = Some(max);
        // no better source for the lower bound than the spin-up point
        state.min_pwm = Some(start);
        Ok(())
    }
}

/// Best-effort switch to manual PWM control.
///
/// When the manual write fails, falls back to the disabled mode so the
/// hardware's automatic control cannot fight the control loop. Returns the
/// outcome of the last attempted write.
pub async fn try_set_manual_mode(fan: &mut dyn Fan) -> Result<()> {
    if !fan.supports(Capability::ControlMode) {
        return Ok(());
    }
    match fan.set_control_mode(ControlMode::Manual).await {
        Ok(()) => Ok(()),
        Err(e) => {
            log::error!("Unable to set fan mode of '{}' to manual: {e}", fan.id());
            fan.set_control_mode(ControlMode::Disabled)
                .await
                .map_err(|e| {
                    log::error!("Unable to set fan mode of '{}' to disabled: {e}", fan.id());
                    e
                })
        }
    }
}
