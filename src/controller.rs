//! Per-fan closed-loop controller.
//!
//! A [`FanController`] owns everything one fan needs: the handle lock, the
//! speed curve, the learned PWM map, a PID loop and the persistence gateway.
//! [`FanController::run`] sequences initialization (characterizing the fan
//! when no persisted data exists), then drives two cooperating tasks — the
//! RPM monitor and the control loop — until cancellation or a fatal tick
//! error, restoring the hardware to its original state on the way out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{error, info, warn};
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::characterization::{self, sleep_or_cancel, CharacterizationTiming};
use crate::curve::SpeedCurve;
use crate::error::ControlError;
use crate::fans::{
    try_set_manual_mode, Capability, ControlMode, Fan, FanKind, MAX_PWM_VALUE, MIN_PWM_VALUE,
};
use crate::persistence::Persistence;
use crate::pid::PidLoop;
use crate::util::{find_closest, update_moving_avg};

/// Shared handle to one fan, serialized across the monitor and control
/// tasks by a single lock held across each short handle operation.
pub type FanHandle = Arc<RwLock<Box<dyn Fan>>>;

/// Settings the controller consumes from global and per-fan configuration.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Interval between control-loop ticks.
    pub update_rate: Duration,
    /// Interval between RPM monitor samples.
    pub rpm_polling_rate: Duration,
    /// Polling rate of the temperature sensors feeding the curve; the
    /// supervisor waits two of these before the first evaluation.
    pub temp_sensor_polling_rate: Duration,
    /// Window size of the RPM moving average.
    pub rpm_rolling_window_size: usize,
    /// Settling threshold for characterization, in RPM.
    pub max_rpm_diff_for_settled_fan: f64,
}

pub struct FanController {
    fan: FanHandle,
    curve: Arc<dyn SpeedCurve>,
    persistence: Arc<dyn Persistence>,
    settings: ControllerSettings,
    timing: CharacterizationTiming,
    /// Serializes characterization across controllers when parallel
    /// initialization is disabled.
    init_lock: Option<Arc<Mutex<()>>>,
    pid: PidLoop,
    pwm_map: BTreeMap<i32, i32>,
    distinct_targets: Vec<i32>,
    last_set_pwm: Option<i32>,
    original_pwm: Option<i32>,
    original_mode: Option<ControlMode>,
}

impl FanController {
    pub fn new(
        fan: FanHandle,
        curve: Arc<dyn SpeedCurve>,
        persistence: Arc<dyn Persistence>,
        pid: PidLoop,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            fan,
            curve,
            persistence,
            settings,
            timing: CharacterizationTiming::default(),
            init_lock: None,
            pid,
            pwm_map: BTreeMap::new(),
            distinct_targets: Vec::new(),
            last_set_pwm: None,
            original_pwm: None,
            original_mode: None,
        }
    }

    pub fn with_init_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.init_lock = Some(lock);
        self
    }

    pub fn with_timing(mut self, timing: CharacterizationTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Runs the supervisor until cancellation or a fatal control error.
    ///
    /// Returns once both the RPM monitor and the control loop have stopped
    /// and the hardware has been restored.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let fan_id = self.fan_id().await;

        {
            let fan = self.fan.read().await;
            if fan.should_never_stop() && !fan.supports(Capability::RpmSensor) {
                warn!(
                    "Cannot guarantee neverStop option on fan {fan_id}, since it has no RPM input"
                );
            }
        }

        // capture the pre-start hardware state for restoration
        {
            let mut fan = self.fan.write().await;
            match fan.get_pwm().await {
                Ok(pwm) => self.original_pwm = Some(pwm),
                Err(_) => warn!("Cannot read pwm value of {fan_id}"),
            }
            if fan.supports(Capability::ControlMode) {
                match fan.get_control_mode().await {
                    Ok(mode) => self.original_mode = Some(mode),
                    Err(_) => warn!("Cannot read control mode of {fan_id}"),
                }
            }
        }

        info!("Gathering sensor data for {fan_id}...");
        let warmup = Duration::from_secs(2) + 2 * self.settings.temp_sensor_polling_rate;
        if sleep_or_cancel(warmup, &cancel).await.is_err() {
            // nothing has been written to the hardware yet
            return Ok(());
        }

        if let Err(e) = self.initialize(&cancel).await {
            self.restore().await;
            if cancel.is_cancelled() {
                info!("Fan controller for {fan_id} cancelled during initialization");
                return Ok(());
            }
            return Err(e).with_context(|| format!("initializing fan {fan_id}"));
        }

        {
            let fan = self.fan.read().await;
            info!(
                "PWM settings of fan '{fan_id}': Min {}, Start {}, Max {}",
                fan.min_pwm(),
                fan.start_pwm(),
                fan.max_pwm()
            );
        }
        info!("Starting controller loop for fan '{fan_id}'");

        let task_token = cancel.child_token();

        let monitor_handle = if self.fan.read().await.supports(Capability::RpmSensor) {
            let fan = self.fan.clone();
            let settings = self.settings.clone();
            let token = task_token.clone();
            let id = fan_id.clone();
            Some(tokio::spawn(run_rpm_monitor(fan, settings, token, id)))
        } else {
            None
        };

        let control_handle = tokio::spawn(self.run_control_loop(task_token));

        let mut result = match control_handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(anyhow::anyhow!("control loop for {fan_id} panicked: {e}")),
        };
        if let Some(handle) = monitor_handle {
            if let Err(e) = handle.await {
                warn!("RPM monitor for {fan_id} panicked: {e}");
                if result.is_ok() {
                    result = Err(anyhow::anyhow!("rpm monitor for {fan_id} panicked: {e}"));
                }
            }
        }
        result
    }

    /// Loads persisted characterization data, running the initialization
    /// sequence when none exists, and prepares the PWM map and distinct
    /// target set.
    async fn initialize(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let fan_id = self.fan_id().await;

        info!("Loading fan curve data for fan '{fan_id}'...");
        let loaded = self
            .persistence
            .load_rpm_curve(&fan_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to load RPM curve for {fan_id}, recomputing: {e}");
                None
            });

        if loaded.is_none() {
            if self.fan.read().await.kind() == FanKind::HwMon {
                warn!("Fan '{fan_id}' has not yet been analyzed, starting initialization sequence...");
                self.run_initialization_sequence(cancel).await?;
            } else {
                let current = self.fan.read().await.rpm_curve().clone();
                self.persistence
                    .save_rpm_curve(&fan_id, &current)
                    .await
                    .with_context(|| format!("persisting empty curve record for {fan_id}"))?;
            }
        }

        let curve_data = self
            .persistence
            .load_rpm_curve(&fan_id)
            .await?
            .with_context(|| format!("no RPM curve data for fan {fan_id} after initialization"))?;

        if curve_data.is_empty() {
            // fans without a tachometer keep their configured boundaries
            info!("No measured RPM curve for fan '{fan_id}', keeping configured boundaries");
        } else {
            self.fan.write().await.attach_rpm_curve(curve_data)?;
        }

        let loaded_map = self
            .persistence
            .load_pwm_map(&fan_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to load PWM map for {fan_id}, recomputing: {e}");
                None
            });
        match loaded_map {
            Some(map) => self.pwm_map = map,
            None => {
                self.pwm_map =
                    characterization::compute_pwm_map(&self.fan, cancel, &self.timing).await?;
                if let Err(e) = self.persistence.save_pwm_map(&fan_id, &self.pwm_map).await {
                    error!("Unable to persist pwm map for fan {fan_id}: {e}");
                }
            }
        }
        self.update_distinct_targets();

        Ok(())
    }

    /// One-shot characterization: PWM map sweep, then RPM curve measurement
    /// for fans with a tachometer.
    async fn run_initialization_sequence(
        &mut self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let init_lock = self.init_lock.clone();
        let _guard = match &init_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let fan_id = self.fan_id().await;

        info!("Computing pwm map...");
        self.pwm_map = characterization::compute_pwm_map(&self.fan, cancel, &self.timing).await?;
        if let Err(e) = self.persistence.save_pwm_map(&fan_id, &self.pwm_map).await {
            error!("Unable to persist pwm map for fan {fan_id}: {e}");
        }
        self.update_distinct_targets();

        if !self.fan.read().await.supports(Capability::RpmSensor) {
            info!("Fan '{fan_id}' doesn't support RPM sensor, skipping fan curve measurement");
            let current = self.fan.read().await.rpm_curve().clone();
            if let Err(e) = self.persistence.save_rpm_curve(&fan_id, &current).await {
                error!("Failed to save fan RPM data for {fan_id}: {e}");
            }
            return Ok(());
        }

        info!("Measuring RPM curve...");
        let curve = characterization::measure_rpm_curve(
            &self.fan,
            &self.pwm_map,
            &self.distinct_targets,
            self.settings.max_rpm_diff_for_settled_fan,
            cancel,
            &self.timing,
        )
        .await?;

        self.fan.write().await.attach_rpm_curve(curve.clone())?;
        if let Err(e) = self.persistence.save_rpm_curve(&fan_id, &curve).await {
            error!("Failed to save fan RPM data for {fan_id}: {e}");
        }
        Ok(())
    }

    async fn run_control_loop(mut self, token: CancellationToken) -> anyhow::Result<()> {
        let fan_id = self.fan_id().await;

        // give the monitor a head start so the moving average holds at
        // least one sample before never-stop enforcement can trigger
        tokio::select! {
            () = token.cancelled() => {
                info!("Stopping fan controller for fan {fan_id}...");
                self.restore().await;
                return Ok(());
            }
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let mut ticks = interval(self.settings.update_rate);
        loop {
            tokio::select! {
                () = token.cancelled() => {
                    info!("Stopping fan controller for fan {fan_id}...");
                    self.restore().await;
                    return Ok(());
                }
                _ = ticks.tick() => {
                    if let Err(e) = self.update_fan_speed().await {
                        error!("Fan Control Error on {fan_id}: {e}");
                        self.restore().await;
                        // take the sibling monitor down with us
                        token.cancel();
                        return Err(e).with_context(|| format!("updating fan {fan_id}"));
                    }
                }
            }
        }
    }

    /// One control tick: evaluate the curve, ask the PID loop for a
    /// correction and write the result.
    ///
    /// Read and curve errors are fatal for this fan; write failures are
    /// logged and retried implicitly on the next tick.
    pub(crate) async fn update_fan_speed(&mut self) -> Result<(), ControlError> {
        let current_pwm = self.fan.write().await.get_pwm().await?;

        let target = self.calculate_target_pwm().await?;

        let correction = self
            .pid
            .update(f64::from(target), f64::from(current_pwm))
            .ceil();
        let coerced = (f64::from(current_pwm) + correction)
            .clamp(f64::from(MIN_PWM_VALUE), f64::from(MAX_PWM_VALUE));
        let rounded = coerced.round() as i32;

        if target >= 0 {
            {
                let mut fan = self.fan.write().await;
                let _ = try_set_manual_mode(fan.as_mut()).await;
            }
            if let Err(e) = self.set_pwm(rounded).await {
                error!("Error setting PWM of fan: {e}");
            }
        }

        Ok(())
    }

    /// Computes the optimal PWM target for the fan.
    ///
    /// Returns −1 when a never-stop fan shows no rotation even at its
    /// maximum PWM; callers skip the write for that tick.
    pub(crate) async fn calculate_target_pwm(&mut self) -> Result<i32, ControlError> {
        let fan_id = self.fan_id().await;

        let raw = self
            .curve
            .evaluate()
            .await
            .map_err(ControlError::CurveEvaluation)?;

        let mut target = raw;
        if target > MAX_PWM_VALUE {
            warn!("Tried to set out-of-bounds PWM value {target} on fan {fan_id}");
            target = MAX_PWM_VALUE;
        } else if target < MIN_PWM_VALUE {
            warn!("Tried to set out-of-bounds PWM value {target} on fan {fan_id}");
            target = MIN_PWM_VALUE;
        }

        let (min_pwm, max_pwm) = {
            let fan = self.fan.read().await;
            (fan.min_pwm(), fan.max_pwm())
        };

        // map the target onto the fan's usable range, assuming a linear
        // response like the measured curve suggests
        target = min_pwm
            + ((f64::from(target) / f64::from(MAX_PWM_VALUE)) * f64::from(max_pwm - min_pwm))
                as i32;

        // snap to the representative of the nearest plateau
        target = self.map_to_closest_distinct(target);

        if let Some(last_set) = self.last_set_pwm {
            let expected = self.pwm_map.get(&last_set).copied().unwrap_or(last_set);
            if let Ok(current) = self.fan.write().await.get_pwm().await {
                if current != expected {
                    warn!(
                        "PWM of {fan_id} was changed by third party! Last set PWM value was: {expected} but is now: {current}"
                    );
                }
            }
        }

        // never-stop enforcement, once a previous tick has set a value
        let (supports_rpm, never_stop, avg_rpm) = {
            let fan = self.fan.read().await;
            (
                fan.supports(Capability::RpmSensor),
                fan.should_never_stop(),
                fan.rpm_avg(),
            )
        };
        if supports_rpm && never_stop && self.last_set_pwm.is_some() && avg_rpm <= 0.0 {
            if target >= max_pwm {
                error!(
                    "CRITICAL: {}",
                    ControlError::NeverStopViolated { max_pwm }
                );
                return Ok(-1);
            }
            let mut fan = self.fan.write().await;
            let min_pwm = fan.min_pwm();
            warn!(
                "Increasing minPwm of {fan_id} from {min_pwm} to {}, which is supposed to never stop, but RPM is {avg_rpm}",
                min_pwm + 1
            );
            fan.set_min_pwm(min_pwm + 1);
            target += 1;
            // seed the moving average so the increase cannot repeat before
            // a fresh RPM sample lands
            fan.set_rpm_avg(1.0);
        }

        Ok(target)
    }

    /// Writes `target` to the fan unless the PWM map predicts the register
    /// already holds the corresponding plateau value.
    pub(crate) async fn set_pwm(&mut self, target: i32) -> Result<(), ControlError> {
        self.last_set_pwm = Some(target);

        let mut fan = self.fan.write().await;
        if let Ok(current) = fan.get_pwm().await {
            if self.pwm_map.get(&target) == Some(&current) {
                return Ok(());
            }
        }
        fan.set_pwm(target).await
    }

    fn map_to_closest_distinct(&self, target: i32) -> i32 {
        if self.distinct_targets.is_empty() {
            return target;
        }
        let closest = find_closest(target, &self.distinct_targets);
        self.pwm_map.get(&closest).copied().unwrap_or(closest)
    }

    fn update_distinct_targets(&mut self) {
        self.distinct_targets = characterization::distinct_pwm_values(&self.pwm_map);
    }

    /// Returns the fan to its pre-start state.
    ///
    /// Writes the captured original PWM, then hands the selector back to
    /// its original mode when that was not manual control. When any step
    /// fails, full speed is written as a safety fallback; a fan that cannot
    /// even be forced to full speed is reported prominently.
    async fn restore(&mut self) {
        let fan_id = self.fan_id().await;
        info!("Trying to restore fan settings for {fan_id}...");

        let mut failed = false;
        match self.original_pwm {
            Some(original) => {
                if let Err(e) = self.set_pwm(original).await {
                    warn!("Error restoring original PWM value for fan {fan_id}: {e}");
                    failed = true;
                }
            }
            None => failed = true,
        }

        if self.fan.read().await.supports(Capability::ControlMode) {
            match self.original_mode {
                Some(mode) if mode != ControlMode::Manual => {
                    match self.fan.write().await.set_control_mode(mode).await {
                        Ok(()) => return,
                        Err(e) => {
                            warn!("Error restoring control mode of fan {fan_id}: {e}");
                            failed = true;
                        }
                    }
                }
                Some(_) => {}
                // the original mode was never captured; assume the worst
                None => failed = true,
            }
        }

        if failed && self.set_pwm(MAX_PWM_VALUE).await.is_err() {
            warn!("Unable to restore fan {fan_id}, make sure it is running!");
        }
    }

    async fn fan_id(&self) -> String {
        self.fan.read().await.id().to_string()
    }
}

async fn run_rpm_monitor(
    fan: FanHandle,
    settings: ControllerSettings,
    token: CancellationToken,
    fan_id: String,
) {
    let mut ticks = IntervalStream::new(interval(settings.rpm_polling_rate));
    loop {
        tokio::select! {
            () = token.cancelled() => {
                info!("Stopping RPM monitor of fan controller for fan {fan_id}...");
                return;
            }
            tick = ticks.next() => {
                if tick.is_none() {
                    return;
                }
                measure_rpm(&fan, settings.rpm_rolling_window_size).await;
            }
        }
    }
}

/// Samples the fan's RPM sensor, feeding the moving average and refining
/// the learned curve at the current PWM.
async fn measure_rpm(fan: &RwLock<Box<dyn Fan>>, window_size: usize) {
    let mut fan = fan.write().await;

    let pwm = match fan.get_pwm().await {
        Ok(pwm) => pwm,
        Err(e) => {
            warn!("Error reading PWM value of fan {}: {e}", fan.id());
            return;
        }
    };
    let rpm = match fan.get_rpm().await {
        Ok(rpm) => rpm,
        Err(e) => {
            warn!("Error reading RPM value of fan {}: {e}", fan.id());
            return;
        }
    };

    let avg = update_moving_avg(fan.rpm_avg(), window_size, f64::from(rpm));
    fan.set_rpm_avg(avg);
    fan.record_rpm_sample(pwm, f64::from(rpm));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::ConstantCurve;
    use crate::fans::testing::{shared_handle, SimFan, SimHardware};
    use crate::persistence::MemoryPersistence;
    use pretty_assertions::assert_eq;

    fn fast_settings() -> ControllerSettings {
        ControllerSettings {
            update_rate: Duration::from_millis(100),
            rpm_polling_rate: Duration::from_millis(50),
            temp_sensor_polling_rate: Duration::from_millis(10),
            rpm_rolling_window_size: 10,
            max_rpm_diff_for_settled_fan: 10.0,
        }
    }

    fn instant_timing() -> CharacterizationTiming {
        CharacterizationTiming {
            probe_delay: Duration::ZERO,
            settle_poll: Duration::ZERO,
            sample_delay: Duration::ZERO,
        }
    }

    struct Rig {
        controller: FanController,
        hw: Arc<SimHardware>,
        fan: FanHandle,
    }

    /// Builds a controller around `sim` with a proportional-only PID so
    /// tick behavior is deterministic.
    fn rig(sim: SimFan, curve_target: i32) -> Rig {
        let hw = sim.hw.clone();
        let fan = shared_handle(sim);
        let controller = FanController::new(
            fan.clone(),
            Arc::new(ConstantCurve::new("curve", curve_target)),
            Arc::new(MemoryPersistence::default()),
            PidLoop::new(1.0, 0.0, 0.0),
            fast_settings(),
        )
        .with_timing(instant_timing());
        Rig { controller, hw, fan }
    }

    /// Preloads an identity PWM map so no characterization is needed.
    fn with_identity_map(mut rig: Rig) -> Rig {
        rig.controller.pwm_map = SimFan::identity_map();
        rig.controller.update_distinct_targets();
        rig
    }

    async fn seed_persisted_identity(persistence: &MemoryPersistence, fan_id: &str) {
        use crate::persistence::Persistence as _;
        let map = SimFan::identity_map();
        let curve: BTreeMap<i32, f64> = (0..=255).map(|i| (i, f64::from(i) * 10.0)).collect();
        persistence.save_pwm_map(fan_id, &map).await.unwrap();
        persistence.save_rpm_curve(fan_id, &curve).await.unwrap();
    }

    #[tokio::test]
    async fn ticks_approach_curve_target_monotonically() {
        let mut rig = with_identity_map(rig(SimFan::linear("fan1"), 128));

        let mut previous = 0;
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            rig.controller.update_fan_speed().await.unwrap();
            let pwm = rig.hw.pwm();
            assert!(pwm >= previous, "pwm must not move away from the target");
            previous = pwm;
        }
        assert!((120..=135).contains(&previous), "settled at {previous}");
    }

    #[tokio::test]
    async fn quantized_target_snaps_to_nearest_plateau() {
        let sim = SimFan::quantized("fan1");
        let mut rig = rig(sim, 100);
        rig.controller.pwm_map = (0..=255).map(|i| (i, i & 0xF8)).collect();
        rig.controller.update_distinct_targets();
        assert_eq!(rig.controller.distinct_targets.len(), 32);

        let target = rig.controller.calculate_target_pwm().await.unwrap();
        assert_eq!(target, 96);
    }

    #[tokio::test]
    async fn target_stays_within_fan_bounds() {
        let mut rig1 = with_identity_map(rig(SimFan::linear("fan1"), 300));
        // out-of-bounds curve values are clamped before remapping
        let target = rig1.controller.calculate_target_pwm().await.unwrap();
        assert_eq!(target, 255);

        let mut rig2 = with_identity_map(rig(SimFan::linear("fan2"), -20));
        let target = rig2.controller.calculate_target_pwm().await.unwrap();
        assert_eq!(target, 0);

        for value in [0, 1, 64, 127, 128, 254, 255] {
            let mut rig3 = with_identity_map(rig(SimFan::linear("fan3"), value));
            let fan = rig3.fan.clone();
            let target = rig3.controller.calculate_target_pwm().await.unwrap();
            let (min, max) = {
                let fan = fan.read().await;
                (fan.min_pwm(), fan.max_pwm())
            };
            assert!(target == -1 || (min..=max).contains(&target));
        }
    }

    #[tokio::test]
    async fn set_pwm_skips_write_when_already_at_plateau() {
        let sim = SimFan::quantized("fan1");
        let mut rig = rig(sim, 0);
        rig.controller.pwm_map = (0..=255).map(|i| (i, i & 0xF8)).collect();
        rig.controller.update_distinct_targets();

        rig.controller.set_pwm(100).await.unwrap();
        assert_eq!(rig.hw.pwm(), 96);
        assert_eq!(rig.hw.pwm_writes(), vec![100]);

        // register already reports this plateau's value: no second write
        rig.controller.set_pwm(100).await.unwrap();
        rig.controller.set_pwm(97).await.unwrap();
        assert_eq!(rig.hw.pwm_writes(), vec![100]);
        assert_eq!(rig.controller.last_set_pwm, Some(97));
    }

    #[tokio::test]
    async fn never_stop_waits_for_first_tick() {
        // the enforcement only arms once a previous tick has set a value;
        // flags the simpler reading of the source's tautological condition
        let sim = SimFan::stalled("fan1").never_stop();
        let mut rig = with_identity_map(rig(sim, 128));

        let first = rig.controller.calculate_target_pwm().await.unwrap();
        assert_eq!(rig.fan.read().await.min_pwm(), 0);

        rig.controller.set_pwm(first).await.unwrap();
        rig.fan.write().await.set_rpm_avg(0.0);
        rig.controller.calculate_target_pwm().await.unwrap();
        assert_eq!(rig.fan.read().await.min_pwm(), 1);
    }

    #[tokio::test]
    async fn stalled_never_stop_fan_walks_to_max_then_reports_critical() {
        let sim = SimFan::stalled("fan1").never_stop();
        let mut rig = with_identity_map(rig(sim, 128));
        {
            let mut fan = rig.fan.write().await;
            fan.set_min_pwm(250);
            fan.set_max_pwm(253);
        }
        let max = rig.fan.read().await.max_pwm();

        // arm enforcement with a first tick
        let first = rig.controller.calculate_target_pwm().await.unwrap();
        rig.controller.set_pwm(first).await.unwrap();

        let mut previous_target = first;
        loop {
            rig.fan.write().await.set_rpm_avg(0.0);
            let min_before = rig.fan.read().await.min_pwm();
            let target = rig.controller.calculate_target_pwm().await.unwrap();
            if target == -1 {
                break;
            }
            // monotone: each increment raises min_pwm, and the target grows
            // strictly until it reaches the ceiling
            assert_eq!(rig.fan.read().await.min_pwm(), min_before + 1);
            assert!(target > previous_target || target == max);
            previous_target = target;
            rig.controller.set_pwm(target).await.unwrap();
        }
        assert!(rig.hw.pwm_writes().iter().all(|&w| w <= max));
        // a later tick keeps reporting the violation without writing
        rig.fan.write().await.set_rpm_avg(0.0);
        assert_eq!(rig.controller.calculate_target_pwm().await.unwrap(), -1);
    }

    #[tokio::test]
    async fn third_party_change_still_converges() {
        let mut rig = with_identity_map(rig(SimFan::linear("fan1"), 120));

        tokio::time::sleep(Duration::from_millis(5)).await;
        rig.controller.update_fan_speed().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        rig.controller.update_fan_speed().await.unwrap();
        let settled = rig.hw.pwm();
        assert!((119..=120).contains(&settled));

        // someone else grabs the register between ticks
        rig.hw.force_pwm(50);
        tokio::time::sleep(Duration::from_millis(5)).await;
        rig.controller.update_fan_speed().await.unwrap();
        assert_eq!(rig.hw.pwm(), settled);
    }

    #[tokio::test]
    async fn tick_error_propagates_pwm_read_failure() {
        let sim = SimFan::linear("fan1");
        let mut rig = with_identity_map(rig(sim, 128));
        rig.hw.fail_pwm_reads(true);

        assert!(matches!(
            rig.controller.update_fan_speed().await,
            Err(ControlError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn mode_stuck_hardware_is_reported() {
        let sim = SimFan::linear("fan1");
        let fan = shared_handle(sim);
        let result = fan
            .write()
            .await
            .set_control_mode(ControlMode::Manual)
            .await;
        assert!(result.is_ok());

        let sim = SimFan::linear("fan2");
        sim.hw.mode_sticks.store(true, std::sync::atomic::Ordering::SeqCst);
        let fan = shared_handle(sim);
        assert!(matches!(
            fan.write()
                .await
                .set_control_mode(ControlMode::Manual)
                .await,
            Err(ControlError::ModeStuck { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_restores_original_state_once() {
        let sim = SimFan::linear("fan1");
        let hw = sim.hw.clone();
        hw.force_pwm(77);
        let fan = shared_handle(sim);

        let persistence = Arc::new(MemoryPersistence::default());
        seed_persisted_identity(&persistence, "fan1").await;

        let controller = FanController::new(
            fan.clone(),
            Arc::new(ConstantCurve::new("curve", 200)),
            persistence,
            PidLoop::new(1.0, 0.0, 0.0),
            fast_settings(),
        )
        .with_timing(instant_timing());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        // several ticks worth of virtual time
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let writes = hw.pwm_writes();
        assert!(!writes.is_empty());
        // the captured original PWM is written exactly once, at the end
        assert_eq!(writes.iter().filter(|&&w| w == 77).count(), 1);
        assert_eq!(*writes.last().unwrap(), 77);
        // the original auto mode (2) is handed back exactly once
        let mode_restores: Vec<_> = hw.mode_writes().into_iter().filter(|&m| m == 2).collect();
        assert_eq!(mode_restores.len(), 1);
        assert_eq!(*hw.mode.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_error_restores_and_terminates_supervisor() {
        let sim = SimFan::linear("fan1");
        let hw = sim.hw.clone();
        hw.force_pwm(40);
        let fan = shared_handle(sim);

        let persistence = Arc::new(MemoryPersistence::default());
        seed_persisted_identity(&persistence, "fan1").await;

        let controller = FanController::new(
            fan.clone(),
            Arc::new(ConstantCurve::new("curve", 200)),
            persistence,
            PidLoop::new(1.0, 0.0, 0.0),
            fast_settings(),
        )
        .with_timing(instant_timing());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        hw.fail_pwm_reads(true);
        let result = tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());

        // restoration ran: with the register unreadable the original value
        // is still written, once
        hw.fail_pwm_reads(false);
        let writes = hw.pwm_writes();
        assert_eq!(writes.iter().filter(|&&w| w == 40).count(), 1);
        assert_eq!(*writes.last().unwrap(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_before_any_write_skips_restoration() {
        let sim = SimFan::linear("fan1");
        let hw = sim.hw.clone();
        let fan = shared_handle(sim);

        let controller = FanController::new(
            fan,
            Arc::new(ConstantCurve::new("curve", 128)),
            Arc::new(MemoryPersistence::default()),
            PidLoop::new(1.0, 0.0, 0.0),
            fast_settings(),
        )
        .with_timing(instant_timing());

        let cancel = CancellationToken::new();
        cancel.cancel();
        controller.run(cancel).await.unwrap();
        assert!(hw.pwm_writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn first_run_characterizes_and_persists() {
        let sim = SimFan::quantized("fan1");
        let hw = sim.hw.clone();
        let fan = shared_handle(sim);

        let persistence = Arc::new(MemoryPersistence::default());
        let controller = FanController::new(
            fan.clone(),
            Arc::new(ConstantCurve::new("curve", 128)),
            persistence.clone(),
            PidLoop::new(1.0, 0.0, 0.0),
            fast_settings(),
        )
        .with_timing(instant_timing());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(60)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        use crate::persistence::Persistence as _;
        let map = persistence.load_pwm_map("fan1").await.unwrap().unwrap();
        assert_eq!(map.len(), 256);
        let curve = persistence.load_rpm_curve("fan1").await.unwrap().unwrap();
        assert!(!curve.is_empty());
        // boundaries were learned from the measured curve
        let start = fan.read().await.start_pwm();
        assert!(start < MAX_PWM_VALUE);
        assert!(!hw.pwm_writes().is_empty());
    }

    #[tokio::test]
    async fn monitor_sample_updates_average_and_curve() {
        let sim = SimFan::linear("fan1");
        sim.hw.force_pwm(100);
        let fan = shared_handle(sim);

        measure_rpm(&fan, 10).await;
        let fan = fan.read().await;
        assert_eq!(fan.rpm_avg(), 100.0);
        assert_eq!(fan.rpm_curve().get(&100), Some(&1000.0));
    }

    #[tokio::test]
    async fn monitor_sample_skips_on_read_error() {
        let sim = SimFan::linear("fan1");
        let hw = sim.hw.clone();
        hw.fail_pwm_reads(true);
        let fan = shared_handle(sim);

        measure_rpm(&fan, 10).await;
        assert_eq!(fan.read().await.rpm_avg(), 0.0);
        assert!(fan.read().await.rpm_curve().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn file_fan_persists_empty_record_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let pwm_path = dir.path().join("pwm");
        std::fs::write(&pwm_path, "30").unwrap();
        let fan: FanHandle = Arc::new(RwLock::new(Box::new(crate::drivers::FileFan::new(
            crate::fans::FanState::new("aux", "curve", false, None, None),
            &pwm_path,
            None,
        ))));

        let persistence = Arc::new(MemoryPersistence::default());
        let controller = FanController::new(
            fan,
            Arc::new(ConstantCurve::new("curve", 128)),
            persistence.clone(),
            PidLoop::new(1.0, 0.0, 0.0),
            fast_settings(),
        )
        .with_timing(instant_timing());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        use crate::persistence::Persistence as _;
        // non-hwmon fans persist an empty record instead of characterizing
        let curve = persistence.load_rpm_curve("aux").await.unwrap().unwrap();
        assert!(curve.is_empty());
        assert!(persistence.load_pwm_map("aux").await.unwrap().is_some());
    }
}
