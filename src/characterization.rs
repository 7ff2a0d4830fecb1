//! One-shot fan characterization.
//!
//! Discovers how a fan's PWM register really behaves: the requested-to-
//! observed PWM map (hardware often quantizes or clips), the representatives
//! of each quantization plateau, and the measured RPM curve from which the
//! start/min/max boundaries are derived.

use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{ControlError, Result};
use crate::fans::{try_set_manual_mode, Fan, MAX_PWM_VALUE, MIN_PWM_VALUE};
use crate::util::RollingWindow;

/// Window size for the settling detector.
const SETTLE_WINDOW_SIZE: usize = 10;

/// Wait intervals used while characterizing.
///
/// Defaults are the production values; tests compress them to keep the
/// 256-probe sweep fast.
#[derive(Debug, Clone)]
pub struct CharacterizationTiming {
    /// Settle time after each PWM map probe.
    pub probe_delay: Duration,
    /// Poll interval of the settling detector.
    pub settle_poll: Duration,
    /// Wait before sampling RPM at each curve point; chosen to exceed
    /// typical RPM sensor update periods.
    pub sample_delay: Duration,
}

impl Default for CharacterizationTiming {
    fn default() -> Self {
        Self {
            probe_delay: Duration::from_millis(10),
            settle_poll: Duration::from_secs(1),
            sample_delay: Duration::from_secs(2),
        }
    }
}

pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ControlError::Cancelled);
    }
    tokio::select! {
        () = cancel.cancelled() => Err(ControlError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Probes every requested PWM value from 255 down to 0 and records what the
/// hardware reports back, yielding a total map over the full range.
///
/// Readback failures are logged and the requested value is recorded for
/// that probe. After the sweep the fan is left at the observed value for
/// its start PWM so it ends up in a defined state.
pub async fn compute_pwm_map(
    fan: &RwLock<Box<dyn Fan>>,
    cancel: &CancellationToken,
    timing: &CharacterizationTiming,
) -> Result<BTreeMap<i32, i32>> {
    {
        let mut fan = fan.write().await;
        let _ = try_set_manual_mode(fan.as_mut()).await;
    }

    let mut map = BTreeMap::new();
    for requested in (MIN_PWM_VALUE..=MAX_PWM_VALUE).rev() {
        {
            let mut fan = fan.write().await;
            if let Err(e) = fan.set_pwm(requested).await {
                warn!("Error writing PWM value {requested} to fan {}: {e}", fan.id());
            }
        }
        sleep_or_cancel(timing.probe_delay, cancel).await?;

        let mut fan = fan.write().await;
        let observed = match fan.get_pwm().await {
            Ok(value) => value,
            Err(e) => {
                warn!("Error reading PWM value of fan {}: {e}", fan.id());
                requested
            }
        };
        map.insert(requested, observed);
    }

    let mut fan = fan.write().await;
    let resting = map[&fan.start_pwm()];
    if let Err(e) = fan.set_pwm(resting).await {
        warn!("Error restoring fan {} to PWM {resting}: {e}", fan.id());
    }

    Ok(map)
}

/// Returns the sorted representatives of each observed-PWM plateau: every
/// key whose observed value differs from the previously kept key's.
pub fn distinct_pwm_values(map: &BTreeMap<i32, i32>) -> Vec<i32> {
    let mut keys = Vec::new();
    let mut last_output = None;
    for (&input, &output) in map {
        if last_output != Some(output) {
            last_output = Some(output);
            keys.push(input);
        }
    }
    keys
}

/// Derives (start, max) PWM boundaries from a measured RPM curve.
///
/// Start is the smallest PWM at which the fan actually spins; max is the
/// last PWM at which RPM still rose. A curve without any rotation yields
/// (MAX, MAX) so the caller's never-stop check can flag the fan.
pub fn pwm_boundaries(curve: &BTreeMap<i32, f64>) -> (i32, i32) {
    let mut start = MAX_PWM_VALUE;
    let mut max = MAX_PWM_VALUE;
    let mut start_found = false;
    let mut highest_rpm = 0.0;

    for (&pwm, &rpm) in curve {
        if !start_found && rpm > 0.0 {
            start = pwm;
            start_found = true;
        }
        if rpm > highest_rpm {
            highest_rpm = rpm;
            max = pwm;
        }
    }
    (start, max)
}

/// Measures RPM at each distinct PWM plateau representative.
///
/// Representatives whose readback differs from the requested value belong
/// to a neighboring plateau and are skipped. The first accepted point waits
/// for the fan to settle from whatever state characterization left it in;
/// later points use the fixed sample delay.
pub async fn measure_rpm_curve(
    fan: &RwLock<Box<dyn Fan>>,
    pwm_map: &BTreeMap<i32, i32>,
    distinct: &[i32],
    settle_threshold: f64,
    cancel: &CancellationToken,
    timing: &CharacterizationTiming,
) -> Result<BTreeMap<i32, f64>> {
    {
        let mut fan = fan.write().await;
        if try_set_manual_mode(fan.as_mut()).await.is_err() {
            warn!(
                "Could not enable manual fan mode on {}, trying to continue anyway...",
                fan.id()
            );
        }
    }

    let mut curve = BTreeMap::new();
    let mut initial_measurement = true;

    for &requested in distinct {
        let observed = {
            let mut fan = fan.write().await;
            // skip the write when the map says the register already holds
            // this plateau's value
            let current = fan.get_pwm().await.ok();
            if current != Some(pwm_map[&requested]) {
                fan.set_pwm(requested).await?;
            }
            fan.get_pwm().await?
        };

        if observed != requested {
            debug!(
                "Skipping curve point {requested}: readback {observed} belongs to another plateau"
            );
            continue;
        }

        if initial_measurement {
            initial_measurement = false;
            wait_for_fan_to_settle(fan, settle_threshold, cancel, timing).await?;
        } else {
            sleep_or_cancel(timing.sample_delay, cancel).await?;
        }

        let mut fan = fan.write().await;
        let rpm = fan.get_rpm().await?;
        debug!("Measured RPM {rpm} at PWM {requested} for fan {}", fan.id());
        fan.set_rpm_avg(f64::from(rpm));
        curve.insert(requested, f64::from(rpm));
    }

    Ok(curve)
}

/// Blocks until successive RPM readings stop fluctuating.
///
/// A rolling window of |ΔRPM| values is prefilled with twice the threshold
/// so the loop always takes at least one sample; the fan counts as settled
/// once the window maximum falls strictly below the threshold.
pub async fn wait_for_fan_to_settle(
    fan: &RwLock<Box<dyn Fan>>,
    threshold: f64,
    cancel: &CancellationToken,
    timing: &CharacterizationTiming,
) -> Result<()> {
    let mut window = RollingWindow::filled(SETTLE_WINDOW_SIZE, 2.0 * threshold);
    let mut max_diff = 2.0 * threshold;
    let mut previous_rpm = 0;

    while max_diff >= threshold {
        debug!("Waiting for fan to settle (current RPM max diff: {max_diff})");
        sleep_or_cancel(timing.settle_poll, cancel).await?;

        let mut fan = fan.write().await;
        let rpm = match fan.get_rpm().await {
            Ok(rpm) => rpm,
            Err(e) => {
                warn!("Cannot read RPM value of fan {}: {e}", fan.id());
                continue;
            }
        };
        window.append(f64::from((rpm - previous_rpm).abs()));
        previous_rpm = rpm;
        max_diff = window.max().ceil();
    }
    debug!("Fan has settled (current RPM max diff: {max_diff})");
    Ok(())
}
