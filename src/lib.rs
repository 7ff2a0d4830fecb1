//! # pwmfand
//!
//! A Linux daemon for closed-loop control of PWM cooling fans exposed
//! through the hwmon sysfs interface.
//!
//! ## Features
//!
//! - **Async Architecture**: Built on Tokio, one supervisor per fan
//! - **Characterization**: Learns each fan's real PWM behavior (the
//!   hardware often quantizes or clips requested values) and its
//!   start/min/max boundaries
//! - **Closed-Loop Control**: Speed curve targets smoothed by a PID loop
//! - **Never-Stop Enforcement**: Raises a fan's minimum PWM at runtime
//!   rather than letting it stall
//! - **Safe Shutdown**: Every exit path restores the fan's original PWM
//!   value and control mode
//!
//! ## Architecture
//!
//! - [`FanCoordinator`](coordinator::FanCoordinator) — spawns and manages
//!   one controller task per configured fan
//! - [`FanController`](controller::FanController) — per-fan supervisor:
//!   characterization, RPM monitor and control loop
//! - [`Fan`](fans::Fan) — capability-based handle over one physical fan,
//!   with hwmon and plain-file backends in [`drivers`]
//! - [`Persistence`](persistence::Persistence) — stores learned PWM maps
//!   and RPM curves between runs
//!
//! ## Example
//!
//! ```no_run
//! use pwmfand::{application::Application, config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::load(None)?;
//!     Application::new(config).run().await
//! }
//! ```

pub mod application;
pub mod characterization;
pub mod cli;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod curve;
pub mod drivers;
pub mod error;
pub mod fans;
pub mod persistence;
pub mod pid;
pub mod sensors;
pub mod task_manager;
pub mod temperature_sensors;
pub mod util;
