//! Application entry point tying configuration to the coordinator.

use anyhow::Result;

use crate::{config::Config, coordinator::FanCoordinator};

/// Orchestrates the daemon lifecycle: start every fan controller, wait for
/// shutdown, restore all fans.
///
/// # Example
///
/// ```no_run
/// use pwmfand::application::Application;
/// use pwmfand::config;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = config::load(None)?;
/// Application::new(config).run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Application {
    coordinator: FanCoordinator,
}

impl Application {
    pub fn new(config: Config) -> Self {
        Self {
            coordinator: FanCoordinator::new(config),
        }
    }

    /// Runs the daemon until a shutdown signal arrives.
    pub async fn run(&mut self) -> Result<()> {
        self.coordinator.start_controllers()?;
        self.coordinator.run_main_loop().await
    }
}
