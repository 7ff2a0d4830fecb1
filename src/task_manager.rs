//! Lifecycle management for the per-fan supervisor tasks.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for a supervisor to restore its fan and return.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Tracks one long-lived task per controlled fan.
///
/// Each task receives a child of the global cancellation token; cancelling
/// the global token asks every supervisor to restore its hardware and
/// return. Shutdown waits for all of them, bounded by [`SHUTDOWN_TIMEOUT`].
pub struct TaskManager {
    tasks: HashMap<String, JoinHandle<Result<()>>>,
    global_token: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            global_token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.global_token.clone()
    }

    /// Spawns and registers a task under the given name.
    pub fn spawn_task<F, Fut>(&mut self, name: String, task_fn: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let token = self.global_token.child_token();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!("Starting task: {task_name}");
            match task_fn(token).await {
                Ok(()) => {
                    info!("Task '{task_name}' completed");
                    Ok(())
                }
                Err(e) => {
                    error!("Task '{task_name}' failed: {e:#}");
                    Err(e)
                }
            }
        });

        self.tasks.insert(name, handle);
    }

    /// Cancels every task and waits for them to return.
    ///
    /// Returns the first error encountered, if any.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());
        self.global_token.cancel();

        let mut first_error = None;
        for (name, handle) in self.tasks.drain() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    warn!("Task '{name}' failed during shutdown: {e:#}");
                    first_error.get_or_insert(e);
                }
                Ok(Err(e)) => {
                    error!("Task '{name}' panicked: {e}");
                    first_error.get_or_insert(anyhow::anyhow!("task '{name}' panicked: {e}"));
                }
                Err(_) => {
                    error!("Task '{name}' exceeded the shutdown timeout");
                    first_error
                        .get_or_insert(anyhow::anyhow!("task '{name}' shutdown timeout exceeded"));
                }
            }
        }

        match first_error {
            Some(error) => Err(error).context("One or more tasks failed during shutdown"),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
