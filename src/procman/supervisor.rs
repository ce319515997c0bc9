//! Background liveness and idle-timeout supervision.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ProcessManager;

/// Supervisor timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Time between liveness polls.
    pub interval: Duration,
    /// Reclaim kernels with no session for this long. `None` disables it.
    pub idle_timeout: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            idle_timeout: None,
        }
    }
}

/// Spawn the task that reaps dead kernels and reclaims idle ones.
///
/// Runs every `config.interval` until `cancel` fires. Crashed kernels are
/// evicted and announced through the manager's event channel; nothing is
/// restarted here.
#[must_use]
pub fn spawn_supervisor(
    manager: Arc<ProcessManager>,
    config: SupervisorConfig,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("kernel supervisor shutting down");
                    break;
                }
                () = tokio::time::sleep(config.interval) => {}
            }

            supervise_once(&manager, config).await;
        }
    })
}

/// One supervision pass.
pub async fn supervise_once(manager: &ProcessManager, config: SupervisorConfig) {
    let dead = manager.check_liveness().await;
    if !dead.is_empty() {
        debug!(count = dead.len(), "reaped dead kernels");
    }

    if let Some(timeout) = config.idle_timeout {
        let reclaimed = manager.reclaim_idle(timeout).await;
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed idle kernels");
        }
    }
}
