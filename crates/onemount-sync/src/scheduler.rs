//! Adaptive delta scheduling
//!
//! Picks the polling cadence from push-channel health:
//! - healthy push channel: poll every 30 minutes (the push nudges cover
//!   the latency)
//! - degraded or failed channel: poll every 5 minutes
//! - recovery window (just reconnected): poll every 10 seconds for a minute
//! - no push channel: poll every configured interval (default 5 minutes)
//!
//! Push nudges trigger an immediate run; the engine serializes invocations
//! so a nudge during a running invocation waits rather than overlaps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onemount_core::ports::PushHealth;
use onemount_graph::PushChannel;

use crate::engine::SyncEngine;

/// Cadence when the push channel is healthy.
const HEALTHY_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Cadence when the push channel is degraded or failed.
const DEGRADED_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Cadence inside the recovery window.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// Length of the recovery window after regaining connectivity.
const RECOVERY_WINDOW: Duration = Duration::from_secs(60);

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Polling interval when no push channel is configured
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Drives the delta loop on the adaptive cadence.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    push: Option<PushChannel>,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl SyncScheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        push: Option<PushChannel>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            push,
            config,
            cancel,
        }
    }

    /// Runs until cancelled. The first invocation fires immediately.
    pub async fn run(mut self) {
        info!(
            push = self.push.is_some(),
            poll_secs = self.config.poll_interval.as_secs(),
            "delta scheduler started"
        );

        let mut recovery_until: Option<Instant> = None;
        let mut was_offline = false;

        loop {
            match self.engine.run_once().await {
                Ok(outcome) => {
                    if was_offline {
                        recovery_until = Some(Instant::now() + RECOVERY_WINDOW);
                        was_offline = false;
                    }
                    if outcome.replayed > 0 {
                        info!(replayed = outcome.replayed, "offline journal replayed");
                    }
                }
                Err(err) => {
                    was_offline = true;
                    recovery_until = Some(Instant::now() + RECOVERY_WINDOW);
                    debug!(error = %err, "delta invocation failed");
                }
            }

            let interval = self.next_interval(recovery_until);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("delta scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
                nudged = wait_nudge(self.push.as_mut()) => {
                    match nudged {
                        Some(()) => debug!("push nudge, running delta now"),
                        None => {
                            // the transport exited permanently; fall back
                            // to pure polling
                            warn!("push channel ended, polling only");
                            self.push = None;
                        }
                    }
                }
            }
        }
    }

    /// Computes the sleep before the next invocation.
    fn next_interval(&self, recovery_until: Option<Instant>) -> Duration {
        if recovery_until.is_some_and(|until| Instant::now() < until) {
            return RECOVERY_INTERVAL;
        }
        match self.push.as_ref() {
            None => self.config.poll_interval,
            Some(push) => match push.health() {
                PushHealth::Healthy => HEALTHY_INTERVAL,
                PushHealth::Degraded | PushHealth::Failed => DEGRADED_INTERVAL,
                PushHealth::Disabled => self.config.poll_interval,
            },
        }
    }
}

/// Awaits the next nudge, or pends forever when no channel is configured.
async fn wait_nudge(push: Option<&mut PushChannel>) -> Option<()> {
    match push {
        Some(channel) => channel.next_nudge().await,
        None => std::future::pending().await,
    }
}
