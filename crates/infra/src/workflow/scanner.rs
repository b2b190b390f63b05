use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::engine::{ResumeOutcome, WorkflowEngine, WorkflowError};

#[derive(Debug, Clone)]
pub struct WakeScannerConfig {
    /// Time between scans
    pub interval: Duration,
    /// Maximum instances resumed per scan
    pub batch: usize,
}

impl Default for WakeScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch: 100,
        }
    }
}

/// Handle to stop a spawned scanner.
#[derive(Debug)]
pub struct WakeScannerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WakeScannerHandle {
    /// Request shutdown and wait for the current scan to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "wake scanner ended abnormally");
        }
    }
}

/// Polls the workflow store for due instances and resumes them.
///
/// Several scanners may run against one store: an instance is only driven by
/// whoever wins its lease, the others see [`ResumeOutcome::Skipped`].
#[derive(Clone)]
pub struct WakeScanner {
    engine: WorkflowEngine,
    config: WakeScannerConfig,
}

impl WakeScanner {
    pub fn new(engine: WorkflowEngine, config: WakeScannerConfig) -> Self {
        Self { engine, config }
    }

    /// Resume every instance due at `now`, up to one batch. Returns how many
    /// instances actually ran.
    ///
    /// A failure on one instance is logged and does not stop the batch.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<usize, WorkflowError> {
        let due = self.engine.store().due_for_wake(now, self.config.batch).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "resuming due workflow instances");

        let mut resumed = 0;
        for id in due {
            match self.engine.resume(id, now).await {
                Ok(ResumeOutcome::Skipped) => {}
                Ok(_) => resumed += 1,
                Err(e) => error!(instance_id = %id, error = %e, "failed to resume workflow instance"),
            }
        }
        Ok(resumed)
    }

    pub fn spawn(self) -> WakeScannerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch = self.config.batch,
            "wake scanner started"
        );
        let join = tokio::spawn(scan_loop(self, shutdown_rx));

        WakeScannerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

async fn scan_loop(scanner: WakeScanner, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(scanner.config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if let Err(e) = scanner.scan_once(Utc::now()).await {
                    error!(error = %e, "wake scan failed");
                }
            }
        }
    }

    debug!("wake scanner stopped");
}
