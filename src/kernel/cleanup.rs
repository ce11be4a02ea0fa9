//! Background cleanup for resource management (§4.6).
//!
//! CleanupService ticks on an interval and delegates a full pass to
//! `Kernel::run_cleanup_cycle`, which acquires each subsystem's own lock in
//! turn - no aggregate lock is held across a cleanup cycle, so IPC handlers
//! are never blocked waiting on it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration as TokioDuration};

use crate::kernel::Kernel;

/// Configuration for cleanup behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// How often to run cleanup (default: 5 minutes)
    pub interval_seconds: u64,
    /// How long to keep zombie processes (default: 24 hours)
    pub process_retention_seconds: i64,
    /// How long to keep stale orchestration sessions (default: 1 hour)
    pub session_retention_seconds: i64,
    /// How long to keep resolved interrupts (default: 24 hours)
    pub interrupt_retention_seconds: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            process_retention_seconds: 86400,
            session_retention_seconds: 3600,
            interrupt_retention_seconds: 86400,
        }
    }
}

/// Statistics from a cleanup cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupStats {
    pub zombies_removed: usize,
    pub sessions_removed: usize,
    pub interrupts_removed: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

/// CleanupService handles background garbage collection.
#[derive(Debug)]
pub struct CleanupService {
    kernel: Arc<Kernel>,
    config: CleanupConfig,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl CleanupService {
    pub fn new(kernel: Arc<Kernel>, config: CleanupConfig) -> Self {
        Self {
            kernel,
            config,
            stop_tx: None,
        }
    }

    /// Start the cleanup loop in the background. Returns immediately; a
    /// panicking cycle is caught and logged rather than killing the loop.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let kernel = self.kernel.clone();
        let config = self.config.clone();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(TokioDuration::from_secs(config.interval_seconds));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let kernel = kernel.clone();
                        let cycle_config = config.clone();
                        let result = crate::kernel::with_recovery(
                            move || Ok(kernel.run_cleanup_cycle(&cycle_config)),
                            "cleanup_cycle",
                        );
                        match result {
                            Ok(stats) => tracing::debug!(
                                zombies = stats.zombies_removed,
                                sessions = stats.sessions_removed,
                                interrupts = stats.interrupts_removed,
                                "cleanup_cycle_completed"
                            ),
                            Err(e) => tracing::error!(error = %e, "cleanup_cycle_panicked"),
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("cleanup_service_stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}
