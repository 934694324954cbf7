//! Background sweep for the short-term memory window.
//!
//! Expired records are dropped on a fixed schedule so long-running
//! deployments do not accumulate stale context. The loop is torn down
//! explicitly on kernel shutdown.

use crate::memory::MemoryEngine;
use std::sync::Arc;
use tokio::time::interval;

/// Periodic short-term expiry sweep.
#[derive(Debug)]
pub struct MemoryCleanup {
    memory: Arc<MemoryEngine>,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MemoryCleanup {
    pub fn new(memory: Arc<MemoryEngine>) -> Self {
        Self {
            memory,
            stop_tx: None,
        }
    }

    /// Start the sweep loop in the background.
    /// Returns immediately; sweeping runs in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let memory = Arc::clone(&self.memory);
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        let period = memory.config().cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = memory.cleanup_expired();
                        if expired > 0 {
                            tracing::debug!("memory_sweep_completed: expired={}", expired);
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("memory_sweep_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the sweep loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}
