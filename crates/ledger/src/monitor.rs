//! Ledger change feed.
//!
//! A background thread polls the ledger for rows past the last seen id and
//! publishes each one on a broadcast bus. The 500 ms interval bounds how
//! stale the orchestrator's view of agent activity can be.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::tracker::ToolCallTracker;
use crate::types::ToolCallRow;

/// Poll interval for the change feed.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Broadcast channel capacity; slow subscribers lag rather than block.
const BUS_CAPACITY: usize = 256;

/// One new ledger row, keyed by the agent that produced it.
#[derive(Debug, Clone)]
pub struct ToolCallEvent {
    pub agent_id: String,
    pub call: ToolCallRow,
}

/// Background poller publishing new ledger rows.
pub struct LedgerMonitor {
    tx: broadcast::Sender<ToolCallEvent>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LedgerMonitor {
    /// Start polling `tracker` from row id `last_seen` (0 for everything).
    pub fn start(tracker: Arc<ToolCallTracker>, last_seen: i64) -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));

        let thread_tx = tx.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::spawn(move || {
            let mut last_seen = last_seen;
            tracing::debug!(last_seen, "ledger monitor started");
            while !thread_stop.load(Ordering::Relaxed) {
                match tracker.rows_after(last_seen) {
                    Ok(rows) => {
                        for row in rows {
                            last_seen = last_seen.max(row.id);
                            let event = ToolCallEvent {
                                agent_id: row.agent_id.clone(),
                                call: row,
                            };
                            // No subscribers is fine; events are advisory.
                            let _ = thread_tx.send(event);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ledger monitor poll failed");
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            tracing::debug!(last_seen, "ledger monitor stopped");
        });

        Self {
            tx,
            stop,
            handle: Some(handle),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToolCallEvent> {
        self.tx.subscribe()
    }

    /// Stop the poller and join its thread. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LedgerMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
