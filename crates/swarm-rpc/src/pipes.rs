//! Correlation pipes: per-key queues connecting wire arrivals to the
//! task waiting for them.
//!
//! A pipe comes into existence on whichever side shows up first, the
//! pushing read loop or the waiting invoker. Receivers are
//! single-consumer; taking the same key twice is an error. Entries
//! nobody drains (a peer died mid-stream, a reply after its waiter
//! timed out) are reclaimed by a periodic sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use swarm_wire::EventField;

use crate::{Result, RpcError};

#[derive(Debug, Clone)]
pub struct PipeTableConfig {
    /// Entries untouched for this long are dropped by the sweep.
    pub expire_after: Duration,
    /// How often the sweep task runs.
    pub sweep_interval: Duration,
}

impl Default for PipeTableConfig {
    fn default() -> Self {
        Self {
            expire_after: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct PipeEntry {
    tx: mpsc::UnboundedSender<EventField>,
    /// Present until some task takes the receiving end.
    rx: Option<mpsc::UnboundedReceiver<EventField>>,
    last_touch: Instant,
}

impl PipeEntry {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            last_touch: Instant::now(),
        }
    }
}

#[derive(Clone)]
pub struct PipeTable {
    inner: Arc<Mutex<HashMap<String, PipeEntry>>>,
    config: PipeTableConfig,
}

impl PipeTable {
    pub fn new(config: PipeTableConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Deliver one field message under its correlation key, creating the
    /// pipe if no waiter registered yet.
    pub fn push(&self, key: &str, msg: EventField) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(key.to_owned()).or_insert_with(PipeEntry::new);
        entry.last_touch = Instant::now();
        // Send only fails when the receiver was taken and then dropped;
        // the entry is stale either way and the sweep will reclaim it.
        let _ = entry.tx.send(msg);
    }

    /// Claim the receiving end of a pipe, creating it if nothing has
    /// been pushed yet.
    pub fn take(&self, key: &str) -> Result<mpsc::UnboundedReceiver<EventField>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(key.to_owned()).or_insert_with(PipeEntry::new);
        entry.last_touch = Instant::now();
        entry
            .rx
            .take()
            .ok_or_else(|| RpcError::PipeUnavailable(key.to_owned()))
    }

    /// Drop a pipe outright (waiter gave up).
    pub fn remove(&self, key: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
    }

    pub fn len(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries idle past the configured expiry. Returns how many
    /// were reclaimed.
    pub fn sweep(&self) -> usize {
        let expire_after = self.config.expire_after;
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, entry| entry.last_touch.elapsed() < expire_after);
        before - map.len()
    }

    /// Spawn the background sweep. The task exits when the table's last
    /// clone is dropped.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let config = self.config.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let table = PipeTable {
                    inner,
                    config: config.clone(),
                };
                let dropped = table.sweep();
                if dropped > 0 {
                    tracing::debug!(dropped, "expired idle correlation pipes");
                }
            }
        })
    }
}
