//! Adapters to the external audit log. Every request state transition is
//! appended here; records are never updated or deleted.

pub mod rocksdb_store;

pub use rocksdb_store::*;

use crate::{transition_key, transition_prefix, Result, StateTransition};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

#[async_trait]
pub trait StateRecorder: Send + Sync {
    async fn record(&self, transition: StateTransition) -> Result<()>;

    /// Transitions recorded for one request, oldest first.
    async fn history(&self, request_id: &str) -> Result<Vec<StateTransition>>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Record a transition, logging instead of failing: a broken audit sink must
/// not stall admission or promotion.
pub async fn record_transition(recorder: &dyn StateRecorder, transition: StateTransition) {
    let request_id = transition.request_id.clone();
    let status = transition.status;
    match recorder.record(transition).await {
        Ok(()) => debug!(request_id = %request_id, ?status, "Recorded transition"),
        Err(e) => error!(request_id = %request_id, ?status, "Failed to record transition: {}", e),
    }
}

/// Append-only transition log in RocksDB, keyed `request_id#micros#seq`.
pub struct RocksDbRecorder {
    store: Arc<RocksDBStore>,
    sequence: AtomicU64,
}

impl RocksDbRecorder {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        let store = RocksDBStore::new(path)?;
        Ok(Self {
            store: Arc::new(store),
            sequence: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl StateRecorder for RocksDbRecorder {
    async fn record(&self, transition: StateTransition) -> Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let key = transition_key(
            &transition.request_id,
            transition.timestamp.timestamp_micros(),
            sequence,
        );
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.put(&key, &transition))
            .await
            .map_err(|e| crate::TicketQueueError::ChannelClosed(e.to_string()))?
    }

    async fn history(&self, request_id: &str) -> Result<Vec<StateTransition>> {
        self.store.scan_prefix(&transition_prefix(request_id))
    }

    async fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}

/// In-process transition log for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryRecorder {
    transitions: Mutex<Vec<StateTransition>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StateRecorder for MemoryRecorder {
    async fn record(&self, transition: StateTransition) -> Result<()> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transition);
        Ok(())
    }

    async fn history(&self, request_id: &str) -> Result<Vec<StateTransition>> {
        Ok(self
            .transitions()
            .into_iter()
            .filter(|t| t.request_id == request_id)
            .collect())
    }
}
