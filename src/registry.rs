//! Address registry: this worker's copy of the cluster address map
//!
//! Populated once per cluster session by the orchestrator's `listen` step.
//! A later session may overwrite it wholesale; entries are never patched
//! individually.

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::net::{AddressMap, WorkerAddress};

// ─────────────────────────────────────────────────────────────────
// Address Registry
// ─────────────────────────────────────────────────────────────────

/// Thread-safe holder of the cluster address map
#[derive(Debug, Default)]
pub struct AddressRegistry {
    inner: RwLock<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    map: Option<AddressMap>,
    generation: u64,
}

impl AddressRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the address map, returning the new generation number
    pub fn set(&self, map: AddressMap) -> u64 {
        let mut state = self.inner.write();
        state.generation += 1;
        debug!(
            entries = map.len(),
            generation = state.generation,
            "Address registry updated"
        );
        state.map = Some(map);
        state.generation
    }

    /// Clone of the current address map, if one has been set
    pub fn snapshot(&self) -> Option<AddressMap> {
        self.inner.read().map.clone()
    }

    /// Look up the address of `worker_id`
    pub fn resolve(&self, worker_id: &str) -> Result<WorkerAddress> {
        let state = self.inner.read();
        let map = state.map.as_ref().ok_or(Error::AddressesNotSet)?;
        map.get(worker_id).copied().ok_or_else(|| Error::UnknownWorker {
            worker_id: worker_id.to_string(),
        })
    }

    /// Number of entries (0 when unset)
    pub fn len(&self) -> usize {
        self.inner.read().map.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a map has been distributed to this worker
    pub fn is_set(&self) -> bool {
        self.inner.read().map.is_some()
    }

    /// How many times the map has been set
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Drop the current map
    pub fn clear(&self) {
        self.inner.write().map = None;
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
