//! In-process backend. Holds committed records in memory and can inject
//! write conflicts and outages so retry behavior is testable without SQLite.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{BackendError, PatternBackend};
use crate::record::PatternRecord;

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<PatternRecord>,
    conflicts_remaining: u32,
    unavailable: bool,
    commit_attempts: u32,
    compactions: u32,
    dimension: Option<usize>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

/// Shared view of a `MemoryBackend` after it has been boxed into a store.
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    // A poisoned lock only means a test thread panicked mid-update.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-populated with already committed records.
    pub fn with_records(records: Vec<PatternRecord>) -> Self {
        let backend = Self::default();
        lock(&backend.state).records = records;
        backend
    }

    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle { state: Arc::clone(&self.state) }
    }
}

impl MemoryHandle {
    /// Fail the next `n` commits with a write conflict.
    pub fn inject_conflicts(&self, n: u32) {
        lock(&self.state).conflicts_remaining = n;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn commit_attempts(&self) -> u32 {
        lock(&self.state).commit_attempts
    }

    pub fn committed_len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn compactions(&self) -> u32 {
        lock(&self.state).compactions
    }

    pub fn dimension(&self) -> Option<usize> {
        lock(&self.state).dimension
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl PatternBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&mut self, dimension: usize) -> Result<(), BackendError> {
        let mut st = lock(&self.state);
        if st.unavailable {
            return Err(BackendError::Unavailable("memory backend offline".into()));
        }
        st.dimension = Some(dimension);
        st.closed = false;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PatternRecord>, BackendError> {
        Ok(lock(&self.state).records.clone())
    }

    fn commit(&mut self, batch: &[PatternRecord]) -> Result<(), BackendError> {
        let mut st = lock(&self.state);
        st.commit_attempts += 1;
        if st.unavailable {
            return Err(BackendError::Unavailable("memory backend offline".into()));
        }
        if st.conflicts_remaining > 0 {
            st.conflicts_remaining -= 1;
            return Err(BackendError::Conflict("injected write conflict".into()));
        }
        st.records.extend_from_slice(batch);
        Ok(())
    }

    fn compact(&mut self) -> Result<(), BackendError> {
        lock(&self.state).compactions += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        lock(&self.state).closed = true;
        Ok(())
    }
}
