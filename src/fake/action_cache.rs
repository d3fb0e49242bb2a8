use crate::digest::Digest;
use crate::remote_exec::ActionResult;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct AcState {
    results: HashMap<Digest, ActionResult>,
    reads: usize,
    writes: usize,
}

/// In-memory action cache; last write wins.
#[derive(Debug, Default)]
pub struct FakeActionCache {
    state: Mutex<AcState>,
}

impl FakeActionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        *self.state.lock() = AcState::default();
    }

    pub fn get(&self, action_digest: &Digest) -> Option<ActionResult> {
        let mut state = self.state.lock();
        state.reads += 1;
        state.results.get(action_digest).cloned()
    }

    pub fn put(&self, action_digest: Digest, result: ActionResult) {
        let mut state = self.state.lock();
        state.writes += 1;
        state.results.insert(action_digest, result);
    }

    /// Store a result as test setup, without counting a client write.
    pub fn seed(&self, action_digest: Digest, result: ActionResult) {
        self.state.lock().results.insert(action_digest, result);
    }

    /// Peek without counting a read.
    pub fn contains(&self, action_digest: &Digest) -> bool {
        self.state.lock().results.contains_key(action_digest)
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }
}
