//! Persistence collaborator.
//!
//! The core does not persist tasks itself; it asks a [`TaskStore`] for
//! everything it should reinstate during recovery and tells it to erase
//! its state on purge. What the store does underneath is its business.

use std::collections::HashMap;
use std::sync::Mutex;

use kiln_common::error::Result;
use kiln_common::protocol::TaskRecord;

pub trait TaskStore: Send + Sync {
    /// Every stored task descriptor, keyed by task id.
    fn all(&self) -> Result<HashMap<String, TaskRecord>>;

    /// Erases all stored state.
    fn purge(&self) -> Result<()>;
}

/// A store with nothing in it.
pub struct NullStore;

impl TaskStore for NullStore {
    fn all(&self) -> Result<HashMap<String, TaskRecord>> {
        Ok(HashMap::new())
    }

    fn purge(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory store for tests and embedders.
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, record: TaskRecord) {
        self.tasks
            .lock()
            .expect("task store mutex poisoned")
            .insert(id.into(), record);
    }
}

impl TaskStore for MemoryStore {
    fn all(&self) -> Result<HashMap<String, TaskRecord>> {
        Ok(self
            .tasks
            .lock()
            .expect("task store mutex poisoned")
            .clone())
    }

    fn purge(&self) -> Result<()> {
        self.tasks
            .lock()
            .expect("task store mutex poisoned")
            .clear();
        Ok(())
    }
}
