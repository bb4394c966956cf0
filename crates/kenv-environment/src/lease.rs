//! Per-environment exclusion for lifecycle workflows

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use kenv_common::Error;

/// Environment ids that currently have a workflow in flight
#[derive(Clone, Debug, Default)]
pub struct LeaseTable {
    held: Arc<DashMap<String, ()>>,
}

impl LeaseTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `id`, or `Error::Conflict` if another workflow has it
    pub fn try_acquire(&self, id: &str) -> Result<WorkflowLease, Error> {
        match self.held.entry(id.to_string()) {
            Entry::Occupied(_) => Err(Error::conflict(
                id,
                "another lifecycle workflow is in progress",
            )),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(WorkflowLease {
                    id: id.to_string(),
                    held: self.held.clone(),
                })
            }
        }
    }

    /// True while a lease for `id` is alive
    pub fn is_held(&self, id: &str) -> bool {
        self.held.contains_key(id)
    }
}

/// Released when dropped, whether the workflow finished, failed or panicked
#[derive(Debug)]
pub struct WorkflowLease {
    id: String,
    held: Arc<DashMap<String, ()>>,
}

impl WorkflowLease {
    /// Environment this lease covers
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for WorkflowLease {
    fn drop(&mut self) {
        self.held.remove(&self.id);
    }
}
