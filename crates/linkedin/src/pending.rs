use crate::error::StoreResult;
use crate::store::{read_json, write_json, KeyValueStore, PENDING_SELECTION_KEY};
use crate::types::{organization_ids, PendingSelection};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Stored,
    Unchanged,
}

#[derive(Clone)]
pub struct PendingSelectionCache {
    store: Arc<dyn KeyValueStore>,
}

impl PendingSelectionCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn read(&self, now: i64) -> Option<PendingSelection> {
        let pending: PendingSelection = match read_json(self.store.as_ref(), PENDING_SELECTION_KEY) {
            Ok(Some(pending)) => pending,
            Ok(None) => return None,
            Err(e) => {
                debug!("Discarding unreadable pending selection: {e}");
                self.clear();
                return None;
            }
        };

        if pending.is_expired(now) {
            debug!(selection_id = ?pending.selection_id, "Pending selection expired");
            self.clear();
            return None;
        }
        if organization_ids(&pending.organizations).is_empty() {
            self.clear();
            return None;
        }
        Some(pending)
    }

    pub fn write(&self, selection: &PendingSelection, now: i64) -> StoreResult<CacheWrite> {
        if let Some(existing) = self.read(now) {
            if existing.same_prompt(selection) {
                return Ok(CacheWrite::Unchanged);
            }
        }

        let mut entry = selection.clone();
        if entry.timestamp <= 0 || entry.timestamp > now {
            entry.timestamp = now;
        }
        write_json(self.store.as_ref(), PENDING_SELECTION_KEY, &entry)?;
        Ok(CacheWrite::Stored)
    }

    pub fn clear(&self) {
        if let Err(e) = self.store.delete(PENDING_SELECTION_KEY) {
            debug!("Failed to clear pending selection: {e}");
        }
    }
}
