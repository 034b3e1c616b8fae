use crate::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub const OAUTH_RESULT_KEY: &str = "linkedin_oauth_result";
pub const PENDING_SELECTION_KEY: &str = "linkedin_pending_selection";
pub const SELECTED_ACCOUNT_KEY: &str = "linkedin_selected_account";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    fn delete(&self, key: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
}

pub fn read_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn write_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> StoreResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn entries(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("storage disabled".to_string()));
        }
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("storage lock poisoned".to_string()))
    }

    fn notify(&self, key: &str, new_value: Option<String>) {
        // No receivers is fine: nobody is listening in other tabs.
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            new_value,
        });
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        self.notify(key, Some(value.to_string()));
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let removed = self.entries()?.remove(key);
        if removed.is_some() {
            self.notify(key, None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let store = MemoryStore::new();
        store.set("k", "v").expect("set");
        assert_eq!(store.get("k").expect("get").as_deref(), Some("v"));
        store.delete("k").expect("delete");
        assert_eq!(store.get("k").expect("get"), None);
    }

    #[test]
    fn writes_are_broadcast_to_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.set(OAUTH_RESULT_KEY, "{}").expect("set");
        store.delete(OAUTH_RESULT_KEY).expect("delete");

        let first = rx.try_recv().expect("set event");
        assert_eq!(first.key, OAUTH_RESULT_KEY);
        assert_eq!(first.new_value.as_deref(), Some("{}"));
        let second = rx.try_recv().expect("delete event");
        assert_eq!(second.new_value, None);
    }

    #[test]
    fn unavailable_store_reports_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get("k"), Err(StoreError::Unavailable(_))));
        assert!(store.set("k", "v").is_err());
    }

    #[test]
    fn json_helpers_surface_malformed_payloads() {
        let store = MemoryStore::new();
        store.set("k", "{not json").expect("set");
        let parsed: StoreResult<Option<serde_json::Value>> = read_json(&store, "k");
        assert!(matches!(parsed, Err(StoreError::Serialization(_))));
    }
}
