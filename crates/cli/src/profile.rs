use anyhow::{anyhow, Result};
use directories::ProjectDirs;
use li_connect_linkedin::store::{KeyValueStore, StorageEvent};
use li_connect_linkedin::StoreError;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

type StoreResult<T> = Result<T, StoreError>;

pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> StoreResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(&self.path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if bytes.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        write_secure_file(&self.path, &json).map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn update<F>(&self, mutate: F) -> StoreResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool,
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
        let mut entries = self.load()?;
        if mutate(&mut entries) {
            self.save(&entries)?;
        }
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.load()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
            true
        })
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.update(|entries| entries.remove(key).is_some())
    }
}

fn write_secure_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

pub struct KeyWatcher {
    store: Arc<dyn KeyValueStore>,
    key: String,
    last: Option<String>,
}

impl KeyWatcher {
    pub fn new(store: Arc<dyn KeyValueStore>, key: &str) -> Self {
        let last = store.get(key).ok().flatten();
        Self {
            store,
            key: key.to_string(),
            last,
        }
    }

    pub fn poll(&mut self) -> Option<StorageEvent> {
        let current = self.store.get(&self.key).ok().flatten();
        if current == self.last {
            return None;
        }
        self.last = current.clone();
        Some(StorageEvent {
            key: self.key.clone(),
            new_value: current,
        })
    }
}

pub struct Profile {
    pub durable: Arc<FileStore>,
    pub session: Arc<FileStore>,
}

impl Profile {
    pub fn default_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "li-connect", "li-connect")
            .ok_or_else(|| anyhow!("Could not determine project directories"))?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }

    pub fn open(dir: &Path, tab: &str) -> Self {
        let tab: String = tab
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        let tab = if tab.is_empty() { "default".to_string() } else { tab };
        Self {
            durable: Arc::new(FileStore::open(dir.join("profile.json"))),
            session: Arc::new(FileStore::open(dir.join("tabs").join(format!("{tab}.json")))),
        }
    }
}
