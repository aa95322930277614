//! Settings persistence.
//!
//! Settings live in a key-value store split into storage areas, with a
//! change stream reporting which keys changed. [`MemoryStore`] keeps
//! everything in-process; [`FileStore`] keeps a JSON document on disk and
//! watches it with `notify` so that edits made by other processes are
//! reported too.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// A partial settings record: storage key to stored value.
pub type Record = Map<String, Value>;

pub const PROXY_PROFILES: &str = "proxyProfiles";
pub const HOST_MAPPINGS: &str = "hostMappings";
pub const DEFAULT_PROFILE_ID: &str = "defaultProfileId";
pub const WHITELIST_HOSTS: &str = "whitelistHosts";
pub const GLOBAL_PROXY_ENABLED: &str = "globalProxyEnabled";
pub const MASTER_PROXY_ENABLED: &str = "masterProxyEnabled";

/// Every key the router reads.
pub const SETTINGS_KEYS: [&str; 6] = [
    PROXY_PROFILES,
    HOST_MAPPINGS,
    DEFAULT_PROFILE_ID,
    WHITELIST_HOSTS,
    GLOBAL_PROXY_ENABLED,
    MASTER_PROXY_ENABLED,
];

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Storage area holding a copy of the settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    /// The area the router reads from.
    #[default]
    Local,
    /// Backup copy shared between installations.
    Sync,
}

impl fmt::Display for StorageArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageArea::Local => f.write_str("local"),
            StorageArea::Sync => f.write_str("sync"),
        }
    }
}

/// Notification that keys changed in one storage area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub area: StorageArea,
    pub keys: Vec<String>,
}

impl StorageChange {
    /// Whether any of the changed keys is a settings key.
    pub fn touches_settings(&self) -> bool {
        self.keys.iter().any(|key| SETTINGS_KEYS.contains(&key.as_str()))
    }
}

/// Asynchronous key-value settings storage with change notification.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Reads the requested keys; absent keys are simply missing from the
    /// returned record.
    async fn get(&self, area: StorageArea, keys: &[&str]) -> Result<Record>;

    /// Merges `values` into the area and notifies subscribers of the keys
    /// whose value changed.
    async fn set(&self, area: StorageArea, values: Record) -> Result<()>;

    /// Subscribes to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// Both storage areas, as persisted by [`FileStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub local: Record,
    #[serde(default)]
    pub sync: Record,
}

impl StoreDocument {
    pub fn area(&self, area: StorageArea) -> &Record {
        match area {
            StorageArea::Local => &self.local,
            StorageArea::Sync => &self.sync,
        }
    }

    pub fn area_mut(&mut self, area: StorageArea) -> &mut Record {
        match area {
            StorageArea::Local => &mut self.local,
            StorageArea::Sync => &mut self.sync,
        }
    }

    /// Parses a settings document. An empty file is an error: it is what a
    /// reader sees in the middle of a truncate-then-write.
    fn parse(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Err(ProxyError::storage("Settings file is empty"));
        }
        serde_json::from_str(contents)
            .map_err(|e| ProxyError::storage(format!("Malformed settings file: {}", e)))
    }
}

/// Copies the requested keys out of a record.
fn select(record: &Record, keys: &[&str]) -> Record {
    keys.iter()
        .filter_map(|key| record.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect()
}

/// Merges `values` into `record`, returning the keys whose value changed.
fn merge(record: &mut Record, values: Record) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, value) in values {
        if record.get(&key) != Some(&value) {
            changed.push(key.clone());
            record.insert(key, value);
        }
    }
    changed
}

/// Keys that differ between two versions of a record.
fn diff(before: &Record, after: &Record) -> Vec<String> {
    let mut keys: Vec<String> = after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    keys.extend(
        before
            .keys()
            .filter(|key| !after.contains_key(*key))
            .cloned(),
    );
    keys
}

/// In-process settings store.
pub struct MemoryStore {
    document: RwLock<StoreDocument>,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_document(StoreDocument::default())
    }

    /// Creates a store pre-populated with `document`.
    pub fn with_document(document: StoreDocument) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            document: RwLock::new(document),
            changes,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, area: StorageArea, keys: &[&str]) -> Result<Record> {
        let document = self.document.read().await;
        Ok(select(document.area(area), keys))
    }

    async fn set(&self, area: StorageArea, values: Record) -> Result<()> {
        let keys = {
            let mut document = self.document.write().await;
            merge(document.area_mut(area), values)
        };

        if !keys.is_empty() {
            let _ = self.changes.send(StorageChange { area, keys });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

/// Settings store backed by a JSON file.
///
/// The file holds a [`StoreDocument`]. A missing file reads as empty
/// settings; an empty or malformed one is a storage error.
#[derive(Clone)]
pub struct FileStore {
    path: PathBuf,

    /// Document as of the last write or watcher reload, used to work out
    /// which keys an external edit changed.
    last_seen: Arc<Mutex<StoreDocument>>,

    /// Serializes read-modify-write cycles.
    write_lock: Arc<tokio::sync::Mutex<()>>,

    changes: broadcast::Sender<StorageChange>,
}

impl FileStore {
    /// Opens the store, reading the current document if the file exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let document = read_document_blocking(&path)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self {
            path,
            last_seen: Arc::new(Mutex::new(document)),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            changes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<StoreDocument> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => StoreDocument::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument::default()),
            Err(e) => Err(ProxyError::storage(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write_document(&self, document: &StoreDocument) -> Result<()> {
        let contents = serde_json::to_string_pretty(document)?;
        let tmp_path = self.path.with_extension("json.tmp");

        tokio::fs::write(&tmp_path, contents).await.map_err(|e| {
            ProxyError::storage(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            ProxyError::storage(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }

    /// Re-reads the file and reports changed keys per area.
    fn reload_from_disk(&self) {
        let document = match read_document_blocking(&self.path) {
            Ok(document) => document,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to reload settings file");
                return;
            }
        };

        let changes: Vec<StorageChange> = {
            let mut last_seen = match self.last_seen.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let changes = [StorageArea::Local, StorageArea::Sync]
                .into_iter()
                .filter_map(|area| {
                    let keys = diff(last_seen.area(area), document.area(area));
                    (!keys.is_empty()).then_some(StorageChange { area, keys })
                })
                .collect();
            *last_seen = document;
            changes
        };

        for change in changes {
            info!(area = %change.area, keys = ?change.keys, "Settings file changed");
            let _ = self.changes.send(change);
        }
    }

    /// Starts watching the settings file for external edits.
    ///
    /// Bursts of file system events are coalesced: the file is re-read
    /// once no event has arrived for `debounce`.
    pub fn start_watcher(&self, debounce: Duration) -> Result<()> {
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();
        let file_name = self.path.file_name().map(|name| name.to_os_string());

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if ours && (event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()) {
                        let _ = notify_tx.send(());
                    }
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| ProxyError::storage(format!("Failed to create file watcher: {}", e)))?;

        // Watch the parent directory to catch file replacements
        let watch_path = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| ProxyError::storage(format!("Failed to watch {}: {}", watch_path.display(), e)))?;

        info!(path = %self.path.display(), "Started watching settings file for changes");

        let store = self.clone();
        std::thread::spawn(move || {
            let _watcher = watcher;
            loop {
                if notify_rx.recv().is_err() {
                    warn!("Settings watcher channel closed");
                    break;
                }
                while notify_rx.recv_timeout(debounce).is_ok() {
                    debug!("Debouncing settings reload");
                }
                store.reload_from_disk();
            }
        });

        Ok(())
    }
}

fn read_document_blocking(path: &Path) -> Result<StoreDocument> {
    match std::fs::read_to_string(path) {
        Ok(contents) => StoreDocument::parse(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument::default()),
        Err(e) => Err(ProxyError::storage(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

#[async_trait]
impl SettingsStore for FileStore {
    async fn get(&self, area: StorageArea, keys: &[&str]) -> Result<Record> {
        let document = self.read_document().await?;
        Ok(select(document.area(area), keys))
    }

    async fn set(&self, area: StorageArea, values: Record) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut document = self.read_document().await?;
        let keys = merge(document.area_mut(area), values);
        if keys.is_empty() {
            return Ok(());
        }

        self.write_document(&document).await?;
        {
            let mut last_seen = match self.last_seen.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *last_seen = document;
        }

        debug!(area = %area, keys = ?keys, "Settings written");
        let _ = self.changes.send(StorageChange { area, keys });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}
