//! Immutable routing snapshots and their lifecycle.
//!
//! A [`Snapshot`] is built wholesale from the stored settings every time
//! they change and published to the [`DecisionEngine`] with a single
//! atomic swap. A failed rebuild leaves the previous snapshot in place.

use crate::engine::DecisionEngine;
use crate::error::Result;
use crate::profile::{ProfileRegistry, ProxyProfile};
use crate::rules::RuleSet;
use crate::store::{
    Record, SettingsStore, StorageArea, StorageChange, DEFAULT_PROFILE_ID, GLOBAL_PROXY_ENABLED,
    HOST_MAPPINGS, MASTER_PROXY_ENABLED, PROXY_PROFILES, SETTINGS_KEYS, WHITELIST_HOSTS,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The on/off switches and default profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    /// Kill switch; when off every request goes direct.
    pub master_enabled: bool,

    /// Route unmapped hosts through the default profile.
    pub global_proxy_enabled: bool,

    /// Always names a profile of the same snapshot when set.
    pub default_profile_id: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            master_enabled: true,
            global_proxy_enabled: false,
            default_profile_id: None,
        }
    }
}

/// A consistent view of all normalized settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub profiles: ProfileRegistry,
    pub rules: RuleSet,
    pub global: GlobalConfig,
}

/// How many stored records normalization threw away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DroppedCounts {
    pub profiles: usize,
    pub mappings: usize,
    pub whitelist: usize,
}

impl DroppedCounts {
    /// Compares the raw arrays of `record` with the snapshot built from it.
    pub fn between(record: &Record, snapshot: &Snapshot) -> Self {
        let raw_len = |key: &str| match record.get(key) {
            Some(Value::Array(items)) => items.len(),
            _ => 0,
        };
        Self {
            profiles: raw_len(PROXY_PROFILES).saturating_sub(snapshot.profiles.len()),
            mappings: raw_len(HOST_MAPPINGS).saturating_sub(snapshot.rules.mappings().len()),
            whitelist: raw_len(WHITELIST_HOSTS).saturating_sub(snapshot.rules.whitelist().len()),
        }
    }
}

fn array(record: &Record, key: &str) -> Vec<Value> {
    match record.get(key) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

impl Snapshot {
    /// Normalizes a stored settings record. Never fails: malformed parts
    /// are dropped and missing keys take their defaults.
    pub fn from_record(record: &Record) -> Self {
        let profiles = ProfileRegistry::normalize(&array(record, PROXY_PROFILES));
        let rules = RuleSet::new(
            &array(record, HOST_MAPPINGS),
            &array(record, WHITELIST_HOSTS),
            &profiles,
        );

        let default_profile_id = match record.get(DEFAULT_PROFILE_ID) {
            Some(Value::String(id)) if profiles.contains(id) => Some(id.clone()),
            _ => None,
        };

        let global = GlobalConfig {
            master_enabled: record.get(MASTER_PROXY_ENABLED) != Some(&Value::Bool(false)),
            global_proxy_enabled: record.get(GLOBAL_PROXY_ENABLED) == Some(&Value::Bool(true)),
            default_profile_id,
        };

        Self {
            profiles,
            rules,
            global,
        }
    }

    /// Renders the snapshot in stored shape.
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(
            PROXY_PROFILES.into(),
            Value::Array(self.profiles.profiles().iter().map(ProxyProfile::to_value).collect()),
        );
        record.insert(
            HOST_MAPPINGS.into(),
            Value::Array(self.rules.mappings().iter().map(|m| m.to_value()).collect()),
        );
        record.insert(
            DEFAULT_PROFILE_ID.into(),
            self.global
                .default_profile_id
                .clone()
                .map_or(Value::Null, Value::String),
        );
        record.insert(
            WHITELIST_HOSTS.into(),
            Value::Array(self.rules.whitelist().iter().cloned().map(Value::String).collect()),
        );
        record.insert(
            GLOBAL_PROXY_ENABLED.into(),
            Value::Bool(self.global.global_proxy_enabled),
        );
        record.insert(
            MASTER_PROXY_ENABLED.into(),
            Value::Bool(self.global.master_enabled),
        );
        record
    }

    /// The configured default profile, if any.
    pub fn default_profile(&self) -> Option<&ProxyProfile> {
        self.global
            .default_profile_id
            .as_deref()
            .and_then(|id| self.profiles.get(id))
    }
}

/// Rebuilds snapshots from a settings store and publishes them.
pub struct SnapshotBuilder {
    store: Arc<dyn SettingsStore>,
    engine: Arc<DecisionEngine>,
    area: StorageArea,
}

impl SnapshotBuilder {
    pub fn new(store: Arc<dyn SettingsStore>, engine: Arc<DecisionEngine>, area: StorageArea) -> Self {
        Self {
            store,
            engine,
            area,
        }
    }

    /// Whether a change notification should trigger a rebuild.
    pub fn is_relevant(&self, change: &StorageChange) -> bool {
        change.area == self.area && change.touches_settings()
    }

    /// Reads the settings, builds a new snapshot and publishes it.
    ///
    /// On a read failure the error is returned and the engine keeps
    /// serving its current snapshot.
    pub async fn rebuild(&self) -> Result<()> {
        let record = match self.store.get(self.area, &SETTINGS_KEYS).await {
            Ok(record) => record,
            Err(e) => {
                error!(area = %self.area, error = %e, "Failed to read settings; keeping previous snapshot");
                return Err(e);
            }
        };

        let snapshot = Snapshot::from_record(&record);
        let dropped = DroppedCounts::between(&record, &snapshot);
        info!(
            area = %self.area,
            profiles = snapshot.profiles.len(),
            profiles_dropped = dropped.profiles,
            mappings = snapshot.rules.mappings().len(),
            mappings_dropped = dropped.mappings,
            whitelist = snapshot.rules.whitelist().len(),
            whitelist_dropped = dropped.whitelist,
            default_profile = ?snapshot.global.default_profile_id,
            master_enabled = snapshot.global.master_enabled,
            global_proxy_enabled = snapshot.global.global_proxy_enabled,
            "Routing snapshot rebuilt"
        );

        self.engine.publish(snapshot);
        Ok(())
    }

    /// Builds the initial snapshot, then rebuilds in the background on
    /// every relevant change notification.
    pub async fn spawn(self) -> JoinHandle<()> {
        let mut changes = self.store.subscribe();
        let _ = self.rebuild().await;

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if !self.is_relevant(&change) {
                            debug!(area = %change.area, keys = ?change.keys, "Ignoring unrelated storage change");
                            continue;
                        }
                        let _ = self.rebuild().await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed storage change notifications; rebuilding");
                        let _ = self.rebuild().await;
                    }
                    Err(RecvError::Closed) => {
                        debug!("Storage change stream closed");
                        break;
                    }
                }
            }
        })
    }
}
