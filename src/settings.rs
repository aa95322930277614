//! Editable settings as the administration side sees them.
//!
//! Unlike a [`Snapshot`](crate::snapshot::Snapshot), settings keep mappings
//! whose profile no longer exists (so they can be shown and fixed) and do
//! not lower-case whitelist entries. Saving applies the default-profile
//! policy; exporting and importing move settings between installations.

use crate::error::{ProxyError, Result};
use crate::profile::{coerce_string, ProxyProfile};
use crate::rules::HostMapping;
use crate::store::{
    Record, DEFAULT_PROFILE_ID, GLOBAL_PROXY_ENABLED, HOST_MAPPINGS, MASTER_PROXY_ENABLED,
    PROXY_PROFILES, SETTINGS_KEYS, WHITELIST_HOSTS,
};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// All user-editable settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub profiles: Vec<ProxyProfile>,
    pub mappings: Vec<HostMapping>,
    pub default_profile_id: Option<String>,
    pub whitelist: Vec<String>,
    pub global_proxy_enabled: bool,
    pub master_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            mappings: Vec::new(),
            default_profile_id: None,
            whitelist: Vec::new(),
            global_proxy_enabled: false,
            master_enabled: true,
        }
    }
}

fn array<'a>(record: &'a Record, key: &str) -> &'a [Value] {
    match record.get(key) {
        Some(Value::Array(items)) => items.as_slice(),
        _ => &[],
    }
}

/// Whether a stored mapping's `profileId` is absent, null, or a non-blank
/// string. Editing drops mappings of any other shape instead of turning
/// them into "use default".
fn has_editable_profile_id(raw: &Value) -> bool {
    match raw.get("profileId") {
        None | Some(Value::Null) => true,
        Some(Value::String(id)) => !id.trim().is_empty(),
        Some(other) => {
            debug!(profile_id = %other, "Dropping host mapping with malformed profile id");
            false
        }
    }
}

/// Generates an id for a new profile.
pub fn new_profile_id() -> String {
    format!("profile-{}", Uuid::new_v4().simple())
}

/// Picks the default profile to store.
///
/// A lone profile is always the default. Otherwise the current default is
/// kept while it names an existing profile.
pub fn apply_default_profile_policy(
    profiles: &[ProxyProfile],
    current: Option<&str>,
) -> Option<String> {
    if let [only] = profiles {
        return Some(only.id.clone());
    }
    current
        .filter(|id| profiles.iter().any(|p| p.id == *id))
        .map(str::to_string)
}

impl Settings {
    /// Leniently reads stored settings.
    pub fn from_record(record: &Record) -> Self {
        let profiles = array(record, PROXY_PROFILES)
            .iter()
            .filter_map(ProxyProfile::from_value)
            .collect();
        let mappings = array(record, HOST_MAPPINGS)
            .iter()
            .filter(|raw| has_editable_profile_id(raw))
            .filter_map(HostMapping::from_value)
            .collect();
        let whitelist = array(record, WHITELIST_HOSTS)
            .iter()
            .map(|entry| coerce_string(Some(entry)))
            .filter(|entry| !entry.is_empty())
            .collect();

        let default_profile_id = match record.get(DEFAULT_PROFILE_ID) {
            Some(Value::String(id)) if !id.trim().is_empty() => Some(id.trim().to_string()),
            _ => None,
        };

        Self {
            profiles,
            mappings,
            default_profile_id,
            whitelist,
            global_proxy_enabled: record.get(GLOBAL_PROXY_ENABLED) == Some(&Value::Bool(true)),
            master_enabled: record.get(MASTER_PROXY_ENABLED) != Some(&Value::Bool(false)),
        }
    }

    /// Renders every settings key.
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(
            PROXY_PROFILES.into(),
            Value::Array(self.profiles.iter().map(ProxyProfile::to_value).collect()),
        );
        record.insert(
            HOST_MAPPINGS.into(),
            Value::Array(self.mappings.iter().map(HostMapping::to_value).collect()),
        );
        record.insert(
            DEFAULT_PROFILE_ID.into(),
            self.default_profile_id
                .clone()
                .map_or(Value::Null, Value::String),
        );
        record.insert(
            WHITELIST_HOSTS.into(),
            Value::Array(self.whitelist.iter().cloned().map(Value::String).collect()),
        );
        record.insert(
            GLOBAL_PROXY_ENABLED.into(),
            Value::Bool(self.global_proxy_enabled),
        );
        record.insert(MASTER_PROXY_ENABLED.into(), Value::Bool(self.master_enabled));
        record
    }

    /// Applies the default-profile policy before the settings are stored.
    pub fn sanitized(mut self) -> Self {
        self.default_profile_id =
            apply_default_profile_policy(&self.profiles, self.default_profile_id.as_deref());
        self
    }

    pub fn profile(&self, id: &str) -> Option<&ProxyProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Pretty JSON carrying every settings key.
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_record())?)
    }

    /// Parses exported settings, giving every profile a fresh id.
    ///
    /// Mappings and the default are re-pointed at the new ids; mappings
    /// that reference a profile missing from the import are skipped.
    pub fn import_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        let record = match value {
            Value::Object(record) => record,
            _ => {
                return Err(ProxyError::import_format(
                    "settings must be a JSON object",
                ))
            }
        };

        if !SETTINGS_KEYS.iter().any(|key| record.contains_key(*key)) {
            return Err(ProxyError::import_format(
                "document does not contain any settings keys",
            ));
        }

        let mut id_map = HashMap::new();
        let mut profiles = Vec::new();
        for raw in array(&record, PROXY_PROFILES) {
            let Some(mut profile) = ProxyProfile::from_value(raw) else {
                debug!(record = %raw, "Skipping malformed imported profile");
                continue;
            };
            let new_id = new_profile_id();
            id_map.insert(profile.id.clone(), new_id.clone());
            profile.id = new_id;
            profiles.push(profile);
        }

        let mut mappings = Vec::new();
        for mut mapping in array(&record, HOST_MAPPINGS)
            .iter()
            .filter(|raw| has_editable_profile_id(raw))
            .filter_map(HostMapping::from_value)
        {
            if let Some(old_id) = mapping.profile_id.take() {
                match id_map.get(&old_id) {
                    Some(new_id) => mapping.profile_id = Some(new_id.clone()),
                    None => {
                        warn!(
                            host = %mapping.host,
                            profile_id = %old_id,
                            "Imported host mapping references an unknown profile; skipped"
                        );
                        continue;
                    }
                }
            }
            mappings.push(mapping);
        }

        let rest = Self::from_record(&record);
        let default_profile_id = rest
            .default_profile_id
            .and_then(|old_id| id_map.get(&old_id).cloned());

        Ok(Self {
            profiles,
            mappings,
            default_profile_id,
            whitelist: rest.whitelist,
            global_proxy_enabled: rest.global_proxy_enabled,
            master_enabled: rest.master_enabled,
        }
        .sanitized())
    }
}
