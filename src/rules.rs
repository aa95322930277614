//! Host mapping rules and whitelist normalization.

use crate::profile::{coerce_string, ProfileRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Binds a host (and its subdomains) to a proxy profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMapping {
    /// Trimmed, lower-cased host.
    pub host: String,

    /// Target profile; `None` means "use the default profile".
    pub profile_id: Option<String>,
}

impl HostMapping {
    /// Coerces a stored record into a mapping without checking that the
    /// referenced profile exists.
    ///
    /// A `profileId` that is not a non-blank string reads as "use default".
    pub fn from_value(value: &Value) -> Option<Self> {
        let record = value.as_object()?;

        let host = normalize_host(&coerce_string(record.get("host")));
        if host.is_empty() {
            return None;
        }

        let profile_id = match record.get("profileId") {
            Some(Value::String(id)) if !id.trim().is_empty() => Some(id.trim().to_string()),
            _ => None,
        };

        Some(Self { host, profile_id })
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "host": self.host,
            "profileId": self.profile_id,
        })
    }
}

/// Trims and lower-cases a host for comparison.
pub fn normalize_host(host: &str) -> String {
    host.trim().to_lowercase()
}

/// Validated mappings, their host index, and the normalized whitelist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    mappings: Vec<HostMapping>,
    by_host: HashMap<String, HostMapping>,
    whitelist: Vec<String>,
}

impl RuleSet {
    pub fn new(raw_mappings: &[Value], raw_whitelist: &[Value], profiles: &ProfileRegistry) -> Self {
        let mappings = normalize_mappings(raw_mappings, profiles);
        let by_host = mappings
            .iter()
            .map(|m| (m.host.clone(), m.clone()))
            .collect();

        Self {
            mappings,
            by_host,
            whitelist: normalize_whitelist(raw_whitelist),
        }
    }

    /// Mappings in stored order, duplicates included.
    pub fn mappings(&self) -> &[HostMapping] {
        &self.mappings
    }

    /// Host index; the last stored mapping for a host wins.
    pub fn host_index(&self) -> &HashMap<String, HostMapping> {
        &self.by_host
    }

    pub fn whitelist(&self) -> &[String] {
        &self.whitelist
    }
}

/// Keeps mappings with a non-empty host whose explicit profile reference,
/// if any, names a profile in the registry.
///
/// A mapping that points at a missing profile is discarded outright rather
/// than downgraded to "use default".
pub fn normalize_mappings(raw: &[Value], profiles: &ProfileRegistry) -> Vec<HostMapping> {
    raw.iter()
        .filter_map(|value| {
            let mapping = HostMapping::from_value(value);
            if mapping.is_none() {
                debug!(record = %value, "Dropping malformed host mapping");
            }
            mapping
        })
        .filter(|mapping| match &mapping.profile_id {
            Some(id) if !profiles.contains(id) => {
                debug!(
                    host = %mapping.host,
                    profile_id = %id,
                    "Dropping host mapping with unknown profile"
                );
                false
            }
            _ => true,
        })
        .collect()
}

/// Trims and lower-cases whitelist entries, dropping blanks.
///
/// Order is preserved and duplicates are kept.
pub fn normalize_whitelist(raw: &[Value]) -> Vec<String> {
    raw.iter()
        .map(|entry| coerce_string(Some(entry)).to_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}
