//! Host mapping resolution.
//!
//! A host resolves through the mapping index in two steps:
//! 1. Exact key match
//! 2. Longest key that the host is a subdomain of
//!
//! The winning mapping's profile is its explicit profile, or the default
//! profile when the mapping carries none.

use crate::profile::{ProfileRegistry, ProxyProfile};
use crate::rules::HostMapping;
use crate::whitelist::is_subdomain_of;
use std::collections::HashMap;
use tracing::trace;

/// How a mapping matched the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The mapping key equals the host.
    Exact,
    /// The host is a subdomain of the mapping key.
    Suffix,
}

/// The mapping selected for a host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MappingHit<'a> {
    pub mapping: &'a HostMapping,
    pub kind: MatchKind,
}

/// Finds the mapping that governs `host`.
///
/// Suffix candidates are ranked by key length, longest first. Two distinct
/// keys of equal length cannot both be suffixes of one host; the lexical
/// order only keeps the ranking total.
pub fn find_mapping<'a>(
    host: &str,
    host_index: &'a HashMap<String, HostMapping>,
) -> Option<MappingHit<'a>> {
    if let Some(mapping) = host_index.get(host) {
        return Some(MappingHit {
            mapping,
            kind: MatchKind::Exact,
        });
    }

    host_index
        .iter()
        .filter(|(key, _)| is_subdomain_of(host, key))
        .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
        .map(|(_, mapping)| MappingHit {
            mapping,
            kind: MatchKind::Suffix,
        })
}

/// Looks up the profile a mapping points at, falling back to the default.
pub fn mapping_profile<'a>(
    mapping: &HostMapping,
    profiles: &'a ProfileRegistry,
    default_profile_id: Option<&str>,
) -> Option<&'a ProxyProfile> {
    match mapping.profile_id.as_deref() {
        Some(id) => profiles.get(id),
        None => default_profile_id.and_then(|id| profiles.get(id)),
    }
}

/// Resolves `host` to a profile through the mapping rules.
///
/// Returns `None` when no mapping covers the host, or when the covering
/// mapping defers to a default that is not configured.
pub fn resolve_mapping<'a>(
    host: &str,
    host_index: &HashMap<String, HostMapping>,
    profiles: &'a ProfileRegistry,
    default_profile_id: Option<&str>,
) -> Option<&'a ProxyProfile> {
    let hit = find_mapping(host, host_index)?;
    let profile = mapping_profile(hit.mapping, profiles, default_profile_id);

    trace!(
        host = %host,
        rule = %hit.mapping.host,
        kind = ?hit.kind,
        profile = ?profile.map(|p| p.id.as_str()),
        "Host mapping matched"
    );

    profile
}
