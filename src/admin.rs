//! Administrative edits.
//!
//! Every edit reads the current settings from the store, changes them, and
//! writes them back. The live routing snapshot is never touched directly;
//! it follows through the store's change notifications.

use crate::error::{ProxyError, Result};
use crate::profile::{ProxyProfile, ProxyType};
use crate::rules::{normalize_host, HostMapping};
use crate::settings::{new_profile_id, Settings};
use crate::store::{SettingsStore, StorageArea, SETTINGS_KEYS};
use crate::whitelist::is_subdomain_of;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// A profile as submitted from a form: no id means "create".
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileDraft {
    pub id: Option<String>,
    pub name: String,
    pub kind: ProxyType,
    pub host: String,
    pub port: u16,
}

/// Share of URLs covered by a host mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Coverage {
    pub covered: usize,
    pub total: usize,
    pub percent: u8,
}

/// Counts how many of `urls` have a host covered by `mappings`.
///
/// A host is covered when it equals a mapping host or is one of its
/// subdomains. URLs that do not parse or carry no host are not counted.
pub fn coverage<'a, I>(urls: I, mappings: &[HostMapping]) -> Coverage
where
    I: IntoIterator<Item = &'a str>,
{
    let hosts: Vec<String> = urls
        .into_iter()
        .filter_map(|url| Url::parse(url).ok())
        .filter_map(|url| url.host_str().map(normalize_host))
        .filter(|host| !host.is_empty())
        .collect();

    let covered = hosts
        .iter()
        .filter(|host| {
            mappings
                .iter()
                .any(|m| **host == m.host || is_subdomain_of(host, &m.host))
        })
        .count();
    let total = hosts.len();
    let percent = if total == 0 {
        0
    } else {
        ((covered as f64 / total as f64) * 100.0).round() as u8
    };

    Coverage {
        covered,
        total,
        percent,
    }
}

/// Reads and edits the settings of one storage area.
#[derive(Clone)]
pub struct SettingsEditor {
    store: Arc<dyn SettingsStore>,
    area: StorageArea,
}

impl SettingsEditor {
    pub fn new(store: Arc<dyn SettingsStore>, area: StorageArea) -> Self {
        Self { store, area }
    }

    pub fn area(&self) -> StorageArea {
        self.area
    }

    pub async fn load(&self) -> Result<Settings> {
        let record = self.store.get(self.area, &SETTINGS_KEYS).await?;
        Ok(Settings::from_record(&record))
    }

    /// Stores `settings` after applying the default-profile policy.
    pub async fn save(&self, settings: Settings) -> Result<()> {
        let settings = settings.sanitized();
        self.store.set(self.area, settings.to_record()).await?;
        debug!(area = %self.area, "Settings saved");
        Ok(())
    }

    /// Creates or updates a profile, returning its id.
    pub async fn upsert_profile(&self, draft: ProfileDraft) -> Result<String> {
        let name = draft.name.trim().to_string();
        let host = draft.host.trim().to_string();
        if name.is_empty() || host.is_empty() {
            return Err(ProxyError::invalid_profile("name and host are required"));
        }
        if draft.port == 0 {
            return Err(ProxyError::invalid_profile("port must be between 1 and 65535"));
        }

        let mut settings = self.load().await?;
        let editing = draft
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        if settings
            .profiles
            .iter()
            .any(|p| p.name == name && Some(&p.id) != editing.as_ref())
        {
            return Err(ProxyError::DuplicateProfileName { name });
        }

        let id = match editing {
            Some(id) => {
                let existing = settings
                    .profiles
                    .iter_mut()
                    .find(|p| p.id == id)
                    .ok_or_else(|| ProxyError::ProfileNotFound { id: id.clone() })?;
                existing.name = name;
                existing.host = host;
                existing.port = draft.port;
                existing.kind = draft.kind;
                id
            }
            None => {
                let id = new_profile_id();
                settings.profiles.push(ProxyProfile {
                    id: id.clone(),
                    name,
                    host,
                    port: draft.port,
                    kind: draft.kind,
                });
                id
            }
        };

        self.save(settings).await?;
        info!(profile_id = %id, "Proxy profile saved");
        Ok(id)
    }

    /// Deletes a profile together with the mappings that point at it.
    pub async fn delete_profile(&self, id: &str) -> Result<()> {
        let mut settings = self.load().await?;

        let before = settings.profiles.len();
        settings.profiles.retain(|p| p.id != id);
        if settings.profiles.len() == before {
            return Err(ProxyError::ProfileNotFound { id: id.to_string() });
        }

        settings
            .mappings
            .retain(|m| m.profile_id.as_deref() != Some(id));
        if settings.default_profile_id.as_deref() == Some(id) {
            settings.default_profile_id = None;
        }

        self.save(settings).await?;
        info!(profile_id = %id, "Proxy profile deleted");
        Ok(())
    }

    pub async fn set_default_profile(&self, id: Option<&str>) -> Result<()> {
        let mut settings = self.load().await?;
        if let Some(id) = id {
            if settings.profile(id).is_none() {
                return Err(ProxyError::ProfileNotFound { id: id.to_string() });
            }
        }
        settings.default_profile_id = id.map(str::to_string);
        self.save(settings).await
    }

    /// Replaces the whitelist with one entry per non-blank line of `text`.
    pub async fn set_whitelist(&self, text: &str) -> Result<()> {
        let mut settings = self.load().await?;
        settings.whitelist = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        self.save(settings).await
    }

    /// Adds a mapping for `host`, returning the normalized host.
    pub async fn add_host_mapping(&self, host: &str, profile_id: Option<&str>) -> Result<String> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(ProxyError::EmptyHost);
        }

        let mut settings = self.load().await?;
        if settings.mappings.iter().any(|m| m.host == host) {
            return Err(ProxyError::HostExists { host });
        }
        let profile_id = Self::checked_profile(&settings, profile_id)?;

        settings.mappings.push(HostMapping {
            host: host.clone(),
            profile_id,
        });
        self.save(settings).await?;
        Ok(host)
    }

    /// Adds a mapping for the host of `url`.
    pub async fn add_host_mapping_from_url(&self, url: &str, profile_id: Option<&str>) -> Result<String> {
        let parsed = Url::parse(url.trim()).map_err(|_| ProxyError::InvalidUrl {
            url: url.to_string(),
        })?;
        let host = parsed.host_str().ok_or(ProxyError::EmptyHost)?;
        self.add_host_mapping(host, profile_id).await
    }

    /// Re-points an existing mapping. Returns `false` if `host` is not mapped.
    pub async fn update_mapping_profile(&self, host: &str, profile_id: Option<&str>) -> Result<bool> {
        let host = normalize_host(host);
        let mut settings = self.load().await?;
        let profile_id = Self::checked_profile(&settings, profile_id)?;

        let mut updated = false;
        for mapping in settings.mappings.iter_mut().filter(|m| m.host == host) {
            mapping.profile_id = profile_id.clone();
            updated = true;
        }
        if updated {
            self.save(settings).await?;
        }
        Ok(updated)
    }

    /// Removes every mapping for `host`. Returns `false` if none existed.
    pub async fn remove_host(&self, host: &str) -> Result<bool> {
        let host = normalize_host(host);
        let mut settings = self.load().await?;

        let before = settings.mappings.len();
        settings.mappings.retain(|m| m.host != host);
        if settings.mappings.len() == before {
            return Ok(false);
        }
        self.save(settings).await?;
        Ok(true)
    }

    pub async fn set_master_enabled(&self, enabled: bool) -> Result<()> {
        let mut settings = self.load().await?;
        settings.master_enabled = enabled;
        self.save(settings).await
    }

    pub async fn set_global_proxy_enabled(&self, enabled: bool) -> Result<()> {
        let mut settings = self.load().await?;
        settings.global_proxy_enabled = enabled;
        self.save(settings).await
    }

    /// Exports the settings; fails when nothing has been configured yet.
    pub async fn export_json(&self) -> Result<String> {
        let settings = self.load().await?;
        if settings == Settings::default() {
            return Err(ProxyError::NothingToExport);
        }
        settings.export_json()
    }

    /// Replaces the settings with an exported document.
    pub async fn import_json(&self, json: &str) -> Result<Settings> {
        let settings = Settings::import_json(json)?;
        self.save(settings.clone()).await?;
        info!(
            profiles = settings.profiles.len(),
            mappings = settings.mappings.len(),
            "Settings imported"
        );
        Ok(settings)
    }

    /// Copies this area's settings into `target`.
    pub async fn copy_to(&self, target: StorageArea) -> Result<()> {
        let settings = self.load().await?;
        SettingsEditor::new(self.store.clone(), target)
            .save(settings)
            .await?;
        info!(from = %self.area, to = %target, "Settings copied");
        Ok(())
    }

    fn checked_profile(settings: &Settings, profile_id: Option<&str>) -> Result<Option<String>> {
        match profile_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) if settings.profile(id).is_none() => Err(ProxyError::ProfileNotFound {
                id: id.to_string(),
            }),
            other => Ok(other.map(str::to_string)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn editor() -> SettingsEditor {
        SettingsEditor::new(Arc::new(MemoryStore::new()), StorageArea::Local)
    }

    fn draft(name: &str) -> ProfileDraft {
        ProfileDraft {
            id: None,
            name: name.into(),
            kind: ProxyType::Socks,
            host: "127.0.0.1".into(),
            port: 1080,
        }
    }

    #[test]
    fn test_coverage() {
        let mappings = vec![
            HostMapping { host: "example.com".into(), profile_id: None },
        ];
        let urls = [
            "https://example.com/",
            "https://www.example.com/a",
            "https://other.org/",
            "about:blank",
            "not a url",
        ];

        let result = coverage(urls, &mappings);
        assert_eq!(result.covered, 2);
        assert_eq!(result.total, 3);
        assert_eq!(result.percent, 67);

        assert_eq!(coverage(std::iter::empty(), &mappings).percent, 0);
    }

    #[tokio::test]
    async fn test_first_profile_becomes_default() {
        let editor = editor();
        let id = editor.upsert_profile(draft("Tor")).await.unwrap();

        let settings = editor.load().await.unwrap();
        assert_eq!(settings.profiles.len(), 1);
        assert_eq!(settings.default_profile_id, Some(id));
    }

    #[tokio::test]
    async fn test_profile_names_are_unique() {
        let editor = editor();
        let id = editor.upsert_profile(draft("Tor")).await.unwrap();
        let err = editor.upsert_profile(draft("Tor")).await.unwrap_err();
        assert!(matches!(err, ProxyError::DuplicateProfileName { .. }));

        // Saving the same profile under its own name is fine.
        let mut edit = draft("Tor");
        edit.id = Some(id.clone());
        edit.port = 9050;
        assert_eq!(editor.upsert_profile(edit).await.unwrap(), id);
        assert_eq!(editor.load().await.unwrap().profiles[0].port, 9050);
    }

    #[tokio::test]
    async fn test_edit_unknown_profile_fails() {
        let mut edit = draft("Ghost");
        edit.id = Some("nope".into());
        let err = editor().upsert_profile(edit).await.unwrap_err();
        assert!(matches!(err, ProxyError::ProfileNotFound { .. }));

        let err = editor().upsert_profile(ProfileDraft { port: 0, ..draft("x") }).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidProfile { .. }));
    }

    #[tokio::test]
    async fn test_delete_profile_cascades() {
        let editor = editor();
        let a = editor.upsert_profile(draft("A")).await.unwrap();
        let b = editor.upsert_profile(draft("B")).await.unwrap();
        editor.set_default_profile(Some(a.as_str())).await.unwrap();
        editor.add_host_mapping("a.com", Some(a.as_str())).await.unwrap();
        editor.add_host_mapping("b.com", Some(b.as_str())).await.unwrap();
        editor.add_host_mapping("any.com", None).await.unwrap();

        editor.delete_profile(&a).await.unwrap();

        let settings = editor.load().await.unwrap();
        let hosts: Vec<_> = settings.mappings.iter().map(|m| m.host.as_str()).collect();
        assert_eq!(hosts, vec!["b.com", "any.com"]);
        // The remaining lone profile becomes the default.
        assert_eq!(settings.default_profile_id, Some(b));

        assert!(matches!(
            editor.delete_profile(&a).await,
            Err(ProxyError::ProfileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_host_mapping_edits() {
        let editor = editor();
        let id = editor.upsert_profile(draft("A")).await.unwrap();

        assert_eq!(editor.add_host_mapping("  Example.COM ", None).await.unwrap(), "example.com");
        assert!(matches!(
            editor.add_host_mapping("example.com", None).await,
            Err(ProxyError::HostExists { .. })
        ));
        assert!(matches!(
            editor.add_host_mapping("   ", None).await,
            Err(ProxyError::EmptyHost)
        ));
        assert!(matches!(
            editor.add_host_mapping("x.com", Some("missing")).await,
            Err(ProxyError::ProfileNotFound { .. })
        ));

        assert!(editor.update_mapping_profile("EXAMPLE.com", Some(id.as_str())).await.unwrap());
        assert!(!editor.update_mapping_profile("unknown.com", None).await.unwrap());
        assert_eq!(
            editor.load().await.unwrap().mappings[0].profile_id.as_deref(),
            Some(id.as_str())
        );

        assert!(editor.remove_host("example.com").await.unwrap());
        assert!(!editor.remove_host("example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_host_mapping_from_url() {
        let editor = editor();
        let host = editor
            .add_host_mapping_from_url("https://WWW.Example.com:8443/path?q=1", None)
            .await
            .unwrap();
        assert_eq!(host, "www.example.com");

        assert!(matches!(
            editor.add_host_mapping_from_url("not a url", None).await,
            Err(ProxyError::InvalidUrl { .. })
        ));
        assert!(matches!(
            editor.add_host_mapping_from_url("data:text/plain,hi", None).await,
            Err(ProxyError::EmptyHost)
        ));
    }

    #[tokio::test]
    async fn test_export_requires_settings() {
        let editor = editor();
        assert!(matches!(
            editor.export_json().await,
            Err(ProxyError::NothingToExport)
        ));

        // An explicitly disabled master switch is worth exporting.
        editor.set_master_enabled(false).await.unwrap();
        assert!(editor.export_json().await.is_ok());
    }

    #[tokio::test]
    async fn test_save_drops_mappings_with_malformed_profile_ids() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                StorageArea::Local,
                serde_json::json!({
                    "proxyProfiles": [{"id": "a", "name": "A", "host": "a.proxy", "port": 3128}],
                    "hostMappings": [
                        {"host": "num.com", "profileId": 5},
                        {"host": "blank.com", "profileId": "  "},
                        {"host": "kept.com", "profileId": "a"}
                    ],
                    "defaultProfileId": "a"
                })
                .as_object()
                .unwrap()
                .clone(),
            )
            .await
            .unwrap();

        let editor = SettingsEditor::new(store.clone(), StorageArea::Local);
        editor.set_master_enabled(true).await.unwrap();

        let stored = store.get(StorageArea::Local, &SETTINGS_KEYS).await.unwrap();
        assert_eq!(
            stored["hostMappings"],
            serde_json::json!([{"host": "kept.com", "profileId": "a"}])
        );
    }

    #[tokio::test]
    async fn test_whitelist_and_switches() {
        let editor = editor();
        editor
            .set_whitelist("localhost\n\n  192.168.1.0/24  \n")
            .await
            .unwrap();
        editor.set_master_enabled(false).await.unwrap();
        editor.set_global_proxy_enabled(true).await.unwrap();

        let settings = editor.load().await.unwrap();
        assert_eq!(settings.whitelist, vec!["localhost", "192.168.1.0/24"]);
        assert!(!settings.master_enabled);
        assert!(settings.global_proxy_enabled);
    }

    #[tokio::test]
    async fn test_copy_between_areas() {
        let store: Arc<dyn SettingsStore> = Arc::new(MemoryStore::new());
        let local = SettingsEditor::new(store.clone(), StorageArea::Local);
        local.upsert_profile(draft("A")).await.unwrap();
        local.add_host_mapping("a.com", None).await.unwrap();

        local.copy_to(StorageArea::Sync).await.unwrap();

        let sync = SettingsEditor::new(store, StorageArea::Sync);
        assert_eq!(sync.load().await.unwrap(), local.load().await.unwrap());
    }
}
