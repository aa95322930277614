//! Integration tests for proxy-router.
//!
//! These tests verify the complete behavior of the routing components
//! working together: normalization, decisions, the settings store, and
//! hot reload.

use proxy_router::engine::{decide, evaluate, DecisionEngine, DecisionRule, ProxyDecision, RequestDescriptor};
use proxy_router::profile::ProxyType;
use proxy_router::snapshot::{Snapshot, SnapshotBuilder};
use proxy_router::store::{FileStore, MemoryStore, Record, SettingsStore, StorageArea};
use proxy_router::{ProfileDraft, SettingsEditor};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Helper to build a snapshot from stored-shape JSON.
fn snapshot(value: Value) -> Snapshot {
    Snapshot::from_record(value.as_object().unwrap())
}

fn record(value: Value) -> Record {
    value.as_object().unwrap().clone()
}

fn proxy(kind: ProxyType, host: &str, port: u16) -> ProxyDecision {
    ProxyDecision::Proxy {
        kind,
        host: host.to_string(),
        port,
        proxy_dns: kind.uses_proxy_dns(),
    }
}

/// Polls until `check` passes or a few seconds have gone by.
async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

mod decision_tests {
    use super::*;

    fn settings() -> Value {
        json!({
            "proxyProfiles": [
                {"id": "a", "name": "A", "host": "a.proxy", "port": 3128, "type": "http"},
                {"id": "b", "name": "B", "host": "b.proxy", "port": 1080, "type": "socks5"},
                {"id": "d", "name": "D", "host": "d.proxy", "port": 8443, "type": "https"}
            ],
            "hostMappings": [
                {"host": "example.com", "profileId": "a"},
                {"host": "a.example.com", "profileId": "b"},
                {"host": "uses-default.org"},
                {"host": "ghost.net", "profileId": "missing"}
            ],
            "defaultProfileId": "d",
            "whitelistHosts": ["intranet.local", "192.168.1.0/24"]
        })
    }

    #[test]
    fn test_longest_suffix_wins() {
        let snapshot = snapshot(settings());

        assert_eq!(
            decide("https://x.a.example.com/path", &snapshot),
            proxy(ProxyType::Socks, "b.proxy", 1080)
        );
        assert_eq!(
            decide("https://y.example.com/", &snapshot),
            proxy(ProxyType::Http, "a.proxy", 3128)
        );
        assert_eq!(
            decide("http://EXAMPLE.com:8080/", &snapshot),
            proxy(ProxyType::Http, "a.proxy", 3128)
        );
        // A bare suffix without the label dot is not a subdomain.
        assert!(decide("https://notexample.com/", &snapshot).is_direct());
    }

    #[test]
    fn test_mapping_without_profile_uses_default() {
        let snapshot = snapshot(settings());
        assert_eq!(
            decide("https://www.uses-default.org/", &snapshot),
            proxy(ProxyType::Https, "d.proxy", 8443)
        );

        let mut without_default = settings();
        without_default["defaultProfileId"] = Value::Null;
        let snapshot = super::snapshot(without_default);
        let verdict = evaluate("https://www.uses-default.org/", &snapshot);
        assert!(verdict.decision.is_direct());
        assert_eq!(verdict.rule, DecisionRule::Fallback);
    }

    #[test]
    fn test_dangling_mapping_is_dropped() {
        let snapshot = snapshot(settings());
        assert!(!snapshot.rules.host_index().contains_key("ghost.net"));
        assert!(decide("https://ghost.net/", &snapshot).is_direct());
    }

    #[test]
    fn test_whitelist_beats_mapping() {
        let mut value = settings();
        value["whitelistHosts"] = json!(["example.com", "192.168.1.0/24"]);
        let snapshot = super::snapshot(value);

        let verdict = evaluate("https://cdn.example.com/", &snapshot);
        assert!(verdict.decision.is_direct());
        assert_eq!(verdict.rule, DecisionRule::Whitelist);

        assert!(decide("http://192.168.1.55/", &snapshot).is_direct());
        assert!(decide("http://192.168.1.1/", &snapshot).is_direct());
        assert_eq!(evaluate("http://192.168.2.1/", &snapshot).rule, DecisionRule::Fallback);
    }

    #[test]
    fn test_master_switch_overrides_everything() {
        let mut value = settings();
        value["masterProxyEnabled"] = json!(false);
        value["globalProxyEnabled"] = json!(true);
        let snapshot = super::snapshot(value);

        for url in ["https://x.a.example.com/", "https://intranet.local/", "https://anything.org/"] {
            let verdict = evaluate(url, &snapshot);
            assert!(verdict.decision.is_direct());
            assert_eq!(verdict.rule, DecisionRule::MasterSwitch);
        }
    }

    #[test]
    fn test_global_default() {
        let mut value = settings();
        value["globalProxyEnabled"] = json!(true);
        let snapshot = super::snapshot(value);

        let verdict = evaluate("https://unmapped.org/", &snapshot);
        assert_eq!(verdict.decision, proxy(ProxyType::Https, "d.proxy", 8443));
        assert_eq!(verdict.rule, DecisionRule::GlobalDefault);

        // Whitelisted hosts still go direct.
        assert!(decide("https://wiki.intranet.local/", &snapshot).is_direct());
    }

    #[test]
    fn test_unparseable_url_is_direct() {
        let mut value = settings();
        value["globalProxyEnabled"] = json!(true);
        let snapshot = super::snapshot(value);

        let verdict = evaluate("not a url", &snapshot);
        assert!(verdict.decision.is_direct());
        assert_eq!(verdict.rule, DecisionRule::UnparseableUrl);
    }

    #[test]
    fn test_decision_wire_shape() {
        let snapshot = snapshot(settings());

        let socks = serde_json::to_value(decide("https://x.a.example.com/", &snapshot)).unwrap();
        assert_eq!(
            socks,
            json!({"type": "socks", "host": "b.proxy", "port": 1080, "proxyDNS": true})
        );

        let direct = serde_json::to_value(decide("https://unmapped.org/", &snapshot)).unwrap();
        assert_eq!(direct, json!({"type": "direct"}));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let first = snapshot(settings());
        let second = Snapshot::from_record(&first.to_record());
        assert_eq!(first, second);
    }
}

mod snapshot_swap_tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    /// A snapshot whose every profile id and proxy host carries `generation`.
    fn generation(generation: usize) -> Snapshot {
        let profiles: Vec<Value> = (0..4)
            .map(|i| {
                json!({
                    "id": format!("g{generation}-p{i}"),
                    "name": format!("Profile {i}"),
                    "host": format!("gen{generation}.proxy"),
                    "port": 1000 + i
                })
            })
            .collect();
        let mappings: Vec<Value> = (0..4)
            .map(|i| json!({"host": format!("h{i}.com"), "profileId": format!("g{generation}-p{i}")}))
            .collect();

        snapshot(json!({
            "proxyProfiles": profiles,
            "hostMappings": mappings,
            "defaultProfileId": format!("g{generation}-p0")
        }))
    }

    #[test]
    fn test_readers_never_see_mixed_snapshots() {
        let engine = Arc::new(DecisionEngine::new(generation(0)));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut checked = 0usize;
                    while !done.load(Ordering::Relaxed) {
                        let snapshot = engine.load();
                        for mapping in snapshot.rules.mappings() {
                            let id = mapping.profile_id.as_deref().unwrap();
                            assert!(snapshot.profiles.contains(id), "mapping to {id} has no profile");
                        }
                        let default = snapshot.global.default_profile_id.as_deref().unwrap();
                        assert!(snapshot.profiles.contains(default));

                        if let ProxyDecision::Proxy { host, .. } =
                            engine.decide(&RequestDescriptor::new("https://www.h2.com/"))
                        {
                            assert!(host.starts_with("gen"));
                        } else {
                            panic!("mapped host went direct");
                        }
                        checked += 1;
                    }
                    checked
                })
            })
            .collect();

        for gen in 1..500 {
            engine.publish(generation(gen));
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            reader.join().unwrap();
        }

        let last = engine.load();
        assert_eq!(last.global.default_profile_id.as_deref(), Some("g499-p0"));
    }
}

mod store_reload_tests {
    use super::*;

    fn sample() -> Record {
        record(json!({
            "proxyProfiles": [{"id": "a", "name": "A", "host": "a.proxy", "port": 3128}],
            "hostMappings": [{"host": "example.com", "profileId": "a"}]
        }))
    }

    #[tokio::test]
    async fn test_builder_follows_memory_store() {
        let store = Arc::new(MemoryStore::new());
        store.set(StorageArea::Local, sample()).await.unwrap();

        let engine = Arc::new(DecisionEngine::default());
        let handle = SnapshotBuilder::new(store.clone(), engine.clone(), StorageArea::Local)
            .spawn()
            .await;

        let request = RequestDescriptor::new("https://www.example.com/");
        assert!(!engine.decide(&request).is_direct());

        store
            .set(StorageArea::Local, record(json!({"masterProxyEnabled": false})))
            .await
            .unwrap();
        assert!(wait_for(|| engine.decide(&request).is_direct()).await);

        // Writes to the other area are ignored.
        store
            .set(StorageArea::Sync, record(json!({"masterProxyEnabled": true})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.decide(&request).is_direct());

        handle.abort();
    }

    #[tokio::test]
    async fn test_file_store_external_edit_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let store = FileStore::open(&path).unwrap();
        store.set(StorageArea::Local, sample()).await.unwrap();
        store.start_watcher(Duration::from_millis(50)).unwrap();

        let engine = Arc::new(DecisionEngine::default());
        let handle = SnapshotBuilder::new(Arc::new(store.clone()), engine.clone(), StorageArea::Local)
            .spawn()
            .await;

        let request = RequestDescriptor::new("https://example.com/");
        assert!(!engine.decide(&request).is_direct());

        // Another process rewrites the file.
        let mut edited = sample();
        edited.insert("whitelistHosts".into(), json!(["example.com"]));
        let document = json!({"local": Value::Object(edited), "sync": {}});
        std::fs::write(&path, serde_json::to_string_pretty(&document).unwrap()).unwrap();

        assert!(wait_for(|| engine.decide(&request).is_direct()).await);
        handle.abort();
    }

    #[tokio::test]
    async fn test_corrupt_file_keeps_last_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let store = Arc::new(FileStore::open(&path).unwrap());
        store.set(StorageArea::Local, sample()).await.unwrap();

        let engine = Arc::new(DecisionEngine::default());
        let builder = SnapshotBuilder::new(store.clone(), engine.clone(), StorageArea::Local);
        builder.rebuild().await.unwrap();

        std::fs::write(&path, "{ not json").unwrap();
        assert!(builder.rebuild().await.is_err());
        assert_eq!(engine.load().profiles.len(), 1);

        // A half-written (truncated) file is treated the same way.
        std::fs::write(&path, "").unwrap();
        assert!(builder.rebuild().await.is_err());
        assert_eq!(engine.load().profiles.len(), 1);
    }
}

mod admin_flow_tests {
    use super::*;

    #[tokio::test]
    async fn test_edits_reach_the_engine() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn SettingsStore> =
            Arc::new(FileStore::open(dir.path().join("settings.json")).unwrap());

        let engine = Arc::new(DecisionEngine::default());
        let handle = SnapshotBuilder::new(store.clone(), engine.clone(), StorageArea::Local)
            .spawn()
            .await;
        let editor = SettingsEditor::new(store, StorageArea::Local);

        let tor = editor
            .upsert_profile(ProfileDraft {
                id: None,
                name: "Tor".into(),
                kind: ProxyType::Socks,
                host: "127.0.0.1".into(),
                port: 9050,
            })
            .await
            .unwrap();
        editor.add_host_mapping("onion.example", Some(tor.as_str())).await.unwrap();

        let request = RequestDescriptor::new("http://hidden.onion.example/");
        let expected = proxy(ProxyType::Socks, "127.0.0.1", 9050);
        assert!(wait_for(|| engine.decide(&request) == expected).await);

        editor.delete_profile(&tor).await.unwrap();
        assert!(wait_for(|| engine.decide(&request).is_direct()).await);

        handle.abort();
    }

    #[tokio::test]
    async fn test_export_import_between_installations() {
        let source = SettingsEditor::new(Arc::new(MemoryStore::new()), StorageArea::Local);
        let id = source
            .upsert_profile(ProfileDraft {
                id: None,
                name: "Office".into(),
                kind: ProxyType::Http,
                host: "proxy.corp".into(),
                port: 3128,
            })
            .await
            .unwrap();
        source.add_host_mapping("corp.example", Some(id.as_str())).await.unwrap();
        source.set_whitelist("localhost").await.unwrap();

        let exported = source.export_json().await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let target = SettingsEditor::new(store.clone(), StorageArea::Local);
        target.import_json(&exported).await.unwrap();

        let record = store.get(StorageArea::Local, &proxy_router::store::SETTINGS_KEYS).await.unwrap();
        let snapshot = Snapshot::from_record(&record);
        assert_eq!(
            decide("https://git.corp.example/", &snapshot),
            proxy(ProxyType::Http, "proxy.corp", 3128)
        );
        assert!(decide("http://localhost/", &snapshot).is_direct());
        assert!(!snapshot.profiles.contains(&id));
    }
}
