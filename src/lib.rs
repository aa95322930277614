//! # Proxy Router Library
//!
//! Decides, per outgoing request, whether to connect directly or through
//! one of the user's upstream proxy profiles. Settings are read from a
//! key-value store and compiled into immutable snapshots that are swapped
//! in atomically whenever the store changes.
//!
//! ## Modules
//!
//! - [`profile`]: Proxy profiles and the normalized profile registry
//! - [`rules`]: Host mappings and whitelist normalization
//! - [`whitelist`]: Direct-connection whitelist matching
//! - [`resolver`]: Host-to-profile mapping resolution
//! - [`engine`]: Per-request decisions over the current snapshot
//! - [`snapshot`]: Snapshot building and hot reload
//! - [`store`]: Settings persistence and change notification
//! - [`settings`]: Editable settings, export and import
//! - [`admin`]: Administrative edits through the store
//! - [`config`]: Application configuration
//! - [`error`]: Error types and handling
//! - [`logging`]: Logging setup and configuration
//!
//! ## Example
//!
//! ```ignore
//! use proxy_router::{DecisionEngine, FileStore, RequestDescriptor, SnapshotBuilder, StorageArea};
//! use std::sync::Arc;
//!
//! let store = Arc::new(FileStore::open("proxy-settings.json")?);
//! let engine = Arc::new(DecisionEngine::default());
//! SnapshotBuilder::new(store, engine.clone(), StorageArea::Local).spawn().await;
//!
//! let decision = engine.decide(&RequestDescriptor::new("https://www.example.com/"));
//! ```
//!
//! ## Decision Priority
//!
//! 1. **Master switch**: when off, every request goes direct
//! 2. **Whitelist**: whitelisted hosts go direct
//! 3. **Host mapping**: exact match, then the longest matching parent domain
//! 4. **Global default**: the default profile, when global proxying is on
//! 5. **Direct** otherwise

pub mod admin;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod profile;
pub mod resolver;
pub mod rules;
pub mod settings;
pub mod snapshot;
pub mod store;
pub mod whitelist;

pub use admin::{coverage, Coverage, ProfileDraft, SettingsEditor};
pub use config::AppConfig;
pub use engine::{DecisionEngine, DecisionRule, ProxyDecision, RequestDescriptor, Verdict};
pub use error::{ProxyError, Result};
pub use profile::{ProfileRegistry, ProxyProfile, ProxyType};
pub use rules::{HostMapping, RuleSet};
pub use settings::Settings;
pub use snapshot::{GlobalConfig, Snapshot, SnapshotBuilder};
pub use store::{FileStore, MemoryStore, SettingsStore, StorageArea, StorageChange};
