//! Per-request proxy decisions.
//!
//! The decision is a pure function of the request URL and one snapshot.
//! Precedence is an explicit ordered list of [`DecisionRule`]s, evaluated
//! top to bottom; the first rule that produces a decision wins.
//!
//! ```text
//! request -> DecisionEngine::decide() -> ArcSwap::load() -> Snapshot
//!                                             |
//!                                      (lock-free read)
//!
//! settings change -> SnapshotBuilder::rebuild() -> DecisionEngine::publish() -> ArcSwap::store()
//! ```

use crate::profile::{ProxyProfile, ProxyType};
use crate::resolver::resolve_mapping;
use crate::snapshot::Snapshot;
use crate::whitelist::is_whitelisted;
use arc_swap::{ArcSwap, Guard};
use serde::{Deserialize, Serialize, Serializer};
use std::sync::Arc;
use tracing::{debug, trace};
use url::Url;

/// What the interception layer should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyDecision {
    /// Connect without a proxy.
    Direct,

    /// Connect through an upstream proxy.
    Proxy {
        kind: ProxyType,
        host: String,
        port: u16,
        /// Resolve the destination name on the proxy side (SOCKS only).
        proxy_dns: bool,
    },
}

impl ProxyDecision {
    pub fn via(profile: &ProxyProfile) -> Self {
        ProxyDecision::Proxy {
            kind: profile.kind,
            host: profile.host.clone(),
            port: profile.port,
            proxy_dns: profile.kind.uses_proxy_dns(),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ProxyDecision::Direct)
    }
}

/// Wire shape of a decision, e.g. `{"type":"socks","host":"h","port":1080,"proxyDNS":true}`.
#[derive(Serialize)]
struct ProxyInfo<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(rename = "proxyDNS", skip_serializing_if = "Option::is_none")]
    proxy_dns: Option<bool>,
}

impl Serialize for ProxyDecision {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let info = match self {
            ProxyDecision::Direct => ProxyInfo {
                kind: "direct",
                host: None,
                port: None,
                proxy_dns: None,
            },
            ProxyDecision::Proxy {
                kind,
                host,
                port,
                proxy_dns,
            } => ProxyInfo {
                kind: kind.as_str(),
                host: Some(host.as_str()),
                port: Some(*port),
                proxy_dns: Some(*proxy_dns),
            },
        };
        info.serialize(serializer)
    }
}

/// An outbound request as seen by the interception layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub url: String,
}

impl RequestDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Named precedence rules, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    /// Master switch off: everything goes direct.
    MasterSwitch,
    /// The URL could not be parsed.
    UnparseableUrl,
    /// The host is whitelisted.
    Whitelist,
    /// A host mapping covers the host.
    HostMapping,
    /// Global proxying through the default profile.
    GlobalDefault,
    /// Nothing applied.
    Fallback,
}

/// Every rule, highest precedence first.
pub const DECISION_RULES: [DecisionRule; 6] = [
    DecisionRule::MasterSwitch,
    DecisionRule::UnparseableUrl,
    DecisionRule::Whitelist,
    DecisionRule::HostMapping,
    DecisionRule::GlobalDefault,
    DecisionRule::Fallback,
];

/// The request being decided, parsed once.
struct RequestContext {
    /// Lower-cased host; `None` when the URL did not parse.
    host: Option<String>,
}

impl RequestContext {
    fn parse(url: &str) -> Self {
        let host = Url::parse(url)
            .ok()
            .map(|parsed| parsed.host_str().unwrap_or_default().to_lowercase());
        Self { host }
    }
}

impl DecisionRule {
    /// Applies this rule alone; `None` passes the request to the next rule.
    fn apply(self, request: &RequestContext, snapshot: &Snapshot) -> Option<ProxyDecision> {
        match self {
            DecisionRule::MasterSwitch => {
                (!snapshot.global.master_enabled).then_some(ProxyDecision::Direct)
            }
            DecisionRule::UnparseableUrl => request.host.is_none().then_some(ProxyDecision::Direct),
            DecisionRule::Whitelist => {
                let host = request.host.as_deref()?;
                is_whitelisted(host, snapshot.rules.whitelist()).then_some(ProxyDecision::Direct)
            }
            DecisionRule::HostMapping => {
                let host = request.host.as_deref()?;
                resolve_mapping(
                    host,
                    snapshot.rules.host_index(),
                    &snapshot.profiles,
                    snapshot.global.default_profile_id.as_deref(),
                )
                .map(ProxyDecision::via)
            }
            DecisionRule::GlobalDefault => {
                if !snapshot.global.global_proxy_enabled {
                    return None;
                }
                snapshot.default_profile().map(ProxyDecision::via)
            }
            DecisionRule::Fallback => Some(ProxyDecision::Direct),
        }
    }
}

/// A decision together with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub decision: ProxyDecision,
    pub rule: DecisionRule,
}

/// Evaluates the precedence rules for `url` against one snapshot.
pub fn evaluate(url: &str, snapshot: &Snapshot) -> Verdict {
    let request = RequestContext::parse(url);

    for rule in DECISION_RULES {
        if let Some(decision) = rule.apply(&request, snapshot) {
            trace!(url = %url, host = ?request.host, rule = ?rule, "Decision rule applied");
            return Verdict { decision, rule };
        }
    }

    // Fallback always applies.
    Verdict {
        decision: ProxyDecision::Direct,
        rule: DecisionRule::Fallback,
    }
}

/// Decides how the request for `url` should be routed.
pub fn decide(url: &str, snapshot: &Snapshot) -> ProxyDecision {
    evaluate(url, snapshot).decision
}

/// Holds the active snapshot and answers requests against it.
///
/// Reads are lock-free; [`publish`](Self::publish) replaces the whole
/// snapshot atomically, so a request never sees parts of two snapshots.
pub struct DecisionEngine {
    snapshot: ArcSwap<Snapshot>,
}

impl DecisionEngine {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Current snapshot; stays valid while the guard is held.
    pub fn load(&self) -> Guard<Arc<Snapshot>> {
        self.snapshot.load()
    }

    /// Swaps in a new snapshot.
    pub fn publish(&self, snapshot: Snapshot) {
        self.snapshot.store(Arc::new(snapshot));
        debug!("Routing snapshot published");
    }

    pub fn evaluate(&self, request: &RequestDescriptor) -> Verdict {
        let snapshot = self.snapshot.load();
        evaluate(&request.url, &snapshot)
    }

    pub fn decide(&self, request: &RequestDescriptor) -> ProxyDecision {
        self.evaluate(request).decision
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new(Snapshot::default())
    }
}
