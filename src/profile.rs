//! Proxy profile registry.
//!
//! Profiles arrive as loosely-typed JSON records written by the settings
//! pages. Each record is coerced field by field; anything that cannot
//! yield an id, a name, a host and a valid port is dropped without error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Upstream proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    /// SOCKS5.
    Socks,
    Socks4,
}

impl ProxyType {
    /// Maps a stored type name onto a protocol, case-insensitively.
    ///
    /// `socks5` is an alias of `socks`; unknown or empty names fall back
    /// to plain HTTP.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "https" => ProxyType::Https,
            "socks" | "socks5" => ProxyType::Socks,
            "socks4" => ProxyType::Socks4,
            _ => ProxyType::Http,
        }
    }

    fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(name)) => Self::from_name(name),
            _ => ProxyType::Http,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Socks => "socks",
            ProxyType::Socks4 => "socks4",
        }
    }

    /// Whether DNS lookups should happen on the proxy side of the tunnel.
    pub fn uses_proxy_dns(&self) -> bool {
        matches!(self, ProxyType::Socks | ProxyType::Socks4)
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated upstream proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyProfile {
    /// Unique identifier referenced by host mappings.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Proxy host name or address.
    pub host: String,

    /// Proxy port, 1-65535.
    pub port: u16,

    /// Proxy protocol.
    #[serde(rename = "type")]
    pub kind: ProxyType,
}

impl ProxyProfile {
    /// Coerces a stored record into a profile.
    ///
    /// Returns `None` when the record is not an object, when id, name or
    /// host are blank after trimming, or when the port is not an integer
    /// in 1..=65535.
    pub fn from_value(value: &Value) -> Option<Self> {
        let record = value.as_object()?;

        let id = coerce_string(record.get("id"));
        let name = coerce_string(record.get("name"));
        let host = coerce_string(record.get("host"));
        let port = coerce_port(record.get("port"));

        if id.is_empty() || name.is_empty() || host.is_empty() {
            return None;
        }

        Some(Self {
            id,
            name,
            host,
            port: port?,
            kind: ProxyType::from_value(record.get("type")),
        })
    }

    /// Renders the profile in its stored shape.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "host": self.host,
            "port": self.port,
            "type": self.kind.as_str(),
        })
    }
}

/// Coerces a loosely-typed field into a trimmed string.
///
/// Strings and numbers are accepted, `true` becomes `"true"`; every other
/// shape (missing, null, false, arrays, objects) becomes empty.
pub(crate) fn coerce_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(true)) => "true".to_string(),
        _ => String::new(),
    }
}

/// Coerces a loosely-typed port into a valid TCP port.
pub(crate) fn coerce_port(value: Option<&Value>) -> Option<u16> {
    let number = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match radix_literal(trimmed) {
                Some(parsed) => parsed? as f64,
                None => trimmed.parse::<f64>().ok()?,
            }
        }
        Value::Bool(true) => 1.0,
        _ => return None,
    };

    if number.fract() != 0.0 || !(1.0..=65535.0).contains(&number) {
        return None;
    }
    Some(number as u16)
}

/// Parses `0x`, `0o` and `0b` integer literals (no sign allowed).
///
/// Returns `None` when `s` has no such prefix and `Some(None)` when it has
/// one but the digits are invalid.
fn radix_literal(s: &str) -> Option<Option<u64>> {
    let radix = match s.get(..2)?.to_ascii_lowercase().as_str() {
        "0x" => 16,
        "0o" => 8,
        "0b" => 2,
        _ => return None,
    };
    let digits = &s[2..];
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Some(None);
    }
    Some(u64::from_str_radix(digits, radix).ok())
}

/// Validated profiles in stored order, indexed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileRegistry {
    profiles: Vec<ProxyProfile>,
    by_id: HashMap<String, ProxyProfile>,
}

impl ProfileRegistry {
    /// Validates raw profile records and indexes the survivors by id.
    ///
    /// Duplicate ids are all kept in the ordered list; the index holds
    /// the last one seen.
    pub fn normalize(raw: &[Value]) -> Self {
        let mut profiles = Vec::with_capacity(raw.len());
        for value in raw {
            match ProxyProfile::from_value(value) {
                Some(profile) => profiles.push(profile),
                None => debug!(record = %value, "Dropping malformed proxy profile"),
            }
        }

        let by_id = profiles
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();

        Self { profiles, by_id }
    }

    /// Profiles in stored order.
    pub fn profiles(&self) -> &[ProxyProfile] {
        &self.profiles
    }

    pub fn get(&self, id: &str) -> Option<&ProxyProfile> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
