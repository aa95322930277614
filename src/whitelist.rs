//! Whitelist matching.
//!
//! An entry is interpreted when matched, in this order:
//!
//! 1. exact host
//! 2. parent domain (`example.com` covers `a.example.com`), for names only
//! 3. `a.b.c.0/24`, compared textually against the first three octets of
//!    an IPv4 host
//!
//! Anything else never matches. Comparisons are purely structural; no
//! name is ever resolved.

use once_cell::sync::Lazy;
use regex::Regex;

static IPV4_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[0-9]{1,3}\.){3}[0-9]{1,3}$").expect("valid IPv4 pattern"));

static CIDR_24: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[0-9]{1,3}\.){3}0/24$").expect("valid CIDR pattern"));

/// Whether `host` has the dotted-quad shape (octet ranges are not checked).
pub fn is_ipv4_literal(host: &str) -> bool {
    IPV4_LITERAL.is_match(host)
}

/// Whether `host` is a strict subdomain of `domain`, i.e. ends with
/// `"." + domain`.
pub fn is_subdomain_of(host: &str, domain: &str) -> bool {
    host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// Matches one normalized host against one normalized entry.
pub fn matches_entry(host: &str, entry: &str) -> bool {
    if host.is_empty() || entry.is_empty() {
        return false;
    }

    if host == entry {
        return true;
    }

    let host_is_ipv4 = is_ipv4_literal(host);
    if !host_is_ipv4 && !host.contains(':') {
        return is_subdomain_of(host, entry);
    }

    if host_is_ipv4 && CIDR_24.is_match(entry) {
        let base = entry.trim_end_matches("/24");
        return base.split('.').take(3).eq(host.split('.').take(3));
    }

    false
}

/// Whether any whitelist entry exempts `host` from proxying.
pub fn is_whitelisted(host: &str, whitelist: &[String]) -> bool {
    whitelist.iter().any(|entry| matches_entry(host, entry))
}
