//! Access guard: caller IP allow-list, shared-secret token, kill-switch.
//!
//! Checks run in a fixed order and the first failure wins. Nothing here has
//! side effects, so the guard always runs before the run lock is touched.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::config::DeployConfig;

/// Outcome of [`authorize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny(String),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow)
    }
}

/// One IP allow-list entry: a literal address or a CIDR range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowEntry {
    network: IpAddr,
    prefix_len: u8,
}

impl AllowEntry {
    /// Whether `addr` matches this entry. Families never cross-match.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix_len);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix_len);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl FromStr for AllowEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, bits) = match s.split_once('/') {
            Some((addr, bits)) => (addr, Some(bits)),
            None => (s, None),
        };
        let network = addr
            .parse::<IpAddr>()
            .map_err(|_| format!("'{addr}' is not an IP address"))?
            .to_canonical();
        let width = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match bits {
            None => width,
            Some(bits) => {
                let bits: u8 = bits
                    .parse()
                    .map_err(|_| format!("'{bits}' is not a prefix length"))?;
                if bits > width {
                    return Err(format!("prefix length {bits} exceeds {width}"));
                }
                bits
            }
        };
        Ok(Self {
            network,
            prefix_len,
        })
    }
}

impl fmt::Display for AllowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn prefix_mask_u32(bits: u8) -> u32 {
    match bits {
        0 => 0,
        b if b >= 32 => u32::MAX,
        b => u32::MAX << (32 - u32::from(b)),
    }
}

fn prefix_mask_u128(bits: u8) -> u128 {
    match bits {
        0 => 0,
        b if b >= 128 => u128::MAX,
        b => u128::MAX << (128 - u32::from(b)),
    }
}

/// Whether `caller` matches any entry of `allow_list`.
///
/// Unparseable callers and entries never match.
pub fn ip_allowed(caller: &str, allow_list: &[String]) -> bool {
    let Ok(addr) = caller.trim().parse::<IpAddr>() else {
        return false;
    };
    allow_list
        .iter()
        .filter_map(|entry| entry.parse::<AllowEntry>().ok())
        .any(|entry| entry.contains(addr))
}

/// Compare a supplied token with the configured secret.
///
/// An empty secret never matches. Both sides are hashed first so the
/// comparison covers fixed-width digests and does not exit early.
pub fn token_matches(supplied: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let a = Sha256::digest(supplied.as_bytes());
    let b = Sha256::digest(secret.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Short, non-reversible fingerprint of a token for audit logs.
pub fn token_fingerprint(token: &str) -> String {
    if token.is_empty() {
        return "none".to_string();
    }
    hex::encode(&Sha256::digest(token.as_bytes())[..4])
}

/// Authorize a caller: IP allow-list, then token, then the kill-switch.
pub fn authorize(caller: &str, supplied_token: &str, config: &DeployConfig) -> AccessDecision {
    if !config.ip_allow.is_empty() && !ip_allowed(caller, &config.ip_allow) {
        return AccessDecision::Deny(format!("caller {caller} is not in the IP allow-list"));
    }
    if config.access_token.is_empty() {
        return AccessDecision::Deny("access token is not configured".to_string());
    }
    if !token_matches(supplied_token, &config.access_token) {
        return AccessDecision::Deny("invalid access token".to_string());
    }
    if config.disabled {
        return AccessDecision::Deny("deployments are disabled".to_string());
    }
    AccessDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ip_allow: &[&str]) -> DeployConfig {
        DeployConfig {
            access_token: "s3cret".to_string(),
            ip_allow: ip_allow.iter().map(|s| s.to_string()).collect(),
            ..DeployConfig::default()
        }
    }

    #[test]
    fn test_literal_entries() {
        let list = vec!["203.0.113.7".to_string(), "2001:db8::1".to_string()];
        assert!(ip_allowed("203.0.113.7", &list));
        assert!(!ip_allowed("203.0.113.8", &list));
        assert!(ip_allowed("2001:db8::1", &list));
        assert!(!ip_allowed("2001:db8::2", &list));
    }

    #[test]
    fn test_ipv4_mapped_caller_matches_ipv4_range() {
        let list = vec!["10.1.0.0/16".to_string()];
        assert!(ip_allowed("::ffff:10.1.2.3", &list));
    }

    #[test]
    fn test_families_do_not_cross_match() {
        let list = vec!["0.0.0.0/0".to_string()];
        assert!(ip_allowed("198.51.100.1", &list));
        assert!(!ip_allowed("2001:db8::1", &list));
    }

    #[test]
    fn test_garbage_never_matches() {
        let list = vec!["not-an-ip".to_string(), "10.0.0.0/99".to_string()];
        assert!(!ip_allowed("10.0.0.1", &list));
        assert!(!ip_allowed("unknown", &["10.0.0.0/8".to_string()]));
    }

    #[test]
    fn test_entry_parse_errors() {
        assert!("10.0.0.0/33".parse::<AllowEntry>().is_err());
        assert!("::/129".parse::<AllowEntry>().is_err());
        assert!("10.0.0.0/x".parse::<AllowEntry>().is_err());
        assert_eq!("10.0.0.1".parse::<AllowEntry>().unwrap().prefix_len(), 32);
        assert_eq!("::1".parse::<AllowEntry>().unwrap().prefix_len(), 128);
    }

    #[test]
    fn test_token_rules() {
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cret ", "s3cret"));
        assert!(!token_matches("", "s3cret"));
        assert!(!token_matches("", ""));
        assert!(!token_matches("anything", ""));
    }

    #[test]
    fn test_authorize_order() {
        let cfg = config(&["10.0.0.0/8"]);
        assert_eq!(authorize("10.2.3.4", "s3cret", &cfg), AccessDecision::Allow);

        match authorize("192.168.1.1", "s3cret", &cfg) {
            AccessDecision::Deny(reason) => assert!(reason.contains("allow-list")),
            AccessDecision::Allow => panic!("expected deny"),
        }
        match authorize("10.2.3.4", "wrong", &cfg) {
            AccessDecision::Deny(reason) => assert!(reason.contains("token")),
            AccessDecision::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn test_empty_secret_denies_even_with_empty_token() {
        let cfg = DeployConfig::default();
        assert!(!authorize("127.0.0.1", "", &cfg).is_allowed());
    }

    #[test]
    fn test_disabled_denies_valid_caller() {
        let mut cfg = config(&[]);
        cfg.disabled = true;
        assert_eq!(
            authorize("127.0.0.1", "s3cret", &cfg),
            AccessDecision::Deny("deployments are disabled".to_string())
        );
    }

    #[test]
    fn test_fingerprint_hides_token() {
        let fp = token_fingerprint("s3cret");
        assert_eq!(fp.len(), 8);
        assert!(!fp.contains("s3cret"));
        assert_eq!(token_fingerprint(""), "none");
    }
}
