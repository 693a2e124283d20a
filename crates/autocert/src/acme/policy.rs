//! Host policies
//!
//! A policy decides whether a certificate may be obtained for a host. It is
//! consulted before the cache or the provider is touched.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::error::AcmeError;

/// Accepts or rejects a host name.
pub type HostPolicy = Arc<dyn Fn(&str) -> Result<(), AcmeError> + Send + Sync>;

/// Policy accepting exactly the given hosts, compared after
/// [`normalize_host`]. There is no wildcard or suffix matching.
pub fn host_whitelist<I, S>(hosts: I) -> HostPolicy
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let allowed: HashSet<String> = hosts
        .into_iter()
        .map(|h| normalize_host(h.as_ref()))
        .filter(|h| !h.is_empty())
        .collect();

    Arc::new(move |host: &str| {
        if allowed.contains(&normalize_host(host)) {
            Ok(())
        } else {
            debug!(host = %host, "Rejected host outside whitelist");
            Err(AcmeError::HostNotAllowed(host.to_string()))
        }
    })
}

/// Wrap `policy` so that hosts carrying a `:port` suffix, as challenge
/// requests on a non-standard port do, are checked without it.
pub fn strip_port(policy: HostPolicy) -> HostPolicy {
    Arc::new(move |host: &str| policy(split_port(host)))
}

/// Host part of a `host[:port]` authority. Bracketed IPv6 literals keep
/// their brackets stripped.
pub fn split_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split_once(']').map(|(h, _)| h).unwrap_or(authority);
    }
    match authority.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            host
        }
        _ => authority,
    }
}

/// Lowercase and drop one trailing root dot.
pub(crate) fn normalize_host(host: &str) -> String {
    host.strip_suffix('.').unwrap_or(host).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist() {
        let policy = host_whitelist(["a.com", "b.com"]);
        assert!(policy("a.com").is_ok());
        assert!(policy("b.com").is_ok());
        assert!(policy("B.COM").is_ok());
        assert!(policy("a.com.").is_ok());

        let err = policy("c.com").unwrap_err();
        assert!(matches!(&err, AcmeError::HostNotAllowed(h) if h == "c.com"));
        assert!(err.to_string().contains("c.com"));
    }

    #[test]
    fn test_whitelist_matches_whole_names_only() {
        let policy = host_whitelist(["A.com."]);
        assert!(policy("a.com").is_ok());
        assert!(policy("sub.a.com").is_err());
        assert!(policy("a.co").is_err());
        assert!(policy("a.com..").is_err());
    }

    #[test]
    fn test_empty_whitelist_rejects_everything() {
        let policy = host_whitelist(Vec::<String>::new());
        assert!(policy("a.com").is_err());
        assert!(policy("").is_err());
    }

    #[test]
    fn test_whitelist_does_not_match_ports() {
        let policy = host_whitelist(["a.com"]);
        assert!(policy("a.com:5002").is_err());

        let policy = strip_port(policy);
        assert!(policy("a.com:5002").is_ok());
        assert!(policy("a.com").is_ok());
        assert!(policy("c.com:80").is_err());
    }

    #[test]
    fn test_split_port() {
        assert_eq!(split_port("a.com"), "a.com");
        assert_eq!(split_port("a.com:80"), "a.com");
        assert_eq!(split_port("[::1]:80"), "::1");
        assert_eq!(split_port("::1"), "::1");
        assert_eq!(split_port("a.com:http"), "a.com:http");
    }
}
