//! KDL document parsing.

use ::kdl::KdlDocument;
use anyhow::{anyhow, Result};
use tracing::trace;

use crate::Config;

mod helpers;
mod sections;

use helpers::{get_first_arg_string, get_string_args};
use sections::{parse_acme, parse_cache, parse_challenge, parse_renewal};

const TOP_LEVEL: &[&str] = &[
    "acme",
    "hosts",
    "client-host",
    "cache",
    "renewal",
    "challenge",
];

/// Parse a whole configuration document on top of the defaults.
pub fn parse_document(content: &str) -> Result<Config> {
    let doc: KdlDocument = content
        .parse()
        .map_err(|e: ::kdl::KdlError| anyhow!("KDL syntax error: {}", e))?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "acme" => config.acme = parse_acme(node)?,
            "hosts" => {
                let hosts = get_string_args(node)?;
                trace!(count = hosts.len(), "Parsed hosts");
                config.hosts.extend(hosts);
            }
            "client-host" => {
                let host = get_first_arg_string(node).ok_or_else(|| {
                    anyhow!("'client-host' requires a hostname, e.g., client-host \"renewer-01\"")
                })?;
                config.client_host = Some(host);
            }
            "cache" => config.cache = parse_cache(node)?,
            "renewal" => config.renewal = parse_renewal(node)?,
            "challenge" => config.challenge = parse_challenge(node)?,
            other => {
                return Err(anyhow!(
                    "Unknown configuration block '{}'. Valid blocks: {}",
                    other,
                    TOP_LEVEL.join(", ")
                ));
            }
        }
    }

    trace!(hosts = config.hosts.len(), "Finished parsing configuration");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackingConfig;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_empty_document_is_defaults() {
        assert_eq!(parse_document("").unwrap(), Config::default());
    }

    #[test]
    fn test_full_document() {
        let config = parse_document(
            r#"
            acme {
                provider "letsencrypt"
                email "ops@example.com"
                renew-before "240h"
                user-agent "fleet/1"
                root-ca "/etc/certfleet/root.pem"
            }
            hosts "a.example.com" "b.example.com"
            hosts "c.example.com"
            client-host "renewer-01"
            cache {
                local-dir "/tmp/local"
                backing "dir" "/tmp/shared"
                file-mode 0o640
            }
            renewal {
                refresh-interval "1s"
                stop-timeout "10s"
            }
            challenge {
                address "127.0.0.1:5002"
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.acme.provider, "letsencrypt");
        assert_eq!(config.acme.email.as_deref(), Some("ops@example.com"));
        assert_eq!(config.acme.renew_before, Duration::from_secs(240 * 3600));
        assert_eq!(config.acme.user_agent, "fleet/1");
        assert_eq!(
            config.acme.root_ca,
            Some(PathBuf::from("/etc/certfleet/root.pem"))
        );
        assert_eq!(
            config.hosts,
            vec!["a.example.com", "b.example.com", "c.example.com"]
        );
        assert_eq!(config.client_host.as_deref(), Some("renewer-01"));
        assert_eq!(config.cache.local_dir, PathBuf::from("/tmp/local"));
        assert_eq!(
            config.cache.backing,
            BackingConfig::Dir {
                path: PathBuf::from("/tmp/shared")
            }
        );
        assert_eq!(config.cache.file_mode, 0o640);
        assert_eq!(config.renewal.refresh_interval, Duration::from_secs(1));
        assert_eq!(config.renewal.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.challenge.address, "127.0.0.1:5002");
    }

    #[test]
    fn test_memory_backing() {
        let config = parse_document(r#"cache { backing "memory"; }"#).unwrap();
        assert_eq!(config.cache.backing, BackingConfig::Memory);
    }

    #[test]
    fn test_errors_name_the_problem() {
        let cases = [
            (r#"acmee { }"#, "acmee"),
            (r#"acme { provder "x"; }"#, "provder"),
            (r#"acme { renew-before "soon"; }"#, "renew-before"),
            (r#"acme { renew-before 720; }"#, "renew-before"),
            (r#"cache { backing "s3"; }"#, "s3"),
            (r#"cache { backing "dir"; }"#, "requires a path"),
            (r#"cache { file-mode 0o7777; }"#, "file-mode"),
            (r#"hosts "a.com" 42"#, "hosts"),
            (r#"client-host"#, "client-host"),
        ];

        for (doc, needle) in cases {
            let err = parse_document(doc).unwrap_err().to_string();
            assert!(err.contains(needle), "{doc:?}: {err}");
        }
    }

    #[test]
    fn test_syntax_error() {
        let err = parse_document("acme {").unwrap_err();
        assert!(err.to_string().contains("KDL syntax error"));
    }
}
