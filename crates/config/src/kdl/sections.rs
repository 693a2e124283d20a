//! Block parsers for the configuration document.

use std::path::PathBuf;

use ::kdl::KdlNode;
use anyhow::{anyhow, Result};
use tracing::trace;

use crate::{AcmeConfig, BackingConfig, CacheConfig, ChallengeConfig, RenewalConfig};

use super::helpers::{
    check_children, get_duration_entry, get_int_entry, get_string_args, get_string_entry,
};

/// Parse the `acme { ... }` block
pub fn parse_acme(node: &KdlNode) -> Result<AcmeConfig> {
    trace!("Parsing acme block");
    check_children(
        node,
        &["provider", "email", "renew-before", "user-agent", "root-ca"],
    )?;

    let defaults = AcmeConfig::default();
    let config = AcmeConfig {
        provider: get_string_entry(node, "provider")?.unwrap_or(defaults.provider),
        email: get_string_entry(node, "email")?,
        renew_before: get_duration_entry(node, "renew-before")?.unwrap_or(defaults.renew_before),
        user_agent: get_string_entry(node, "user-agent")?.unwrap_or(defaults.user_agent),
        root_ca: get_string_entry(node, "root-ca")?.map(PathBuf::from),
    };

    trace!(
        provider = %config.provider,
        renew_before = ?config.renew_before,
        "Parsed acme block"
    );
    Ok(config)
}

/// Parse the `cache { ... }` block
pub fn parse_cache(node: &KdlNode) -> Result<CacheConfig> {
    trace!("Parsing cache block");
    check_children(node, &["local-dir", "backing", "file-mode"])?;

    let defaults = CacheConfig::default();

    let backing = match node.children().and_then(|c| c.get("backing")) {
        Some(backing) => parse_backing(backing)?,
        None => defaults.backing,
    };

    let file_mode = match get_int_entry(node, "file-mode")? {
        Some(mode) => u32::try_from(mode)
            .ok()
            .filter(|m| *m <= 0o777)
            .ok_or_else(|| anyhow!("'file-mode' must be between 0o000 and 0o777, got {mode:#o}"))?,
        None => defaults.file_mode,
    };

    let config = CacheConfig {
        local_dir: get_string_entry(node, "local-dir")?
            .map(PathBuf::from)
            .unwrap_or(defaults.local_dir),
        backing,
        file_mode,
    };

    trace!(
        local_dir = %config.local_dir.display(),
        backing = config.backing.kind(),
        "Parsed cache block"
    );
    Ok(config)
}

/// Parse `backing "dir" "/path"` or `backing "memory"`
fn parse_backing(node: &KdlNode) -> Result<BackingConfig> {
    let args = get_string_args(node)?;
    match args.first().map(String::as_str) {
        Some("dir") => {
            let path = args.get(1).ok_or_else(|| {
                anyhow!("Backing 'dir' requires a path, e.g., backing \"dir\" \"/mnt/shared/certs\"")
            })?;
            Ok(BackingConfig::Dir {
                path: PathBuf::from(path),
            })
        }
        Some("memory") => Ok(BackingConfig::Memory),
        Some(other) => Err(anyhow!(
            "Invalid backing '{}'. Valid backings: dir, memory",
            other
        )),
        None => Err(anyhow!(
            "'backing' requires a kind, e.g., backing \"dir\" \"/mnt/shared/certs\""
        )),
    }
}

/// Parse the `renewal { ... }` block
pub fn parse_renewal(node: &KdlNode) -> Result<RenewalConfig> {
    trace!("Parsing renewal block");
    check_children(node, &["refresh-interval", "stop-timeout"])?;

    let defaults = RenewalConfig::default();
    Ok(RenewalConfig {
        refresh_interval: get_duration_entry(node, "refresh-interval")?
            .unwrap_or(defaults.refresh_interval),
        stop_timeout: get_duration_entry(node, "stop-timeout")?.unwrap_or(defaults.stop_timeout),
    })
}

/// Parse the `challenge { ... }` block
pub fn parse_challenge(node: &KdlNode) -> Result<ChallengeConfig> {
    trace!("Parsing challenge block");
    check_children(node, &["address"])?;

    Ok(ChallengeConfig {
        address: get_string_entry(node, "address")?
            .unwrap_or_else(crate::default_challenge_address),
    })
}
