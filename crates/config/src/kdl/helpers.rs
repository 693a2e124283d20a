//! Accessors for the `name value` child nodes used throughout the config.

use std::time::Duration;

use ::kdl::{KdlNode, KdlValue};
use anyhow::{anyhow, Result};

/// First positional argument of a node.
fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

/// First positional argument of the child named `name`.
fn child_arg<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    node.children()?.get(name).and_then(first_arg)
}

/// String argument of a node, e.g. `client-host "renewer-01"`.
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    first_arg(node)?.as_string().map(str::to_string)
}

/// All positional string arguments of a node, e.g. `hosts "a" "b"`.
pub fn get_string_args(node: &KdlNode) -> Result<Vec<String>> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| {
            e.value().as_string().map(str::to_string).ok_or_else(|| {
                anyhow!(
                    "'{}' expects string arguments, found {}",
                    node.name().value(),
                    e.value()
                )
            })
        })
        .collect()
}

/// String value of child `name`. Present but not a string is an error.
pub fn get_string_entry(node: &KdlNode, name: &str) -> Result<Option<String>> {
    match child_arg(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_string()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| anyhow!("'{}' must be a string, found {}", name, value)),
    }
}

pub fn get_int_entry(node: &KdlNode, name: &str) -> Result<Option<i128>> {
    match child_arg(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .map(Some)
            .ok_or_else(|| anyhow!("'{}' must be an integer, found {}", name, value)),
    }
}

/// Duration in humantime syntax (`"720h"`, `"1m 30s"`).
pub fn get_duration_entry(node: &KdlNode, name: &str) -> Result<Option<Duration>> {
    let Some(raw) = get_string_entry(node, name)? else {
        return Ok(None);
    };
    humantime::parse_duration(&raw)
        .map(Some)
        .map_err(|e| anyhow!("'{}' has invalid duration '{}': {}", name, raw, e))
}

/// Reject child nodes other than `allowed`, catching typos that would
/// otherwise silently fall back to defaults.
pub fn check_children(node: &KdlNode, allowed: &[&str]) -> Result<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        let name = child.name().value();
        if !allowed.contains(&name) {
            return Err(anyhow!(
                "Unknown setting '{}' in '{}' block. Valid settings: {}",
                name,
                node.name().value(),
                allowed.join(", ")
            ));
        }
    }
    Ok(())
}
