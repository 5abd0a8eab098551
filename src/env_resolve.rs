//! Environment-variable substitution and top-env linking over a resolved
//! spec tree (§4.1, "Environment resolution" and "Top-env linking").
//!
//! Both passes walk every `env` value in the tree, recursing into nested
//! JSON objects and arrays, and rewrite strings matching a reserved prefix.
//! They run strictly in order: env resolution first, then top-env linking
//! (a link may point at an already-`process.env.`-resolved root value, but
//! a `process.env.` value is never itself a link target).

use std::collections::BTreeMap;
use std::env as process_env;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::spec::Spec;

const ENV_PREFIX: &str = "process.env.";
const LINK_PREFIX: &str = "$._.env.";

/// Resolves every `process.env.NAME||default` string in `spec`'s env tree
/// (recursively, including child components) against the real process
/// environment.
pub fn resolve_env(spec: &mut Spec) -> Result<()> {
    resolve_env_map(&mut spec.env)?;
    if let Some(children) = &mut spec.components {
        for child in children {
            resolve_env(child)?;
        }
    }
    Ok(())
}

fn resolve_env_map(env: &mut BTreeMap<String, Value>) -> Result<()> {
    for value in env.values_mut() {
        resolve_env_value(value)?;
    }
    Ok(())
}

fn resolve_env_value(value: &mut Value) -> Result<()> {
    match value {
        Value::String(s) => {
            if let Some(rest) = s.strip_prefix(ENV_PREFIX) {
                *value = resolve_process_env_ref(rest);
            }
        }
        Value::Object(map) => {
            for v in map.values_mut() {
                resolve_env_value(v)?;
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                resolve_env_value(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// `name||default` → look up `name` in the process environment; if present,
/// JSON-parse its value (falling back to the raw string on parse failure);
/// otherwise apply the same parse to `default`, or leave `Value::Null` if
/// there isn't one.
fn resolve_process_env_ref(rest: &str) -> Value {
    let (name, default) = match rest.split_once("||") {
        Some((name, default)) => (name, Some(default)),
        None => (rest, None),
    };

    match process_env::var(name) {
        Ok(raw) => parse_or_raw(&raw),
        Err(_) => match default {
            Some(default) => parse_or_raw(default),
            None => Value::Null,
        },
    }
}

fn parse_or_raw(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Resolves every `$._.env.KEY` string in `spec`'s env tree (recursively)
/// against `spec.env` itself — `spec` is expected to already be the root of
/// the tree by the time this runs, so `$._`  always means "this tree's
/// root".
pub fn resolve_links(spec: &mut Spec) -> Result<()> {
    let root_env = spec.env.clone();
    resolve_links_map(&mut spec.env, &root_env)?;
    if let Some(children) = &mut spec.components {
        for child in children {
            resolve_links_recursive(child, &root_env)?;
        }
    }
    Ok(())
}

fn resolve_links_recursive(spec: &mut Spec, root_env: &BTreeMap<String, Value>) -> Result<()> {
    resolve_links_map(&mut spec.env, root_env)?;
    if let Some(children) = &mut spec.components {
        for child in children {
            resolve_links_recursive(child, root_env)?;
        }
    }
    Ok(())
}

fn resolve_links_map(env: &mut BTreeMap<String, Value>, root_env: &BTreeMap<String, Value>) -> Result<()> {
    for value in env.values_mut() {
        resolve_link_value(value, root_env)?;
    }
    Ok(())
}

fn resolve_link_value(value: &mut Value, root_env: &BTreeMap<String, Value>) -> Result<()> {
    match value {
        Value::String(s) => {
            if let Some(key) = s.strip_prefix(LINK_PREFIX) {
                *value = root_env.get(key).cloned().ok_or_else(|| {
                    Error::invalid_spec(
                        "<env-link>",
                        format!("`$._.env.{key}` does not name a root env key"),
                    )
                })?;
            }
        }
        Value::Object(map) => {
            for v in map.values_mut() {
                resolve_link_value(v, root_env)?;
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                resolve_link_value(v, root_env)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// §8 invariant 1: after both passes, no string in the tree still matches
/// either reserved prefix. Exposed for tests and for defensive assertions
/// in the loader.
pub fn has_unresolved_refs(spec: &Spec) -> bool {
    fn value_has_ref(value: &Value) -> bool {
        match value {
            Value::String(s) => s.starts_with(ENV_PREFIX) || s.starts_with(LINK_PREFIX),
            Value::Object(map) => map.values().any(value_has_ref),
            Value::Array(items) => items.iter().any(value_has_ref),
            _ => false,
        }
    }
    spec.env.values().any(value_has_ref)
        || spec
            .components
            .as_ref()
            .map(|children| children.iter().any(has_unresolved_refs))
            .unwrap_or(false)
}
