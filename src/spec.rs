//! The resolved (or partially-resolved) description of one component, and
//! its children.
//!
//! A [`Spec`] is shared between three roles described in the spec's data
//! model: a template, a delta (spec-override), and the fully-resolved tree
//! the loader ultimately consumes. The only field whose meaning changes
//! across those roles is `module`: a template or resolved spec always
//! carries a module path, but a delta may omit it (no opinion, keep the
//! template's) or set it to JSON `null` (delete this component). Plain
//! `Option<String>` can't distinguish "key absent" from "key present and
//! null", so `module` is stored as the double-option tri-state below.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `env` values are arbitrary JSON — object, array, number, string, bool or
/// null — per the spec's data model. Keyed in a `BTreeMap` so iteration
/// order (and therefore env-resolution/linking output) is deterministic.
pub type Env = BTreeMap<String, Value>;

/// The declarative description of one component and, recursively, its
/// children.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub name: String,

    /// Tri-state module reference:
    /// - `None` — key absent, "no opinion" (only meaningful in a delta).
    /// - `Some(None)` — explicit JSON `null`, "delete this component".
    /// - `Some(Some(path))` — a `pkg#ns#factory`-shaped module path.
    #[serde(
        default,
        with = "serde_with::rust::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub module: Option<Option<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub env: Env,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<Spec>>,
}

impl Spec {
    /// A freshly-named spec with no module set yet (useful for building
    /// deltas in tests without the double-option ceremony).
    pub fn new(name: impl Into<String>) -> Self {
        Spec {
            name: name.into(),
            module: None,
            description: None,
            env: Env::new(),
            components: None,
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(Some(module.into()));
        self
    }

    /// Marks this spec, when used as a delta entry, as "delete this
    /// component" (`module: null`).
    pub fn deletion_marker(name: impl Into<String>) -> Self {
        Spec {
            name: name.into(),
            module: Some(None),
            ..Spec::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_components(mut self, components: Vec<Spec>) -> Self {
        self.components = Some(components);
        self
    }

    /// `true` if this spec (as a delta entry) signals "delete this
    /// component", i.e. `module` was explicitly JSON `null`.
    pub fn is_deletion_marker(&self) -> bool {
        matches!(self.module, Some(None))
    }

    /// The resolved module path, if any is set.
    pub fn module_path(&self) -> Option<&str> {
        self.module.as_ref().and_then(|inner| inner.as_deref())
    }

    /// The module path, failing with `InvalidSpec` if this spec has no
    /// module set — the state every spec must be in by the time the loader
    /// tries to instantiate it.
    pub fn require_module(&self) -> crate::error::Result<&str> {
        self.module_path().ok_or_else(|| {
            crate::error::Error::invalid_spec(&self.name, "component has no module set")
        })
    }

    /// Splits `module_path` on `#` into `(module_name, accessor_chain)`, per
    /// the loader's `pkg#ns#factory` convention.
    pub fn module_accessor_chain(&self) -> crate::error::Result<(&str, Vec<&str>)> {
        let path = self.require_module()?;
        let mut parts = path.split('#');
        let module_name = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| {
            crate::error::Error::invalid_spec(&self.name, "empty module path")
        })?;
        Ok((module_name, parts.collect()))
    }

    pub fn env_bool(&self, key: &str) -> Option<bool> {
        self.env.get(key).and_then(Value::as_bool)
    }

    pub fn env_u64(&self, key: &str) -> Option<u64> {
        self.env.get(key).and_then(Value::as_u64)
    }

    pub fn env_i64(&self, key: &str) -> Option<i64> {
        self.env.get(key).and_then(Value::as_i64)
    }

    pub fn env_str(&self, key: &str) -> Option<&str> {
        self.env.get(key).and_then(Value::as_str)
    }

    /// Validates structural invariants that must hold for any spec the
    /// loader is about to instantiate: a non-empty name, and (recursively)
    /// unique names among `components`.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.name.is_empty() {
            return Err(crate::error::Error::invalid_spec(
                &self.name,
                "component name must not be empty",
            ));
        }
        if let Some(children) = &self.components {
            let mut seen = std::collections::HashSet::new();
            for child in children {
                if !seen.insert(child.name.as_str()) {
                    return Err(crate::error::Error::invalid_spec(
                        &self.name,
                        format!("duplicate child name `{}`", child.name),
                    ));
                }
                child.validate()?;
            }
        }
        Ok(())
    }
}

/// Reserved context keys that are never "unknown" children and are never
/// themselves subject to supervision.
pub const RESERVED_NAMES: &[&str] = &["_", "loader", "ca"];

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Marks a child spec as temporary: its own checkup failures are not
/// escalated to a parent-triggered restart (§7, "Temporary children").
pub const ENV_TEMPORARY: &str = "__ca_temporary__";

/// Marks a child as not-unknown even though it isn't declared in
/// `spec.components` (the "proxy" carve-out in §4.4 step 2).
pub const ENV_NOT_UNKNOWN: &str = "__ca_isNotUnknown__";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_tristate_roundtrips() {
        let present = Spec::new("a").with_module("pkg#ns#factory");
        let json = serde_json::to_value(&present).unwrap();
        assert_eq!(json["module"], "pkg#ns#factory");
        let back: Spec = serde_json::from_value(json).unwrap();
        assert_eq!(back.module_path(), Some("pkg#ns#factory"));

        let deleted = Spec::deletion_marker("a");
        assert!(deleted.is_deletion_marker());
        let json = serde_json::to_value(&deleted).unwrap();
        assert!(json["module"].is_null());
        let back: Spec = serde_json::from_value(json).unwrap();
        assert!(back.is_deletion_marker());

        let absent: Spec = serde_json::from_value(serde_json::json!({ "name": "a" })).unwrap();
        assert_eq!(absent.module, None);
        assert!(!absent.is_deletion_marker());
    }

    #[test]
    fn accessor_chain_splits_on_hash() {
        let spec = Spec::new("a").with_module("pkg#ns#factory");
        let (module, chain) = spec.module_accessor_chain().unwrap();
        assert_eq!(module, "pkg");
        assert_eq!(chain, vec!["ns", "factory"]);
    }

    #[test]
    fn duplicate_child_names_rejected() {
        let spec = Spec::new("root").with_components(vec![
            Spec::new("a").with_module("m"),
            Spec::new("a").with_module("m"),
        ]);
        assert!(spec.validate().is_err());
    }
}
