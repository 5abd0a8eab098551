//! The description engine's `merge` operation: combining a template with a
//! delta (spec-override) into a fresh, fully independent `Spec`.
//!
//! This is the part of the source the design notes call out as easy to get
//! wrong by "naive hash-map diffing": the `components` merge is
//! order-sensitive and a delta can reorder children by touching an entry
//! (no changes, just a name match) to move an internal cursor, then
//! inserting new entries after it.

use crate::error::{Error, Result};
use crate::spec::Spec;

/// Merges `delta` onto `template`, returning a brand new `Spec`. Neither
/// input is mutated or retained by reference in the result (§8, invariant
/// 2: `merge` never mutates its inputs).
pub fn merge(template: &Spec, delta: &Spec, override_name: bool) -> Result<Spec> {
    if template.name != delta.name && !override_name {
        return Err(Error::invalid_spec(
            &template.name,
            format!(
                "delta name `{}` does not match template name `{}` and overrideName is false",
                delta.name, template.name
            ),
        ));
    }

    let name = if override_name && !delta.name.is_empty() {
        delta.name.clone()
    } else {
        template.name.clone()
    };

    let module = match &delta.module {
        // Non-empty module path in the delta wins.
        Some(Some(path)) if !path.is_empty() => Some(Some(path.clone())),
        // Explicit `null` or an empty string in the delta carries no
        // scalar-merge opinion at this level — deletion is handled one
        // level up, by `merge_components`, before `merge` is ever called
        // recursively on a deleted entry.
        _ => template.module.clone(),
    };

    let description = match &delta.description {
        Some(d) if !d.is_empty() => Some(d.clone()),
        _ => template.description.clone(),
    };

    let mut env = template.env.clone();
    for (key, value) in &delta.env {
        env.insert(key.clone(), value.clone());
    }

    let components = merge_components(template.components.as_deref(), delta.components.as_deref())?;

    Ok(Spec {
        name,
        module,
        description,
        env,
        components,
    })
}

/// The order-sensitive `components` merge described in §4.1.
fn merge_components(
    template: Option<&[Spec]>,
    delta: Option<&[Spec]>,
) -> Result<Option<Vec<Spec>>> {
    let template = template.unwrap_or(&[]);
    let delta = match delta {
        Some(d) => d,
        None => return Ok(if template.is_empty() {
            None
        } else {
            Some(template.to_vec())
        }),
    };

    let mut result: Vec<Spec> = template.to_vec();
    // `lastOp` is `-1`-based in the source; `None` here plays that role so
    // "insert at position `lastOp + 1`" doesn't need a signed index.
    let mut last_op: Option<usize> = None;

    for entry in delta {
        match result.iter().position(|existing| existing.name == entry.name) {
            Some(index) => {
                last_op = Some(index);
                if entry.is_deletion_marker() {
                    result.remove(index);
                    // "decrement lastOp by 1" — None if it underflows past the front.
                    last_op = index.checked_sub(1);
                } else {
                    result[index] = merge(&result[index], entry, false)?;
                }
            }
            None => {
                if !entry.is_deletion_marker() {
                    let insert_at = last_op.map(|i| i + 1).unwrap_or(0);
                    result.insert(insert_at, entry.clone());
                    last_op = Some(insert_at);
                }
                // Deletion of a non-existent entry is a no-op, cursor unmoved.
            }
        }
    }

    Ok(if result.is_empty() { None } else { Some(result) })
}
