//! Generic patch-operation interpreter.
//!
//! Applies the `{operation, property, value|id}` op lists carried by
//! `change.patch` frames to a JSON representation of an entity.
//! Property paths are dot-separated and may address nested mappings;
//! `add`/`remove` operate on array-valued fields, `set`/`delete` on
//! scalars and mapping keys.
//!
//! All operations of one packet are applied before the caller emits any
//! change notification, so observers never see a half-updated entity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use confab_shared::protocol::{PatchOp, PatchVerb};

/// Interpretation failures. The change applier catches and logs these;
/// a malformed patch never propagates out of the pipeline.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Patch path is empty")]
    EmptyPath,

    #[error("Patch path traverses a non-mapping value: {0}")]
    NotAMapping(String),

    #[error("Add/remove applied to a non-array field: {0}")]
    NotAnArray(String),

    #[error("Set operation carries neither value nor id: {0}")]
    MissingOperand(String),

    #[error("Patched entity no longer deserializes: {0}")]
    Rehydrate(#[from] serde_json::Error),
}

/// Apply every op in order against `target`, which must be the JSON
/// object form of an entity.
///
/// Returns the top-level property names that were actually modified,
/// deduplicated in first-touch order.
pub fn apply_patch_ops(target: &mut Value, ops: &[PatchOp]) -> Result<Vec<String>, PatchError> {
    let mut changed: Vec<String> = Vec::new();
    for op in ops {
        if apply_one(target, op)? {
            let head = op
                .property
                .split('.')
                .next()
                .unwrap_or(op.property.as_str())
                .to_string();
            if !changed.contains(&head) {
                changed.push(head);
            }
        }
    }
    Ok(changed)
}

fn operand(op: &PatchOp) -> Option<Value> {
    op.value
        .clone()
        .or_else(|| op.id.clone().map(Value::String))
}

/// Apply a single op; returns whether the document was modified.
fn apply_one(target: &mut Value, op: &PatchOp) -> Result<bool, PatchError> {
    let mut segments = op.property.split('.').peekable();
    let Some(first) = segments.next() else {
        return Err(PatchError::EmptyPath);
    };
    if first.is_empty() {
        return Err(PatchError::EmptyPath);
    }

    // Walk to the parent mapping of the final segment. Intermediates
    // are created for set/add; delete/remove on a missing path is a
    // no-op (nothing to take away).
    let creating = matches!(op.operation, PatchVerb::Set | PatchVerb::Add);
    let mut parent = target;
    let mut leaf = first;
    while segments.peek().is_some() {
        let map = parent
            .as_object_mut()
            .ok_or_else(|| PatchError::NotAMapping(op.property.clone()))?;
        if !map.contains_key(leaf) {
            if !creating {
                return Ok(false);
            }
            map.insert(leaf.to_string(), Value::Object(Default::default()));
        }
        parent = map
            .get_mut(leaf)
            .expect("key inserted or present above");
        leaf = segments.next().expect("peeked segment");
    }
    let map = parent
        .as_object_mut()
        .ok_or_else(|| PatchError::NotAMapping(op.property.clone()))?;

    match op.operation {
        PatchVerb::Set => {
            let value =
                operand(op).ok_or_else(|| PatchError::MissingOperand(op.property.clone()))?;
            let unchanged = map.get(leaf) == Some(&value);
            map.insert(leaf.to_string(), value);
            Ok(!unchanged)
        }
        PatchVerb::Delete => Ok(map.remove(leaf).is_some()),
        PatchVerb::Add => {
            let value =
                operand(op).ok_or_else(|| PatchError::MissingOperand(op.property.clone()))?;
            let slot = map
                .entry(leaf.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            let array = slot
                .as_array_mut()
                .ok_or_else(|| PatchError::NotAnArray(op.property.clone()))?;
            if array.contains(&value) {
                Ok(false)
            } else {
                array.push(value);
                Ok(true)
            }
        }
        PatchVerb::Remove => {
            let Some(value) = operand(op) else {
                return Ok(false);
            };
            let Some(slot) = map.get_mut(leaf) else {
                return Ok(false);
            };
            let array = slot
                .as_array_mut()
                .ok_or_else(|| PatchError::NotAnArray(op.property.clone()))?;
            let before = array.len();
            array.retain(|existing| existing != &value);
            Ok(array.len() != before)
        }
    }
}

/// RAII marker for "the patch interpreter is running".
///
/// The flag is raised on entry and lowered on drop, including on the
/// error path, so property hooks can always distinguish an
/// interpreter-driven update from a direct assignment.
pub struct ReentrancyGuard {
    flag: Arc<AtomicBool>,
}

impl ReentrancyGuard {
    pub fn enter(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { flag: flag.clone() }
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
