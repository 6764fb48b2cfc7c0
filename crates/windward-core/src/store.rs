//! Dot-path key/value operations
//!
//! The foundation shared by Definition (immutable views) and Context
//! (mutable cache). Paths are dot-separated; each segment is a mapping
//! key, and numeric segments address sequence elements.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::value::Value;

/// Walk a dot-path through a value tree.
///
/// Returns `None` for the empty path, for any missing segment, and when
/// the walk hits a scalar before the path is exhausted.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }

    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Mapping(map) => map.get(segment)?,
            Value::Sequence(seq) => seq.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Does the dot-path exist in the value tree?
pub fn has_path(value: &Value, path: &str) -> bool {
    get_path(value, path).is_some()
}

/// Longest prefix of `path` that exists in the value tree; empty if none.
pub fn existing_parent(value: &Value, path: &str) -> String {
    let segments: Vec<&str> = path.split('.').collect();

    for end in (1..segments.len()).rev() {
        let prefix = segments[..end].join(".");
        if has_path(value, &prefix) {
            return prefix;
        }
    }

    String::new()
}

/// Set a value at a dot-path, creating intermediate mappings as needed.
///
/// Existing values are never overwritten: writing a sequence onto an
/// existing sequence appends the new tail members (existing indices win),
/// writing a mapping onto an existing mapping inserts only absent keys,
/// and any other collision is an error. An intermediate segment holding a
/// scalar is also an error.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<()> {
    if path.is_empty() {
        return Err(Error::store_conflict("Cannot set with an empty lookup"));
    }

    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;

    for segment in &segments[..segments.len() - 1] {
        current = match current {
            Value::Mapping(map) => {
                let entry = map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Mapping(IndexMap::new()));
                if entry.is_scalar() || entry.is_bytes() || entry.is_response() {
                    return Err(Error::store_conflict(format!(
                        "Cannot set through scalar segment '{}' in '{}'",
                        segment, path
                    )));
                }
                entry
            }
            Value::Sequence(seq) => {
                let idx: usize = segment.parse().map_err(|_| {
                    Error::store_conflict(format!(
                        "Segment '{}' does not address a sequence element in '{}'",
                        segment, path
                    ))
                })?;
                seq.get_mut(idx).ok_or_else(|| {
                    Error::store_conflict(format!(
                        "Sequence index '{}' out of range in '{}'",
                        segment, path
                    ))
                })?
            }
            _ => {
                return Err(Error::store_conflict(format!(
                    "Cannot set through scalar segment '{}' in '{}'",
                    segment, path
                )))
            }
        };
    }

    let key = segments[segments.len() - 1];
    match current {
        Value::Mapping(map) => match map.get_mut(key) {
            None => {
                map.insert(key.to_string(), value);
                Ok(())
            }
            Some(existing) => merge_no_overwrite(existing, value, path),
        },
        Value::Sequence(seq) => {
            let idx: usize = key.parse().map_err(|_| {
                Error::store_conflict(format!(
                    "Segment '{}' does not address a sequence element in '{}'",
                    key, path
                ))
            })?;
            if idx == seq.len() {
                seq.push(value);
                Ok(())
            } else if let Some(existing) = seq.get_mut(idx) {
                merge_no_overwrite(existing, value, path)
            } else {
                Err(Error::store_conflict(format!(
                    "Sequence index '{}' out of range in '{}'",
                    key, path
                )))
            }
        }
        _ => Err(Error::store_conflict(format!(
            "Cannot set '{}' inside a scalar value",
            path
        ))),
    }
}

/// Merge `value` into an existing entry without clobbering anything.
fn merge_no_overwrite(existing: &mut Value, value: Value, path: &str) -> Result<()> {
    match (existing, value) {
        (Value::Sequence(old), Value::Sequence(new)) => {
            // Existing indices win; the new tail is appended
            for (idx, item) in new.into_iter().enumerate() {
                if idx >= old.len() {
                    old.push(item);
                }
            }
            Ok(())
        }
        (Value::Mapping(old), Value::Mapping(new)) => {
            for (key, item) in new {
                if !old.contains_key(&key) {
                    old.insert(key, item);
                }
            }
            Ok(())
        }
        _ => Err(Error::store_conflict(format!(
            "No overwriting existing value at '{}'",
            path
        ))),
    }
}

/// A mutable key/value store rooted at a mapping
#[derive(Debug, Clone)]
pub struct Store {
    data: Value,
}

// Deriving Default would root the store at Null and reject every write
impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            data: Value::Mapping(IndexMap::new()),
        }
    }

    pub fn from_mapping(map: IndexMap<String, Value>) -> Self {
        Self {
            data: Value::Mapping(map),
        }
    }

    /// Get a cloned value at a dot-path
    pub fn get(&self, lookup: &str) -> Option<Value> {
        get_path(&self.data, lookup).cloned()
    }

    pub fn has(&self, lookup: &str) -> bool {
        has_path(&self.data, lookup)
    }

    pub fn existing_parent(&self, lookup: &str) -> String {
        existing_parent(&self.data, lookup)
    }

    pub fn set(&mut self, lookup: &str, value: Value) -> Result<()> {
        set_path(&mut self.data, lookup, value)
    }

    /// Remove a top-level key
    pub fn remove(&mut self, key: &str) {
        if let Value::Mapping(map) = &mut self.data {
            map.shift_remove(key);
        }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }
}
