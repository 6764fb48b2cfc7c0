//! Definition tree
//!
//! A Definition is an immutable view into the parsed definition tree.
//! Children returned from `get` share the underlying data; each view is
//! stamped with its own tree address (the dot path from the root, used
//! for cycle detection and diagnostics) and inherits the base path of
//! the source file (used to resolve relative file references).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store;
use crate::value::Value;

const NULL: Value = Value::Null;

/// An addressed view into a shared definition tree
#[derive(Debug, Clone)]
pub struct Definition {
    root: Arc<Value>,
    address: String,
    base_path: PathBuf,
}

impl Definition {
    /// Load a definition from a YAML file.
    ///
    /// The document must parse to a mapping. The base path is the
    /// directory containing the file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::io(format!("Failed to read '{}': {}", path.display(), e))
        })?;

        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&content).map_err(|e| Error::parse(e.to_string()))?;
        let value = Value::from(parsed);

        if !value.is_mapping() {
            return Err(Error::parse(format!(
                "File '{}' did not parse to a YAML mapping",
                path.display()
            )));
        }

        let base_path = path
            .parent()
            .map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()))
            .unwrap_or_default();

        Ok(Self::from_value(value, base_path))
    }

    /// Build a definition from an in-memory value (synthetic sub-trees
    /// produced by resolvers, and tests).
    pub fn from_value(value: Value, base_path: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(value),
            address: String::new(),
            base_path: base_path.into(),
        }
    }

    /// The value at this node
    pub fn value(&self) -> &Value {
        if self.address.is_empty() {
            &self.root
        } else {
            store::get_path(&self.root, &self.address).unwrap_or(&NULL)
        }
    }

    /// Child view at a dot-path lookup.
    ///
    /// The child shares the tree, inherits this node's base path, and is
    /// addressed at `this address + '.' + lookup`.
    pub fn get(&self, lookup: &str) -> Option<Definition> {
        store::get_path(self.value(), lookup)?;

        let address = if self.address.is_empty() {
            lookup.to_string()
        } else {
            format!("{}.{}", self.address, lookup)
        };

        Some(Definition {
            root: Arc::clone(&self.root),
            address,
            base_path: self.base_path.clone(),
        })
    }

    pub fn has(&self, lookup: &str) -> bool {
        store::has_path(self.value(), lookup)
    }

    /// Longest prefix of `lookup` that exists under this node; empty if none
    pub fn existing_parent(&self, lookup: &str) -> String {
        store::existing_parent(self.value(), lookup)
    }

    /// Dot-separated address of this node within the definition tree
    pub fn tree_address(&self) -> &str {
        &self.address
    }

    /// Directory containing the definition source file
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn is_list(&self) -> bool {
        self.value().is_list()
    }

    pub fn len(&self) -> usize {
        self.value().len()
    }

    pub fn is_empty(&self) -> bool {
        self.value().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.value().keys()
    }
}
