//! Recursive definition evaluation
//!
//! The evaluator walks the definition tree on demand: each lookup is
//! located (falling back to the nearest existing parent), dispatched to a
//! resolver strategy, and the result memoized in the request context.
//! Tree addresses in flight live on a lookup stack for cycle detection.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::context::Context;
use crate::definition::Definition;
use crate::error::{Error, Result};
use crate::resolver::{
    HttpTransport, ResolverInput, ResolverOutput, ResolverRegistry, UreqTransport,
};
use crate::store;
use crate::template::TemplateRegistry;
use crate::value::Value;

pub struct Evaluator {
    root: Definition,
    context: Context,
    registry: Arc<ResolverRegistry>,
    templates: Arc<TemplateRegistry>,
    transport: Arc<dyn HttpTransport>,
    lookup_stack: Vec<String>,
}

impl Evaluator {
    /// Evaluator with the builtin strategies and the ureq transport
    pub fn new(root: Definition, context: Context) -> Self {
        Self::with_parts(
            root,
            context,
            Arc::new(ResolverRegistry::with_builtins()),
            Arc::new(TemplateRegistry::with_builtins()),
            Arc::new(UreqTransport),
        )
    }

    pub fn with_parts(
        root: Definition,
        context: Context,
        registry: Arc<ResolverRegistry>,
        templates: Arc<TemplateRegistry>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            root,
            context,
            registry,
            templates,
            transport,
            lookup_stack: Vec::new(),
        }
    }

    pub fn root(&self) -> &Definition {
        &self.root
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn registry(&self) -> &Arc<ResolverRegistry> {
        &self.registry
    }

    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Independent evaluator over the same tree, with ephemeral context
    /// keys stripped. Used for matcher branches.
    pub fn isolated_clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            context: self.context.clone_isolated(),
            registry: Arc::clone(&self.registry),
            templates: Arc::clone(&self.templates),
            transport: Arc::clone(&self.transport),
            lookup_stack: self.lookup_stack.clone(),
        }
    }

    /// Resolve a root-level lookup, memoizing the result
    pub fn resolve(&mut self, lookup: &str) -> Result<Value> {
        if let Some(cached) = self.cached(lookup) {
            log::trace!("Cache hit for '{}'", lookup);
            return Ok(cached);
        }
        log::trace!("Resolving '{}'", lookup);

        let Some(def) = self.root.get(lookup) else {
            return self.resolve_through_parent(lookup);
        };

        let address = def.tree_address().to_string();
        if self.lookup_stack.contains(&address) {
            return Err(Error::circular_reference(lookup, &self.lookup_stack));
        }

        self.lookup_stack.push(address);
        let result = self.resolve_node(&def);
        self.lookup_stack.pop();
        let value = result?;

        self.context.set(lookup, value.clone(), true)?;
        Ok(value)
    }

    /// Resolve a sub-lookup within a definition node (resolver callbacks).
    /// Results are not cached at root level.
    pub fn resolve_in(&mut self, lookup: &str, def: &Definition) -> Result<Value> {
        let child = def.get(lookup).ok_or_else(|| {
            if def.tree_address().is_empty() {
                Error::no_definition(lookup)
            } else {
                Error::no_definition(format!("{}.{}", def.tree_address(), lookup))
            }
        })?;

        let address = child.tree_address().to_string();
        if self.lookup_stack.contains(&address) {
            return Err(Error::circular_reference(address.clone(), &self.lookup_stack));
        }

        self.lookup_stack.push(address);
        let result = self.resolve_node(&child);
        self.lookup_stack.pop();
        result
    }

    /// Cached value for a lookup, unless a cached sequence is shorter than
    /// the definition's (a partial list forces a recompute)
    fn cached(&self, lookup: &str) -> Option<Value> {
        let cached = self.context.get(lookup)?;
        if let Value::Sequence(seq) = &cached {
            if let Some(def) = self.root.get(lookup) {
                if def.len() > seq.len() {
                    return None;
                }
            }
        }
        Some(cached)
    }

    /// A lookup with no definition node may still live under a resolvable
    /// parent prefix: resolve the parent, then drill the remaining suffix
    /// into its result.
    fn resolve_through_parent(&mut self, lookup: &str) -> Result<Value> {
        let parent = self.root.existing_parent(lookup);
        if parent.is_empty() {
            return Err(Error::no_definition(lookup));
        }

        log::trace!("Retrying '{}' through parent '{}'", lookup, parent);
        let parent_value = self.resolve(&parent)?;
        let suffix = &lookup[parent.len() + 1..];

        match &parent_value {
            // A terminal response absorbs any deeper lookup
            Value::Response(_) => Ok(parent_value),
            Value::Mapping(_) | Value::Sequence(_) => store::get_path(&parent_value, suffix)
                .cloned()
                .ok_or_else(|| Error::no_definition(lookup)),
            other => Err(Error::type_mismatch(lookup, other.type_name())),
        }
    }

    /// Resolve one located definition node
    fn resolve_node(&mut self, def: &Definition) -> Result<Value> {
        let value = def.value().clone();

        if Context::is_builtin(&value) {
            return Ok(value);
        }

        match value {
            Value::String(text) => {
                if let Some(resolver) = self.registry.clone().for_scalar(&text) {
                    log::debug!(
                        "Dispatching shorthand '{}' to '{}'",
                        text,
                        resolver.indicator()
                    );
                    let output = resolver.resolve(self, &ResolverInput::Shorthand(text))?;
                    return self.finish_output(output);
                }
                // A bare string is an indirection into the root tree
                self.resolve(&text)
            }
            Value::Mapping(_) if !def.is_list() => {
                let resolver = self.registry.clone().for_definition(def)?;
                if !resolver.is_valid(self, def) {
                    return Err(Error::invalid_resolver_input(
                        resolver.indicator(),
                        Some(def.tree_address().to_string()),
                    ));
                }
                log::debug!(
                    "Dispatching '{}' to '{}'",
                    def.tree_address(),
                    resolver.indicator()
                );
                let output = resolver.resolve(self, &ResolverInput::Definition(def.clone()))?;
                self.finish_output(output)
            }
            // Lists (sequences, or mappings with contiguous numeric keys)
            // resolve element by element
            Value::Sequence(_) | Value::Mapping(_) => {
                let mut items = Vec::with_capacity(def.len());
                for key in def.keys() {
                    items.push(self.resolve_in(&key, def)?);
                }
                Ok(Value::Sequence(items))
            }
            other => Ok(other),
        }
    }

    /// Turn a resolver's output into a value, resolving compound results
    /// key by key
    fn finish_output(&mut self, output: ResolverOutput) -> Result<Value> {
        match output {
            ResolverOutput::Value(value) => Ok(value),
            ResolverOutput::Definition(def) => match def.value() {
                Value::Response(_) => Ok(def.value().clone()),
                Value::Sequence(_) => {
                    let mut items = Vec::with_capacity(def.len());
                    for key in def.keys() {
                        items.push(self.resolve_in(&key, &def)?);
                    }
                    Ok(Value::Sequence(items))
                }
                Value::Mapping(_) => {
                    let mut map = IndexMap::new();
                    for key in def.keys() {
                        let value = self.resolve_in(&key, &def)?;
                        map.insert(key, value);
                    }
                    Ok(Value::Mapping(map))
                }
                _ => self.resolve_node(&def),
            },
        }
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("root", &self.root.tree_address())
            .field("lookup_stack", &self.lookup_stack)
            .finish()
    }
}
