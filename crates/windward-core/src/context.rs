//! Request-scoped resolution context
//!
//! The Context caches already-resolved values for one request and seeds
//! the lookup namespace with request facts (`request.*`) and the process
//! environment (`env.*`). A fixed set of builtin literal values
//! short-circuits resolution entirely and can never be overwritten.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::value::Value;

/// Static values that always resolve to themselves
const BUILTIN_STRINGS: &[&str] = &[
    "GET",
    "POST",
    "mustache",
    "text/html",
    "text/plain",
    "application/json",
    "utf-8",
    "utf8",
    "latin-1",
    "base64",
    "binary",
    "hex",
];

/// Precomputed facts about the incoming request.
///
/// The engine never parses raw HTTP; the transport layer hands it this
/// bag.
#[derive(Debug, Clone, Default)]
pub struct RequestFacts {
    pub headers: IndexMap<String, String>,
    pub query: IndexMap<String, String>,
    pub url: UrlFacts,
}

/// Decomposed request URL
#[derive(Debug, Clone, Default)]
pub struct UrlFacts {
    pub host: String,
    pub port: u16,
    pub pathname: String,
    pub search: String,
}

/// Request-scoped cache of resolved values plus builtin literals
#[derive(Debug, Clone, Default)]
pub struct Context {
    store: Store,
    /// Keys dropped by `clone_isolated` (branch-scoped bindings)
    ephemeral: Vec<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context from request facts and the process environment
    pub fn from_request(facts: &RequestFacts) -> Self {
        let env: IndexMap<String, Value> = std::env::vars()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        Self::from_request_with_env(facts, env)
    }

    /// Seed a context from request facts and an explicit environment map
    pub fn from_request_with_env(facts: &RequestFacts, env: IndexMap<String, Value>) -> Self {
        let headers: IndexMap<String, Value> = facts
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let query: IndexMap<String, Value> = facts
            .query
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        let mut url = IndexMap::new();
        url.insert("host".to_string(), Value::String(facts.url.host.clone()));
        url.insert(
            "hostname".to_string(),
            Value::String(format!("{}:{}", facts.url.host, facts.url.port)),
        );
        url.insert("port".to_string(), Value::Integer(facts.url.port as i64));
        url.insert(
            "pathname".to_string(),
            Value::String(facts.url.pathname.clone()),
        );
        url.insert("search".to_string(), Value::String(facts.url.search.clone()));
        url.insert("query".to_string(), Value::Mapping(query.clone()));

        let mut request = IndexMap::new();
        request.insert("headers".to_string(), Value::Mapping(headers.clone()));
        request.insert("headerEntries".to_string(), entries_of(&headers));
        request.insert("queryEntries".to_string(), entries_of(&query));
        request.insert("url".to_string(), Value::Mapping(url));

        let mut data = IndexMap::new();
        data.insert("request".to_string(), Value::Mapping(request));
        data.insert("env".to_string(), Value::Mapping(env));

        Self {
            store: Store::from_mapping(data),
            ephemeral: Vec::new(),
        }
    }

    /// Builtin lookups return themselves; everything else hits the store
    pub fn get(&self, lookup: &str) -> Option<Value> {
        if Self::is_builtin_lookup(lookup) {
            return Some(Value::String(lookup.to_string()));
        }

        self.store.get(lookup)
    }

    /// Is `lookup` a builtin value or present in the store?
    pub fn has(&self, lookup: &str) -> bool {
        Self::is_builtin_lookup(lookup) || self.store.has(lookup)
    }

    /// Cache a resolved value.
    ///
    /// Builtin lookups are immutable. `cloneable = false` marks the key
    /// ephemeral: isolated clones drop it.
    pub fn set(&mut self, lookup: &str, value: Value, cloneable: bool) -> Result<()> {
        if Self::is_builtin_lookup(lookup) {
            return Err(Error::builtin_immutable(lookup));
        }

        if !cloneable {
            self.ephemeral.push(lookup.to_string());
        }

        self.store.set(lookup, value)
    }

    /// Independent copy with ephemeral keys stripped
    pub fn clone_isolated(&self) -> Self {
        let mut store = self.store.clone();
        for key in &self.ephemeral {
            store.remove(key);
        }

        Self {
            store,
            ephemeral: Vec::new(),
        }
    }

    /// Is a lookup string one of the builtin literals?
    pub fn is_builtin_lookup(lookup: &str) -> bool {
        BUILTIN_STRINGS.contains(&lookup) || is_status_code_str(lookup)
    }

    /// Is a value a builtin constant or an HTTP status code?
    pub fn is_builtin(value: &Value) -> bool {
        match value {
            Value::Bool(_) => true,
            Value::Integer(i) => (100..600).contains(i),
            Value::String(s) => BUILTIN_STRINGS.contains(&s.as_str()) || is_status_code_str(s),
            _ => false,
        }
    }
}

fn is_status_code_str(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_digit())
        && matches!(s.parse::<u32>(), Ok(n) if (100..600).contains(&n))
}

/// Convert a mapping into an ordered list of `{key, value}` entries for
/// template iteration
fn entries_of(map: &IndexMap<String, Value>) -> Value {
    Value::Sequence(
        map.iter()
            .map(|(k, v)| {
                let mut entry = IndexMap::new();
                entry.insert("key".to_string(), Value::String(k.clone()));
                entry.insert("value".to_string(), v.clone());
                Value::Mapping(entry)
            })
            .collect(),
    )
}
