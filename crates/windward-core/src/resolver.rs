//! Resolver strategies
//!
//! A resolver turns one definition node into a concrete value. The
//! registry infers which strategy applies from the node's indicator key
//! (or an explicit `resolver` tag); the evaluator then gates dispatch on
//! `is_valid` and hands the node to `resolve`. Strategies that perform
//! network I/O go through the `HttpTransport` seam so they can be tested
//! without a live upstream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use regex::Regex;
use url::{Position, Url};

use crate::definition::Definition;
use crate::error::{Error, Result};
use crate::evaluator::Evaluator;
use crate::value::{Body, ResponseValue, Value};

// =============================================================================
// Resolver Trait and Registry
// =============================================================================

/// Input handed to a resolver: a bare scalar shorthand or a definition node
#[derive(Debug, Clone)]
pub enum ResolverInput {
    Shorthand(String),
    Definition(Definition),
}

impl ResolverInput {
    pub fn definition(&self) -> Option<&Definition> {
        match self {
            ResolverInput::Definition(def) => Some(def),
            ResolverInput::Shorthand(_) => None,
        }
    }

    pub fn shorthand(&self) -> Option<&str> {
        match self {
            ResolverInput::Shorthand(s) => Some(s),
            ResolverInput::Definition(_) => None,
        }
    }
}

/// Resolver result: a finished value, or a compound definition whose
/// children the evaluator resolves one by one
#[derive(Debug, Clone)]
pub enum ResolverOutput {
    Value(Value),
    Definition(Definition),
}

/// A single resolution strategy
pub trait Resolver: Send + Sync {
    /// The definition key that selects this strategy
    fn indicator(&self) -> &'static str;

    /// Older indicator spellings still accepted (with a warning)
    fn deprecated_indicators(&self) -> &[&'static str] {
        &[]
    }

    /// Does a bare scalar string select this strategy?
    fn is_shorthand(&self, _value: &str) -> bool {
        false
    }

    /// Structural validity check, run before `resolve`. Sub-lookups that
    /// fail to resolve count as invalid.
    fn is_valid(&self, _iter: &mut Evaluator, def: &Definition) -> bool {
        def.has(self.indicator())
    }

    fn resolve(&self, iter: &mut Evaluator, input: &ResolverInput) -> Result<ResolverOutput>;
}

/// Ordered registry of resolution strategies.
///
/// Indicator inference walks the registration order, so more specific
/// strategies must be registered before more general ones.
#[derive(Clone)]
pub struct ResolverRegistry {
    entries: Vec<(String, Arc<dyn Resolver>)>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registry with the builtin strategies in priority order
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("conditional", Arc::new(ConditionalResolver));
        registry.register("directory", Arc::new(DirectoryResolver));
        registry.register("file", Arc::new(FileResolver));
        registry.register("inline", Arc::new(InlineResolver));
        registry.register("proxy", Arc::new(ProxyResolver));
        registry.register("service", Arc::new(ServiceResolver));
        registry.register("template", Arc::new(TemplateResolver));
        registry.register("url", Arc::new(UrlResolver));
        registry
    }

    /// Register a strategy under a tag, replacing any existing entry with
    /// the same tag in place
    pub fn register(&mut self, tag: impl Into<String>, resolver: Arc<dyn Resolver>) {
        let tag = tag.into();
        if let Some(entry) = self.entries.iter_mut().find(|(t, _)| *t == tag) {
            entry.1 = resolver;
        } else {
            self.entries.push((tag, resolver));
        }
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Resolver>> {
        self.entries
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, r)| Arc::clone(r))
    }

    /// First strategy claiming a bare scalar as shorthand
    pub fn for_scalar(&self, value: &str) -> Option<Arc<dyn Resolver>> {
        self.entries
            .iter()
            .find(|(_, r)| r.is_shorthand(value))
            .map(|(_, r)| Arc::clone(r))
    }

    /// Strategy for a definition node: explicit `resolver` tag first, then
    /// indicator inference in registration order
    pub fn for_definition(&self, def: &Definition) -> Result<Arc<dyn Resolver>> {
        if let Some(tag_def) = def.get("resolver") {
            let tag = tag_def.value().as_str().ok_or_else(|| {
                Error::malformed("The 'resolver' tag must be a literal string")
                    .with_lookup(tag_def.tree_address().to_string())
            })?;
            return self
                .get(tag)
                .ok_or_else(|| Error::unknown_resolver(tag).with_lookup(def.tree_address().to_string()));
        }

        for (_, resolver) in &self.entries {
            if def.has(resolver.indicator()) {
                return Ok(Arc::clone(resolver));
            }
            for deprecated in resolver.deprecated_indicators() {
                if def.has(deprecated) {
                    log::warn!(
                        "Indicator '{}' at '{}' is deprecated; use '{}'",
                        deprecated,
                        def.tree_address(),
                        resolver.indicator()
                    );
                    return Ok(Arc::clone(resolver));
                }
            }
        }

        Err(Error::no_resolver_for(def.keys().join(", "))
            .with_lookup(def.tree_address().to_string()))
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field(
                "entries",
                &self.entries.iter().map(|(t, _)| t).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// =============================================================================
// HTTP Transport Seam
// =============================================================================

/// One outbound HTTP request
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub ignore_ssl_errors: bool,
}

/// The upstream's answer
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub headers: IndexMap<String, String>,
    pub body: Vec<u8>,
}

/// Blocking HTTP I/O used by the service and proxy strategies
pub trait HttpTransport: Send + Sync {
    fn send(&self, call: &HttpCall) -> Result<HttpReply>;
}

/// Default transport backed by ureq
#[derive(Debug, Default)]
pub struct UreqTransport;

impl HttpTransport for UreqTransport {
    fn send(&self, call: &HttpCall) -> Result<HttpReply> {
        use std::time::Duration;
        use ureq::tls::TlsConfig;

        let mut tls = TlsConfig::builder();
        if call.ignore_ssl_errors {
            log::warn!(
                "TLS certificate verification is disabled for request to {}",
                call.url
            );
            tls = tls.disable_verification(true);
        }

        // Upstream error statuses are part of the resolved result, not
        // transport failures
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(30)))
            .http_status_as_error(false)
            .tls_config(tls.build())
            .build();
        let agent: ureq::Agent = config.into();

        let result = if call.method == "POST" {
            let mut request = agent.post(&call.url);
            for (name, value) in &call.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            let body = call.body.clone().unwrap_or_default();
            request.send(&body[..])
        } else {
            let mut request = agent.get(&call.url);
            for (name, value) in &call.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            request.call()
        };

        let response = result.map_err(|e| {
            let message = match &e {
                ureq::Error::Timeout(kind) => format!("Request timeout: {:?}", kind),
                ureq::Error::Io(io_err) => format!("Connection error: {}", io_err),
                _ => format!("Request failed: {}", e),
            };
            Error::http(&call.url, message)
        })?;

        let status = response.status().as_u16();
        let mut headers = IndexMap::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers.insert(name.as_str().to_string(), text.to_string());
            }
        }
        let body = response
            .into_body()
            .read_to_vec()
            .map_err(|e| Error::http(&call.url, e.to_string()))?;

        Ok(HttpReply {
            status,
            headers,
            body,
        })
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Resolve a sub-lookup of a definition node to a string
fn resolve_string(iter: &mut Evaluator, lookup: &str, def: &Definition) -> Result<String> {
    let value = iter.resolve_in(lookup, def)?;
    match value {
        Value::String(s) => Ok(s),
        other => Err(Error::type_mismatch(lookup, other.type_name())
            .with_lookup(def.tree_address().to_string())),
    }
}

/// Resolve an optional sub-lookup to a string, with a fallback
fn resolve_string_or(
    iter: &mut Evaluator,
    lookup: &str,
    def: &Definition,
    fallback: &str,
) -> Result<String> {
    if def.has(lookup) {
        resolve_string(iter, lookup, def)
    } else {
        Ok(fallback.to_string())
    }
}

/// Resolve an optional sub-lookup to a bool, with a fallback
fn resolve_bool_or(
    iter: &mut Evaluator,
    lookup: &str,
    def: &Definition,
    fallback: bool,
) -> Result<bool> {
    if !def.has(lookup) {
        return Ok(fallback);
    }
    match iter.resolve_in(lookup, def)? {
        Value::Bool(b) => Ok(b),
        other => Err(Error::type_mismatch(lookup, other.type_name())
            .with_lookup(def.tree_address().to_string())),
    }
}

fn input_definition<'a>(resolver: &str, input: &'a ResolverInput) -> Result<&'a Definition> {
    input
        .definition()
        .ok_or_else(|| Error::invalid_resolver_input(resolver, None))
}

/// Canonicalize a path, falling back to the raw path when it does not
/// exist on disk
fn canonical_or_raw(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Content type for a static file, by extension
fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "application/javascript",
        Some("json") | Some("map") => "application/json",
        Some("txt") => "text/plain",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

fn not_found() -> ResolverOutput {
    ResolverOutput::Value(Value::Response(Box::new(ResponseValue::with_status(404))))
}

// =============================================================================
// Inline Resolver
// =============================================================================

/// Returns the raw value under `inline`. Structured values come back as
/// compound definitions so the evaluator resolves their children.
pub struct InlineResolver;

impl Resolver for InlineResolver {
    fn indicator(&self) -> &'static str {
        "inline"
    }

    fn resolve(&self, _iter: &mut Evaluator, input: &ResolverInput) -> Result<ResolverOutput> {
        let def = input_definition("inline", input)?;
        let child = def
            .get("inline")
            .ok_or_else(|| Error::invalid_resolver_input("inline", Some(def.tree_address().to_string())))?;

        match child.value() {
            Value::Mapping(_) | Value::Sequence(_) => Ok(ResolverOutput::Definition(child)),
            scalar => Ok(ResolverOutput::Value(scalar.clone())),
        }
    }
}

// =============================================================================
// File Resolver
// =============================================================================

const FILE_ENCODINGS: &[&str] = &["utf-8", "latin-1", "binary"];
const FILE_PARSE_MODES: &[&str] = &["auto", "text", "json", "mustache", "graphql"];

/// Reads a file relative to the definition's base path. Paths escaping
/// the base path fail closed with a 404 response.
pub struct FileResolver;

impl FileResolver {
    fn read(&self, def_base: &Path, raw_path: &str, encoding: &str, parse: &str) -> Result<ResolverOutput> {
        let trimmed = raw_path.strip_prefix("file://").unwrap_or(raw_path);
        let joined = if Path::new(trimmed).is_absolute() {
            def_base.join(trimmed.trim_start_matches(['/', '\\']))
        } else {
            def_base.join(trimmed)
        };

        let base = canonical_or_raw(def_base);
        let candidate = match joined.canonicalize() {
            Ok(path) => path,
            Err(_) => {
                log::warn!("File '{}' not found under '{}'", trimmed, base.display());
                return Ok(not_found());
            }
        };
        if !candidate.starts_with(&base) {
            log::warn!(
                "File '{}' escapes the definition base path '{}'",
                trimmed,
                base.display()
            );
            return Ok(not_found());
        }

        let content = match encoding {
            "binary" => Value::Bytes(std::fs::read(&candidate).map_err(|e| {
                Error::io(format!("Failed to read '{}': {}", candidate.display(), e))
            })?),
            "latin-1" => {
                let bytes = std::fs::read(&candidate).map_err(|e| {
                    Error::io(format!("Failed to read '{}': {}", candidate.display(), e))
                })?;
                Value::String(bytes.iter().map(|&b| b as char).collect())
            }
            _ => Value::String(std::fs::read_to_string(&candidate).map_err(|e| {
                Error::io(format!("Failed to read '{}': {}", candidate.display(), e))
            })?),
        };

        let is_json = parse == "json"
            || (parse == "auto"
                && candidate.extension().and_then(|e| e.to_str()) == Some("json"));
        if is_json {
            let text = content.as_str().ok_or_else(|| {
                Error::malformed(format!(
                    "Cannot JSON-parse '{}' read with binary encoding",
                    candidate.display()
                ))
            })?;
            let parsed: serde_json::Value = serde_json::from_str(text).map_err(|e| {
                Error::malformed(format!("Invalid JSON in '{}': {}", candidate.display(), e))
            })?;
            return Ok(ResolverOutput::Value(Value::from(parsed)));
        }

        Ok(ResolverOutput::Value(content))
    }
}

impl Resolver for FileResolver {
    fn indicator(&self) -> &'static str {
        "file"
    }

    fn is_shorthand(&self, value: &str) -> bool {
        value.starts_with('/')
            || value.starts_with("./")
            || value.starts_with("../")
            || value.starts_with("file://")
            || is_windows_drive_path(value)
    }

    fn is_valid(&self, iter: &mut Evaluator, def: &Definition) -> bool {
        if !def.has("file") {
            return false;
        }
        if def.has("encoding") {
            match resolve_string(iter, "encoding", def) {
                Ok(enc) if FILE_ENCODINGS.contains(&enc.as_str()) => {}
                _ => return false,
            }
        }
        if def.has("parse") {
            match resolve_string(iter, "parse", def) {
                Ok(mode) if FILE_PARSE_MODES.contains(&mode.as_str()) => {}
                _ => return false,
            }
        }
        true
    }

    fn resolve(&self, iter: &mut Evaluator, input: &ResolverInput) -> Result<ResolverOutput> {
        match input {
            ResolverInput::Shorthand(path) => {
                let base = iter.root().base_path().to_path_buf();
                self.read(&base, path, "utf-8", "auto")
            }
            ResolverInput::Definition(def) => {
                let path = resolve_string(iter, "file", def)?;
                let encoding = resolve_string_or(iter, "encoding", def, "utf-8")?;
                let parse = resolve_string_or(iter, "parse", def, "auto")?;
                self.read(&def.base_path().to_path_buf(), &path, &encoding, &parse)
            }
        }
    }
}

fn is_windows_drive_path(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

// =============================================================================
// Directory Resolver
// =============================================================================

/// Serves static files under a directory, keyed by the request pathname.
/// Anything outside the directory (or the base path) is a 404.
pub struct DirectoryResolver;

impl DirectoryResolver {
    fn directory_root(&self, iter: &mut Evaluator, def: &Definition) -> Result<PathBuf> {
        let dir = resolve_string(iter, "directory", def)?;
        let joined = def.base_path().join(dir.trim_start_matches('/'));
        joined.canonicalize().map_err(|e| {
            Error::io(format!(
                "Static directory '{}' is not accessible: {}",
                joined.display(),
                e
            ))
        })
    }
}

impl Resolver for DirectoryResolver {
    fn indicator(&self) -> &'static str {
        "directory"
    }

    fn is_valid(&self, iter: &mut Evaluator, def: &Definition) -> bool {
        def.has("directory")
            && self
                .directory_root(iter, def)
                .map(|root| root.is_dir())
                .unwrap_or(false)
    }

    fn resolve(&self, iter: &mut Evaluator, input: &ResolverInput) -> Result<ResolverOutput> {
        let def = input_definition("directory", input)?;
        let root = self.directory_root(iter, def)?;
        let base = canonical_or_raw(def.base_path());

        let pathname = match iter.resolve("request.url.pathname")? {
            Value::String(s) => s,
            other => {
                return Err(Error::type_mismatch("request.url.pathname", other.type_name()))
            }
        };

        let candidate = root.join(pathname.trim_start_matches('/'));
        let candidate = match candidate.canonicalize() {
            Ok(path) => path,
            Err(_) => return Ok(not_found()),
        };
        if !candidate.starts_with(&root) || !candidate.starts_with(&base) || !candidate.is_file() {
            return Ok(not_found());
        }

        let bytes = std::fs::read(&candidate).map_err(|e| {
            Error::io(format!("Failed to read '{}': {}", candidate.display(), e))
        })?;

        let mut headers = IndexMap::new();
        headers.insert(
            "Content-Type".to_string(),
            content_type_for(&candidate).to_string(),
        );
        headers.insert(
            "Cache-Control".to_string(),
            "max-age=31557600".to_string(),
        );

        Ok(ResolverOutput::Value(Value::Response(Box::new(
            ResponseValue {
                status: 200,
                headers,
                body: Body::Binary(bytes),
            },
        ))))
    }
}

// =============================================================================
// Proxy Resolver
// =============================================================================

/// Forwards the current request to an upstream target, rewriting the Host
/// header. The upstream answer is a terminal response.
pub struct ProxyResolver;

impl Resolver for ProxyResolver {
    fn indicator(&self) -> &'static str {
        "target"
    }

    fn is_valid(&self, iter: &mut Evaluator, def: &Definition) -> bool {
        def.has("target")
            && (!def.has("ignoreSSLErrors")
                || resolve_bool_or(iter, "ignoreSSLErrors", def, false).is_ok())
    }

    fn resolve(&self, iter: &mut Evaluator, input: &ResolverInput) -> Result<ResolverOutput> {
        let def = input_definition("proxy", input)?;
        let target = resolve_string(iter, "target", def)?;
        let ignore_ssl_errors = resolve_bool_or(iter, "ignoreSSLErrors", def, false)?;
        if ignore_ssl_errors {
            log::warn!(
                "Proxy at '{}' forwards to '{}' with certificate checks disabled",
                def.tree_address(),
                target
            );
        }

        let pathname = match iter.resolve("request.url.pathname")? {
            Value::String(s) => s,
            other => {
                return Err(Error::type_mismatch("request.url.pathname", other.type_name()))
            }
        };
        let search = iter
            .resolve("request.url.search")
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_default();

        let mut upstream = Url::parse(&target)
            .map_err(|e| Error::malformed(format!("Invalid proxy target '{}': {}", target, e)))?;
        upstream.set_path(&pathname);
        let query = search.trim_start_matches('?');
        upstream.set_query(if query.is_empty() { None } else { Some(query) });

        let host = match (upstream.host_str(), upstream.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(Error::malformed(format!(
                    "Proxy target '{}' has no host",
                    target
                )))
            }
        };

        let mut headers = IndexMap::new();
        if let Ok(Value::Mapping(request_headers)) = iter.resolve("request.headers") {
            for (name, value) in request_headers {
                if let Value::String(text) = value {
                    headers.insert(name, text);
                }
            }
        }
        headers.insert("host".to_string(), host);

        let reply = iter.transport().send(&HttpCall {
            method: "GET".to_string(),
            url: upstream.to_string(),
            headers,
            body: None,
            ignore_ssl_errors,
        })?;

        // The transport already decoded the body
        let mut headers: IndexMap<String, String> = reply
            .headers
            .into_iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("transfer-encoding")
                    && !name.eq_ignore_ascii_case("connection")
            })
            .collect();
        headers.shift_remove("content-length");

        Ok(ResolverOutput::Value(Value::Response(Box::new(
            ResponseValue {
                status: reply.status,
                headers,
                body: Body::Binary(reply.body),
            },
        ))))
    }
}

// =============================================================================
// Service Resolver
// =============================================================================

/// Calls a backing GraphQL-style service and returns its decoded JSON
/// response
pub struct ServiceResolver;

impl ServiceResolver {
    fn endpoint_key(def: &Definition) -> Option<&'static str> {
        match (def.has("endpoint"), def.has("url")) {
            (true, false) => Some("endpoint"),
            (false, true) => Some("url"),
            _ => None,
        }
    }
}

impl Resolver for ServiceResolver {
    fn indicator(&self) -> &'static str {
        "endpoint"
    }

    fn deprecated_indicators(&self) -> &[&'static str] {
        &["url"]
    }

    fn is_valid(&self, iter: &mut Evaluator, def: &Definition) -> bool {
        if Self::endpoint_key(def).is_none() || !def.has("query") {
            return false;
        }
        if def.has("method") {
            match resolve_string(iter, "method", def) {
                Ok(method) if method == "GET" || method == "POST" => {}
                _ => return false,
            }
        }
        if def.has("ignoreSSLErrors")
            && resolve_bool_or(iter, "ignoreSSLErrors", def, false).is_err()
        {
            return false;
        }
        true
    }

    fn resolve(&self, iter: &mut Evaluator, input: &ResolverInput) -> Result<ResolverOutput> {
        let def = input_definition("service", input)?;
        let endpoint_key = Self::endpoint_key(def)
            .ok_or_else(|| Error::invalid_resolver_input("service", Some(def.tree_address().to_string())))?;
        if endpoint_key == "url" {
            log::warn!(
                "Service at '{}' uses the deprecated 'url' key; use 'endpoint'",
                def.tree_address()
            );
        }

        let endpoint = resolve_string(iter, endpoint_key, def)?;
        let query = resolve_string(iter, "query", def)?;
        let method = resolve_string_or(iter, "method", def, "POST")?;
        let ignore_ssl_errors = resolve_bool_or(iter, "ignoreSSLErrors", def, false)?;

        let variables = if def.has("variables") {
            let resolved = iter.resolve_in("variables", def)?;
            resolved.to_json().ok_or_else(|| {
                Error::malformed("Service variables must be JSON-representable")
                    .with_lookup(def.tree_address().to_string())
            })?
        } else {
            serde_json::Value::Object(serde_json::Map::new())
        };

        let mut headers = IndexMap::new();
        let mut body = None;
        let url = if method == "GET" {
            let mut url = Url::parse(&endpoint).map_err(|e| {
                Error::malformed(format!("Invalid service endpoint '{}': {}", endpoint, e))
            })?;
            url.query_pairs_mut().append_pair("query", &query);
            if variables != serde_json::Value::Object(serde_json::Map::new()) {
                url.query_pairs_mut()
                    .append_pair("variables", &variables.to_string());
            }
            url.to_string()
        } else {
            headers.insert("Content-type".to_string(), "application/json".to_string());
            let payload = serde_json::json!({
                "query": query,
                "variables": variables,
            });
            body = Some(payload.to_string().into_bytes());
            endpoint.clone()
        };

        // Caller headers win over the defaults
        if def.has("headers") {
            if let Value::Mapping(caller) = iter.resolve_in("headers", def)? {
                for (name, value) in caller {
                    headers.insert(name, format!("{}", value));
                }
            }
        }

        let reply = iter.transport().send(&HttpCall {
            method,
            url,
            headers,
            body,
            ignore_ssl_errors,
        })?;

        let decoded: serde_json::Value = serde_json::from_slice(&reply.body).map_err(|e| {
            Error::malformed(format!(
                "Service '{}' returned a non-JSON body: {}",
                endpoint, e
            ))
        })?;

        Ok(ResolverOutput::Value(Value::from(decoded)))
    }
}

// =============================================================================
// Conditional Resolver
// =============================================================================

/// Walks a list of matchers in order; the first whose resolved lookup
/// matches its pattern wins, otherwise `default` is used. Matching runs on
/// an isolated evaluator so capture bindings never leak.
pub struct ConditionalResolver;

impl ConditionalResolver {
    fn matcher_is_valid(matcher: &Value) -> bool {
        let Value::Mapping(map) = matcher else {
            return false;
        };
        matches!(map.get("matches"), Some(Value::String(_)))
            && matches!(map.get("pattern"), Some(Value::String(_)))
            && map.contains_key("use")
    }

    /// Text a resolved value is matched against: scalars verbatim,
    /// structures as JSON
    fn match_text(value: &Value) -> Option<String> {
        match value {
            Value::Null => Some(String::new()),
            Value::String(s) => Some(s.clone()),
            Value::Bool(_) | Value::Integer(_) | Value::Float(_) => Some(format!("{}", value)),
            Value::Sequence(_) | Value::Mapping(_) => value.to_json().map(|j| j.to_string()),
            Value::Bytes(_) | Value::Response(_) => None,
        }
    }
}

impl Resolver for ConditionalResolver {
    fn indicator(&self) -> &'static str {
        "when"
    }

    fn is_valid(&self, _iter: &mut Evaluator, def: &Definition) -> bool {
        if !def.has("default") {
            return false;
        }
        let Some(when) = def.get("when") else {
            return false;
        };
        let Value::Sequence(matchers) = when.value() else {
            return false;
        };
        !matchers.is_empty() && matchers.iter().all(Self::matcher_is_valid)
    }

    fn resolve(&self, iter: &mut Evaluator, input: &ResolverInput) -> Result<ResolverOutput> {
        let def = input_definition("conditional", input)?;
        let when = def
            .get("when")
            .ok_or_else(|| Error::invalid_resolver_input("conditional", Some(def.tree_address().to_string())))?;

        for index in 0..when.len() {
            let matcher = when.get(&index.to_string()).ok_or_else(|| {
                Error::invalid_resolver_input("conditional", Some(when.tree_address().to_string()))
            })?;
            let (matches_lookup, pattern) = match matcher.value() {
                Value::Mapping(map) => match (map.get("matches"), map.get("pattern")) {
                    (Some(Value::String(m)), Some(Value::String(p))) => (m.clone(), p.clone()),
                    _ => {
                        return Err(Error::invalid_resolver_input(
                            "conditional",
                            Some(matcher.tree_address().to_string()),
                        ))
                    }
                },
                _ => {
                    return Err(Error::invalid_resolver_input(
                        "conditional",
                        Some(matcher.tree_address().to_string()),
                    ))
                }
            };

            // A lookup that fails to resolve falls through silently
            let subject = match iter.resolve(&matches_lookup) {
                Ok(value) => value,
                Err(e) => {
                    log::trace!(
                        "Matcher lookup '{}' did not resolve, falling through: {}",
                        matches_lookup,
                        e
                    );
                    continue;
                }
            };
            let Some(text) = Self::match_text(&subject) else {
                continue;
            };

            // A pattern that does not compile also falls through
            let regex = match Regex::new(&pattern) {
                Ok(regex) => regex,
                Err(e) => {
                    log::warn!(
                        "Invalid matcher pattern '{}' at '{}', falling through: {}",
                        pattern,
                        matcher.tree_address(),
                        e
                    );
                    continue;
                }
            };
            let Some(captures) = regex.captures(&text) else {
                continue;
            };

            let mut bindings = IndexMap::new();
            for (group, capture) in captures.iter().enumerate() {
                if let Some(capture) = capture {
                    bindings.insert(
                        format!("${}", group),
                        Value::String(capture.as_str().to_string()),
                    );
                }
            }

            let mut branch = iter.isolated_clone();
            branch
                .context_mut()
                .set("$match", Value::Mapping(bindings), false)?;
            let result = branch.resolve_in("use", &matcher)?;
            return Ok(ResolverOutput::Value(result));
        }

        Ok(ResolverOutput::Value(iter.resolve_in("default", def)?))
    }
}

// =============================================================================
// Template Resolver
// =============================================================================

/// Renders a template with resolved data bindings
pub struct TemplateResolver;

impl Resolver for TemplateResolver {
    fn indicator(&self) -> &'static str {
        "template"
    }

    fn is_valid(&self, iter: &mut Evaluator, def: &Definition) -> bool {
        if !def.has("template") || !def.has("provide") {
            return false;
        }
        if def.has("engine") {
            match resolve_string(iter, "engine", def) {
                Ok(engine) if iter.templates().has(&engine) => {}
                _ => return false,
            }
        }
        true
    }

    fn resolve(&self, iter: &mut Evaluator, input: &ResolverInput) -> Result<ResolverOutput> {
        let def = input_definition("template", input)?;
        let engine_name = resolve_string_or(iter, "engine", def, "mustache")?;
        let engine = iter.templates().get(&engine_name).ok_or_else(|| {
            Error::template(format!("No template engine registered as '{}'", engine_name))
                .with_lookup(def.tree_address().to_string())
        })?;

        let source = resolve_string(iter, "template", def)?;

        let provide = def
            .get("provide")
            .ok_or_else(|| Error::invalid_resolver_input("template", Some(def.tree_address().to_string())))?;
        let mut data = IndexMap::new();
        if provide.is_list() {
            for index in 0..provide.len() {
                let entry = provide.get(&index.to_string()).ok_or_else(|| {
                    Error::invalid_resolver_input("template", Some(provide.tree_address().to_string()))
                })?;
                let name = entry.value().as_str().ok_or_else(|| {
                    Error::invalid_resolver_input("template", Some(entry.tree_address().to_string()))
                })?;
                let value = iter.resolve(name)?;
                data.insert(name.to_string(), value);
            }
        } else {
            for key in provide.keys() {
                let value = iter.resolve_in(&key, &provide)?;
                data.insert(key, value);
            }
        }

        let rendered = engine.render(&source, &Value::Mapping(data))?;
        Ok(ResolverOutput::Value(Value::String(rendered)))
    }
}

// =============================================================================
// Url Resolver
// =============================================================================

/// Sentinel base for composing relative URLs; stripped from the output
/// when the host was never overridden. The https scheme carries into
/// hostname-only compositions.
const FAKE_BASE: &str = "https://windward-fake-base.invalid";

/// Composes a URL from a base plus overriding parts
pub struct UrlResolver;

impl Resolver for UrlResolver {
    fn indicator(&self) -> &'static str {
        "baseUrl"
    }

    fn is_valid(&self, _iter: &mut Evaluator, def: &Definition) -> bool {
        if !def.has("baseUrl") {
            return false;
        }
        if let Some(query) = def.get("query") {
            if !query.value().is_mapping() {
                return false;
            }
        }
        if def.has("password") && !def.has("username") {
            return false;
        }
        true
    }

    fn resolve(&self, iter: &mut Evaluator, input: &ResolverInput) -> Result<ResolverOutput> {
        let def = input_definition("url", input)?;

        let base_value = iter.resolve_in("baseUrl", def)?;
        let (base_str, base_is_false) = match &base_value {
            Value::Bool(false) => (String::new(), true),
            Value::String(s) => (s.clone(), false),
            other => {
                return Err(Error::type_mismatch("baseUrl", other.type_name())
                    .with_lookup(def.tree_address().to_string()))
            }
        };

        if base_is_false && !def.has("hostname") {
            for forbidden in ["protocol", "port", "username", "password"] {
                if def.has(forbidden) {
                    return Err(Error::invalid_resolver_input(
                        "url",
                        Some(def.tree_address().to_string()),
                    )
                    .with_help(format!(
                        "'{}' requires an absolute base or a 'hostname'",
                        forbidden
                    )));
                }
            }
        }

        let relative_base = base_is_false || !base_str.contains("://");
        let fake = Url::parse(FAKE_BASE)
            .map_err(|e| Error::malformed(format!("URL composition failed: {}", e)))?;
        let mut url = if base_is_false {
            fake.clone()
        } else if relative_base {
            fake.join(&base_str).map_err(|e| {
                Error::malformed(format!("Invalid baseUrl '{}': {}", base_str, e))
            })?
        } else {
            Url::parse(&base_str).map_err(|e| {
                Error::malformed(format!("Invalid baseUrl '{}': {}", base_str, e))
            })?
        };

        // Base query participates in the merge even when a pathname join
        // would drop it
        let mut merged: IndexMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if def.has("protocol") {
            let protocol = resolve_string(iter, "protocol", def)?;
            url.set_scheme(protocol.trim_end_matches(':')).map_err(|_| {
                Error::malformed(format!("Invalid protocol '{}'", protocol))
                    .with_lookup(def.tree_address().to_string())
            })?;
        }
        if def.has("hostname") {
            let hostname = resolve_string(iter, "hostname", def)?;
            url.set_host(Some(&hostname)).map_err(|e| {
                Error::malformed(format!("Invalid hostname '{}': {}", hostname, e))
                    .with_lookup(def.tree_address().to_string())
            })?;
        }
        if def.has("port") {
            let port = match iter.resolve_in("port", def)? {
                Value::Integer(i) => i as u16,
                Value::String(s) => s.parse().map_err(|_| {
                    Error::malformed(format!("Invalid port '{}'", s))
                        .with_lookup(def.tree_address().to_string())
                })?,
                other => {
                    return Err(Error::type_mismatch("port", other.type_name())
                        .with_lookup(def.tree_address().to_string()))
                }
            };
            url.set_port(Some(port))
                .map_err(|_| Error::malformed("Cannot set port on this URL"))?;
        }
        if def.has("username") {
            let username = resolve_string(iter, "username", def)?;
            url.set_username(&username)
                .map_err(|_| Error::malformed("Cannot set username on this URL"))?;
            if def.has("password") {
                let password = resolve_string(iter, "password", def)?;
                url.set_password(Some(&password))
                    .map_err(|_| Error::malformed("Cannot set password on this URL"))?;
            }
        }

        // A pathname starting with '/' replaces the whole path; otherwise
        // it replaces everything after the base path's last segment
        if def.has("pathname") {
            let pathname = resolve_string(iter, "pathname", def)?;
            url = url.join(&pathname).map_err(|e| {
                Error::malformed(format!("Invalid pathname '{}': {}", pathname, e))
                    .with_lookup(def.tree_address().to_string())
            })?;
        }

        if def.has("search") {
            let search = resolve_string(iter, "search", def)?;
            for (key, value) in url::form_urlencoded::parse(search.trim_start_matches('?').as_bytes())
            {
                merged.insert(key.into_owned(), value.into_owned());
            }
        }
        if let Some(query) = def.get("query") {
            for key in query.keys() {
                let value = iter.resolve_in(&key, &query)?;
                merged.insert(key, format!("{}", value));
            }
        }

        url.set_query(None);
        if !merged.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &merged {
                pairs.append_pair(key, value);
            }
        }

        if def.has("hash") {
            let hash = resolve_string(iter, "hash", def)?;
            url.set_fragment(Some(hash.trim_start_matches('#')));
        }

        // Still on the sentinel host after all overrides: emit only the
        // path onward
        let result = if relative_base && url.host_str() == fake.host_str() {
            url[Position::BeforePath..].to_string()
        } else {
            url.to_string()
        };

        Ok(ResolverOutput::Value(Value::String(result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::template::TemplateRegistry;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn definition(yaml: &str, base: impl Into<PathBuf>) -> Definition {
        let parsed: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        Definition::from_value(Value::from(parsed), base.into())
    }

    fn evaluator(yaml: &str) -> Evaluator {
        Evaluator::new(definition(yaml, "/tmp"), Context::new())
    }

    /// Transport that records calls and returns a canned reply
    struct RecordingTransport {
        calls: Mutex<Vec<HttpCall>>,
        reply: HttpReply,
    }

    impl RecordingTransport {
        fn new(reply: HttpReply) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply,
            })
        }

        fn json(body: &str) -> Arc<Self> {
            let mut headers = IndexMap::new();
            headers.insert("content-type".to_string(), "application/json".to_string());
            Self::new(HttpReply {
                status: 200,
                headers,
                body: body.as_bytes().to_vec(),
            })
        }

        fn last_call(&self) -> HttpCall {
            self.calls.lock().unwrap().last().unwrap().clone()
        }
    }

    impl HttpTransport for RecordingTransport {
        fn send(&self, call: &HttpCall) -> Result<HttpReply> {
            self.calls.lock().unwrap().push(call.clone());
            Ok(self.reply.clone())
        }
    }

    fn evaluator_with_transport(
        yaml: &str,
        facts: &crate::context::RequestFacts,
        transport: Arc<dyn HttpTransport>,
    ) -> Evaluator {
        Evaluator::with_parts(
            definition(yaml, "/tmp"),
            Context::from_request_with_env(facts, IndexMap::new()),
            Arc::new(ResolverRegistry::with_builtins()),
            Arc::new(TemplateRegistry::with_builtins()),
            transport,
        )
    }

    fn request_facts() -> crate::context::RequestFacts {
        crate::context::RequestFacts {
            headers: {
                let mut h = IndexMap::new();
                h.insert("accept".to_string(), "application/json".to_string());
                h
            },
            query: IndexMap::new(),
            url: crate::context::UrlFacts {
                host: "frontend.test".to_string(),
                port: 80,
                pathname: "/graphql".to_string(),
                search: "?v=1".to_string(),
            },
        }
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    #[test]
    fn test_registry_infers_by_indicator() {
        let registry = ResolverRegistry::with_builtins();
        let def = definition("inline: hello", "/tmp");
        assert_eq!(registry.for_definition(&def).unwrap().indicator(), "inline");

        let def = definition("target: https://example.test", "/tmp");
        assert_eq!(registry.for_definition(&def).unwrap().indicator(), "target");
    }

    #[test]
    fn test_registry_priority_order() {
        // A node carrying both 'when' and 'inline' is conditional
        let registry = ResolverRegistry::with_builtins();
        let def = definition("when: []\ninline: x\ndefault: y", "/tmp");
        assert_eq!(registry.for_definition(&def).unwrap().indicator(), "when");
    }

    #[test]
    fn test_registry_explicit_tag() {
        let registry = ResolverRegistry::with_builtins();
        let def = definition("resolver: inline\ninline: hello", "/tmp");
        assert_eq!(registry.for_definition(&def).unwrap().indicator(), "inline");

        let def = definition("resolver: nonesuch\ninline: hello", "/tmp");
        let err = match registry.for_definition(&def) {
            Err(err) => err,
            Ok(resolver) => panic!("expected an error, got '{}'", resolver.indicator()),
        };
        assert!(format!("{}", err).contains("Unknown resolver: nonesuch"));
    }

    #[test]
    fn test_registry_deprecated_indicator() {
        let registry = ResolverRegistry::with_builtins();
        let def = definition("url: https://backend.test/graphql\nquery: '{ x }'", "/tmp");
        assert_eq!(
            registry.for_definition(&def).unwrap().indicator(),
            "endpoint"
        );
    }

    #[test]
    fn test_registry_no_match() {
        let registry = ResolverRegistry::with_builtins();
        let def = definition("nothing: here", "/tmp");
        assert!(registry.for_definition(&def).is_err());
    }

    #[test]
    fn test_registry_shorthand_dispatch() {
        let registry = ResolverRegistry::with_builtins();
        assert_eq!(registry.for_scalar("./index.html").unwrap().indicator(), "file");
        assert_eq!(registry.for_scalar("file:///etc/motd").unwrap().indicator(), "file");
        assert!(registry.for_scalar("plain lookup").is_none());
    }

    #[test]
    fn test_registry_register_replaces_in_place() {
        let mut registry = ResolverRegistry::with_builtins();
        registry.register("inline", Arc::new(InlineResolver));
        let repr = format!("{:?}", registry);
        assert_eq!(repr.matches("inline").count(), 1);
    }

    // -------------------------------------------------------------------------
    // Inline
    // -------------------------------------------------------------------------

    #[test]
    fn test_inline_scalar() {
        let mut iter = evaluator("node:\n  inline: hello");
        let def = iter.root().get("node").unwrap();
        let out = InlineResolver
            .resolve(&mut iter, &ResolverInput::Definition(def))
            .unwrap();
        match out {
            ResolverOutput::Value(v) => assert_eq!(v, Value::from("hello")),
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn test_inline_mapping_is_compound() {
        let mut iter = evaluator("node:\n  inline:\n    a: 1\n    b: 2");
        let def = iter.root().get("node").unwrap();
        let out = InlineResolver
            .resolve(&mut iter, &ResolverInput::Definition(def))
            .unwrap();
        match out {
            ResolverOutput::Definition(d) => assert_eq!(d.tree_address(), "node.inline"),
            other => panic!("expected definition, got {:?}", other),
        }
    }

    // -------------------------------------------------------------------------
    // File
    // -------------------------------------------------------------------------

    fn file_fixture(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_file_reads_relative_to_base_path() {
        let dir = file_fixture("windward_test_file_read");
        std::fs::write(dir.join("greeting.txt"), "hello file").unwrap();

        let root = definition("doc:\n  file:\n    inline: ./greeting.txt", &dir);
        let mut iter = Evaluator::new(root, Context::new());
        let result = iter.resolve("doc").unwrap();
        assert_eq!(result, Value::from("hello file"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_escape_fails_closed() {
        let dir = file_fixture("windward_test_file_escape");
        let inner = dir.join("app");
        std::fs::create_dir_all(&inner).unwrap();
        std::fs::write(dir.join("secret.txt"), "secret").unwrap();

        let root = definition("doc: ../secret.txt", &inner);
        let mut iter = Evaluator::new(root, Context::new());
        let result = iter.resolve("doc").unwrap();
        match result {
            Value::Response(response) => assert_eq!(response.status, 404),
            other => panic!("expected 404 response, got {:?}", other),
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_missing_is_404() {
        let dir = file_fixture("windward_test_file_missing");
        let root = definition("doc: ./nope.txt", &dir);
        let mut iter = Evaluator::new(root, Context::new());
        match iter.resolve("doc").unwrap() {
            Value::Response(response) => assert_eq!(response.status, 404),
            other => panic!("expected 404 response, got {:?}", other),
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_json_auto_parse() {
        let dir = file_fixture("windward_test_file_json");
        std::fs::write(dir.join("data.json"), r#"{"n": 3}"#).unwrap();

        let root = definition("doc:\n  file:\n    inline: ./data.json", &dir);
        let mut iter = Evaluator::new(root, Context::new());
        let result = iter.resolve("doc").unwrap();
        assert_eq!(crate::store::get_path(&result, "n"), Some(&Value::Integer(3)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_bad_json_is_fatal() {
        let dir = file_fixture("windward_test_file_badjson");
        std::fs::write(dir.join("data.json"), "{ nope").unwrap();

        let root = definition("doc:\n  file:\n    inline: ./data.json", &dir);
        let mut iter = Evaluator::new(root, Context::new());
        let err = iter.resolve("doc").unwrap_err();
        assert!(format!("{}", err).contains("Invalid JSON"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_text_parse_keeps_json_verbatim() {
        let dir = file_fixture("windward_test_file_text");
        std::fs::write(dir.join("data.json"), r#"{"n": 3}"#).unwrap();

        let root = definition(
            "doc:\n  file:\n    inline: ./data.json\n  parse:\n    inline: text",
            &dir,
        );
        let mut iter = Evaluator::new(root, Context::new());
        assert_eq!(iter.resolve("doc").unwrap(), Value::from(r#"{"n": 3}"#));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_encodings() {
        let dir = file_fixture("windward_test_file_encodings");
        std::fs::write(dir.join("raw.bin"), [0xC3, 0xA9]).unwrap();

        // 'binary' and 'latin-1' are builtin values, so they need no wrapper
        let root = definition(
            concat!(
                "asBinary:\n",
                "  file:\n",
                "    inline: ./raw.bin\n",
                "  encoding: binary\n",
                "asLatin:\n",
                "  file:\n",
                "    inline: ./raw.bin\n",
                "  encoding: latin-1\n",
            ),
            &dir,
        );
        let mut iter = Evaluator::new(root, Context::new());
        assert_eq!(
            iter.resolve("asBinary").unwrap(),
            Value::Bytes(vec![0xC3, 0xA9])
        );
        // Each byte becomes one char
        assert_eq!(iter.resolve("asLatin").unwrap(), Value::from("\u{c3}\u{a9}"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_invalid_encoding_rejected() {
        let mut iter = evaluator("doc:\n  file:\n    inline: ./x.txt\n  encoding: ebcdic");
        let def = iter.root().get("doc").unwrap();
        assert!(!FileResolver.is_valid(&mut iter, &def));
    }

    // -------------------------------------------------------------------------
    // Directory
    // -------------------------------------------------------------------------

    #[test]
    fn test_directory_serves_static_file() {
        let dir = file_fixture("windward_test_directory");
        let assets = dir.join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(assets.join("app.css"), "body{}").unwrap();

        let mut facts = request_facts();
        facts.url.pathname = "/app.css".to_string();
        let root = definition("static:\n  directory:\n    inline: ./assets", &dir);
        let mut iter = Evaluator::new(
            root,
            Context::from_request_with_env(&facts, IndexMap::new()),
        );

        match iter.resolve("static").unwrap() {
            Value::Response(response) => {
                assert_eq!(response.status, 200);
                assert_eq!(
                    response.headers.get("Content-Type"),
                    Some(&"text/css".to_string())
                );
                assert_eq!(
                    response.headers.get("Cache-Control"),
                    Some(&"max-age=31557600".to_string())
                );
                assert_eq!(response.body, Body::Binary(b"body{}".to_vec()));
            }
            other => panic!("expected response, got {:?}", other),
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_directory_traversal_is_404() {
        let dir = file_fixture("windward_test_directory_traversal");
        let assets = dir.join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(dir.join("secret.txt"), "secret").unwrap();

        let mut facts = request_facts();
        facts.url.pathname = "/../secret.txt".to_string();
        let root = definition("static:\n  directory:\n    inline: ./assets", &dir);
        let mut iter = Evaluator::new(
            root,
            Context::from_request_with_env(&facts, IndexMap::new()),
        );

        match iter.resolve("static").unwrap() {
            Value::Response(response) => assert_eq!(response.status, 404),
            other => panic!("expected 404 response, got {:?}", other),
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_directory_missing_dir_is_invalid() {
        let mut iter = evaluator("static:\n  directory:\n    inline: ./no-such-dir");
        let def = iter.root().get("static").unwrap();
        assert!(!DirectoryResolver.is_valid(&mut iter, &def));
    }

    // -------------------------------------------------------------------------
    // Proxy
    // -------------------------------------------------------------------------

    #[test]
    fn test_proxy_forwards_request_with_host_rewrite() {
        let transport = RecordingTransport::new(HttpReply {
            status: 201,
            headers: {
                let mut h = IndexMap::new();
                h.insert("x-served-by".to_string(), "upstream".to_string());
                h.insert("transfer-encoding".to_string(), "chunked".to_string());
                h
            },
            body: b"proxied".to_vec(),
        });
        let yaml = "proxy:\n  target:\n    inline: https://backend.test:8443/ignored";
        let mut iter = evaluator_with_transport(yaml, &request_facts(), transport.clone());

        let result = iter.resolve("proxy").unwrap();
        let call = transport.last_call();
        assert_eq!(call.method, "GET");
        assert_eq!(call.url, "https://backend.test:8443/graphql?v=1");
        assert_eq!(call.headers.get("host"), Some(&"backend.test:8443".to_string()));
        assert_eq!(
            call.headers.get("accept"),
            Some(&"application/json".to_string())
        );
        assert!(!call.ignore_ssl_errors);

        match result {
            Value::Response(response) => {
                assert_eq!(response.status, 201);
                assert_eq!(response.headers.get("x-served-by"), Some(&"upstream".to_string()));
                assert!(!response.headers.contains_key("transfer-encoding"));
                assert_eq!(response.body, Body::Binary(b"proxied".to_vec()));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_proxy_ignore_ssl_errors() {
        let transport = RecordingTransport::json("{}");
        let yaml = "proxy:\n  target:\n    inline: https://backend.test\n  ignoreSSLErrors: true";
        let mut iter = evaluator_with_transport(yaml, &request_facts(), transport.clone());
        iter.resolve("proxy").unwrap();
        assert!(transport.last_call().ignore_ssl_errors);
    }

    #[test]
    fn test_proxy_non_bool_ignore_ssl_is_invalid() {
        let mut iter = evaluator(
            "proxy:\n  target:\n    inline: https://backend.test\n  ignoreSSLErrors: soon",
        );
        let def = iter.root().get("proxy").unwrap();
        assert!(!ProxyResolver.is_valid(&mut iter, &def));
    }

    // -------------------------------------------------------------------------
    // Service
    // -------------------------------------------------------------------------

    #[test]
    fn test_service_post_payload() {
        let transport = RecordingTransport::json(r#"{"data":{"name":"Ada"}}"#);
        let yaml = concat!(
            "data:\n",
            "  endpoint:\n",
            "    inline: https://backend.test/graphql\n",
            "  query:\n",
            "    inline: 'query { name }'\n",
            "  variables:\n",
            "    inline:\n",
            "      id:\n",
            "        inline: 42\n",
        );
        let mut iter = evaluator_with_transport(yaml, &request_facts(), transport.clone());

        let result = iter.resolve("data").unwrap();
        assert_eq!(
            crate::store::get_path(&result, "data.name"),
            Some(&Value::from("Ada"))
        );

        let call = transport.last_call();
        assert_eq!(call.method, "POST");
        assert_eq!(call.url, "https://backend.test/graphql");
        assert_eq!(
            call.headers.get("Content-type"),
            Some(&"application/json".to_string())
        );
        let payload: serde_json::Value =
            serde_json::from_slice(call.body.as_deref().unwrap()).unwrap();
        assert_eq!(payload["query"], "query { name }");
        assert_eq!(payload["variables"]["id"], 42);
    }

    #[test]
    fn test_service_get_puts_query_in_url() {
        let transport = RecordingTransport::json("{}");
        let yaml = concat!(
            "data:\n",
            "  endpoint:\n",
            "    inline: https://backend.test/graphql\n",
            "  method:\n",
            "    inline: GET\n",
            "  query:\n",
            "    inline: '{ x }'\n",
        );
        let mut iter = evaluator_with_transport(yaml, &request_facts(), transport.clone());
        iter.resolve("data").unwrap();

        let call = transport.last_call();
        assert_eq!(call.method, "GET");
        assert!(call.url.contains("query=%7B+x+%7D"));
        assert!(call.body.is_none());
    }

    #[test]
    fn test_service_caller_headers_win() {
        let transport = RecordingTransport::json("{}");
        let yaml = concat!(
            "data:\n",
            "  endpoint:\n",
            "    inline: https://backend.test/graphql\n",
            "  query:\n",
            "    inline: '{ x }'\n",
            "  headers:\n",
            "    inline:\n",
            "      Content-type:\n",
            "        inline: application/graphql\n",
        );
        let mut iter = evaluator_with_transport(yaml, &request_facts(), transport.clone());
        iter.resolve("data").unwrap();
        assert_eq!(
            transport.last_call().headers.get("Content-type"),
            Some(&"application/graphql".to_string())
        );
    }

    #[test]
    fn test_service_non_json_reply_is_malformed() {
        let transport = RecordingTransport::new(HttpReply {
            status: 200,
            headers: IndexMap::new(),
            body: b"<html>".to_vec(),
        });
        let yaml = concat!(
            "data:\n",
            "  endpoint:\n",
            "    inline: https://backend.test/graphql\n",
            "  query:\n",
            "    inline: '{ x }'\n",
        );
        let mut iter = evaluator_with_transport(yaml, &request_facts(), transport);
        let err = iter.resolve("data").unwrap_err();
        assert!(format!("{}", err).contains("non-JSON body"));
    }

    #[test]
    fn test_service_validity_rules() {
        let mut iter = evaluator("svc:\n  endpoint: x\n  url: y\n  query: q");
        let def = iter.root().get("svc").unwrap();
        // Both endpoint and url present
        assert!(!ServiceResolver.is_valid(&mut iter, &def));

        let mut iter = evaluator("svc:\n  endpoint:\n    inline: x");
        let def = iter.root().get("svc").unwrap();
        // Missing query
        assert!(!ServiceResolver.is_valid(&mut iter, &def));

        let mut iter = evaluator(
            "svc:\n  endpoint:\n    inline: x\n  query:\n    inline: q\n  method:\n    inline: DELETE",
        );
        let def = iter.root().get("svc").unwrap();
        assert!(!ServiceResolver.is_valid(&mut iter, &def));
    }

    #[test]
    fn test_service_over_the_wire() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/graphql")
            .match_header("content-type", "application/json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{"ok":true}}"#)
            .create();

        let yaml = format!(
            "data:\n  endpoint:\n    inline: {}/graphql\n  query:\n    inline: '{{ ok }}'\n",
            server.url()
        );
        let root = definition(&yaml, "/tmp");
        let mut iter = Evaluator::new(root, Context::new());

        let result = iter.resolve("data").unwrap();
        assert_eq!(
            crate::store::get_path(&result, "data.ok"),
            Some(&Value::Bool(true))
        );
        mock.assert();
    }

    #[test]
    fn test_proxy_over_the_wire() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/graphql?v=1")
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_body("from upstream")
            .create();

        let yaml = format!("proxy:\n  target:\n    inline: {}\n", server.url());
        let root = definition(&yaml, "/tmp");
        let mut iter = Evaluator::new(
            root,
            Context::from_request_with_env(&request_facts(), IndexMap::new()),
        );

        match iter.resolve("proxy").unwrap() {
            Value::Response(response) => {
                assert_eq!(response.status, 200);
                assert_eq!(response.body, Body::Binary(b"from upstream".to_vec()));
            }
            other => panic!("expected response, got {:?}", other),
        }
        mock.assert();
    }

    // -------------------------------------------------------------------------
    // Conditional
    // -------------------------------------------------------------------------

    fn conditional_yaml() -> &'static str {
        concat!(
            "result:\n",
            "  when:\n",
            "    - matches: request.url.pathname\n",
            "      pattern: '^/products/(\\d+)$'\n",
            "      use:\n",
            "        inline: product-page\n",
            "    - matches: request.url.pathname\n",
            "      pattern: '^/cart'\n",
            "      use:\n",
            "        inline: cart-page\n",
            "  default:\n",
            "    inline: home-page\n",
        )
    }

    fn conditional_eval(pathname: &str) -> Evaluator {
        let mut facts = request_facts();
        facts.url.pathname = pathname.to_string();
        Evaluator::new(
            definition(conditional_yaml(), "/tmp"),
            Context::from_request_with_env(&facts, IndexMap::new()),
        )
    }

    #[test]
    fn test_conditional_first_match_wins() {
        let mut iter = conditional_eval("/products/42");
        assert_eq!(iter.resolve("result").unwrap(), Value::from("product-page"));

        let mut iter = conditional_eval("/cart/checkout");
        assert_eq!(iter.resolve("result").unwrap(), Value::from("cart-page"));
    }

    #[test]
    fn test_conditional_default_on_no_match() {
        let mut iter = conditional_eval("/about");
        assert_eq!(iter.resolve("result").unwrap(), Value::from("home-page"));
    }

    #[test]
    fn test_conditional_capture_groups() {
        let yaml = concat!(
            "result:\n",
            "  when:\n",
            "    - matches: request.url.pathname\n",
            "      pattern: '^/products/(\\d+)$'\n",
            "      use:\n",
            "        template:\n",
            "          inline: 'id={{id}}'\n",
            "        provide:\n",
            "          id: $match.$1\n",
            "  default:\n",
            "    inline: none\n",
        );
        let mut facts = request_facts();
        facts.url.pathname = "/products/42".to_string();
        let mut iter = Evaluator::new(
            definition(yaml, "/tmp"),
            Context::from_request_with_env(&facts, IndexMap::new()),
        );
        assert_eq!(iter.resolve("result").unwrap(), Value::from("id=42"));
        // Captures stay on the isolated branch
        assert!(!iter.context().has("$match"));
    }

    #[test]
    fn test_conditional_failed_lookup_falls_through() {
        let yaml = concat!(
            "result:\n",
            "  when:\n",
            "    - matches: no.such.lookup\n",
            "      pattern: '.*'\n",
            "      use:\n",
            "        inline: never\n",
            "  default:\n",
            "    inline: fallback\n",
        );
        let mut iter = Evaluator::new(
            definition(yaml, "/tmp"),
            Context::from_request_with_env(&request_facts(), IndexMap::new()),
        );
        assert_eq!(iter.resolve("result").unwrap(), Value::from("fallback"));
    }

    #[test]
    fn test_conditional_invalid_pattern_falls_through() {
        let yaml = concat!(
            "result:\n",
            "  when:\n",
            "    - matches: request.url.pathname\n",
            "      pattern: '(unclosed'\n",
            "      use:\n",
            "        inline: never\n",
            "    - matches: request.url.pathname\n",
            "      pattern: '^/graphql$'\n",
            "      use:\n",
            "        inline: next-matcher\n",
            "  default:\n",
            "    inline: fallback\n",
        );
        let mut iter = Evaluator::new(
            definition(yaml, "/tmp"),
            Context::from_request_with_env(&request_facts(), IndexMap::new()),
        );
        assert_eq!(iter.resolve("result").unwrap(), Value::from("next-matcher"));
    }

    #[test]
    fn test_conditional_validity() {
        let mut iter = evaluator("c:\n  when:\n    - matches: x\n      pattern: y\n      use: z");
        let def = iter.root().get("c").unwrap();
        // Missing default
        assert!(!ConditionalResolver.is_valid(&mut iter, &def));

        let mut iter = evaluator("c:\n  when:\n    - matches: x\n  default: d");
        let def = iter.root().get("c").unwrap();
        // Matcher missing pattern and use
        assert!(!ConditionalResolver.is_valid(&mut iter, &def));
    }

    // -------------------------------------------------------------------------
    // Template
    // -------------------------------------------------------------------------

    #[test]
    fn test_template_with_provide_mapping() {
        let yaml = concat!(
            "name:\n",
            "  inline: Ada\n",
            "page:\n",
            "  template:\n",
            "    inline: 'Hello {{who}}'\n",
            "  provide:\n",
            "    who: name\n",
        );
        let mut iter = evaluator(yaml);
        assert_eq!(iter.resolve("page").unwrap(), Value::from("Hello Ada"));
    }

    #[test]
    fn test_template_with_provide_list() {
        let yaml = concat!(
            "name:\n",
            "  inline: Ada\n",
            "page:\n",
            "  template:\n",
            "    inline: 'Hello {{name}}'\n",
            "  provide:\n",
            "    - name\n",
        );
        let mut iter = evaluator(yaml);
        assert_eq!(iter.resolve("page").unwrap(), Value::from("Hello Ada"));
    }

    #[test]
    fn test_template_unknown_engine_is_invalid() {
        let yaml = concat!(
            "page:\n",
            "  template:\n",
            "    inline: x\n",
            "  engine:\n",
            "    inline: handlebars\n",
            "  provide: []\n",
        );
        let mut iter = evaluator(yaml);
        let def = iter.root().get("page").unwrap();
        assert!(!TemplateResolver.is_valid(&mut iter, &def));
    }

    // -------------------------------------------------------------------------
    // Url
    // -------------------------------------------------------------------------

    fn resolve_url(yaml: &str) -> Value {
        let mut iter = evaluator(yaml);
        iter.resolve("u").unwrap()
    }

    #[test]
    fn test_url_absolute_base_with_pathname() {
        let out = resolve_url(
            "u:\n  baseUrl:\n    inline: https://api.test/v1/\n  pathname:\n    inline: products\n",
        );
        assert_eq!(out, Value::from("https://api.test/v1/products"));
    }

    #[test]
    fn test_url_absolute_pathname_replaces() {
        let out = resolve_url(
            "u:\n  baseUrl:\n    inline: https://api.test/v1/things\n  pathname:\n    inline: /health\n",
        );
        assert_eq!(out, Value::from("https://api.test/health"));
    }

    #[test]
    fn test_url_relative_pathname_replaces_last_segment() {
        let out = resolve_url(
            "u:\n  baseUrl:\n    inline: https://api.test/v1/things\n  pathname:\n    inline: other\n",
        );
        assert_eq!(out, Value::from("https://api.test/v1/other"));
    }

    #[test]
    fn test_url_relative_base_stays_relative() {
        let out = resolve_url(
            "u:\n  baseUrl:\n    inline: /graphql\n  query:\n    v:\n      inline: 2\n",
        );
        assert_eq!(out, Value::from("/graphql?v=2"));
    }

    #[test]
    fn test_url_false_base_relative_pathname_gets_leading_slash() {
        let out = resolve_url(
            "u:\n  baseUrl:\n    inline: false\n  pathname:\n    inline: no-slash-path\n",
        );
        assert_eq!(out, Value::from("/no-slash-path"));
    }

    #[test]
    fn test_url_false_base_with_hostname_is_https() {
        let out = resolve_url(concat!(
            "u:\n",
            "  baseUrl:\n",
            "    inline: false\n",
            "  hostname:\n",
            "    inline: backend.test\n",
            "  pathname:\n",
            "    inline: /graphql\n",
        ));
        assert_eq!(out, Value::from("https://backend.test/graphql"));
    }

    #[test]
    fn test_url_query_merge_caller_wins() {
        let out = resolve_url(
            "u:\n  baseUrl:\n    inline: https://api.test/search?q=old&page=1\n  query:\n    q:\n      inline: new\n",
        );
        assert_eq!(out, Value::from("https://api.test/search?q=new&page=1"));
    }

    #[test]
    fn test_url_parts_override_base() {
        let out = resolve_url(concat!(
            "u:\n",
            "  baseUrl:\n",
            "    inline: http://api.test/v1\n",
            "  protocol:\n",
            "    inline: 'https:'\n",
            "  hostname:\n",
            "    inline: other.test\n",
            "  port:\n",
            "    inline: 8443\n",
        ));
        assert_eq!(out, Value::from("https://other.test:8443/v1"));
    }

    #[test]
    fn test_url_false_base_forbids_authority_parts() {
        let mut iter = evaluator(
            "u:\n  baseUrl:\n    inline: false\n  port:\n    inline: 80\n",
        );
        assert!(iter.resolve("u").is_err());
    }

    #[test]
    fn test_url_validity() {
        let mut iter = evaluator("u:\n  baseUrl:\n    inline: /x\n  query: notamapping");
        let def = iter.root().get("u").unwrap();
        assert!(!UrlResolver.is_valid(&mut iter, &def));

        let mut iter = evaluator("u:\n  baseUrl:\n    inline: /x\n  password:\n    inline: p");
        let def = iter.root().get("u").unwrap();
        assert!(!UrlResolver.is_valid(&mut iter, &def));
    }

    // -------------------------------------------------------------------------
    // Content types
    // -------------------------------------------------------------------------

    #[test]
    fn test_content_type_table() {
        assert_eq!(content_type_for(Path::new("a/index.html")), "text/html");
        assert_eq!(content_type_for(Path::new("app.js")), "application/javascript");
        assert_eq!(content_type_for(Path::new("logo.SVG")), "image/svg+xml");
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
    }
}
