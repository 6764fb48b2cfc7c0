//! Request controller
//!
//! Sits between the HTTP transport and the evaluator: loads the
//! definition once, then assembles one response per request by resolving
//! the three top-level fields. Engine errors never escape; they become a
//! 500 response.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::context::{Context, RequestFacts};
use crate::definition::Definition;
use crate::error::{Error, Result};
use crate::evaluator::Evaluator;
use crate::resolver::{HttpTransport, Resolver, ResolverRegistry, UreqTransport};
use crate::template::{TemplateEngine, TemplateRegistry};
use crate::value::{Body, ResponseValue, Value};

const REQUIRED_KEYS: &[&str] = &["status", "headers", "body"];

pub struct Controller {
    definition: Definition,
    registry: ResolverRegistry,
    templates: TemplateRegistry,
    transport: Arc<dyn HttpTransport>,
}

impl Controller {
    /// Load a definition file and validate its top-level shape
    pub fn new(definition_path: impl AsRef<Path>) -> Result<Self> {
        let definition = Definition::from_yaml_file(definition_path)?;
        Self::with_definition(definition)
    }

    /// Build a controller over an already-loaded definition
    pub fn with_definition(definition: Definition) -> Result<Self> {
        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !definition.has(key))
            .collect();
        if !missing.is_empty() {
            return Err(Error::parse(format!(
                "Definition is missing required keys: {}",
                missing.join(", ")
            ))
            .with_help("A definition must declare 'status', 'headers', and 'body'"));
        }

        Ok(Self {
            definition,
            registry: ResolverRegistry::with_builtins(),
            templates: TemplateRegistry::with_builtins(),
            transport: Arc::new(UreqTransport),
        })
    }

    /// Register a custom resolution strategy
    pub fn register_resolver(&mut self, tag: impl Into<String>, resolver: Arc<dyn Resolver>) {
        self.registry.register(tag, resolver);
    }

    /// Register a custom template engine
    pub fn register_template_engine(&mut self, engine: Arc<dyn TemplateEngine>) {
        self.templates.register(engine);
    }

    /// Replace the HTTP transport (tests, instrumentation)
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Produce the response for one request
    pub fn run(&self, facts: &RequestFacts) -> ResponseValue {
        self.run_with_context(Context::from_request(facts))
    }

    /// Produce the response with an explicitly seeded context
    pub fn run_with_context(&self, context: Context) -> ResponseValue {
        let mut evaluator = Evaluator::with_parts(
            self.definition.clone(),
            context,
            Arc::new(self.registry.clone()),
            Arc::new(self.templates.clone()),
            Arc::clone(&self.transport),
        );

        match self.assemble(&mut evaluator) {
            Ok(response) => response,
            Err(e) => {
                log::error!("Request failed: {}", e);
                let mut headers = IndexMap::new();
                headers.insert("Content-Type".to_string(), "text/plain".to_string());
                ResponseValue {
                    status: 500,
                    headers,
                    body: Body::Text(format!("{}", e)),
                }
            }
        }
    }

    fn assemble(&self, evaluator: &mut Evaluator) -> Result<ResponseValue> {
        // Any field resolving to a terminal response wins outright
        let status = match evaluator.resolve("status")? {
            Value::Response(response) => return Ok(*response),
            value => status_code(&value)?,
        };
        let headers = match evaluator.resolve("headers")? {
            Value::Response(response) => return Ok(*response),
            value => header_map(&value)?,
        };
        let body = match evaluator.resolve("body")? {
            Value::Response(response) => return Ok(*response),
            value => body_content(&value)?,
        };

        Ok(ResponseValue {
            status,
            headers,
            body,
        })
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("registry", &self.registry)
            .finish()
    }
}

fn status_code(value: &Value) -> Result<u16> {
    let code = match value {
        Value::Integer(i) => Some(*i),
        Value::String(s) => s.parse::<i64>().ok(),
        other => {
            return Err(Error::malformed(format!(
                "Status resolved to a {}, not a status code",
                other.type_name()
            ))
            .with_lookup("status"))
        }
    };
    code.filter(|code| (100..600).contains(code))
        .map(|code| code as u16)
        .ok_or_else(|| {
            Error::malformed(format!("'{}' is not an HTTP status code", value))
                .with_lookup("status")
        })
}

fn header_map(value: &Value) -> Result<IndexMap<String, String>> {
    match value {
        Value::Mapping(map) => Ok(map
            .iter()
            .map(|(name, value)| (name.clone(), format!("{}", value)))
            .collect()),
        other => Err(Error::type_mismatch("headers", other.type_name())),
    }
}

fn body_content(value: &Value) -> Result<Body> {
    match value {
        Value::Null => Ok(Body::Text(String::new())),
        Value::String(s) => Ok(Body::Text(s.clone())),
        Value::Bytes(bytes) => Ok(Body::Binary(bytes.clone())),
        Value::Bool(_) | Value::Integer(_) | Value::Float(_) => {
            Ok(Body::Text(format!("{}", value)))
        }
        Value::Sequence(_) | Value::Mapping(_) => value
            .to_json()
            .map(|json| Body::Text(json.to_string()))
            .ok_or_else(|| Error::type_mismatch("body", value.type_name())),
        Value::Response(_) => Err(Error::type_mismatch("body", "response")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UrlFacts;
    use pretty_assertions::assert_eq;

    fn definition(yaml: &str, base: impl Into<std::path::PathBuf>) -> Definition {
        let parsed: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        Definition::from_value(Value::from(parsed), base.into())
    }

    fn facts(pathname: &str) -> RequestFacts {
        RequestFacts {
            headers: IndexMap::new(),
            query: IndexMap::new(),
            url: UrlFacts {
                host: "shop.test".to_string(),
                port: 80,
                pathname: pathname.to_string(),
                search: String::new(),
            },
        }
    }

    fn context(pathname: &str) -> Context {
        Context::from_request_with_env(&facts(pathname), IndexMap::new())
    }

    #[test]
    fn test_assembles_full_response() {
        let yaml = concat!(
            "status: 200\n",
            "headers:\n",
            "  inline:\n",
            "    content-type: text/html\n",
            "body:\n",
            "  inline: '<h1>hi</h1>'\n",
        );
        let controller = Controller::with_definition(definition(yaml, "/tmp")).unwrap();
        let response = controller.run_with_context(context("/"));

        assert_eq!(response.status, 200);
        assert_eq!(
            response.headers.get("content-type"),
            Some(&"text/html".to_string())
        );
        assert_eq!(response.body, Body::Text("<h1>hi</h1>".to_string()));
    }

    #[test]
    fn test_status_accepts_digit_string() {
        let yaml = "status:\n  inline: '201'\nheaders:\n  inline: {}\nbody:\n  inline: ''\n";
        let controller = Controller::with_definition(definition(yaml, "/tmp")).unwrap();
        assert_eq!(controller.run_with_context(context("/")).status, 201);
    }

    #[test]
    fn test_out_of_range_status_names_the_code() {
        let yaml = "status: 999\nheaders:\n  inline: {}\nbody:\n  inline: ''\n";
        let controller = Controller::with_definition(definition(yaml, "/tmp")).unwrap();
        let response = controller.run_with_context(context("/"));

        assert_eq!(response.status, 500);
        match &response.body {
            Body::Text(text) => assert!(text.contains("'999' is not an HTTP status code")),
            other => panic!("expected text body, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_required_keys_rejected() {
        let err = Controller::with_definition(definition("status: 200\n", "/tmp")).unwrap_err();
        assert!(format!("{}", err).contains("missing required keys: headers, body"));
    }

    #[test]
    fn test_engine_error_becomes_500() {
        let yaml = "status: nonexistent.lookup\nheaders:\n  inline: {}\nbody:\n  inline: ''\n";
        let controller = Controller::with_definition(definition(yaml, "/tmp")).unwrap();
        let response = controller.run_with_context(context("/"));

        assert_eq!(response.status, 500);
        match &response.body {
            Body::Text(text) => assert!(text.contains("No definition")),
            other => panic!("expected text body, got {:?}", other),
        }
    }

    #[test]
    fn test_terminal_response_short_circuits_remaining_fields() {
        // The body is a missing file; its 404 response wins over status 200
        let dir = std::env::temp_dir().join("windward_test_controller_terminal");
        std::fs::create_dir_all(&dir).unwrap();

        let yaml = "status: 200\nheaders:\n  inline: {}\nbody: ./missing.html\n";
        let controller = Controller::with_definition(definition(yaml, &dir)).unwrap();
        let response = controller.run_with_context(context("/"));
        assert_eq!(response.status, 404);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_structured_body_serializes_to_json() {
        let yaml = concat!(
            "status: 200\n",
            "headers:\n",
            "  inline:\n",
            "    content-type: application/json\n",
            "body:\n",
            "  inline:\n",
            "    ok:\n",
            "      inline: true\n",
        );
        let controller = Controller::with_definition(definition(yaml, "/tmp")).unwrap();
        let response = controller.run_with_context(context("/"));
        assert_eq!(response.body, Body::Text(r#"{"ok":true}"#.to_string()));
    }

    #[test]
    fn test_new_loads_definition_from_disk() {
        let dir = std::env::temp_dir().join("windward_test_controller_load");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("app.yaml");
        std::fs::write(
            &file,
            "status: 200\nheaders:\n  inline: {}\nbody:\n  inline: loaded\n",
        )
        .unwrap();

        let controller = Controller::new(&file).unwrap();
        let response = controller.run_with_context(context("/"));
        assert_eq!(response.body, Body::Text("loaded".to_string()));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_conditional_routing_end_to_end() {
        let yaml = concat!(
            "status: 200\n",
            "headers:\n",
            "  inline:\n",
            "    content-type: text/plain\n",
            "body:\n",
            "  when:\n",
            "    - matches: request.url.pathname\n",
            "      pattern: '^/products/(\\d+)$'\n",
            "      use:\n",
            "        template:\n",
            "          inline: 'product {{id}}'\n",
            "        provide:\n",
            "          id: $match.$1\n",
            "  default:\n",
            "    inline: home\n",
        );
        let controller = Controller::with_definition(definition(yaml, "/tmp")).unwrap();

        let response = controller.run_with_context(context("/products/7"));
        assert_eq!(response.body, Body::Text("product 7".to_string()));

        let response = controller.run_with_context(context("/elsewhere"));
        assert_eq!(response.body, Body::Text("home".to_string()));
    }
}
