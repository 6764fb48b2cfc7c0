//! windward-core: Declarative HTTP response resolution engine
//!
//! This crate resolves a tree-shaped YAML definition into a concrete HTTP
//! response (status, headers, body) per request. Values are resolved
//! lazily by pluggable strategies (inline, file, directory, proxy,
//! service, conditional, template, url), memoized per request, and
//! guarded against circular references.
//!
//! # Example
//!
//! ```rust
//! use windward_core::{Context, Controller, Definition, Value};
//!
//! let yaml = r#"
//! status: 200
//! headers:
//!   inline:
//!     content-type: text/plain
//! body:
//!   inline: hello
//! "#;
//!
//! let parsed: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
//! let definition = Definition::from_value(Value::from(parsed), ".");
//! let controller = Controller::with_definition(definition).unwrap();
//! let response = controller.run_with_context(Context::new());
//! assert_eq!(response.status, 200);
//! ```

pub mod context;
pub mod controller;
pub mod definition;
pub mod error;
pub mod evaluator;
pub mod resolver;
pub mod store;
pub mod template;
pub mod value;

pub use context::{Context, RequestFacts, UrlFacts};
pub use controller::Controller;
pub use definition::Definition;
pub use error::{Error, ErrorKind, Result};
pub use evaluator::Evaluator;
pub use resolver::{
    HttpCall, HttpReply, HttpTransport, Resolver, ResolverInput, ResolverOutput, ResolverRegistry,
};
pub use template::{TemplateEngine, TemplateRegistry};
pub use value::{Body, ResponseValue, Value};
