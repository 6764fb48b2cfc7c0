//! Error types for windward
//!
//! Structured errors carrying the definition lookup where the failure
//! occurred plus an actionable help message. Every engine error is
//! request-fatal; the controller turns them into a 500 response.

use std::fmt;

/// Result type alias for windward operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for windward operations
#[derive(Debug, Clone)]
pub struct Error {
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Lookup in the definition where the error occurred (e.g., "body.file")
    pub lookup: Option<String>,
    /// Actionable help message
    pub help: Option<String>,
    /// Underlying cause (as string for Clone compatibility)
    pub cause: Option<String>,
}

/// Categories of errors that can occur
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Error parsing the definition YAML
    Parse,
    /// I/O error (file not found, etc.)
    Io,
    /// A lookup has no definition and no existing parent prefix
    NoDefinition { lookup: String },
    /// A tree address reappeared on the lookup stack
    CircularReference,
    /// A definition node failed a resolver's validity check
    InvalidResolverInput { resolver: String },
    /// A `resolver:` tag names an unregistered strategy, or no indicator
    /// matches any registered resolver
    UnknownResolver { name: String },
    /// Embedded JSON or other source content failed to decode
    MalformedValue,
    /// Attempted to drill a sub-key into a non-mapping, non-response value
    TypeMismatch { expected: String, got: String },
    /// A store write violated the no-overwrite invariants
    StoreConflict,
    /// Attempted to overwrite a builtin context value
    BuiltinImmutable { lookup: String },
    /// Template engine failure
    Template,
    /// Outbound HTTP failure (service or proxy)
    Http { url: String },
}

impl Error {
    /// Create a new parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Parse,
            lookup: None,
            help: None,
            cause: Some(message.into()),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Io,
            lookup: None,
            help: None,
            cause: Some(message.into()),
        }
    }

    /// Create a missing-definition error
    pub fn no_definition(lookup: impl Into<String>) -> Self {
        let lookup = lookup.into();
        Self {
            kind: ErrorKind::NoDefinition {
                lookup: lookup.clone(),
            },
            lookup: Some(lookup.clone()),
            help: Some(format!("Check that '{}' exists in the definition", lookup)),
            cause: None,
        }
    }

    /// Create a circular reference error naming the in-flight stack
    pub fn circular_reference(lookup: impl Into<String>, stack: &[String]) -> Self {
        Self {
            kind: ErrorKind::CircularReference,
            lookup: Some(lookup.into()),
            help: Some("Break the cycle by removing one of the references".into()),
            cause: Some(format!("Lookup stack: {}", stack.join(" -> "))),
        }
    }

    /// Create an invalid-resolver-input error
    pub fn invalid_resolver_input(resolver: impl Into<String>, lookup: Option<String>) -> Self {
        let resolver = resolver.into();
        Self {
            kind: ErrorKind::InvalidResolverInput {
                resolver: resolver.clone(),
            },
            lookup,
            help: Some(format!(
                "Check the required fields for the '{}' resolver",
                resolver
            )),
            cause: None,
        }
    }

    /// Create an unknown resolver error for an explicit `resolver:` tag
    pub fn unknown_resolver(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: ErrorKind::UnknownResolver { name: name.clone() },
            lookup: None,
            help: Some(format!("Register the '{}' resolver or check for typos", name)),
            cause: None,
        }
    }

    /// Create an error for a definition no registered resolver claims
    pub fn no_resolver_for(definition: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::UnknownResolver {
                name: "<inferred>".into(),
            },
            lookup: None,
            help: Some("Add a recognized indicator key or an explicit 'resolver' tag".into()),
            cause: Some(format!("No resolver found for definition: {}", definition.into())),
        }
    }

    /// Create a malformed source value error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::MalformedValue,
            lookup: None,
            help: None,
            cause: Some(message.into()),
        }
    }

    /// Create a type mismatch error
    pub fn type_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::TypeMismatch {
                expected: expected.into(),
                got: got.into(),
            },
            lookup: None,
            help: None,
            cause: None,
        }
    }

    /// Create a store conflict error
    pub fn store_conflict(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::StoreConflict,
            lookup: None,
            help: Some("Existing store values are never overwritten".into()),
            cause: Some(message.into()),
        }
    }

    /// Create a builtin-immutable error
    pub fn builtin_immutable(lookup: impl Into<String>) -> Self {
        let lookup = lookup.into();
        Self {
            kind: ErrorKind::BuiltinImmutable {
                lookup: lookup.clone(),
            },
            lookup: Some(lookup),
            help: Some("Builtin values cannot be overridden".into()),
            cause: None,
        }
    }

    /// Create a template engine error
    pub fn template(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Template,
            lookup: None,
            help: None,
            cause: Some(message.into()),
        }
    }

    /// Create an outbound HTTP error
    pub fn http(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Http { url: url.into() },
            lookup: None,
            help: None,
            cause: Some(message.into()),
        }
    }

    /// Add lookup context to the error
    pub fn with_lookup(mut self, lookup: impl Into<String>) -> Self {
        self.lookup = Some(lookup.into());
        self
    }

    /// Add help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Parse => write!(f, "Parse error")?,
            ErrorKind::Io => write!(f, "I/O error")?,
            ErrorKind::NoDefinition { lookup } => write!(f, "No definition for {}", lookup)?,
            ErrorKind::CircularReference => {
                write!(f, "Definition appears to contain a loop")?
            }
            ErrorKind::InvalidResolverInput { resolver } => {
                write!(f, "Definition is not valid for resolver '{}'", resolver)?
            }
            ErrorKind::UnknownResolver { name } => {
                write!(f, "Unknown resolver: {}", name)?
            }
            ErrorKind::MalformedValue => write!(f, "Malformed source value")?,
            ErrorKind::TypeMismatch { expected, got } => {
                write!(f, "Could not get nested value {} from value of type {}", expected, got)?
            }
            ErrorKind::StoreConflict => write!(f, "Store conflict")?,
            ErrorKind::BuiltinImmutable { lookup } => {
                write!(f, "Cannot override builtin value '{}'", lookup)?
            }
            ErrorKind::Template => write!(f, "Template error")?,
            ErrorKind::Http { url } => write!(f, "HTTP request failed: {}", url)?,
        }

        if let Some(lookup) = &self.lookup {
            write!(f, "\n  Lookup: {}", lookup)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, "\n  {}", cause)?;
        }
        if let Some(help) = &self.help {
            write!(f, "\n  Help: {}", help)?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {}
