//! Template rendering
//!
//! Pluggable engines keyed by name, with a builtin mustache engine. The
//! builtin covers the mustache constructs definitions actually use:
//! interpolation (escaped and raw), sections, inverted sections, dotted
//! names, and comments. Partials are not supported; provide shared
//! fragments as separate resolved values instead.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store;
use crate::value::Value;

/// A named rendering strategy for the `template` resolver
pub trait TemplateEngine: Send + Sync {
    /// Engine name as referenced by the `engine` key
    fn name(&self) -> &str;

    /// Render `source` against the root context value
    fn render(&self, source: &str, root: &Value) -> Result<String>;
}

/// Registry of template engines keyed by name
#[derive(Clone, Default)]
pub struct TemplateRegistry {
    engines: HashMap<String, Arc<dyn TemplateEngine>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the builtin mustache engine
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MustacheEngine));
        registry
    }

    pub fn register(&mut self, engine: Arc<dyn TemplateEngine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TemplateEngine>> {
        self.engines.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRegistry")
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builtin mustache renderer
pub struct MustacheEngine;

impl TemplateEngine for MustacheEngine {
    fn name(&self) -> &str {
        "mustache"
    }

    fn render(&self, source: &str, root: &Value) -> Result<String> {
        let tokens = parse(source)?;
        let mut out = String::with_capacity(source.len());
        let stack = vec![root];
        render_tokens(&tokens, &stack, &mut out)?;
        Ok(out)
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Text(String),
    /// `{{name}}`, HTML-escaped
    Escaped(String),
    /// `{{{name}}}` or `{{& name}}`
    Raw(String),
    /// `{{#name}}...{{/name}}`
    Section(String, Vec<Token>),
    /// `{{^name}}...{{/name}}`
    Inverted(String, Vec<Token>),
}

fn parse(source: &str) -> Result<Vec<Token>> {
    let mut pos = 0;
    let tokens = parse_until(source, &mut pos, None)?;
    Ok(tokens)
}

/// Parse tokens until the closing tag for `section` (or end of input for
/// the top level).
fn parse_until(source: &str, pos: &mut usize, section: Option<&str>) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();

    loop {
        let rest = &source[*pos..];
        let Some(open) = rest.find("{{") else {
            if let Some(name) = section {
                return Err(Error::template(format!("Unclosed section '{}'", name)));
            }
            if !rest.is_empty() {
                tokens.push(Token::Text(rest.to_string()));
            }
            *pos = source.len();
            return Ok(tokens);
        };

        if open > 0 {
            tokens.push(Token::Text(rest[..open].to_string()));
        }

        // Triple mustache closes with }}}
        let after_open = &rest[open + 2..];
        let (tag, consumed) = if let Some(inner) = after_open.strip_prefix('{') {
            let close = inner
                .find("}}}")
                .ok_or_else(|| Error::template("Unclosed '{{{' tag"))?;
            (format!("&{}", &inner[..close]), open + 2 + 1 + close + 3)
        } else {
            let close = after_open
                .find("}}")
                .ok_or_else(|| Error::template("Unclosed '{{' tag"))?;
            (after_open[..close].to_string(), open + 2 + close + 2)
        };
        *pos += consumed;

        let tag = tag.trim();
        match tag.chars().next() {
            Some('!') => {} // comment
            Some('#') => {
                let name = tag[1..].trim().to_string();
                let inner = parse_until(source, pos, Some(&name))?;
                tokens.push(Token::Section(name, inner));
            }
            Some('^') => {
                let name = tag[1..].trim().to_string();
                let inner = parse_until(source, pos, Some(&name))?;
                tokens.push(Token::Inverted(name, inner));
            }
            Some('/') => {
                let name = tag[1..].trim();
                match section {
                    Some(open_name) if open_name == name => return Ok(tokens),
                    Some(open_name) => {
                        return Err(Error::template(format!(
                            "Section '{}' closed by '{}'",
                            open_name, name
                        )))
                    }
                    None => {
                        return Err(Error::template(format!(
                            "Closing tag '{}' without an open section",
                            name
                        )))
                    }
                }
            }
            Some('&') => {
                tokens.push(Token::Raw(tag[1..].trim().to_string()));
            }
            Some(_) => {
                tokens.push(Token::Escaped(tag.to_string()));
            }
            None => return Err(Error::template("Empty '{{' tag")),
        }
    }
}

fn render_tokens(tokens: &[Token], stack: &[&Value], out: &mut String) -> Result<()> {
    for token in tokens {
        match token {
            Token::Text(text) => out.push_str(text),
            Token::Escaped(name) => {
                if let Some(value) = lookup(stack, name) {
                    out.push_str(&escape_html(&display(value)));
                }
            }
            Token::Raw(name) => {
                if let Some(value) = lookup(stack, name) {
                    out.push_str(&display(value));
                }
            }
            Token::Section(name, inner) => {
                let Some(value) = lookup(stack, name) else {
                    continue;
                };
                match value {
                    Value::Null | Value::Bool(false) => {}
                    Value::Sequence(items) => {
                        for item in items {
                            let mut frame = stack.to_vec();
                            frame.push(item);
                            render_tokens(inner, &frame, out)?;
                        }
                    }
                    Value::Bool(true) => render_tokens(inner, stack, out)?,
                    other => {
                        let mut frame = stack.to_vec();
                        frame.push(other);
                        render_tokens(inner, &frame, out)?;
                    }
                }
            }
            Token::Inverted(name, inner) => {
                let falsey = match lookup(stack, name) {
                    None => true,
                    Some(Value::Null) | Some(Value::Bool(false)) => true,
                    Some(Value::Sequence(items)) => items.is_empty(),
                    Some(_) => false,
                };
                if falsey {
                    render_tokens(inner, stack, out)?;
                }
            }
        }
    }

    Ok(())
}

/// Resolve a dotted name against the context stack, innermost frame first
fn lookup<'a>(stack: &[&'a Value], name: &str) -> Option<&'a Value> {
    if name == "." {
        return stack.last().copied();
    }

    for frame in stack.iter().rev() {
        if let Some(found) = store::get_path(frame, name) {
            return Some(found);
        }
        // A name whose head key exists in this frame binds here even when
        // the full path dead-ends
        let head = name.split('.').next().unwrap_or(name);
        if store::has_path(frame, head) {
            return None;
        }
    }

    None
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => format!("{}", other),
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
