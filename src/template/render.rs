//! AST renderer: executes a parsed template against a context value.

use crate::error::{ServerError, ServerResult};
use crate::template::expr::{self, Expr, Scope};
use crate::template::parser::{Node, Template};
use crate::template::{Engine, ViewContext};
use serde_json::Value;
use std::collections::HashMap;

/// Include chains deeper than this are assumed cyclic.
const MAX_INCLUDE_DEPTH: usize = 32;

/// Loop control travelling up from `@break`/`@continue`.
enum Flow {
    Normal,
    Break,
    Continue,
}

pub(crate) struct Renderer<'a> {
    engine: &'a Engine,
    ctx: &'a ViewContext,
    out: String,
    sections: HashMap<String, String>,
    include_depth: usize,
}

impl<'a> Renderer<'a> {
    pub fn new(engine: &'a Engine, ctx: &'a ViewContext) -> Renderer<'a> {
        Renderer {
            engine,
            ctx,
            out: String::new(),
            sections: HashMap::new(),
            include_depth: 0,
        }
    }

    /// Render a template, following its `@extend` chain. Child sections are
    /// collected first, then the layout renders with `@content` splicing
    /// them in; the child's non-section output is dropped, as layouts own
    /// the page shell.
    pub fn render(mut self, template: &Template, root: &Value) -> ServerResult<String> {
        let mut scope = Scope::new(root);
        let mut current = template.clone();

        loop {
            match current.extends.clone() {
                Some(layout) => {
                    // Capture sections, discard direct output.
                    let kept = std::mem::take(&mut self.out);
                    self.render_nodes(&current.nodes, &mut scope)?;
                    self.out = kept;
                    current = (*self.engine.compile(&layout)?).clone();
                }
                None => {
                    self.render_nodes(&current.nodes, &mut scope)?;
                    return Ok(self.out);
                }
            }
        }
    }

    fn render_nodes(&mut self, nodes: &[Node], scope: &mut Scope) -> ServerResult<Flow> {
        for node in nodes {
            match node {
                Node::Text(text) => self.out.push_str(text),
                Node::EchoEscaped(expr) => {
                    let value = expr::eval(expr, scope);
                    self.out.push_str(&escape_html(&expr::display(&value)));
                }
                Node::EchoRaw(expr) => {
                    let value = expr::eval(expr, scope);
                    self.out.push_str(&expr::display(&value));
                }
                Node::If {
                    branches,
                    otherwise,
                } => {
                    let mut taken = false;
                    for (condition, body) in branches {
                        if expr::truthy(&expr::eval(condition, scope)) {
                            let flow = self.render_nodes(body, scope)?;
                            if !matches!(flow, Flow::Normal) {
                                return Ok(flow);
                            }
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        if let Some(body) = otherwise {
                            let flow = self.render_nodes(body, scope)?;
                            if !matches!(flow, Flow::Normal) {
                                return Ok(flow);
                            }
                        }
                    }
                }
                Node::For {
                    var,
                    start,
                    end,
                    body,
                } => {
                    let start = expr::eval(start, scope).as_i64().unwrap_or(0);
                    let end = expr::eval(end, scope).as_i64().unwrap_or(0);
                    scope.push();
                    for i in start..end {
                        scope.bind(var, Value::from(i));
                        match self.render_nodes(body, scope)? {
                            Flow::Break => break,
                            Flow::Continue | Flow::Normal => {}
                        }
                    }
                    scope.pop();
                }
                Node::Foreach {
                    subject,
                    key_var,
                    value_var,
                    body,
                } => {
                    let subject = expr::eval(subject, scope);
                    let entries: Vec<(Value, Value)> = match subject {
                        Value::Array(items) => items
                            .into_iter()
                            .enumerate()
                            .map(|(i, item)| (Value::from(i as i64), item))
                            .collect(),
                        Value::Object(map) => map
                            .into_iter()
                            .map(|(key, value)| (Value::String(key), value))
                            .collect(),
                        _ => Vec::new(),
                    };
                    scope.push();
                    for (key, value) in entries {
                        if let Some(key_var) = key_var {
                            scope.bind(key_var, key);
                        }
                        scope.bind(value_var, value);
                        match self.render_nodes(body, scope)? {
                            Flow::Break => break,
                            Flow::Continue | Flow::Normal => {}
                        }
                    }
                    scope.pop();
                }
                Node::Isset { expr, body } => {
                    if !expr::eval(expr, scope).is_null() {
                        let flow = self.render_nodes(body, scope)?;
                        if !matches!(flow, Flow::Normal) {
                            return Ok(flow);
                        }
                    }
                }
                Node::Empty { expr, body } => {
                    if !expr::truthy(&expr::eval(expr, scope)) {
                        let flow = self.render_nodes(body, scope)?;
                        if !matches!(flow, Flow::Normal) {
                            return Ok(flow);
                        }
                    }
                }
                Node::Auth(body) => {
                    if self.ctx.auth {
                        let flow = self.render_nodes(body, scope)?;
                        if !matches!(flow, Flow::Normal) {
                            return Ok(flow);
                        }
                    }
                }
                Node::Guest(body) => {
                    if !self.ctx.auth {
                        let flow = self.render_nodes(body, scope)?;
                        if !matches!(flow, Flow::Normal) {
                            return Ok(flow);
                        }
                    }
                }
                Node::ErrorBlock { field, body } => {
                    if let Some(message) = self.ctx.errors.get(field) {
                        scope.push();
                        scope.bind("message", Value::String(message.clone()));
                        let flow = self.render_nodes(body, scope)?;
                        scope.pop();
                        if !matches!(flow, Flow::Normal) {
                            return Ok(flow);
                        }
                    }
                }
                Node::Section { name, body } => {
                    // Render into a side buffer; the innermost child wins.
                    let kept = std::mem::take(&mut self.out);
                    self.render_nodes(body, scope)?;
                    let rendered = std::mem::replace(&mut self.out, kept);
                    self.sections.entry(name.clone()).or_insert(rendered);
                }
                Node::Content(name) => {
                    if let Some(section) = self.sections.get(name) {
                        self.out.push_str(&section.clone());
                    }
                }
                Node::Include(name) => {
                    if self.include_depth >= MAX_INCLUDE_DEPTH {
                        return Err(ServerError::Template(format!(
                            "include depth exceeded at '{}'",
                            name
                        )));
                    }
                    let included = self.engine.compile(name)?;
                    self.include_depth += 1;
                    let flow = self.render_nodes(&included.nodes, scope)?;
                    self.include_depth -= 1;
                    if !matches!(flow, Flow::Normal) {
                        return Ok(flow);
                    }
                }
                Node::Continue_ => return Ok(Flow::Continue),
                Node::Break_ => return Ok(Flow::Break),
                Node::Csrf => {
                    self.out.push_str(&format!(
                        "<input type=\"hidden\" name=\"_token\" value=\"{}\">",
                        escape_html(&self.ctx.csrf_token)
                    ));
                }
                Node::MethodField(method) => {
                    self.out.push_str(&format!(
                        "<input type=\"hidden\" name=\"_method\" value=\"{}\">",
                        escape_html(method)
                    ));
                }
            }
        }
        Ok(Flow::Normal)
    }
}

pub(crate) fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            other => escaped.push(other),
        }
    }
    escaped
}
