//! Recursive-descent parser from token stream to directive AST.
//!
//! Nesting is tracked for real: every paired directive must close, closers
//! must match their opener, and `@elseif`/`@else` only appear inside `@if`.
//! Mismatches are compile errors rather than silently miscompiled output.

use crate::error::{ServerError, ServerResult};
use crate::template::expr::{self, Expr};
use crate::template::lexer::{tokenize, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    EchoEscaped(Expr),
    EchoRaw(Expr),
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        otherwise: Option<Vec<Node>>,
    },
    /// `@for($i in 1..10)` — inclusive start, exclusive end.
    For {
        var: String,
        start: Expr,
        end: Expr,
        body: Vec<Node>,
    },
    /// `@foreach($items as $item)` / `@foreach($map as $k => $v)`.
    Foreach {
        subject: Expr,
        key_var: Option<String>,
        value_var: String,
        body: Vec<Node>,
    },
    Isset {
        expr: Expr,
        body: Vec<Node>,
    },
    Empty {
        expr: Expr,
        body: Vec<Node>,
    },
    Auth(Vec<Node>),
    Guest(Vec<Node>),
    /// `@error('field')` — body renders when the field has a validation
    /// error, with `$message` bound.
    ErrorBlock {
        field: String,
        body: Vec<Node>,
    },
    Section {
        name: String,
        body: Vec<Node>,
    },
    Content(String),
    Include(String),
    Continue_,
    Break_,
    Csrf,
    MethodField(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub extends: Option<String>,
    pub nodes: Vec<Node>,
}

pub fn parse(source: &str) -> ServerResult<Template> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        extends: None,
    };
    let nodes = parser.parse_nodes(&[])?;
    Ok(Template {
        extends: parser.extends,
        nodes,
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    extends: Option<String>,
}

impl Parser {
    /// Parse until one of `until` closes this block (the closer is
    /// consumed) or, for the top level, until the tokens run out.
    fn parse_nodes(&mut self, until: &[&str]) -> ServerResult<Vec<Node>> {
        let mut nodes = Vec::new();

        while let Some(token) = self.tokens.get(self.pos).cloned() {
            match token {
                Token::Text(text) => {
                    self.pos += 1;
                    nodes.push(Node::Text(text));
                }
                Token::EchoEscaped(source) => {
                    self.pos += 1;
                    nodes.push(Node::EchoEscaped(expr::parse(&source)?));
                }
                Token::EchoRaw(source) => {
                    self.pos += 1;
                    nodes.push(Node::EchoRaw(expr::parse(&source)?));
                }
                Token::Directive { name, args } => {
                    if until.contains(&name.as_str()) {
                        // Closer stays for the caller to inspect.
                        return Ok(nodes);
                    }
                    self.pos += 1;
                    nodes.push(self.parse_directive(&name, &args)?);
                }
            }
        }

        if until.is_empty() {
            Ok(nodes)
        } else {
            Err(err(format!(
                "unclosed block: expected one of {}",
                until.join(", ")
            )))
        }
    }

    fn parse_directive(&mut self, name: &str, args: &str) -> ServerResult<Node> {
        match name {
            "if" => self.parse_if(args),
            "for" => self.parse_for(args),
            "foreach" => self.parse_foreach(args),
            "isset" => {
                let body = self.parse_block(&["endisset"])?;
                Ok(Node::Isset {
                    expr: expr::parse(args)?,
                    body,
                })
            }
            "empty" => {
                let body = self.parse_block(&["endempty"])?;
                Ok(Node::Empty {
                    expr: expr::parse(args)?,
                    body,
                })
            }
            "auth" => Ok(Node::Auth(self.parse_block(&["endauth"])?)),
            "guest" => Ok(Node::Guest(self.parse_block(&["endguest"])?)),
            "error" => {
                let field = string_arg(args, "error")?;
                let body = self.parse_block(&["enderror"])?;
                Ok(Node::ErrorBlock { field, body })
            }
            "section" => {
                let name = string_arg(args, "section")?;
                let body = self.parse_block(&["endsection"])?;
                Ok(Node::Section { name, body })
            }
            "original" => {
                // The lexer reduces the block to one literal text token.
                let body = self.parse_block(&["endoriginal"])?;
                Ok(Node::Text(
                    body.into_iter()
                        .map(|node| match node {
                            Node::Text(text) => text,
                            _ => String::new(),
                        })
                        .collect(),
                ))
            }
            "extend" => {
                if self.extends.is_some() {
                    return Err(err("a template may only @extend once".to_string()));
                }
                self.extends = Some(string_arg(args, "extend")?);
                Ok(Node::Text(String::new()))
            }
            "include" => Ok(Node::Include(string_arg(args, "include")?)),
            "content" => Ok(Node::Content(string_arg(args, "content")?)),
            "continue" => Ok(Node::Continue_),
            "break" => Ok(Node::Break_),
            "csrf" => Ok(Node::Csrf),
            "method" => Ok(Node::MethodField(string_arg(args, "method")?)),
            "elseif" | "else" | "endif" | "endfor" | "endforeach" | "endisset" | "endempty"
            | "endsection" | "endauth" | "endguest" | "enderror" | "endoriginal" => {
                Err(err(format!("unexpected @{} with no open block", name)))
            }
            other => Err(err(format!("unknown directive @{}", other))),
        }
    }

    /// Parse a simple paired block and consume its closer.
    fn parse_block(&mut self, closer: &[&str]) -> ServerResult<Vec<Node>> {
        let body = self.parse_nodes(closer)?;
        self.pos += 1; // the closer itself
        Ok(body)
    }

    fn parse_if(&mut self, args: &str) -> ServerResult<Node> {
        let mut branches = Vec::new();
        let mut otherwise = None;

        let mut condition = expr::parse(args)?;
        loop {
            let body = self.parse_nodes(&["elseif", "else", "endif"])?;
            let Some(Token::Directive { name, args }) = self.tokens.get(self.pos).cloned() else {
                return Err(err("unclosed @if".to_string()));
            };
            self.pos += 1;
            branches.push((condition, body));
            match name.as_str() {
                "elseif" => {
                    condition = expr::parse(&args)?;
                }
                "else" => {
                    otherwise = Some(self.parse_block(&["endif"])?);
                    break;
                }
                _ => break, // endif
            }
        }

        Ok(Node::If {
            branches,
            otherwise,
        })
    }

    fn parse_for(&mut self, args: &str) -> ServerResult<Node> {
        // `$i in 1..10`
        let (var, range) = args
            .split_once(" in ")
            .ok_or_else(|| err(format!("@for expects '$var in start..end', got '{}'", args)))?;
        let var = var
            .trim()
            .strip_prefix('$')
            .ok_or_else(|| err("@for variable must start with '$'".to_string()))?
            .to_string();
        let (start, end) = range
            .split_once("..")
            .ok_or_else(|| err("@for range must use 'start..end'".to_string()))?;
        let body = self.parse_block(&["endfor"])?;
        Ok(Node::For {
            var,
            start: expr::parse(start.trim())?,
            end: expr::parse(end.trim())?,
            body,
        })
    }

    fn parse_foreach(&mut self, args: &str) -> ServerResult<Node> {
        // `$items as $item` or `$items as $key => $value`
        let (subject, bindings) = args
            .split_once(" as ")
            .ok_or_else(|| err(format!("@foreach expects '$subject as $var', got '{}'", args)))?;
        let subject = expr::parse(subject.trim())?;

        let (key_var, value_var) = match bindings.split_once("=>") {
            Some((key, value)) => (
                Some(var_name(key)?),
                var_name(value)?,
            ),
            None => (None, var_name(bindings)?),
        };

        let body = self.parse_block(&["endforeach"])?;
        Ok(Node::Foreach {
            subject,
            key_var,
            value_var,
            body,
        })
    }
}

fn var_name(source: &str) -> ServerResult<String> {
    source
        .trim()
        .strip_prefix('$')
        .filter(|name| {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
        .map(|name| name.to_string())
        .ok_or_else(|| err(format!("expected a '$variable', got '{}'", source.trim())))
}

/// Extract a single quoted argument: `@section('header')` → `header`.
fn string_arg(args: &str, directive: &str) -> ServerResult<String> {
    let trimmed = args.trim();
    let inner = trimmed
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| {
            trimmed
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
        })
        .ok_or_else(|| {
            err(format!(
                "@{} expects a quoted name, got '{}'",
                directive, args
            ))
        })?;
    Ok(inner.to_string())
}

fn err(msg: String) -> ServerError {
    ServerError::Template(msg)
}
