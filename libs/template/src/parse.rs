//! Lexing and parsing of template sources.

use crate::{Cond, Node, TemplateError};

/// A lexed piece of template source.
#[derive(Debug)]
enum Token {
    Text(String),
    Action { body: String, line: usize },
}

/// What `.` refers to at a point in the template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Dot {
    #[default]
    Root,
    Host,
    Port,
    Hosts,
}

/// Names visible at a point in the template.
#[derive(Debug, Clone, Default)]
struct Scope {
    dot: Dot,
    in_range: bool,
    /// `$i` in `{{range $i, $host := .Hosts}}`.
    index_var: Option<String>,
    /// `$host` in `{{range $host := .Hosts}}`.
    host_var: Option<String>,
}

impl Scope {
    fn with_dot(&self, dot: Dot) -> Self {
        Self {
            dot,
            ..self.clone()
        }
    }
}

/// Why a node list stopped.
#[derive(Debug)]
enum Stop {
    Eof,
    End(usize),
    Else(usize),
}

enum Action {
    Emit(Node),
    Comment,
    /// Carries the scope of the range body.
    Range(Scope),
    If(Cond),
    /// Carries the scope of the `with` body.
    With(Cond, Scope),
    Else,
    End,
}

pub(crate) fn parse(name: &str, source: &str) -> Result<Vec<Node>, TemplateError> {
    let tokens = lex(name, source)?;
    let mut parser = Parser {
        name,
        tokens: tokens.into_iter(),
    };

    let (nodes, stop) = parser.parse_nodes(&Scope::default())?;
    match stop {
        Stop::Eof => Ok(nodes),
        Stop::End(line) => Err(parser.unexpected(line, "end")),
        Stop::Else(line) => Err(parser.unexpected(line, "else")),
    }
}

fn lex(name: &str, source: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    let mut line = 1;
    let mut trim_next = false;

    while let Some(open) = rest.find("{{") {
        let raw_text = &rest[..open];
        let action_line = line + raw_text.matches('\n').count();

        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            return Err(TemplateError::UnclosedAction {
                name: name.to_string(),
                line: action_line,
            });
        };
        let raw_body = &after_open[..close];

        let trim_left = raw_body
            .strip_prefix('-')
            .is_some_and(|s| s.starts_with(char::is_whitespace));
        let trim_right = raw_body
            .strip_suffix('-')
            .is_some_and(|s| s.ends_with(char::is_whitespace));

        let mut body = raw_body;
        if trim_left {
            body = &body[1..];
        }
        if trim_right {
            body = &body[..body.len() - 1];
        }

        let mut text = raw_text;
        if trim_next {
            text = text.trim_start();
        }
        if trim_left {
            text = text.trim_end();
        }
        if !text.is_empty() {
            tokens.push(Token::Text(text.to_string()));
        }
        tokens.push(Token::Action {
            body: body.trim().to_string(),
            line: action_line,
        });

        line = action_line + raw_body.matches('\n').count();
        rest = &after_open[close + 2..];
        trim_next = trim_right;
    }

    let text = if trim_next { rest.trim_start() } else { rest };
    if !text.is_empty() {
        tokens.push(Token::Text(text.to_string()));
    }

    Ok(tokens)
}

struct Parser<'a> {
    name: &'a str,
    tokens: std::vec::IntoIter<Token>,
}

impl Parser<'_> {
    /// Parse nodes until the input ends or an `end`/`else` is reached.
    fn parse_nodes(&mut self, scope: &Scope) -> Result<(Vec<Node>, Stop), TemplateError> {
        let mut nodes = Vec::new();

        while let Some(token) = self.tokens.next() {
            let (body, line) = match token {
                Token::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Token::Action { body, line } => (body, line),
            };

            match self.action(&body, line, scope)? {
                Action::Emit(node) => nodes.push(node),
                Action::Comment => {}
                Action::End => return Ok((nodes, Stop::End(line))),
                Action::Else => return Ok((nodes, Stop::Else(line))),
                Action::Range(inner) => {
                    let (body, empty) = self.parse_block(&inner, scope, line, "range")?;
                    nodes.push(Node::Range { body, empty });
                }
                Action::If(cond) => {
                    let (then, otherwise) = self.parse_block(scope, scope, line, "if")?;
                    nodes.push(Node::If {
                        cond,
                        then,
                        otherwise,
                    });
                }
                Action::With(cond, inner) => {
                    let (then, otherwise) = self.parse_block(&inner, scope, line, "with")?;
                    nodes.push(Node::If {
                        cond,
                        then,
                        otherwise,
                    });
                }
            }
        }

        Ok((nodes, Stop::Eof))
    }

    /// Parse the body of a block and its optional `else` branch.
    fn parse_block(
        &mut self,
        body_scope: &Scope,
        else_scope: &Scope,
        line: usize,
        block: &'static str,
    ) -> Result<(Vec<Node>, Vec<Node>), TemplateError> {
        let (body, stop) = self.parse_nodes(body_scope)?;
        match stop {
            Stop::End(_) => Ok((body, Vec::new())),
            Stop::Eof => Err(self.missing_end(line, block)),
            Stop::Else(_) => {
                let (otherwise, stop) = self.parse_nodes(else_scope)?;
                match stop {
                    Stop::End(_) => Ok((body, otherwise)),
                    Stop::Eof => Err(self.missing_end(line, block)),
                    Stop::Else(line) => Err(self.unexpected(line, "else")),
                }
            }
        }
    }

    fn action(&self, body: &str, line: usize, scope: &Scope) -> Result<Action, TemplateError> {
        if let Some(comment) = body.strip_prefix("/*") {
            if comment.ends_with("*/") {
                return Ok(Action::Comment);
            }
            return Err(TemplateError::UnclosedComment {
                name: self.name.to_string(),
                line,
            });
        }

        let (keyword, rest) = match body.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (body, ""),
        };

        match (keyword, rest) {
            ("end", "") => Ok(Action::End),
            ("else", "") => Ok(Action::Else),
            ("range", header) if !scope.in_range => self.range(header, body, line, scope),
            ("with", target) if is_single_word(target) => {
                match self.field(target, line, scope)? {
                    Field::Hosts => Ok(Action::With(Cond::Hosts, scope.with_dot(Dot::Hosts))),
                    Field::Port => Ok(Action::With(Cond::Port, scope.with_dot(Dot::Port))),
                    Field::Host | Field::Index => Err(self.unsupported(line, body)),
                }
            }
            ("if", target) if is_single_word(target) => match self.field(target, line, scope)? {
                Field::Hosts => Ok(Action::If(Cond::Hosts)),
                Field::Port => Ok(Action::If(Cond::Port)),
                Field::Host | Field::Index => Err(self.unsupported(line, body)),
            },
            ("len", target) if is_single_word(target) => {
                self.hosts_ref(target, line, scope)?;
                Ok(Action::Emit(Node::HostCount))
            }
            (target, "") if target.starts_with(['.', '$']) => {
                let node = match self.field(target, line, scope)? {
                    Field::Hosts => Node::HostList,
                    Field::Port => Node::Port,
                    Field::Host => Node::Host,
                    Field::Index => Node::Index,
                };
                Ok(Action::Emit(node))
            }
            _ => Err(self.unsupported(line, body)),
        }
    }

    /// `range` header: `.Hosts`, `$host := .Hosts` or `$i, $host := .Hosts`.
    fn range(
        &self,
        header: &str,
        body: &str,
        line: usize,
        scope: &Scope,
    ) -> Result<Action, TemplateError> {
        let (declared, target) = match header.split_once(":=") {
            Some((declared, target)) => (Some(declared), target.trim()),
            None => (None, header),
        };
        if !is_single_word(target) {
            return Err(self.unsupported(line, body));
        }
        self.hosts_ref(target, line, scope)?;

        let mut inner = Scope {
            dot: Dot::Host,
            in_range: true,
            ..scope.clone()
        };
        if let Some(declared) = declared {
            let names: Vec<&str> = declared.split(',').map(str::trim).collect();
            if !names.iter().all(|name| is_variable(name)) {
                return Err(self.unsupported(line, body));
            }
            match names.as_slice() {
                [host] => inner.host_var = Some(host.to_string()),
                [index, host] => {
                    inner.index_var = Some(index.to_string());
                    inner.host_var = Some(host.to_string());
                }
                _ => return Err(self.unsupported(line, body)),
            }
        }

        Ok(Action::Range(inner))
    }

    fn hosts_ref(&self, target: &str, line: usize, scope: &Scope) -> Result<(), TemplateError> {
        match self.field(target, line, scope)? {
            Field::Hosts => Ok(()),
            _ => Err(self.unsupported(line, target)),
        }
    }

    /// Resolve a field or variable reference against the current scope.
    fn field(&self, target: &str, line: usize, scope: &Scope) -> Result<Field, TemplateError> {
        if target == "." {
            return match scope.dot {
                Dot::Root => Err(self.undefined(line, ".")),
                Dot::Host => Ok(Field::Host),
                Dot::Port => Ok(Field::Port),
                Dot::Hosts => Ok(Field::Hosts),
            };
        }

        if let Some(field) = target.strip_prefix("$.") {
            return root_field(field).ok_or_else(|| self.undefined(line, field));
        }

        if is_variable(target) {
            if scope.host_var.as_deref() == Some(target) {
                return Ok(Field::Host);
            }
            if scope.index_var.as_deref() == Some(target) {
                return Ok(Field::Index);
            }
            return Err(TemplateError::UndefinedVariable {
                name: self.name.to_string(),
                line,
                variable: target.to_string(),
            });
        }

        let Some(field) = target.strip_prefix('.') else {
            return Err(self.unsupported(line, target));
        };

        if scope.dot != Dot::Root {
            return Err(self.undefined(line, field));
        }

        root_field(field).ok_or_else(|| self.undefined(line, field))
    }

    fn undefined(&self, line: usize, field: &str) -> TemplateError {
        TemplateError::UndefinedField {
            name: self.name.to_string(),
            line,
            field: field.to_string(),
        }
    }

    fn unsupported(&self, line: usize, action: &str) -> TemplateError {
        TemplateError::UnsupportedAction {
            name: self.name.to_string(),
            line,
            action: action.to_string(),
        }
    }

    fn unexpected(&self, line: usize, keyword: &'static str) -> TemplateError {
        TemplateError::Unexpected {
            name: self.name.to_string(),
            line,
            keyword,
        }
    }

    fn missing_end(&self, line: usize, block: &'static str) -> TemplateError {
        TemplateError::MissingEnd {
            name: self.name.to_string(),
            line,
            block,
        }
    }
}

enum Field {
    Hosts,
    Port,
    Host,
    Index,
}

fn root_field(name: &str) -> Option<Field> {
    match name {
        "Hosts" => Some(Field::Hosts),
        "Port" => Some(Field::Port),
        _ => None,
    }
}

fn is_single_word(s: &str) -> bool {
    !s.is_empty() && !s.contains(char::is_whitespace)
}

/// `$name`, where the name is a Go identifier.
fn is_variable(s: &str) -> bool {
    s.strip_prefix('$').is_some_and(|name| {
        name.starts_with(|c: char| c.is_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_alphanumeric() || c == '_')
    })
}
