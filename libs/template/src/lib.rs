//! Upstream configuration templates.
//!
//! Templates use the subset of Go's `text/template` syntax that upstream
//! blocks are written in, so typical templates from Go-based proxy updaters
//! work unchanged. Anything outside the subset is rejected when the template
//! is parsed:
//!
//! ```text
//! upstream backends {
//! {{- range $host := .Hosts}}
//!     server {{$host}}:{{$.Port}};
//! {{- end}}
//! }
//! ```
//!
//! The data model is fixed: `.Hosts` is the list of backend addresses and
//! `.Port` is the proxied port. Every reference is checked when the template
//! is parsed, so a [`Template`] that parsed successfully always renders.
//!
//! # Supported actions
//!
//! - `{{.Port}}`, `{{$.Port}}`: the port number
//! - `{{.Hosts}}`: the host list in Go's `[a b c]` form
//! - `{{range .Hosts}} ... {{else}} ... {{end}}`: one body per host, `{{.}}` is the host
//! - `{{range $host := .Hosts}}`, `{{range $i, $host := .Hosts}}`: range variables
//!   for the host and its zero-based index, visible in the range body
//! - `{{if .Hosts}} ... {{else}} ... {{end}}`: conditional on a non-empty list
//! - `{{with .Port}}`, `{{with .Hosts}}`: conditional, with `.` bound to the field
//! - `{{len .Hosts}}`: number of hosts
//! - `{{/* comment */}}`
//! - `{{-` and `-}}` whitespace trimming
//!
//! Ranges cannot be nested: hosts are plain strings.

use thiserror::Error;

mod parse;

/// Template errors.
///
/// All of these are raised by [`Template::parse`]; execution cannot fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// An action was opened but never closed.
    #[error("{name}:{line}: unclosed action")]
    UnclosedAction { name: String, line: usize },

    /// A comment action does not end with `*/`.
    #[error("{name}:{line}: unclosed comment")]
    UnclosedComment { name: String, line: usize },

    /// A field that is not part of the data model was referenced.
    #[error("{name}:{line}: can't evaluate field {field}")]
    UndefinedField {
        name: String,
        line: usize,
        field: String,
    },

    /// A `$variable` that no enclosing range declares.
    #[error("{name}:{line}: undefined variable {variable}")]
    UndefinedVariable {
        name: String,
        line: usize,
        variable: String,
    },

    /// An action that the template language does not know.
    #[error("{name}:{line}: unsupported action {action:?}")]
    UnsupportedAction {
        name: String,
        line: usize,
        action: String,
    },

    /// An `end` or `else` without a matching block.
    #[error("{name}:{line}: unexpected {keyword}")]
    Unexpected {
        name: String,
        line: usize,
        keyword: &'static str,
    },

    /// A block that is never closed with `end`.
    #[error("{name}:{line}: missing end for {block}")]
    MissingEnd {
        name: String,
        line: usize,
        block: &'static str,
    },
}

/// Data a template is rendered with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateData<'a> {
    /// Backend addresses, in the order they should be rendered.
    pub hosts: Vec<&'a str>,

    /// Port proxied on every backend.
    pub port: u16,
}

/// Condition of an `if` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cond {
    Hosts,
    Port,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Port,
    Host,
    /// Zero-based position of the current host.
    Index,
    HostList,
    HostCount,
    Range {
        body: Vec<Node>,
        empty: Vec<Node>,
    },
    If {
        cond: Cond,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// A parsed and validated template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    name: String,
    nodes: Vec<Node>,
}

impl Template {
    /// Parse a template.
    ///
    /// `name` is only used in error messages (usually the file path).
    pub fn parse(name: impl Into<String>, source: &str) -> Result<Self, TemplateError> {
        let name = name.into();
        let nodes = parse::parse(&name, source)?;
        Ok(Self { name, nodes })
    }

    /// Name the template was parsed with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render the template.
    pub fn execute(&self, data: &TemplateData<'_>) -> String {
        let mut out = String::new();
        write_nodes(&self.nodes, data, None, &mut out);
        out
    }
}

/// `item` is the position and host of the innermost range iteration.
fn write_nodes(
    nodes: &[Node],
    data: &TemplateData<'_>,
    item: Option<(usize, &str)>,
    out: &mut String,
) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Port => out.push_str(&data.port.to_string()),
            // The parser only admits host and index references inside a range body.
            Node::Host => out.push_str(item.map(|(_, host)| host).unwrap_or_default()),
            Node::Index => {
                if let Some((index, _)) = item {
                    out.push_str(&index.to_string());
                }
            }
            Node::HostList => {
                out.push('[');
                out.push_str(&data.hosts.join(" "));
                out.push(']');
            }
            Node::HostCount => out.push_str(&data.hosts.len().to_string()),
            Node::Range { body, empty } => {
                if data.hosts.is_empty() {
                    write_nodes(empty, data, item, out);
                }
                for (index, host) in data.hosts.iter().enumerate() {
                    write_nodes(body, data, Some((index, *host)), out);
                }
            }
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                let truthy = match cond {
                    Cond::Hosts => !data.hosts.is_empty(),
                    Cond::Port => data.port != 0,
                };
                let branch = if truthy { then } else { otherwise };
                write_nodes(branch, data, item, out);
            }
        }
    }
}
