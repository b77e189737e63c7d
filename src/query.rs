//!
//! Request path and query-string parsing
//! -------------------------------------
//! Turns a request path into the single-chain query skeleton used against
//! the store (resolving it against the schema as it goes, including
//! RESTCONF `list=key` notation and `model:name` prefixes), and parses the
//! RESTCONF query parameters (`depth`, `fields`, `content`, `with-defaults`,
//! `filter`) into format flags and extra query branches.

use crate::error::{ErrorKind, RestError};
use crate::request::FormatFlags;
use crate::schema::{SchemaError, SchemaId, SchemaInstance};
use crate::tree::Node;

/// A resolved request path: the query skeleton, the addressed schema node
/// and the literal path segments.
#[derive(Debug)]
pub struct ResolvedPath {
    pub query: Node,
    pub schema: SchemaId,
    pub segments: Vec<String>,
    /// The path entered through the `/operations` RPC root alias.
    pub operations: bool,
}

/// Expand RESTCONF instance notation: `list=k1,k2` contributes the `list`
/// segment followed by one segment per key value.
fn expand_segments(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    for seg in path.split('/').filter(|s| !s.is_empty()) {
        match seg.split_once('=') {
            Some((name, keys)) => {
                out.push(name.to_string());
                for key in keys.split(',').filter(|k| !k.is_empty()) {
                    out.push(key.to_string());
                }
            }
            None => out.push(seg.to_string()),
        }
    }
    out
}

/// Build the query chain for a request path, resolving each segment against
/// the schema (wildcard instances, proxy restarts, model prefixes).
pub fn path_to_tree(schema: &SchemaInstance, path: &str) -> Result<ResolvedPath, RestError> {
    let segments = expand_segments(path);
    if segments.is_empty() {
        return Err(RestError::not_found());
    }
    let mut root = Node::root();
    let mut node = &mut root;
    let mut sid = schema.root();
    let mut first = true;
    let mut operations = false;
    for (idx, seg) in segments.iter().enumerate() {
        // "/operations" is an alias of the schema root for RPC addressing:
        // multiple models expose RPCs at the same logical root.
        if idx == 0 && seg == "operations" && schema.named_child(sid, "operations").is_none() {
            operations = true;
            node = node.append(Node::new("operations"));
            continue;
        }
        if schema.is_proxy(sid) {
            sid = schema.root();
        }
        if first {
            // The compact `model:name` form resolves two schema levels and
            // contributes both to the chain.
            let ids = schema.resolve_first(seg).ok_or(SchemaError::NoSchemaNode)?;
            for id in ids {
                node = node.append(Node::new(schema.name(id)));
                sid = id;
            }
        } else {
            sid = schema.child(sid, seg).ok_or(SchemaError::NoSchemaNode)?;
            // Wildcard instance segments keep the literal instance name;
            // named segments canonicalise to the schema spelling.
            let name = if schema.name(sid) == "*" { seg.as_str() } else { schema.name(sid) };
            node = node.append(Node::new(name));
        }
        first = false;
    }
    if first {
        return Err(RestError::not_found());
    }
    Ok(ResolvedPath { query: root, schema: sid, segments, operations })
}

/// Parse a `fields` expression into a list of segment paths.
/// Grammar: `fields = path ("," path)*`,
/// `path = segment ("/" segment)* ("(" fields ")")?`.
pub fn parse_fields(expr: &str) -> Result<Vec<Vec<String>>, RestError> {
    let mut chars = expr.chars().peekable();
    let paths = parse_fields_list(&mut chars)?;
    if chars.next().is_some() {
        return Err(invalid_query());
    }
    if paths.is_empty() {
        return Err(invalid_query());
    }
    Ok(paths)
}

fn invalid_query() -> RestError {
    RestError::new(ErrorKind::InvalidValue)
}

type Chars<'a> = std::iter::Peekable<std::str::Chars<'a>>;

fn parse_fields_list(chars: &mut Chars) -> Result<Vec<Vec<String>>, RestError> {
    let mut paths = Vec::new();
    loop {
        paths.extend(parse_fields_path(chars)?);
        match chars.peek() {
            Some(',') => {
                chars.next();
            }
            _ => break,
        }
    }
    Ok(paths)
}

fn parse_fields_path(chars: &mut Chars) -> Result<Vec<Vec<String>>, RestError> {
    let mut prefix: Vec<String> = Vec::new();
    loop {
        let mut segment = String::new();
        while let Some(&c) = chars.peek() {
            if c == '/' || c == ',' || c == '(' || c == ')' {
                break;
            }
            segment.push(c);
            chars.next();
        }
        if segment.is_empty() {
            return Err(invalid_query());
        }
        prefix.push(segment);
        match chars.peek() {
            Some('/') => {
                chars.next();
            }
            Some('(') => {
                chars.next();
                let subs = parse_fields_list(chars)?;
                if chars.next() != Some(')') {
                    return Err(invalid_query());
                }
                let mut out = Vec::new();
                for sub in subs {
                    let mut path = prefix.clone();
                    path.extend(sub);
                    out.push(path);
                }
                return Ok(out);
            }
            _ => return Ok(vec![prefix]),
        }
    }
}

/// Parse the query string, setting flags and attaching `fields` branches
/// below the addressed query node. Unknown parameters or values fail with
/// an invalid-query error.
pub fn parse_query(
    schema: &SchemaInstance,
    qschema: SchemaId,
    qnode: &mut Node,
    query: &str,
    flags: &mut FormatFlags,
    filter: &mut Option<String>,
) -> Result<(), RestError> {
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "depth" => {
                if value == "unbounded" {
                    flags.depth = None;
                } else {
                    let depth: u32 = value.parse().map_err(|_| invalid_query())?;
                    if depth == 0 {
                        return Err(invalid_query());
                    }
                    flags.depth = Some(depth);
                }
            }
            "fields" => {
                let paths = parse_fields(value)?;
                for path in paths {
                    let mut sid = qschema;
                    let mut node = &mut *qnode;
                    for seg in &path {
                        sid = schema.child(sid, seg).ok_or_else(invalid_query)?;
                        node = match node.children().iter().position(|c| c.name() == seg.as_str()) {
                            Some(idx) => &mut node.children_mut()[idx],
                            None => node.append(Node::new(seg.as_str())),
                        };
                    }
                }
            }
            "content" => match value {
                "all" => {
                    flags.config_only = false;
                    flags.nonconfig_only = false;
                }
                "config" => flags.config_only = true,
                "nonconfig" => flags.nonconfig_only = true,
                _ => return Err(invalid_query()),
            },
            "with-defaults" => match value {
                "report-all" | "report-all-tagged" => flags.add_defaults = true,
                "trim" => flags.trim_defaults = true,
                "explicit" => {}
                _ => return Err(invalid_query()),
            },
            "filter" => {
                *filter = Some(value.to_string());
            }
            _ => return Err(invalid_query()),
        }
    }
    Ok(())
}
