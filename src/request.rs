//! Request and response models shared by the front-end and the method
//! handlers, including the content-negotiation table that turns HTTP
//! method/media-type/extension headers into the per-request flag set.

use crate::error::{ErrorKind, RestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn parse(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Method::Get => 1 << 0,
            Method::Post => 1 << 1,
            Method::Put => 1 << 2,
            Method::Patch => 1 << 3,
            Method::Delete => 1 << 4,
            Method::Head => 1 << 5,
            Method::Options => 1 << 6,
        }
    }
}

/// A set of HTTP methods (RPC registrations, logging configuration).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodSet(u8);

impl MethodSet {
    pub fn empty() -> Self {
        MethodSet(0)
    }

    pub fn insert(&mut self, method: Method) {
        self.0 |= method.bit();
    }

    pub fn contains(self, method: Method) -> bool {
        self.0 & method.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Method> for MethodSet {
    fn from_iter<T: IntoIterator<Item = Method>>(iter: T) -> Self {
        let mut set = MethodSet::empty();
        for m in iter {
            set.insert(m);
        }
        set
    }
}

/// Negotiated response encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    Json,
    Xml,
    EventStream,
    StreamJson,
}

/// Per-request formatting flags (extension headers plus RESTCONF
/// defaults), consumed by the JSON codec and the method handlers.
#[derive(Debug, Clone, Default)]
pub struct FormatFlags {
    pub restconf: bool,
    pub arrays: bool,
    pub types: bool,
    pub namespace: bool,
    /// Prefix the response root as well; set when the request path itself
    /// carried a `model:` prefix.
    pub ns_prefix: bool,
    pub root: bool,
    pub multi: bool,
    /// Translate enum values to their symbolic names on output.
    pub idref_values: bool,
    /// Evaluate schema conditions on writes (delegated, carried for parity).
    pub conditions: bool,
    pub config_only: bool,
    pub nonconfig_only: bool,
    pub add_defaults: bool,
    pub trim_defaults: bool,
    pub put_replace: bool,
    pub put_key_value: bool,
    /// `depth` query parameter (1-based from the response root).
    pub depth: Option<u32>,
}

/// Server-wide negotiation defaults from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodingDefaults {
    /// `-e application/yang-data+json` makes RESTCONF framing the default.
    pub restconf: bool,
    /// `-a` formats lists as JSON arrays by default.
    pub use_arrays: bool,
    /// `-t` encodes typed JSON values by default.
    pub use_types: bool,
}

/// The decoded request handed to the method handlers.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub accept: Accept,
    pub flags: FormatFlags,
    /// Percent-decoded path with the document-root prefix stripped.
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    /// The document-root prefix that was stripped (`/api` or the RESTCONF
    /// root), used when generating absolute resource paths.
    pub doc_root: String,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
    pub if_unmodified_since: Option<String>,
    pub server_name: String,
    pub server_port: String,
    pub remote_addr: String,
    pub remote_user: String,
    pub body: String,
}

/// A fully-assembled (non-streaming) response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub etag: Option<u64>,
    pub last_modified: Option<String>,
    pub location: Option<String>,
    pub allow: Option<String>,
    pub accept_patch: Option<&'static str>,
    pub body: String,
}

impl Response {
    pub fn content_type_for(flags: &FormatFlags) -> &'static str {
        if flags.restconf {
            "application/yang-data+json"
        } else {
            "application/json"
        }
    }

    pub fn new(status: u16, flags: &FormatFlags, body: String) -> Self {
        Response {
            status,
            content_type: Self::content_type_for(flags),
            etag: None,
            last_modified: None,
            location: None,
            allow: None,
            accept_patch: None,
            body,
        }
    }

    /// Error response: RESTCONF framing carries the errors object, plain
    /// mode carries an empty body (304 never carries one).
    pub fn from_error(flags: &FormatFlags, err: &RestError) -> Self {
        let status = err.http_status();
        let body = if flags.restconf && (400..=499).contains(&status) {
            err.restconf_body().to_string()
        } else {
            String::new()
        };
        Response::new(status, flags, body)
    }

    pub fn with_etag(mut self, etag: u64) -> Self {
        self.etag = Some(etag);
        self
    }
}

/// Extension headers consumed from the request (`X-JSON-*`).
#[derive(Debug, Clone, Default)]
pub struct JsonHeaders {
    pub root: Option<String>,
    pub multi: Option<String>,
    pub arrays: Option<String>,
    pub types: Option<String>,
    pub namespace: Option<String>,
    pub idref_values: Option<String>,
    pub conditions: Option<String>,
}

fn on(v: &Option<String>) -> bool {
    v.as_deref() == Some("on")
}

fn off(v: &Option<String>) -> bool {
    v.as_deref() == Some("off")
}

/// Compute the negotiated method, accept encoding and flag set from the raw
/// request fields. Errors map to 405 (unknown method) and 415 (unknown
/// media type).
pub fn negotiate(
    method: &str,
    content_type: Option<&str>,
    accept: Option<&str>,
    headers: &JsonHeaders,
    defaults: EncodingDefaults,
) -> Result<(Method, Accept, FormatFlags), RestError> {
    let method = Method::parse(method)
        .ok_or_else(|| RestError::with_message(ErrorKind::NotSupported, "method not allowed"))?;

    let mut flags = FormatFlags::default();
    let mut accept_kind = None;

    // Content type of the request body.
    match content_type {
        Some("application/json") => {}
        Some("application/yang-data+json") => flags.restconf = true,
        // XML encodings are reserved: accepted at the negotiation table but
        // the build emits JSON.
        Some("application/xml") => {}
        Some("application/yang-data+xml") => flags.restconf = true,
        Some(other) => {
            return Err(RestError::with_message(
                ErrorKind::UnsupportedMedia,
                format!("media type \"{}\" not allowed", other),
            ));
        }
        None => {
            if matches!(method, Method::Post | Method::Put | Method::Patch) && defaults.restconf {
                flags.restconf = true;
            }
        }
    }

    // Accepted response types.
    if let Some(accept) = accept {
        if accept.contains("application/yang-data+json") {
            accept_kind = Some(Accept::Json);
            flags.restconf = true;
        } else if accept.contains("application/json") {
            accept_kind = Some(Accept::Json);
        } else if accept.contains("application/yang-data+xml") {
            accept_kind = Some(Accept::Xml);
            flags.restconf = true;
        } else if accept.contains("application/xml") {
            accept_kind = Some(Accept::Xml);
        } else if accept.contains("text/event-stream") {
            accept_kind = Some(Accept::EventStream);
        } else if accept.contains("application/stream+json") {
            accept_kind = Some(Accept::StreamJson);
        } else if accept.contains("*/*") {
            accept_kind = Some(Accept::Json);
            if defaults.restconf {
                flags.restconf = true;
            }
        } else {
            return Err(RestError::with_message(
                ErrorKind::UnsupportedMedia,
                format!("media type \"{}\" not allowed", accept),
            ));
        }
    }
    let accept_kind = accept_kind.unwrap_or(Accept::Json);

    // JSON formatting extension headers; RESTCONF forces arrays, typed
    // values and namespace prefixes unless explicitly turned off.
    flags.root = !off(&headers.root);
    flags.multi = on(&headers.multi);
    flags.arrays = defaults.use_arrays || flags.restconf || on(&headers.arrays);
    if off(&headers.arrays) {
        flags.arrays = false;
    }
    flags.types = defaults.use_types || flags.restconf || on(&headers.types);
    if off(&headers.types) {
        flags.types = false;
    }
    flags.namespace = flags.restconf || on(&headers.namespace);
    if off(&headers.namespace) {
        flags.namespace = false;
    }
    flags.idref_values = on(&headers.idref_values);
    flags.conditions = on(&headers.conditions);

    // RESTCONF PUT replaces the target resource; the body must be a single
    // key/value object naming the data resource.
    if flags.restconf && method == Method::Put {
        flags.put_replace = true;
        flags.put_key_value = true;
    }

    Ok((method, accept_kind, flags))
}
