//!
//! Method handlers
//! ---------------
//! The request pipeline core: GET/HEAD (reads, searches, schema dumps),
//! POST/PUT/PATCH (writes with conditional-request preconditions and
//! RESTCONF create semantics), DELETE (query-and-blank), OPTIONS, the
//! RESTCONF well-known resources and the RPC invocation path.
//!
//! Handlers translate a decoded [`Request`](crate::request::Request) into
//! store operations and produce a [`Response`](crate::request::Response);
//! streaming subscriptions are handled by the subscription engine before
//! requests reach this module.

use crate::codec;
use crate::error::{ErrorKind, RestError};
use crate::logging::LogConfig;
use crate::query::{self, ResolvedPath};
use crate::request::{FormatFlags, Method, Request, Response};
use crate::rpc::{RpcOutcome, RpcRegistry};
use crate::schema::{SchemaId, SchemaInstance};
use crate::store::{Store, StoreError};
use crate::tree::Node;
use chrono::{NaiveDateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error};

/// Built-in HTML explorer served at `<root>.html`.
pub const API_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>grove-rest</title></head>
<body>
<h2>grove-rest API explorer</h2>
<p>Enter a data path and press fetch.</p>
<input id="path" size="60" value="/api/"/>
<button onclick="fetchPath()">fetch</button>
<pre id="result"></pre>
<script>
function fetchPath() {
    var p = document.getElementById('path').value;
    fetch(p, { headers: { 'Accept': 'application/json' } })
        .then(function (r) { return r.text(); })
        .then(function (t) { document.getElementById('result').textContent = t; })
        .catch(function (e) { document.getElementById('result').textContent = e; });
}
</script>
</body>
</html>
"#;

/// Shared context handed to every request handler.
#[derive(Clone)]
pub struct RestContext {
    pub schema: Arc<SchemaInstance>,
    pub store: Store,
    pub rpcs: Arc<RpcRegistry>,
    pub log: LogConfig,
    /// Wallclock seconds when the store started; `Last-Modified` is derived
    /// as boot time plus timestamp seconds.
    pub boot_epoch: i64,
}

impl RestContext {
    pub fn new(schema: Arc<SchemaInstance>, store: Store, rpcs: Arc<RpcRegistry>, log: LogConfig) -> Self {
        RestContext { schema, store, rpcs, log, boot_epoch: Utc::now().timestamp() }
    }

    fn last_modified(&self, ts: u64) -> String {
        let secs = self.boot_epoch + (ts / 1_000_000) as i64;
        match Utc.timestamp_opt(secs, 0).single() {
            Some(dt) => dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            None => String::new(),
        }
    }

    /// Seconds-since-boot for an HTTP date header, for comparison against
    /// store timestamps.
    fn header_seconds(&self, header: &str) -> Option<i64> {
        let parsed = NaiveDateTime::parse_from_str(header.trim(), "%a, %d %b %Y %H:%M:%S GMT").ok()?;
        Some(parsed.and_utc().timestamp() - self.boot_epoch)
    }
}

fn parse_etag(value: &str) -> u64 {
    u64::from_str_radix(value.trim().trim_matches('"'), 16).unwrap_or(0)
}

/// Absolute store path of the (single-chain) query tree.
fn chain_path(query: &Node) -> String {
    let mut path = String::new();
    let mut node = query;
    while let Some(child) = node.children().first() {
        path.push('/');
        path.push_str(child.name());
        node = child;
    }
    path
}

fn error_response(flags: &FormatFlags, err: &RestError) -> Response {
    Response::from_error(flags, err)
}

/// Top-level dispatcher for non-streaming requests. The path is already
/// percent-decoded and stripped of the document root.
pub fn rest_api(ctx: &RestContext, req: &Request) -> Response {
    debug!(target: "rest", "{} {}{}", req.method.as_str(), req.doc_root, req.path);

    let mut req = req.clone();
    if req.flags.restconf {
        // RESTCONF well-known resources live beside /data.
        if let Some(rest) = req.path.strip_prefix("/data") {
            if rest.is_empty() || rest.starts_with('/') {
                let mut doc_root = req.doc_root.clone();
                doc_root.push_str("/data");
                req.doc_root = doc_root;
                req.path = rest.to_string();
            }
        } else if matches!(req.method, Method::Get | Method::Head) {
            if let Some(resp) = restconf_well_known(ctx, &req) {
                return resp;
            }
        }
    }

    let resp = match req.method {
        Method::Get | Method::Head => {
            if req.path == ".xml" || req.path == "/.xml" {
                Response {
                    status: 200,
                    content_type: "text/xml",
                    etag: None,
                    last_modified: None,
                    location: None,
                    allow: None,
                    accept_patch: None,
                    body: ctx.schema.dump_xml(),
                }
            } else if req.path == ".html" || req.path == "/.html" {
                Response {
                    status: 200,
                    content_type: "text/html",
                    etag: None,
                    last_modified: None,
                    location: None,
                    allow: None,
                    accept_patch: None,
                    body: API_HTML.to_string(),
                }
            } else if req.path.ends_with('/') {
                rest_api_search(ctx, &req)
            } else {
                rest_api_get(ctx, &req)
            }
        }
        Method::Post | Method::Put | Method::Patch => rest_api_write(ctx, &req),
        Method::Delete => rest_api_delete(ctx, &req),
        Method::Options => rest_api_options(ctx, &req),
    };

    let mut resp = resp;
    if req.method == Method::Head {
        resp.body = String::new();
    }
    resp
}

/// The RESTCONF root resource, `/operations` listing and
/// `/yang-library-version` documents.
fn restconf_well_known(ctx: &RestContext, req: &Request) -> Option<Response> {
    let doc = if req.path.is_empty() || req.path == "/" {
        let resource = format!("ietf-restconf:{}", req.doc_root.trim_start_matches('/'));
        let mut root = Map::new();
        root.insert(
            resource,
            json!({
                "data": {},
                "operations": {},
                "yang-library-version": "2019-01-04",
            }),
        );
        Value::Object(root)
    } else if req.path == "/operations" {
        let mut ops = Map::new();
        for child in ctx.schema.children(ctx.schema.root()) {
            if ctx.schema.rpc_schema(child).is_none() {
                continue;
            }
            let name = ctx.schema.name(child);
            let fname = match ctx.schema.model(child) {
                Some(model) => format!("{}:{}", model.name, name),
                None => name.to_string(),
            };
            let path = format!("{}/operations/{}", req.doc_root, fname);
            ops.insert(fname, Value::String(path));
        }
        json!({ "ietf-restconf:operations": ops })
    } else if req.path == "/yang-library-version" {
        json!({ "yang-library-version": "2019-01-04" })
    } else {
        return None;
    };
    Some(Response::new(200, &req.flags, doc.to_string()))
}

/// Search request: list the immediate readable children below a path.
fn rest_api_search(ctx: &RestContext, req: &Request) -> Response {
    let parent = req.path.trim_end_matches('/');
    let ts = ctx.store.timestamp(parent);

    let mut status = 200;
    let mut body = String::new();

    if let Some(if_none_match) = req.if_none_match.as_deref().filter(|s| !s.is_empty()) {
        if ts == parse_etag(if_none_match) {
            status = 304;
        }
    }

    if status == 200 {
        match ctx.schema.lookup(parent) {
            Ok(sid) if ctx.schema.is_readable(sid) => {
                let mut names: Vec<String> = Vec::new();
                for child_path in ctx.store.search(parent) {
                    let name = child_path.rsplit('/').next().unwrap_or("").to_string();
                    if let Some(child_sid) = ctx.schema.child(sid, &name) {
                        if ctx.schema.is_readable(child_sid) {
                            names.push(name);
                        }
                    }
                }
                names.sort_by_key(|a| a.to_lowercase());
                let segment = parent.rsplit('/').next().unwrap_or("");
                let mut obj = Map::new();
                obj.insert(segment.to_string(), json!(names));
                body = Value::Object(obj).to_string();
            }
            Ok(_) => status = 403,
            Err(_) => status = 404,
        }
    }

    ctx.log.log_read(req.method, status, &req.remote_user, &req.remote_addr, &req.path);

    let mut resp = if status >= 400 {
        error_response(&req.flags, &RestError::new(status_to_kind(status)))
    } else {
        Response::new(status, &req.flags, body)
    };
    resp.etag = Some(ts);
    resp
}

fn status_to_kind(status: u16) -> ErrorKind {
    match status {
        403 => ErrorKind::AccessDenied,
        404 => ErrorKind::NotFound,
        _ => ErrorKind::Internal,
    }
}

/// Read request over the store with conditional headers, query parameters
/// and response formatting.
fn rest_api_get(ctx: &RestContext, req: &Request) -> Response {
    let schema = &*ctx.schema;
    let mut flags = req.flags.clone();
    let mut path = req.path.clone();

    // A request to the bare data root is analogous to a request for the
    // YANG library.
    if path.is_empty() && flags.restconf {
        path = "/ietf-yang-library:yang-library".to_string();
    }

    // Only prefix the response root when the request itself named a model.
    if flags.namespace {
        let first = path.trim_start_matches('/').split('/').next().unwrap_or("");
        flags.ns_prefix = first.contains(':');
    }

    let resolved = match query::path_to_tree(schema, &path) {
        Ok(r) => r,
        Err(e) => {
            ctx.log.log_read(req.method, e.http_status(), &req.remote_user, &req.remote_addr, &path);
            return error_response(&flags, &e);
        }
    };
    let qschema = resolved.schema;

    if schema.is_leaf(qschema) && !schema.is_readable(qschema) {
        let e = RestError::access_denied();
        ctx.log.log_read(req.method, 403, &req.remote_user, &req.remote_addr, &path);
        return error_response(&flags, &e);
    }

    // GET on an RPC invokes it with empty input outside RESTCONF.
    if let Some(rpc) = schema.rpc_schema(qschema) {
        if flags.restconf || !schema.is_readable(rpc) {
            let e = RestError::not_supported();
            return error_response(&flags, &e);
        }
        return rpc_invoke(ctx, req, &resolved, rpc, None);
    }

    let mut tree_query = resolved.query;
    let qdepth = tree_query.max_height();

    // Response depth: descend while the chain is unambiguous; present a
    // list rather than a single instance.
    let mut rdepth = 1;
    {
        let mut rnode = &tree_query;
        while rnode.children_count() == 1 && rnode.children()[0].name() != "*" {
            rnode = &rnode.children()[0];
            rdepth += 1;
        }
    }
    let mut rschema = qschema;
    for _ in rdepth..qdepth {
        rschema = schema.parent(rschema).unwrap_or(schema.root());
    }
    if let Some(parent) = schema.parent(rschema) {
        if schema.is_list(parent) {
            rschema = parent;
            rdepth -= 1;
        }
    }

    let ts_path = chain_path(&tree_query);
    let ts = ctx.store.timestamp(&ts_path);

    if let Some(if_none_match) = req.if_none_match.as_deref().filter(|s| !s.is_empty()) {
        if ts == parse_etag(if_none_match) {
            debug!(target: "rest", "\"{}\" not modified since ETag {}", path, if_none_match);
            ctx.log.log_read(req.method, 304, &req.remote_user, &req.remote_addr, &path);
            return Response::new(304, &flags, String::new());
        }
    }
    if let Some(since) = req.if_modified_since.as_deref().filter(|s| !s.is_empty()) {
        if let Some(header_secs) = ctx.header_seconds(since) {
            if (ts / 1_000_000) as i64 <= header_secs {
                ctx.log.log_read(req.method, 304, &req.remote_user, &req.remote_addr, &path);
                return Response::new(304, &flags, String::new());
            }
        }
    }

    // Query parameters attach below the addressed node.
    let mut filter = None;
    if let Some(qstr) = req.query.as_deref().filter(|q| !q.is_empty()) {
        let qnode = tree_query.at_depth_mut(qdepth).expect("chain depth");
        if let Err(e) = query::parse_query(schema, qschema, qnode, qstr, &mut flags, &mut filter) {
            ctx.log.log_read(req.method, e.http_status(), &req.remote_user, &req.remote_addr, &path);
            return error_response(&flags, &e);
        }
    }

    // Without fields we may need a wildcard to pull everything below.
    if qdepth == tree_query.max_height() && flags.depth != Some(1) && schema.has_children(qschema) {
        let qnode = tree_query.at_depth_mut(qdepth).expect("chain depth");
        if qnode.children_count() == 0 && qnode.name() != "*" {
            qnode.append(Node::new("*"));
        }
    }

    let mut tree = ctx.store.query(&tree_query);

    if flags.add_defaults {
        match tree {
            Some(ref mut t) => {
                if let Some(rnode) = t.at_depth_mut(rdepth) {
                    codec::add_defaults(schema, rschema, rnode);
                }
            }
            None if qdepth == rdepth && (schema.has_children(rschema) || schema.is_leaf(rschema)) => {
                // Nothing in the store, but defaults may exist.
                let mut t = tree_query.clone();
                if let Some(qnode) = t.at_depth_mut(qdepth) {
                    qnode.children_mut().clear();
                    codec::add_defaults(schema, rschema, qnode);
                }
                tree = Some(t);
            }
            None => {}
        }
    }

    let mut json = None;
    if let Some(ref mut t) = tree {
        if flags.trim_defaults {
            if let Some(rnode) = t.at_depth_mut(rdepth) {
                codec::trim_defaults(schema, rschema, rnode);
            }
        }
        if let Some(depth) = flags.depth {
            if let Some(rnode) = t.at_depth_mut(rdepth) {
                codec::trim_tree_depth(rnode, depth);
            }
        }
        if let Some(rnode) = t.at_depth(rdepth) {
            json = codec::tree_to_json(schema, rschema, rnode, &flags);
        }
    }
    let mut json = json.unwrap_or_else(|| json!({}));

    // Root chopping and list unwrapping.
    let chop = !flags.root || (!flags.restconf && qschema != rschema && schema.is_list(rschema));
    if chop {
        if let Value::Object(map) = &json {
            if let Some((_, inner)) = map.iter().next() {
                json = inner.clone();
            }
        }
    }
    if flags.multi {
        json = Value::Array(vec![json]);
    }

    ctx.log.log_read(req.method, 200, &req.remote_user, &req.remote_addr, &path);

    let mut resp = Response::new(200, &flags, json.to_string());
    resp.etag = Some(ts);
    resp.last_modified = Some(ctx.last_modified(ts));
    resp
}

/// True when the parsed write would change an existing list instance's key
/// leaf (rejected with 405 in RESTCONF).
fn restconf_key_update(
    ctx: &RestContext,
    target: SchemaId,
    full_path: &str,
    parsed: &Node,
) -> bool {
    let schema = &*ctx.schema;
    let parent1 = schema.parent(target);
    let (list_sid, on_instance) = match parent1 {
        Some(p) if schema.is_list(p) => (Some(p), true),
        Some(p) => match schema.parent(p) {
            Some(pp) if schema.is_list(pp) => (Some(pp), false),
            _ => (None, true),
        },
        None => (None, true),
    };
    let Some(list_sid) = list_sid else {
        return false;
    };
    let Some(key) = schema.list_key(list_sid) else {
        return false;
    };
    let list_name = schema.name(list_sid);

    // Find the incoming key leaf: either directly among the parsed fields
    // or nested below the list node for wrapped resource bodies.
    let mut fields = parsed.children();
    if let Some(list_node) = parsed.child(list_name) {
        if let Some(instance) = list_node.children().first() {
            fields = instance.children();
        }
    }
    let Some(new_value) = fields.iter().find(|n| n.name() == key).and_then(|n| n.value()) else {
        return false;
    };

    let stored_path = if on_instance {
        format!("{}/{}", full_path, key)
    } else {
        full_path.to_string()
    };
    match ctx.store.get(&stored_path) {
        Some(existing) => existing != new_value,
        None => false,
    }
}

/// Shared handler for POST, PUT and PATCH.
fn rest_api_write(ctx: &RestContext, req: &Request) -> Response {
    let schema = &*ctx.schema;
    let flags = req.flags.clone();
    let path = &req.path;

    let resolved = match query::path_to_tree(schema, path) {
        Ok(r) => r,
        Err(e) => {
            ctx.log.log_write(req.method, e.http_status(), &req.remote_user, &req.remote_addr, path, &[]);
            return error_response(&flags, &e);
        }
    };
    let target = resolved.schema;

    // RPCs are invoked rather than written.
    if let Some(rpc) = schema.rpc_schema(target) {
        let json = match rpc_body_json(ctx, req, rpc) {
            Ok(j) => j,
            Err(e) => return error_response(&flags, &e),
        };
        return rpc_invoke(ctx, req, &resolved, rpc, json);
    }

    if schema.is_leaf(target) && !schema.is_writable(target) {
        let e = RestError::access_denied();
        ctx.log.log_write(req.method, 403, &req.remote_user, &req.remote_addr, path, &[]);
        return error_response(&flags, &e);
    }

    // RESTCONF never writes a leaf-list instance through the URI; entries
    // are fully defined in the data portion of the set.
    if flags.restconf {
        let star_instance = schema.name(target) == "*"
            && schema.parent(target).map(|p| schema.is_leaf_list(p)).unwrap_or(false);
        if schema.is_leaf_list(target) || star_instance {
            let e = RestError::not_supported();
            ctx.log.log_write(req.method, 405, &req.remote_user, &req.remote_addr, path, &[]);
            return error_response(&flags, &e);
        }
    }

    let mut chain = resolved.query;
    let qdepth = chain.max_height();
    let full_path = chain_path(&chain);

    // Conditional request preconditions against the target's timestamp.
    let ts = ctx.store.timestamp(&full_path);
    if let Some(etag) = req.if_match.as_deref().filter(|s| !s.is_empty()) {
        if ts != parse_etag(etag) {
            let e = RestError::precondition_failed();
            ctx.log.log_write(req.method, 412, &req.remote_user, &req.remote_addr, path, &[]);
            return error_response(&flags, &e);
        }
    }
    if let Some(etag) = req.if_none_match.as_deref().filter(|s| !s.is_empty()) {
        if ts == parse_etag(etag) {
            let e = RestError::precondition_failed();
            ctx.log.log_write(req.method, 412, &req.remote_user, &req.remote_addr, path, &[]);
            return error_response(&flags, &e);
        }
    }
    if let Some(since) = req.if_unmodified_since.as_deref().filter(|s| !s.is_empty()) {
        if let Some(header_secs) = ctx.header_seconds(since) {
            if (ts / 1_000_000) as i64 > header_secs {
                let e = RestError::precondition_failed();
                ctx.log.log_write(req.method, 412, &req.remote_user, &req.remote_addr, path, &[]);
                return error_response(&flags, &e);
            }
        }
    }

    // Determine the parse scope, the JSON document and how many chain
    // segments the graft replaces.
    let body = req.body.as_str();
    let mut resource_sid = target;
    let scope;
    let pop;
    let json: Value;

    if flags.put_key_value && req.method == Method::Put {
        let parsed: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(_) => {
                let e = RestError::malformed();
                ctx.log.log_write(req.method, 400, &req.remote_user, &req.remote_addr, path, &[]);
                return error_response(&flags, &e);
            }
        };
        // The data resource is the list when addressing a list instance.
        if schema.name(target) == "*" {
            if let Some(parent) = schema.parent(target) {
                if schema.is_list(parent) {
                    resource_sid = parent;
                }
            }
        }
        let resource_name = schema.name(resource_sid);
        let ok = match &parsed {
            Value::Object(map) if map.len() == 1 => map
                .keys()
                .next()
                .map(|k| k.rsplit(':').next().unwrap_or(k) == resource_name)
                .unwrap_or(false),
            _ => false,
        };
        if !ok {
            debug!(target: "rest", "PUT body is not a single {}: object", resource_name);
            let e = RestError::invalid();
            ctx.log.log_write(req.method, 400, &req.remote_user, &req.remote_addr, path, &[]);
            return error_response(&flags, &e);
        }
        scope = schema.parent(resource_sid).unwrap_or(schema.root());
        pop = if resource_sid == target { 1 } else { 2 };
        json = parsed;
    } else if schema.is_leaf(target) && !body.is_empty() {
        // Full path to a leaf: the body is a scalar (or a bare string).
        let mut value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
        if value.is_null() && !body.starts_with('{') && !body.starts_with('[') {
            value = Value::String(body.to_string());
        }
        // A resource-shaped body ({"leaf": value}) unwraps to the scalar.
        if let Value::Object(map) = &value {
            if map.len() == 1 {
                if let Some((k, v)) = map.iter().next() {
                    if k.rsplit(':').next().unwrap_or(k) == schema.name(target) {
                        value = v.clone();
                    }
                }
            }
        }
        let pschema = schema.parent(target).unwrap_or(schema.root());
        let name = if schema.is_leaf_list(pschema) {
            match codec::scalar_to_string(&value) {
                Some(s) => s,
                None => {
                    let e = RestError::malformed();
                    ctx.log.log_write(req.method, 400, &req.remote_user, &req.remote_addr, path, &[]);
                    return error_response(&flags, &e);
                }
            }
        } else {
            schema.name(target).to_string()
        };
        let mut object = Map::new();
        object.insert(name, value);
        json = Value::Object(object);
        scope = pschema;
        pop = 1;
    } else if !body.is_empty() {
        match serde_json::from_str(body) {
            Ok(v) => json = v,
            Err(e) => {
                error!(target: "rest", "malformed body: {}", e);
                let e = RestError::malformed();
                ctx.log.log_write(req.method, 400, &req.remote_user, &req.remote_addr, path, &[]);
                return error_response(&flags, &e);
            }
        }
        // A list addressed directly may carry a body keyed by its own name
        // (RESTCONF create-into-list); re-scope to the parent so the key
        // resolves as a child.
        let self_named = schema.is_list(target)
            && match &json {
                Value::Object(map) if map.len() == 1 => map
                    .keys()
                    .next()
                    .map(|k| k.rsplit(':').next().unwrap_or(k) == schema.name(target))
                    .unwrap_or(false),
                _ => false,
            };
        if self_named {
            scope = schema.parent(target).unwrap_or(schema.root());
            pop = 1;
        } else {
            scope = target;
            pop = 0;
        }
    } else {
        let e = RestError::invalid();
        ctx.log.log_write(req.method, 400, &req.remote_user, &req.remote_addr, path, &[]);
        return error_response(&flags, &e);
    }

    // Convert and validate the body against the schema.
    let mut parsed = match codec::json_to_tree(schema, scope, &json, false) {
        Ok(t) => t,
        Err(e) => {
            ctx.log.log_write(req.method, e.http_status(), &req.remote_user, &req.remote_addr, path, &[]);
            return error_response(&flags, &e);
        }
    };

    if flags.restconf
        && matches!(req.method, Method::Put | Method::Patch)
        && restconf_key_update(ctx, resolved.schema, &full_path, &parsed)
    {
        let e = RestError::not_supported();
        ctx.log.log_write(req.method, 405, &req.remote_user, &req.remote_addr, path, &[]);
        return error_response(&flags, &e);
    }

    // PUT replace semantics: blank out every writable leaf the body omits.
    if flags.put_replace && req.method == Method::Put && !schema.is_leaf(resource_sid) {
        let resource_name = schema.name(resource_sid).to_string();
        if resource_sid == scope {
            codec::add_missing_empty(schema, resource_sid, &mut parsed);
        } else if let Some(node) = parsed.child_mut(&resource_name) {
            codec::add_missing_empty(schema, resource_sid, node);
        }
    }

    // Graft the parsed body into the absolute chain. The created instance
    // (for Location) is the first new node below the addressed resource.
    let new_instance = if pop == 0 {
        parsed.children().first().map(|n| n.name().to_string())
    } else {
        parsed
            .child(schema.name(resolved.schema))
            .and_then(|n| n.children().first())
            .map(|n| n.name().to_string())
    };
    let graft_depth = qdepth - pop;
    let children = parsed.take_children();
    match chain.at_depth_mut(graft_depth) {
        Some(node) => {
            node.children_mut().clear();
            *node.children_mut() = children;
        }
        None => {
            return error_response(&flags, &RestError::internal("graft point missing"));
        }
    }

    // RESTCONF POST asserts creation with a compare-and-swap.
    let mut location = None;
    let result = if flags.restconf && req.method == Method::Post {
        let r = ctx.store.cas_tree(&chain, 0);
        if r.is_ok() {
            if let Some(instance) = &new_instance {
                location = Some(format!(
                    "https://{}:{}{}{}/{}",
                    req.server_name, req.server_port, req.doc_root, path, instance
                ));
            }
        }
        r
    } else {
        ctx.store.set_tree(&chain)
    };

    match result {
        Ok(changes) => {
            let status = if flags.restconf && req.method == Method::Post { 201 } else { 204 };
            ctx.log.log_write(req.method, status, &req.remote_user, &req.remote_addr, path, &changes);
            let mut resp = Response::new(status, &flags, String::new());
            resp.location = location;
            resp
        }
        Err(StoreError::Busy) => {
            let e = RestError::data_exists();
            ctx.log.log_write(req.method, 409, &req.remote_user, &req.remote_addr, path, &[]);
            error_response(&flags, &e)
        }
    }
}

/// Blank every writable leaf below `node`; hidden subtrees are skipped
/// silently, unwritable leaves fail unless the config-only filter skips
/// them first.
fn blank_leaves(
    schema: &SchemaInstance,
    sid: SchemaId,
    node: &mut Node,
    config_only: bool,
) -> Result<(), RestError> {
    if schema.is_hidden(sid) {
        return Ok(());
    }
    if node.is_leaf() {
        if config_only && !schema.is_config(sid) {
            return Ok(());
        }
        if !schema.is_writable(sid) {
            return Err(RestError::access_denied());
        }
        node.set_value("");
        return Ok(());
    }
    for child in node.children_mut() {
        if let Some(child_sid) = schema.child(sid, child.name()) {
            blank_leaves(schema, child_sid, child, config_only)?;
        }
    }
    Ok(())
}

/// DELETE: query the subtree and write every leaf back blanked.
fn rest_api_delete(ctx: &RestContext, req: &Request) -> Response {
    let schema = &*ctx.schema;
    let flags = req.flags.clone();
    let path = &req.path;
    // Outside namespace mode only config nodes are deleted.
    let config_only = !flags.namespace;

    let resolved = match query::path_to_tree(schema, path) {
        Ok(r) => r,
        Err(e) => {
            ctx.log.log_delete(e.http_status(), &req.remote_user, &req.remote_addr, path, &[]);
            return error_response(&flags, &e);
        }
    };
    let target = resolved.schema;

    // DELETE on an RPC invokes it with empty input (legacy, non-RESTCONF).
    if let Some(rpc) = schema.rpc_schema(target) {
        if flags.restconf {
            return error_response(&flags, &RestError::not_supported());
        }
        return rpc_invoke(ctx, req, &resolved, rpc, None);
    }

    // Hidden nodes silently succeed.
    if schema.is_hidden(target) {
        return Response::new(204, &flags, String::new());
    }
    if schema.is_leaf(target) && !schema.is_writable(target) {
        let e = RestError::access_denied();
        ctx.log.log_delete(403, &req.remote_user, &req.remote_addr, path, &[]);
        return error_response(&flags, &e);
    }

    let mut tree_query = resolved.query;
    let qdepth = tree_query.max_height();
    if schema.has_children(target) {
        let tip = tree_query.chain_tip_mut();
        if tip.name() != "*" {
            tip.append(Node::new("*"));
        }
    }

    let Some(mut tree) = ctx.store.query(&tree_query) else {
        let e = RestError::not_found();
        ctx.log.log_delete(404, &req.remote_user, &req.remote_addr, path, &[]);
        return error_response(&flags, &e);
    };

    let rnode = match tree.at_depth_mut(qdepth) {
        Some(node) => node,
        None => {
            let e = RestError::not_found();
            ctx.log.log_delete(404, &req.remote_user, &req.remote_addr, path, &[]);
            return error_response(&flags, &e);
        }
    };
    if let Err(e) = blank_leaves(schema, target, rnode, config_only) {
        ctx.log.log_delete(e.http_status(), &req.remote_user, &req.remote_addr, path, &[]);
        return error_response(&flags, &e);
    }

    match ctx.store.set_tree(&tree) {
        Ok(changes) => {
            ctx.log.log_delete(204, &req.remote_user, &req.remote_addr, path, &changes);
            Response::new(204, &flags, String::new())
        }
        Err(_) => {
            let e = RestError::invalid();
            ctx.log.log_delete(400, &req.remote_user, &req.remote_addr, path, &[]);
            error_response(&flags, &e)
        }
    }
}

/// OPTIONS: advertise the methods the schema allows at a path.
fn rest_api_options(ctx: &RestContext, req: &Request) -> Response {
    let schema = &*ctx.schema;
    // Key/value notation flattens to plain path segments for the lookup.
    let path = req.path.replace('=', "/");
    let Ok(sid) = schema.lookup(&path) else {
        return error_response(&req.flags, &RestError::not_found());
    };

    let mut methods: Vec<&str> = Vec::new();
    if schema.is_readable(sid) {
        methods.extend(["GET", "HEAD", "OPTIONS"]);
    }
    if schema.is_writable(sid) {
        methods.extend(["POST", "PUT", "PATCH", "DELETE"]);
    }

    let mut resp = Response::new(200, &req.flags, String::new());
    resp.content_type = "text/html";
    resp.allow = Some(methods.join(","));
    resp.accept_patch = Some(if req.flags.restconf {
        "application/yang-data+json"
    } else {
        "application/json"
    });
    resp
}

/// Wrap a scalar as the RPC's single unnamed input parameter (supported
/// outside RESTCONF for RPCs whose input has exactly one field).
fn rpc_single_input(ctx: &RestContext, rpc: SchemaId, value: Value) -> Result<Value, RestError> {
    let schema = &*ctx.schema;
    let input = schema.named_child(rpc, "input").ok_or_else(RestError::malformed)?;
    let mut children = schema.children(input);
    let (first, second) = (children.next(), children.next());
    let (Some(only), None) = (first, second) else {
        return Err(RestError::malformed());
    };
    let mut map = Map::new();
    map.insert(schema.name(only).to_string(), value);
    Ok(Value::Object(map))
}

/// Parse the body of an RPC request. A scalar or malformed body on a
/// single-input RPC falls back to a bare-value interpretation outside
/// RESTCONF.
fn rpc_body_json(ctx: &RestContext, req: &Request, rpc: SchemaId) -> Result<Option<Value>, RestError> {
    let body = req.body.as_str();
    if body.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<Value>(body) {
        Ok(v @ Value::Object(_)) => Ok(Some(v)),
        Ok(scalar) if !req.flags.restconf && !scalar.is_array() => {
            Ok(Some(rpc_single_input(ctx, rpc, scalar)?))
        }
        Err(_) if !req.flags.restconf && !body.starts_with('{') && !body.starts_with('[') => {
            let value = Value::String(body.trim_matches('"').to_string());
            Ok(Some(rpc_single_input(ctx, rpc, value)?))
        }
        Ok(_) | Err(_) => {
            error!(target: "rest", "malformed rpc body");
            Err(RestError::malformed())
        }
    }
}

/// Invoke a scripted RPC handler and format its result.
fn rpc_invoke(
    ctx: &RestContext,
    req: &Request,
    resolved: &ResolvedPath,
    rpc: SchemaId,
    json: Option<Value>,
) -> Response {
    let schema = &*ctx.schema;
    let mut flags = req.flags.clone();
    flags.ns_prefix = flags.namespace;
    let flags = &flags;

    // Dispatch path: under the /operations root, non-native models keep a
    // prefix so several models can expose RPCs at the same logical root.
    let mut rpc_path = chain_path(&resolved.query);
    if resolved.operations {
        let holder = if schema.name(rpc) == "_" { schema.parent(rpc).unwrap_or(rpc) } else { rpc };
        if let Some(model) = schema.model(holder) {
            if model.namespace.is_some() {
                let prefix = model.prefix.as_deref().unwrap_or(&model.name);
                let name = resolved
                    .query
                    .chain_tip()
                    .name()
                    .to_string();
                rpc_path = format!("/operations/{}:{}", prefix, name);
            }
        }
    }

    // RESTCONF mandates "input" as the primary object; plain mode wraps the
    // body when it is not already wrapped.
    let json = json.map(|j| {
        let wrapped = match &j {
            Value::Object(map) if map.len() == 1 => map
                .keys()
                .next()
                .map(|k| k.rsplit(':').next().unwrap_or(k) == "input")
                .unwrap_or(false),
            Value::Object(map) if map.is_empty() => true,
            _ => false,
        };
        if !flags.restconf && !wrapped {
            json!({ "input": j })
        } else {
            j
        }
    });

    let input_tree = match json {
        Some(j) => match codec::json_to_tree(schema, rpc, &j, true) {
            Ok(t) => Some(t),
            Err(e) => return error_response(flags, &e),
        },
        None => None,
    };
    let input = input_tree.as_ref().and_then(|t| t.child("input"));

    let outcome = ctx.rpcs.execute(req.method, &rpc_path, input);
    match outcome {
        RpcOutcome::Success(None) => Response::new(204, flags, String::new()),
        RpcOutcome::Success(Some(output)) => rpc_output_response(ctx, flags, rpc, &output, 200),
        RpcOutcome::Failure { message, output } => {
            if let Some(output) = output {
                return rpc_output_response(ctx, flags, rpc, &output, 400);
            }
            let err = RestError { kind: ErrorKind::OperationFailed, message };
            if flags.restconf {
                error_response(flags, &err)
            } else {
                let body = match &err.message {
                    Some(m) => json!({ "message": m }).to_string(),
                    None => String::new(),
                };
                Response::new(400, flags, body)
            }
        }
        RpcOutcome::NotFound { message } => {
            let err = RestError::with_message(ErrorKind::NotSupported, message);
            error_response(flags, &err)
        }
        RpcOutcome::Internal => {
            error_response(flags, &RestError::internal("rpc execution failed"))
        }
    }
}

/// Convert an RPC output tree to the response body.
fn rpc_output_response(
    ctx: &RestContext,
    flags: &FormatFlags,
    rpc: SchemaId,
    output: &Node,
    status: u16,
) -> Response {
    let schema = &*ctx.schema;
    let Some(output_sid) = schema.named_child(rpc, "output") else {
        error!(target: "rest", "no output node in schema");
        return error_response(flags, &RestError::internal("no output node in schema"));
    };
    let Some(mut json) = codec::tree_to_json(schema, output_sid, output, flags) else {
        error!(target: "rest", "failed to convert rpc output to json");
        return error_response(flags, &RestError::internal("rpc output conversion failed"));
    };
    if !flags.restconf {
        // Chop off the output wrapper, then optionally the single root key.
        if let Value::Object(map) = &json {
            if let Some((_, inner)) = map.iter().next() {
                json = inner.clone();
            }
        }
        if !flags.root {
            if let Value::Object(map) = &json {
                if map.len() == 1 {
                    if let Some((_, inner)) = map.iter().next() {
                        json = inner.clone();
                    }
                }
            }
        }
    }
    Response::new(status, flags, json.to_string())
}
