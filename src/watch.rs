//!
//! Subscription engine
//! -------------------
//! Streaming GETs register a watch on the store and stream formatted
//! change events to the open response until the client disconnects.
//! Registrations live in a process-wide list; each subscription owns its
//! event channel and response writer, and tears both down on drop.

use crate::error::RestError;
use crate::query;
use crate::request::{Accept, FormatFlags, Request};
use crate::rest::RestContext;
use crate::schema::SchemaId;
use crate::tree::Node;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

#[derive(Debug)]
pub struct WatchEntry {
    pub id: u64,
    pub path: String,
    pub wpath: String,
}

/// Process-wide list of live subscriptions.
#[derive(Clone, Default)]
pub struct WatchRegistry {
    entries: Arc<Mutex<Vec<WatchEntry>>>,
    next_id: Arc<Mutex<u64>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, path: String, wpath: String) -> u64 {
        let mut next = self.next_id.lock();
        *next += 1;
        let id = *next;
        self.entries.lock().push(WatchEntry { id, path, wpath });
        id
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|e| e.id != id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// One live streaming subscription. Dropping it removes the store callback
/// and the registry entry.
pub struct Subscription {
    ctx: RestContext,
    registry: WatchRegistry,
    entry_id: u64,
    store_watch: u64,
    rx: UnboundedReceiver<Node>,
    sid: SchemaId,
    path: String,
    flags: FormatFlags,
    filter: Option<String>,
    sse: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("entry_id", &self.entry_id)
            .field("store_watch", &self.store_watch)
            .field("path", &self.path)
            .finish()
    }
}

/// Register a watch for a streaming GET. The watch path is the request
/// path itself for a leaf, `<path>/*` otherwise.
pub fn subscribe(
    ctx: &RestContext,
    registry: &WatchRegistry,
    req: &Request,
    filter: Option<String>,
) -> Result<Subscription, RestError> {
    let resolved = query::path_to_tree(&ctx.schema, &req.path)?;
    let sid = resolved.schema;
    let path = {
        // Canonical chain path so events line up with store paths.
        let mut p = String::new();
        let mut node = &resolved.query;
        while let Some(child) = node.children().first() {
            p.push('/');
            p.push_str(child.name());
            node = child;
        }
        p
    };
    let wpath = if ctx.schema.is_leaf(sid) { path.clone() } else { format!("{}/*", path) };

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let store_watch = ctx.store.watch(&wpath, tx);
    let entry_id = registry.add(path.clone(), wpath.clone());
    debug!(target: "watch", "adding watch for \"{}\" ({})", path, wpath);

    Ok(Subscription {
        ctx: ctx.clone(),
        registry: registry.clone(),
        entry_id,
        store_watch,
        rx,
        sid,
        path,
        flags: req.flags.clone(),
        filter,
        sse: req.accept == Accept::EventStream,
    })
}

impl Subscription {
    /// Format one store callback tree as a wire frame, or `None` when the
    /// change is filtered out.
    pub fn format_event(&self, tree: &Node) -> Option<String> {
        let node = tree.find_path(&self.path)?;
        if let Some(filter) = &self.filter {
            node.find_path(filter)?;
        }
        let json = crate::codec::tree_to_json(&self.ctx.schema, self.sid, node, &self.flags)?;
        let payload = json.to_string();
        Some(if self.sse {
            format!("data: {}\r\n\r\n", payload)
        } else {
            format!("{}\r\n", payload)
        })
    }

    /// Await the next formatted event; `None` once the store side closes.
    pub async fn next_event(&mut self) -> Option<String> {
        while let Some(tree) = self.rx.recv().await {
            if let Some(frame) = self.format_event(&tree) {
                return Some(frame);
            }
        }
        None
    }

    pub fn content_type(&self) -> &'static str {
        if self.sse {
            "text/event-stream"
        } else {
            "application/stream+json"
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!(target: "watch", "removing watch for \"{}\"", self.path);
        self.ctx.store.unwatch(self.store_watch);
        self.registry.remove(self.entry_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogConfig;
    use crate::request::Method;
    use crate::rpc::RpcRegistry;
    use crate::schema::fixture::test_schema;
    use crate::store::Store;

    fn context() -> RestContext {
        RestContext::new(
            Arc::new(test_schema()),
            Store::new(),
            Arc::new(RpcRegistry::empty()),
            LogConfig::disabled(),
        )
    }

    fn stream_request(path: &str, accept: Accept) -> Request {
        Request {
            method: Method::Get,
            accept,
            flags: FormatFlags { root: true, ..FormatFlags::default() },
            path: path.to_string(),
            query: None,
            doc_root: "/api".to_string(),
            if_match: None,
            if_none_match: None,
            if_modified_since: None,
            if_unmodified_since: None,
            server_name: "localhost".to_string(),
            server_port: "443".to_string(),
            remote_addr: "127.0.0.1".to_string(),
            remote_user: "test".to_string(),
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn event_stream_framing() {
        let ctx = context();
        let registry = WatchRegistry::new();
        let mut sub =
            subscribe(&ctx, &registry, &stream_request("/test/list", Accept::EventStream), None)
                .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(sub.content_type(), "text/event-stream");

        ctx.store.set("/test/list/fred/name", Some("fred"));
        let frame = sub.next_event().await.unwrap();
        assert_eq!(frame, "data: {\"list\":{\"fred\":{\"name\":\"fred\"}}}\r\n\r\n");

        drop(sub);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn ndjson_framing_on_leaf() {
        let ctx = context();
        let registry = WatchRegistry::new();
        let mut sub =
            subscribe(&ctx, &registry, &stream_request("/test/debug", Accept::StreamJson), None)
                .unwrap();
        ctx.store.set("/test/debug", Some("1"));
        let frame = sub.next_event().await.unwrap();
        assert_eq!(frame, "{\"debug\":\"1\"}\r\n");
    }

    #[test]
    fn unknown_path_is_rejected() {
        let ctx = context();
        let registry = WatchRegistry::new();
        let err = subscribe(&ctx, &registry, &stream_request("/nope", Accept::EventStream), None)
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn filter_suppresses_unrelated_events() {
        let ctx = context();
        let registry = WatchRegistry::new();
        let mut sub = subscribe(
            &ctx,
            &registry,
            &stream_request("/test/list", Accept::StreamJson),
            Some("fred".to_string()),
        )
        .unwrap();
        ctx.store.set("/test/list/tom/name", Some("tom"));
        ctx.store.set("/test/list/fred/name", Some("fred"));
        let frame = sub.next_event().await.unwrap();
        assert!(frame.contains("fred"));
    }
}
