//!
//! grove store client
//! ------------------
//! The hierarchical datastore the gateway translates requests onto. The
//! handle is cheap to clone and internally synchronised (`Arc` + parking_lot
//! mutex); all operations are tree-shaped: read a subtree by query skeleton,
//! write a tree of leaves, compare-and-set, search immediate children, read
//! a path's modification timestamp, and register watch callbacks delivered
//! as changed-subtree trees over per-watcher channels.
//!
//! Values are strings keyed by slash-delimited absolute paths. Writing an
//! empty value deletes the leaf. Timestamps are microseconds since store
//! start, strictly monotonic, and propagate to every ancestor of a changed
//! path; a path with no remaining data reports timestamp 0.

use crate::tree::Node;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Store operation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Compare-and-set lost the race (or the data already exists).
    #[error("resource busy")]
    Busy,
}

struct Watcher {
    id: u64,
    pattern: String,
    tx: UnboundedSender<Node>,
}

struct State {
    values: BTreeMap<String, String>,
    timestamps: HashMap<String, u64>,
    clock: u64,
    watchers: Vec<Watcher>,
    next_watch_id: u64,
}

struct Inner {
    state: Mutex<State>,
    started: Instant,
}

/// Clone-able handle to the store.
#[derive(Clone)]
pub struct Store(Arc<Inner>);

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// True when `path` falls under a watch pattern. A pattern ending in `/*`
/// matches every path strictly below its prefix at any depth; any other
/// pattern matches exactly.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(prefix) => path.len() > prefix.len() + 1 && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/',
        None => pattern == path,
    }
}

/// Match a stored path's segments against the children of a query node.
/// A terminal `*` consumes the remainder of the path; an interior `*`
/// consumes exactly one segment (a list instance identifier).
fn query_matches(children: &[Node], segs: &[&str]) -> bool {
    let Some((head, rest)) = segs.split_first() else {
        return false;
    };
    for child in children {
        let name_ok = child.name() == "*" || child.name() == *head;
        if !name_ok {
            continue;
        }
        if child.is_leaf() {
            if child.name() == "*" || rest.is_empty() {
                return true;
            }
        } else if query_matches(child.children(), rest) {
            return true;
        }
    }
    false
}

impl Store {
    pub fn new() -> Self {
        Store(Arc::new(Inner {
            state: Mutex::new(State {
                values: BTreeMap::new(),
                timestamps: HashMap::new(),
                clock: 0,
                watchers: Vec::new(),
                next_watch_id: 1,
            }),
            started: Instant::now(),
        }))
    }

    /// Read a single leaf value.
    pub fn get(&self, path: &str) -> Option<String> {
        self.0.state.lock().values.get(path).cloned()
    }

    /// Convenience single-leaf write; `None` or an empty value deletes.
    pub fn set(&self, path: &str, value: Option<&str>) {
        let mut root = Node::root();
        root.insert_path(path, Some(value.unwrap_or("")));
        let _ = self.set_tree(&root);
    }

    /// Write every valued leaf of `root` into the store. Empty values delete.
    /// Returns the applied `(path, value)` changes.
    pub fn set_tree(&self, root: &Node) -> Result<Vec<(String, String)>, StoreError> {
        self.apply(root, None)
    }

    /// Compare-and-set: every valued leaf in `root` must currently carry the
    /// given timestamp (0 asserts absence) or the whole write is refused.
    pub fn cas_tree(&self, root: &Node, required_ts: u64) -> Result<Vec<(String, String)>, StoreError> {
        self.apply(root, Some(required_ts))
    }

    fn apply(&self, root: &Node, required_ts: Option<u64>) -> Result<Vec<(String, String)>, StoreError> {
        let changes: Vec<(String, String)> = root.leaf_paths();
        if changes.is_empty() {
            return Ok(changes);
        }
        let notify: Vec<(Node, UnboundedSender<Node>)>;
        {
            let mut state = self.0.state.lock();
            if let Some(required) = required_ts {
                for (path, _) in &changes {
                    let current = state.timestamps.get(path).copied().unwrap_or(0);
                    if current != required {
                        debug!(target: "store", "cas failed for \"{}\" ({} != {})", path, current, required);
                        return Err(StoreError::Busy);
                    }
                }
            }
            let elapsed = self.0.started.elapsed().as_micros() as u64;
            state.clock = state.clock.max(elapsed).wrapping_add(1);
            let now = state.clock;
            for (path, value) in &changes {
                if value.is_empty() {
                    state.values.remove(path);
                } else {
                    state.values.insert(path.clone(), value.clone());
                }
            }
            // Timestamp every changed path and its ancestors; paths left with
            // no data report 0 again.
            for (path, _) in &changes {
                let mut p = path.as_str();
                loop {
                    if has_data_under(&state.values, p) {
                        state.timestamps.insert(p.to_string(), now);
                    } else {
                        state.timestamps.remove(p);
                    }
                    match p.rfind('/') {
                        Some(0) | None => break,
                        Some(idx) => p = &p[..idx],
                    }
                }
            }
            notify = state
                .watchers
                .iter()
                .filter_map(|w| {
                    let mut tree = Node::root();
                    let mut any = false;
                    for (path, value) in &changes {
                        if pattern_matches(&w.pattern, path) {
                            tree.insert_path(path, Some(value));
                            any = true;
                        }
                    }
                    any.then(|| (tree, w.tx.clone()))
                })
                .collect();
        }
        // Callbacks are delivered outside the store lock; each watcher owns
        // the tree it receives.
        for (tree, tx) in notify {
            let _ = tx.send(tree);
        }
        Ok(changes)
    }

    /// Read the subtree selected by a query skeleton. Returns `None` when
    /// nothing matches.
    pub fn query(&self, query: &Node) -> Option<Node> {
        let state = self.0.state.lock();
        let mut result = Node::root();
        let mut any = false;
        for (path, value) in state.values.iter() {
            let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
            if query_matches(query.children(), &segs) {
                result.insert_path(path, Some(value));
                any = true;
            }
        }
        any.then_some(result)
    }

    /// List the immediate children of `path` as full paths, sorted.
    pub fn search(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let prefix = if prefix.starts_with('/') { prefix } else { format!("/{}", prefix) };
        let state = self.0.state.lock();
        let mut out: Vec<String> = Vec::new();
        for key in state.values.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let seg = rest.split('/').next().unwrap_or("");
                if seg.is_empty() {
                    continue;
                }
                let full = format!("{}{}", prefix, seg);
                if out.last().map(|l| l != &full).unwrap_or(true) && !out.contains(&full) {
                    out.push(full);
                }
            }
        }
        out
    }

    /// Modification timestamp of a path (microseconds since store start),
    /// or 0 when no data exists at or below the path.
    pub fn timestamp(&self, path: &str) -> u64 {
        let path = if path.is_empty() { "/" } else { path };
        let state = self.0.state.lock();
        if path == "/" {
            return state.timestamps.values().copied().max().unwrap_or(0);
        }
        state.timestamps.get(path).copied().unwrap_or(0)
    }

    /// Register a watch; changed-subtree trees are delivered on `tx` for
    /// every store write touching a path under `pattern`.
    pub fn watch(&self, pattern: &str, tx: UnboundedSender<Node>) -> u64 {
        let mut state = self.0.state.lock();
        let id = state.next_watch_id;
        state.next_watch_id += 1;
        debug!(target: "store", "adding watch {} for \"{}\"", id, pattern);
        state.watchers.push(Watcher { id, pattern: pattern.to_string(), tx });
        id
    }

    pub fn unwatch(&self, id: u64) {
        let mut state = self.0.state.lock();
        state.watchers.retain(|w| w.id != id);
    }

    /// All stored leaf paths under a prefix; used by startup publishing and
    /// by tests.
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        let state = self.0.state.lock();
        state
            .values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

fn has_data_under(values: &BTreeMap<String, String>, path: &str) -> bool {
    if values.contains_key(path) {
        return true;
    }
    let prefix = format!("{}/", path);
    values
        .range(prefix.clone()..)
        .next()
        .map(|(k, _)| k.starts_with(&prefix))
        .unwrap_or(false)
}
