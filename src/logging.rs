//!
//! Method logging configuration
//! ----------------------------
//! A single-line flag file enables per-method access logging: space
//! separated tokens from {post put patch delete get head}. The file is
//! reloaded whenever it changes on disk. Access log lines go to the
//! `access` tracing target in the original one-line format:
//! `METHOD [rc] user@addr path` plus one line per changed leaf for
//! mutating methods.

use crate::request::{Method, MethodSet};
use notify::{RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

struct Inner {
    flags: RwLock<MethodSet>,
    path: Option<PathBuf>,
}

/// Shared handle to the logging configuration.
#[derive(Clone)]
pub struct LogConfig {
    inner: Arc<Inner>,
    // Held for its side effect: reload on file change.
    _watcher: Option<Arc<Mutex<notify::RecommendedWatcher>>>,
}

/// Parse the single-line flag file format.
pub fn parse_flags(text: &str) -> MethodSet {
    let mut flags = MethodSet::empty();
    let line = text.lines().next().unwrap_or("");
    for token in line.split(' ') {
        match token {
            "post" => flags.insert(Method::Post),
            "put" => flags.insert(Method::Put),
            "patch" => flags.insert(Method::Patch),
            "delete" => flags.insert(Method::Delete),
            "get" => flags.insert(Method::Get),
            "head" => flags.insert(Method::Head),
            _ => {}
        }
    }
    flags
}

fn load_file(path: &Path) -> MethodSet {
    match fs::read_to_string(path) {
        Ok(text) => parse_flags(&text),
        Err(_) => MethodSet::empty(),
    }
}

impl LogConfig {
    /// Logging disabled entirely (no flag file configured).
    pub fn disabled() -> Self {
        LogConfig {
            inner: Arc::new(Inner { flags: RwLock::new(MethodSet::empty()), path: None }),
            _watcher: None,
        }
    }

    /// Load the flag file and watch it for changes.
    pub fn init(path: &Path) -> Self {
        let inner = Arc::new(Inner {
            flags: RwLock::new(load_file(path)),
            path: Some(path.to_path_buf()),
        });
        // Watch the parent directory so delete/recreate of the file is seen.
        let watch_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let reload_inner = Arc::clone(&inner);
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                if let Some(p) = &reload_inner.path {
                    *reload_inner.flags.write() = load_file(p);
                }
            }
        })
        .and_then(|mut w| {
            w.watch(&watch_dir, RecursiveMode::NonRecursive)?;
            Ok(w)
        });
        let watcher = match watcher {
            Ok(w) => Some(Arc::new(Mutex::new(w))),
            Err(e) => {
                warn!(target: "logging", "failed to watch \"{}\": {}", path.display(), e);
                None
            }
        };
        LogConfig { inner, _watcher: watcher }
    }

    pub fn enabled(&self, method: Method) -> bool {
        self.inner.flags.read().contains(method)
    }

    /// One-line access log for GET/HEAD.
    pub fn log_read(&self, method: Method, rc: u16, user: &str, addr: &str, path: &str) {
        if self.enabled(method) {
            info!(target: "access", "{:<6}[{:3}] {}@{} {}", method.as_str(), rc, user, addr, path);
        }
    }

    /// Per-changed-leaf log lines for POST/PUT/PATCH, falling back to the
    /// request path when nothing was written.
    pub fn log_write(
        &self,
        method: Method,
        rc: u16,
        user: &str,
        addr: &str,
        path: &str,
        changes: &[(String, String)],
    ) {
        if !self.enabled(method) {
            return;
        }
        if changes.is_empty() {
            info!(target: "access", "{:<6}[{:3}] {}@{} {}", method.as_str(), rc, user, addr, path);
            return;
        }
        for (leaf, value) in changes {
            info!(
                target: "access",
                "{:<6}[{:3}] {}@{} {}={}",
                method.as_str(), rc, user, addr, leaf, value
            );
        }
    }

    /// Per-deleted-leaf log lines for DELETE.
    pub fn log_delete(
        &self,
        rc: u16,
        user: &str,
        addr: &str,
        path: &str,
        deleted: &[(String, String)],
    ) {
        if !self.enabled(Method::Delete) {
            return;
        }
        if deleted.is_empty() {
            info!(target: "access", "DELETE[{:3}] {}@{} {}", rc, user, addr, path);
            return;
        }
        for (leaf, _) in deleted {
            info!(target: "access", "DELETE[{:3}] {}@{} {}", rc, user, addr, leaf);
        }
    }
}
