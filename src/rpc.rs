//!
//! Scripted RPC dispatcher
//! -----------------------
//! At startup a configured directory is scanned for Lua scripts; each chunk
//! returns a list of `{path, methods = {...}, handler}` records. Handlers
//! are registered in order and dispatched by glob path plus method mask
//! (first match wins). The single interpreter lives behind a mutex; an
//! invocation holds it for the whole push-call-pop sequence.
//!
//! Handlers are called as `handler(input, path, method)` where `input` is
//! the request tree as a nested table. Accepted return shapes:
//! `true` / `table` / `(true, table)` success, `false` /
//! `(false, message)` / `(false, table)` failure.

use crate::request::{Method, MethodSet};
use crate::tree::Node;
use glob::Pattern;
use mlua::{Lua, MultiValue, RegistryKey, Table, Value as LuaValue};
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use tracing::{debug, error};

struct Handler {
    pattern: Pattern,
    raw_path: String,
    methods: MethodSet,
    key: RegistryKey,
}

/// Result of invoking a scripted handler.
#[derive(Debug)]
pub enum RpcOutcome {
    /// Success; the optional tree is rooted at "output".
    Success(Option<Node>),
    /// Handler reported failure, optionally with a message or detail tree.
    Failure { message: Option<String>, output: Option<Node> },
    /// No registered handler matches the path and method.
    NotFound { message: String },
    /// The handler misbehaved (raised, returned garbage).
    Internal,
}

pub struct RpcRegistry {
    lua: Mutex<Lua>,
    handlers: Vec<Handler>,
}

impl RpcRegistry {
    /// Empty registry (no script directory configured).
    pub fn empty() -> Self {
        RpcRegistry { lua: Mutex::new(Lua::new()), handlers: Vec::new() }
    }

    /// Scan `dir` for `*.lua` files and register the handler records each
    /// returns. A missing directory yields an empty registry; a broken
    /// script is logged and skipped.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let lua = Lua::new();
        let mut handlers = Vec::new();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => {
                debug!(target: "rpc", "no script files in \"{}\"", dir.display());
                return Ok(RpcRegistry { lua: Mutex::new(lua), handlers });
            }
        };
        let mut files: Vec<_> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("lua"))
            .collect();
        files.sort();

        for file in files {
            debug!(target: "rpc", "loading Lua file \"{}\"", file.display());
            let code = fs::read_to_string(&file)?;
            let table: Table = match lua.load(&code).set_name(file.display().to_string()).eval() {
                Ok(LuaValue::Table(t)) => t,
                Ok(_) => {
                    error!(target: "rpc", "\"{}\" did not return a table", file.display());
                    continue;
                }
                Err(e) => {
                    error!(target: "rpc", "lua: {}", e);
                    continue;
                }
            };
            for record in table.sequence_values::<Table>() {
                let Ok(record) = record else { continue };
                let path: Option<String> = record.get("path").ok();
                let methods = record
                    .get::<_, Table>("methods")
                    .map(|t| {
                        t.sequence_values::<String>()
                            .flatten()
                            .filter_map(|m| Method::parse(&m))
                            .collect::<MethodSet>()
                    })
                    .unwrap_or_default();
                let handler: Option<mlua::Function> = record.get("handler").ok();
                match (path, handler) {
                    (Some(path), Some(func)) if !methods.is_empty() => {
                        let pattern = match Pattern::new(&path) {
                            Ok(p) => p,
                            Err(e) => {
                                error!(target: "rpc", "bad rpc path \"{}\": {}", path, e);
                                continue;
                            }
                        };
                        let key = lua.create_registry_value(func)?;
                        debug!(target: "rpc", "registered rpc for \"{}\"", path);
                        handlers.push(Handler { pattern, raw_path: path, methods, key });
                    }
                    _ => {
                        error!(
                            target: "rpc",
                            "failed to parse an rpc handler from \"{}\"", file.display()
                        );
                    }
                }
            }
        }

        // Publish the registration table into the interpreter so scripts can
        // introspect what is loaded.
        let rpcs = lua.create_table()?;
        for (idx, handler) in handlers.iter().enumerate() {
            let entry = lua.create_table()?;
            entry.set("path", handler.raw_path.as_str())?;
            let methods = lua.create_table()?;
            let mut n = 1;
            for method in [
                Method::Get,
                Method::Post,
                Method::Put,
                Method::Patch,
                Method::Delete,
                Method::Head,
                Method::Options,
            ] {
                if handler.methods.contains(method) {
                    methods.set(n, method.as_str())?;
                    n += 1;
                }
            }
            entry.set("methods", methods)?;
            rpcs.set(idx + 1, entry)?;
        }
        lua.globals().set("_RPCS", rpcs)?;

        Ok(RpcRegistry { lua: Mutex::new(lua), handlers })
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch `method` on `path`: linear scan, first glob match whose
    /// method mask contains the method wins.
    pub fn execute(&self, method: Method, path: &str, input: Option<&Node>) -> RpcOutcome {
        let lua = self.lua.lock();

        let Some(handler) = self.handlers.iter().find(|h| h.pattern.matches(path)) else {
            error!(target: "rpc", "rpc for path \"{}\" not found", path);
            return RpcOutcome::NotFound { message: format!("rpc {} not found", path) };
        };
        if !handler.methods.contains(method) {
            error!(target: "rpc", "rpc[{}] does not support {}", handler.raw_path, method.as_str());
            return RpcOutcome::NotFound { message: format!("rpc {} not found", path) };
        }

        let func: mlua::Function = match lua.registry_value(&handler.key) {
            Ok(f) => f,
            Err(e) => {
                error!(target: "rpc", "rpc[{}] handler missing: {}", handler.raw_path, e);
                return RpcOutcome::Internal;
            }
        };
        let table = match tree_to_table(&lua, input) {
            Ok(t) => t,
            Err(e) => {
                error!(target: "rpc", "rpc[{}] input marshalling: {}", handler.raw_path, e);
                return RpcOutcome::Internal;
            }
        };

        let returns: MultiValue = match func.call((table, path, method.as_str())) {
            Ok(rets) => rets,
            Err(e) => {
                error!(target: "rpc", "lua: {}", e);
                return RpcOutcome::Internal;
            }
        };

        let rets: Vec<LuaValue> = returns.into_iter().collect();
        match rets.as_slice() {
            [LuaValue::Boolean(true)] => RpcOutcome::Success(None),
            [LuaValue::Table(t)] => RpcOutcome::Success(table_to_tree(t, "output")),
            [LuaValue::Boolean(true), LuaValue::Table(t)] => {
                RpcOutcome::Success(table_to_tree(t, "output"))
            }
            [LuaValue::Boolean(false)] => RpcOutcome::Failure { message: None, output: None },
            [LuaValue::Boolean(false), LuaValue::String(s)] => RpcOutcome::Failure {
                message: s.to_str().ok().map(str::to_string),
                output: None,
            },
            [LuaValue::Boolean(false), LuaValue::Table(t)] => {
                RpcOutcome::Failure { message: None, output: table_to_tree(t, "output") }
            }
            other => {
                error!(
                    target: "rpc",
                    "rpc[{}] did not return a valid response ({} values)",
                    handler.raw_path,
                    other.len()
                );
                RpcOutcome::Internal
            }
        }
    }
}

/// Marshal a tree node's children into a nested Lua table. Leaves become
/// string values, interior nodes become tables.
fn tree_to_table<'lua>(lua: &'lua Lua, node: Option<&Node>) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table()?;
    if let Some(node) = node {
        for child in node.children() {
            set_tree_entry(lua, &table, child)?;
        }
    }
    Ok(table)
}

fn set_tree_entry<'lua>(lua: &'lua Lua, table: &Table<'lua>, node: &Node) -> mlua::Result<()> {
    if node.is_leaf() {
        table.set(node.name(), node.value().unwrap_or(""))?;
    } else {
        let sub = lua.create_table()?;
        for child in node.children() {
            set_tree_entry(lua, &sub, child)?;
        }
        table.set(node.name(), sub)?;
    }
    Ok(())
}

/// Render a Lua scalar the way the store expects: booleans become "1"/"0",
/// numbers their decimal text.
fn lua_scalar_to_string(value: &LuaValue) -> Option<String> {
    match value {
        LuaValue::Boolean(b) => Some(if *b { "1" } else { "0" }.to_string()),
        LuaValue::Integer(i) => Some(i.to_string()),
        LuaValue::Number(n) => Some(n.to_string()),
        LuaValue::String(s) => s.to_str().ok().map(str::to_string),
        _ => None,
    }
}

fn lua_key_to_string(value: &LuaValue) -> Option<String> {
    match value {
        LuaValue::String(s) => s.to_str().ok().map(str::to_string),
        LuaValue::Integer(i) => Some(i.to_string()),
        LuaValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Convert a Lua table into a tree rooted at `root_name`. Returns `None`
/// for an empty table.
fn table_to_tree(table: &Table, root_name: &str) -> Option<Node> {
    let mut root = Node::new(root_name);
    if !fill_tree(table, &mut root) {
        return None;
    }
    Some(root)
}

fn fill_tree(table: &Table, node: &mut Node) -> bool {
    let mut any = false;
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        let Ok((key, value)) = pair else { continue };
        let Some(name) = lua_key_to_string(&key) else { continue };
        match value {
            LuaValue::Table(sub) => {
                let child = node.append(Node::new(name));
                if fill_tree(&sub, child) {
                    any = true;
                } else {
                    let name = child.name().to_string();
                    node.unlink(&name);
                }
            }
            other => {
                if let Some(rendered) = lua_scalar_to_string(&other) {
                    node.append(Node::leaf(name, rendered));
                    any = true;
                }
            }
        }
    }
    any
}
