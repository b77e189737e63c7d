//!
//! Schema facade
//! -------------
//! The merged data-model tree that every request is validated against.
//! Modules are JSON files describing named nodes with mode flags, value
//! patterns, defaults and enumerations; same-named nodes from different
//! modules merge into one tree (augmentation). The loaded instance is
//! immutable and shared read-only across all request tasks.
//!
//! Nodes live in an arena addressed by `SchemaId`; parent/child links are
//! indices so the cyclic list/key relationship needs no reference counting.

use crate::error::{ErrorKind, RestError};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub type SchemaId = usize;

/// Access mode flags parsed from a node's `mode` string (subset of "rwcxph").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mode {
    pub readable: bool,
    pub writable: bool,
    pub config: bool,
    pub executable: bool,
    pub proxy: bool,
    pub hidden: bool,
}

impl Mode {
    fn parse(mode: Option<&str>) -> Self {
        match mode {
            None => Mode { readable: true, ..Mode::default() },
            Some(m) => Mode {
                readable: m.contains('r') || m.is_empty(),
                writable: m.contains('w'),
                // Writable data is config data even without an explicit 'c'.
                config: m.contains('c') || m.contains('w'),
                executable: m.contains('x'),
                proxy: m.contains('p'),
                hidden: m.contains('h'),
            },
        }
    }

    fn render(&self) -> String {
        let mut s = String::new();
        if self.readable { s.push('r'); }
        if self.writable { s.push('w'); }
        if self.config && !self.writable { s.push('c'); }
        if self.executable { s.push('x'); }
        if self.proxy { s.push('p'); }
        if self.hidden { s.push('h'); }
        s
    }
}

/// Structural classification of a schema node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaKind {
    Container,
    Leaf,
    /// A list whose instances are bare scalars (wildcard child with no
    /// children of its own).
    LeafList,
    /// A keyed list; `key` names the distinguished key leaf of each
    /// instance.
    List { key: String },
    Rpc,
}

#[derive(Debug)]
pub struct SchemaNode {
    name: String,
    parent: Option<SchemaId>,
    children: Vec<SchemaId>,
    kind: SchemaKind,
    mode: Mode,
    pattern: Option<Regex>,
    default: Option<String>,
    /// Enumerated values as (name, value) pairs.
    values: Vec<(String, String)>,
    model: Option<usize>,
}

/// Identity of one loaded module.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub prefix: Option<String>,
    pub namespace: Option<String>,
    pub revision: Option<String>,
}

/// Schema lookup / validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("no schema node")]
    NoSchemaNode,
    #[error("not readable")]
    NotReadable,
    #[error("not writable")]
    NotWritable,
    #[error("invalid query")]
    InvalidQuery,
    #[error("pattern mismatch")]
    PatternMismatch,
}

impl From<SchemaError> for RestError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::NoSchemaNode => RestError::not_found(),
            SchemaError::NotReadable | SchemaError::NotWritable => RestError::access_denied(),
            SchemaError::InvalidQuery => RestError::new(ErrorKind::InvalidValue),
            SchemaError::PatternMismatch => RestError::new(ErrorKind::InvalidValue),
        }
    }
}

// --- Module file format -----------------------------------------------------

#[derive(Debug, Deserialize)]
struct ModuleFile {
    model: String,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    revision: Option<String>,
    #[serde(default)]
    nodes: Vec<NodeDef>,
}

#[derive(Debug, Deserialize)]
struct NodeDef {
    name: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default, rename = "default")]
    default_value: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    values: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    children: Vec<NodeDef>,
}

// ----------------------------------------------------------------------------

/// The merged, immutable schema tree plus the registry of loaded modules.
pub struct SchemaInstance {
    nodes: Vec<SchemaNode>,
    models: Vec<ModelInfo>,
}

/// Hyphen and underscore are interchangeable in segment matching.
fn names_match(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes().zip(b.bytes()).all(|(x, y)| {
            x == y || (x == b'-' && y == b'_') || (x == b'_' && y == b'-')
        })
}

impl SchemaInstance {
    pub const ROOT: SchemaId = 0;

    fn empty() -> Self {
        SchemaInstance {
            nodes: vec![SchemaNode {
                name: String::new(),
                parent: None,
                children: Vec::new(),
                kind: SchemaKind::Container,
                mode: Mode { readable: true, ..Mode::default() },
                pattern: None,
                default: None,
                values: Vec::new(),
                model: None,
            }],
            models: Vec::new(),
        }
    }

    /// Load and merge all `*.json` module files found in each directory of a
    /// colon-separated search path, plus any built-in modules. `supported`
    /// optionally restricts loading of file modules to the named models
    /// (one per line in the original file format).
    pub fn load(
        search_path: &str,
        supported: Option<&HashSet<String>>,
        builtins: &[&str],
    ) -> anyhow::Result<Self> {
        let mut instance = Self::empty();
        let mut files: Vec<std::path::PathBuf> = Vec::new();
        for dir in search_path.split(':').filter(|d| !d.is_empty()) {
            debug!(target: "schema", "looking for module files in \"{}\"", dir);
            for entry in WalkDir::new(dir).max_depth(1).into_iter().flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    files.push(path.to_path_buf());
                }
            }
        }
        files.sort();
        for file in files {
            let text = fs::read_to_string(&file)?;
            match serde_json::from_str::<ModuleFile>(&text) {
                Ok(module) => {
                    if let Some(names) = supported {
                        if !names.contains(&module.model) {
                            debug!(target: "schema", "skipping unsupported model \"{}\"", module.model);
                            continue;
                        }
                    }
                    debug!(target: "schema", "merging model \"{}\" from {}", module.model, file.display());
                    instance.merge_module(module)?;
                }
                Err(e) => warn!(target: "schema", "failed to parse \"{}\": {}", file.display(), e),
            }
        }
        if instance.nodes.len() == 1 {
            anyhow::bail!("no schema modules loaded from \"{}\"", search_path);
        }
        for text in builtins {
            let module: ModuleFile = serde_json::from_str(text)?;
            instance.merge_module(module)?;
        }
        instance.classify(Self::ROOT);
        Ok(instance)
    }

    /// Build an instance from in-memory module documents. Used by tests and
    /// by callers that assemble modules programmatically.
    pub fn from_modules(modules: &[&str]) -> anyhow::Result<Self> {
        let mut instance = Self::empty();
        for text in modules {
            let module: ModuleFile = serde_json::from_str(text)?;
            instance.merge_module(module)?;
        }
        instance.classify(Self::ROOT);
        Ok(instance)
    }

    fn merge_module(&mut self, module: ModuleFile) -> anyhow::Result<()> {
        let model_idx = self.models.len();
        self.models.push(ModelInfo {
            name: module.model,
            prefix: module.prefix,
            namespace: module.namespace,
            revision: module.revision,
        });
        for def in module.nodes {
            self.merge_node(Self::ROOT, def, model_idx);
        }
        Ok(())
    }

    fn merge_node(&mut self, parent: SchemaId, def: NodeDef, model: usize) {
        let existing = self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].name == def.name);
        let id = match existing {
            Some(id) => id,
            None => {
                let pattern = def.pattern.as_deref().and_then(|p| match Regex::new(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(target: "schema", "bad pattern \"{}\" on node \"{}\": {}", p, def.name, e);
                        None
                    }
                });
                let values = def
                    .values
                    .as_ref()
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                let id = self.nodes.len();
                self.nodes.push(SchemaNode {
                    name: def.name.clone(),
                    parent: Some(parent),
                    children: Vec::new(),
                    kind: SchemaKind::Container,
                    mode: Mode::parse(def.mode.as_deref()),
                    pattern,
                    default: def.default_value.clone(),
                    values,
                    model: Some(model),
                });
                self.nodes[parent].children.push(id);
                id
            }
        };
        for child in def.children {
            self.merge_node(id, child, model);
        }
    }

    /// Compute structural kinds bottom-up once the whole tree is merged.
    fn classify(&mut self, id: SchemaId) {
        let children = self.nodes[id].children.clone();
        for child in &children {
            self.classify(*child);
        }
        let kind = if self.nodes[id].mode.executable {
            SchemaKind::Rpc
        } else if children.is_empty() {
            if id == Self::ROOT { SchemaKind::Container } else { SchemaKind::Leaf }
        } else if let Some(&star) = children
            .iter()
            .find(|&&c| self.nodes[c].name == "*")
        {
            if self.nodes[star].children.is_empty() {
                SchemaKind::LeafList
            } else {
                let key = self.nodes[star]
                    .children
                    .first()
                    .map(|&c| self.nodes[c].name.clone())
                    .unwrap_or_default();
                SchemaKind::List { key }
            }
        } else {
            SchemaKind::Container
        };
        self.nodes[id].kind = kind;
    }

    // --- Facade operations --------------------------------------------------

    pub fn root(&self) -> SchemaId {
        Self::ROOT
    }

    pub fn name(&self, id: SchemaId) -> &str {
        &self.nodes[id].name
    }

    pub fn parent(&self, id: SchemaId) -> Option<SchemaId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: SchemaId) -> impl Iterator<Item = SchemaId> + '_ {
        self.nodes[id].children.iter().copied()
    }

    pub fn first_child(&self, id: SchemaId) -> Option<SchemaId> {
        self.nodes[id].children.first().copied()
    }

    pub fn has_children(&self, id: SchemaId) -> bool {
        !self.nodes[id].children.is_empty()
    }

    /// Match a child by exact name (hyphen/underscore interchangeable) or by
    /// the single `*` wildcard. A `model:name` segment also matches on the
    /// part after the first colon, tried after the literal name so values
    /// containing colons (URNs) still match wildcards and literal nodes.
    pub fn child(&self, id: SchemaId, name: &str) -> Option<SchemaId> {
        let mut wildcard = None;
        for &c in &self.nodes[id].children {
            if names_match(&self.nodes[c].name, name) {
                return Some(c);
            }
            if self.nodes[c].name == "*" {
                wildcard = Some(c);
            }
        }
        if let Some((_, suffix)) = name.split_once(':') {
            for &c in &self.nodes[id].children {
                if names_match(&self.nodes[c].name, suffix) {
                    return Some(c);
                }
            }
        }
        wildcard
    }

    /// Match a child by exact name only (no wildcard fallback).
    pub fn named_child(&self, id: SchemaId, name: &str) -> Option<SchemaId> {
        let exact = self.nodes[id]
            .children
            .iter()
            .copied()
            .find(|&c| names_match(&self.nodes[c].name, name));
        if exact.is_some() {
            return exact;
        }
        let (_, suffix) = name.split_once(':')?;
        self.nodes[id]
            .children
            .iter()
            .copied()
            .find(|&c| names_match(&self.nodes[c].name, suffix))
    }

    pub fn kind(&self, id: SchemaId) -> &SchemaKind {
        &self.nodes[id].kind
    }

    pub fn is_leaf(&self, id: SchemaId) -> bool {
        self.nodes[id].children.is_empty()
    }

    pub fn is_list(&self, id: SchemaId) -> bool {
        matches!(self.nodes[id].kind, SchemaKind::List { .. })
    }

    pub fn is_leaf_list(&self, id: SchemaId) -> bool {
        matches!(self.nodes[id].kind, SchemaKind::LeafList)
    }

    pub fn is_readable(&self, id: SchemaId) -> bool {
        self.nodes[id].mode.readable && !self.nodes[id].mode.hidden
    }

    pub fn is_writable(&self, id: SchemaId) -> bool {
        self.nodes[id].mode.writable && !self.nodes[id].mode.hidden
    }

    pub fn is_config(&self, id: SchemaId) -> bool {
        self.nodes[id].mode.config
    }

    pub fn is_hidden(&self, id: SchemaId) -> bool {
        self.nodes[id].mode.hidden
    }

    pub fn is_executable(&self, id: SchemaId) -> bool {
        self.nodes[id].mode.executable
    }

    pub fn is_proxy(&self, id: SchemaId) -> bool {
        self.nodes[id].mode.proxy
    }

    pub fn list_key(&self, id: SchemaId) -> Option<&str> {
        match &self.nodes[id].kind {
            SchemaKind::List { key } => Some(key),
            _ => None,
        }
    }

    pub fn default(&self, id: SchemaId) -> Option<&str> {
        self.nodes[id].default.as_deref()
    }

    pub fn pattern(&self, id: SchemaId) -> Option<&Regex> {
        self.nodes[id].pattern.as_ref()
    }

    pub fn model(&self, id: SchemaId) -> Option<&ModelInfo> {
        self.nodes[id].model.map(|m| &self.models[m])
    }

    pub fn loaded_models(&self) -> &[ModelInfo] {
        &self.models
    }

    /// True when the node sits in a different module than its parent; the
    /// serialiser prefixes such keys with `model:` in namespace mode.
    pub fn model_boundary(&self, id: SchemaId) -> bool {
        match (self.nodes[id].model, self.nodes[id].parent.and_then(|p| self.nodes[p].model)) {
            (Some(m), Some(pm)) => m != pm,
            (Some(_), None) => self.model(id).and_then(|m| m.namespace.as_ref()).is_some(),
            _ => false,
        }
    }

    /// Validate a leaf value against the node's pattern. The empty string is
    /// always accepted (it represents deletion).
    pub fn validate_pattern(&self, id: SchemaId, value: &str) -> Result<(), SchemaError> {
        if value.is_empty() {
            return Ok(());
        }
        match &self.nodes[id].pattern {
            Some(re) if !re.is_match(value) => Err(SchemaError::PatternMismatch),
            _ => Ok(()),
        }
    }

    /// Enum value -> enum name.
    pub fn translate_to(&self, id: SchemaId, value: &str) -> Option<&str> {
        self.nodes[id]
            .values
            .iter()
            .find(|(_, v)| v == value)
            .map(|(n, _)| n.as_str())
    }

    /// Enum name -> enum value.
    pub fn translate_from(&self, id: SchemaId, name: &str) -> Option<&str> {
        self.nodes[id]
            .values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_values(&self, id: SchemaId) -> bool {
        !self.nodes[id].values.is_empty()
    }

    /// Resolve a slash-delimited path from the schema root. Wildcard list
    /// nodes consume instance-identifier segments; a proxy node restarts
    /// resolution from the root for the remaining segments.
    pub fn lookup(&self, path: &str) -> Result<SchemaId, SchemaError> {
        let mut node = Self::ROOT;
        let mut first = true;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            if self.nodes[node].mode.proxy {
                node = Self::ROOT;
            }
            if first {
                node = *self
                    .resolve_first(seg)
                    .ok_or(SchemaError::NoSchemaNode)?
                    .last()
                    .ok_or(SchemaError::NoSchemaNode)?;
            } else {
                node = self.child(node, seg).ok_or(SchemaError::NoSchemaNode)?;
            }
            first = false;
        }
        Ok(node)
    }

    /// Resolve the first path segment from the root. A `model:name` prefix
    /// selects either the node `model` whose child is `name` (compact
    /// RESTCONF addressing; both levels are returned) or a root child `name`
    /// owned by model `model`.
    pub fn resolve_first(&self, seg: &str) -> Option<Vec<SchemaId>> {
        if let Some((model, name)) = seg.split_once(':') {
            if let Some(top) = self.named_child(Self::ROOT, model) {
                if let Some(inner) = self.named_child(top, name) {
                    return Some(vec![top, inner]);
                }
            }
            if let Some(direct) = self.named_child(Self::ROOT, name) {
                let owned = self
                    .model(direct)
                    .map(|m| {
                        names_match(&m.name, model)
                            || m.prefix.as_deref().map(|p| names_match(p, model)).unwrap_or(false)
                    })
                    .unwrap_or(false);
                if owned {
                    return Some(vec![direct]);
                }
            }
            return None;
        }
        self.child(Self::ROOT, seg).map(|id| vec![id])
    }

    /// The RPC schema node addressed by `id`, if any. An executable node is
    /// an RPC directly; a container or list whose `_` child is executable is
    /// an RPC sharing its name with data.
    pub fn rpc_schema(&self, id: SchemaId) -> Option<SchemaId> {
        if self.is_executable(id) {
            return Some(id);
        }
        let holder = if self.is_list(id) { self.first_child(id)? } else { id };
        let underscore = self.named_child(holder, "_")?;
        self.is_executable(underscore).then_some(underscore)
    }

    /// Serialise the merged schema back to an XML module document.
    pub fn dump_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<MODULE>\n");
        for &child in &self.nodes[Self::ROOT].children {
            self.dump_node_xml(child, 1, &mut out);
        }
        out.push_str("</MODULE>\n");
        out
    }

    fn dump_node_xml(&self, id: SchemaId, indent: usize, out: &mut String) {
        let node = &self.nodes[id];
        let pad = "    ".repeat(indent);
        out.push_str(&pad);
        out.push_str(&format!("<NODE name=\"{}\"", xml_escape(&node.name)));
        let mode = node.mode.render();
        if !mode.is_empty() && mode != "r" {
            out.push_str(&format!(" mode=\"{}\"", mode));
        }
        if let Some(def) = &node.default {
            out.push_str(&format!(" default=\"{}\"", xml_escape(def)));
        }
        if let Some(re) = &node.pattern {
            out.push_str(&format!(" pattern=\"{}\"", xml_escape(re.as_str())));
        }
        if node.children.is_empty() && node.values.is_empty() {
            out.push_str(" />\n");
            return;
        }
        out.push_str(">\n");
        for (name, value) in &node.values {
            out.push_str(&pad);
            out.push_str(&format!(
                "    <VALUE name=\"{}\" value=\"{}\" />\n",
                xml_escape(name),
                xml_escape(value)
            ));
        }
        for &child in &node.children {
            self.dump_node_xml(child, indent + 1, out);
        }
        out.push_str(&pad);
        out.push_str("</NODE>\n");
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::SchemaInstance;

    /// The canonical test schema used across the crate: two modules merged
    /// into one `/test` tree plus an RPC module.
    pub fn test_schema() -> SchemaInstance {
        SchemaInstance::from_modules(&[
            r#"{
                "model": "test",
                "prefix": "t",
                "namespace": "https://example.com/ns/test",
                "revision": "2024-02-10",
                "nodes": [
                    {"name": "test", "children": [
                        {"name": "debug", "mode": "rw", "default": "0", "pattern": "^(0|1)$",
                         "values": {"disable": "0", "enable": "1"}},
                        {"name": "list", "children": [
                            {"name": "*", "children": [
                                {"name": "name", "mode": "rw"},
                                {"name": "type", "mode": "rw", "default": "1",
                                 "values": {"big": "1", "little": "2"}},
                                {"name": "sub-list", "children": [
                                    {"name": "*", "children": [
                                        {"name": "i-d", "mode": "rw"}
                                    ]}
                                ]}
                            ]}
                        ]},
                        {"name": "trivial-list", "children": [{"name": "*", "mode": "rw"}]}
                    ]}
                ]
            }"#,
            r#"{
                "model": "test2",
                "nodes": [
                    {"name": "test", "children": [
                        {"name": "state", "mode": "r", "default": "0",
                         "values": {"up": "0", "down": "1"}},
                        {"name": "kick", "mode": "w", "pattern": "^(0|1)$"},
                        {"name": "secret", "mode": "h"}
                    ]}
                ]
            }"#,
            r#"{
                "model": "ops",
                "prefix": "ops",
                "namespace": "https://example.com/ns/ops",
                "nodes": [
                    {"name": "reboot", "mode": "x", "children": [
                        {"name": "input", "children": [
                            {"name": "delay", "mode": "w"}
                        ]},
                        {"name": "output", "children": [
                            {"name": "status", "mode": "r"}
                        ]}
                    ]}
                ]
            }"#,
        ])
        .expect("fixture schema")
    }
}
