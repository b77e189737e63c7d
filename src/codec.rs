//!
//! JSON <-> tree codec
//! -------------------
//! Schema-driven conversion between JSON documents and the data tree.
//! Writing validates every leaf (schema presence, writability, pattern,
//! enum translation); reading honours hidden/readability flags, list array
//! formatting, typed scalars, namespace prefixing and default handling.

use crate::error::RestError;
use crate::request::FormatFlags;
use crate::schema::{SchemaError, SchemaId, SchemaInstance, SchemaKind};
use crate::tree::Node;
use serde_json::{json, Map, Value};

/// Render a JSON scalar to the store's canonical string form.
/// Integers and booleans use their canonical text; anything else fails.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
        _ => None,
    }
}

/// Convert a JSON document into a tree rooted at the schema node `sid`.
/// `allow_exec` admits executable (RPC input) leaves in place of writable
/// ones.
pub fn json_to_tree(
    schema: &SchemaInstance,
    sid: SchemaId,
    json: &Value,
    allow_exec: bool,
) -> Result<Node, RestError> {
    let mut root = Node::new(schema.name(sid));
    let Value::Object(map) = json else {
        return Err(RestError::malformed());
    };
    decode_object(schema, sid, map, &mut root, allow_exec)?;
    Ok(root)
}

fn decode_object(
    schema: &SchemaInstance,
    sid: SchemaId,
    map: &Map<String, Value>,
    node: &mut Node,
    allow_exec: bool,
) -> Result<(), RestError> {
    for (key, value) in map {
        let name = key.rsplit(':').next().unwrap_or(key);
        let child_sid = schema.child(sid, name).ok_or(SchemaError::NoSchemaNode)?;
        decode_value(schema, child_sid, name, value, node, allow_exec)?;
    }
    Ok(())
}

fn decode_value(
    schema: &SchemaInstance,
    sid: SchemaId,
    name: &str,
    value: &Value,
    parent: &mut Node,
    allow_exec: bool,
) -> Result<(), RestError> {
    match value {
        Value::Object(map) => {
            let child = parent.append(Node::new(name));
            decode_object(schema, sid, map, child, allow_exec)
        }
        Value::Array(items) => match schema.kind(sid) {
            SchemaKind::List { key } => {
                let list = parent.append(Node::new(name));
                let star = schema.named_child(sid, "*").ok_or(SchemaError::NoSchemaNode)?;
                for item in items {
                    let Value::Object(fields) = item else {
                        return Err(RestError::invalid());
                    };
                    let key_value = fields
                        .get(key.as_str())
                        .and_then(scalar_to_string)
                        .ok_or_else(RestError::invalid)?;
                    let instance = list.append(Node::new(key_value));
                    decode_object(schema, star, fields, instance, allow_exec)?;
                }
                Ok(())
            }
            SchemaKind::LeafList => {
                let list = parent.append(Node::new(name));
                let star = schema.named_child(sid, "*").ok_or(SchemaError::NoSchemaNode)?;
                if !schema.is_writable(star) && !(allow_exec && schema.is_executable(star)) {
                    return Err(SchemaError::NotWritable.into());
                }
                for item in items {
                    let rendered = scalar_to_string(item).ok_or_else(RestError::invalid)?;
                    schema.validate_pattern(star, &rendered)?;
                    list.append(Node::leaf(rendered.clone(), rendered));
                }
                Ok(())
            }
            _ => Err(RestError::invalid()),
        },
        Value::String(_) | Value::Number(_) | Value::Bool(_) => {
            if !schema.is_leaf(sid) {
                return Err(RestError::invalid());
            }
            if !schema.is_writable(sid) && !(allow_exec && schema.is_executable(sid)) {
                return Err(SchemaError::NotWritable.into());
            }
            let rendered = scalar_to_string(value).ok_or_else(RestError::invalid)?;
            // Accept enumerated names in place of raw values.
            let rendered = schema
                .translate_from(sid, &rendered)
                .map(str::to_string)
                .unwrap_or(rendered);
            schema.validate_pattern(sid, &rendered)?;
            parent.append(Node::leaf(name, rendered));
            Ok(())
        }
        _ => Err(RestError::invalid()),
    }
}

/// Serialise a leaf value honouring typed output and enum naming.
fn encode_leaf(schema: &SchemaInstance, sid: SchemaId, value: &str, flags: &FormatFlags) -> Value {
    if flags.idref_values {
        if let Some(name) = schema.translate_to(sid, value) {
            return Value::String(name.to_string());
        }
    }
    if flags.types {
        if let Ok(i) = value.parse::<i64>() {
            return json!(i);
        }
        if value == "true" {
            return Value::Bool(true);
        }
        if value == "false" {
            return Value::Bool(false);
        }
    }
    Value::String(value.to_string())
}

fn child_key(schema: &SchemaInstance, sid: SchemaId, name: &str, flags: &FormatFlags) -> String {
    if flags.namespace && schema.model_boundary(sid) {
        if let Some(model) = schema.model(sid) {
            return format!("{}:{}", model.name, name);
        }
    }
    name.to_string()
}

/// Convert a tree into JSON, driven by the schema subtree rooted at `sid`.
/// Produces an object keyed by the node's (possibly namespaced) name, or
/// `None` when everything below is filtered out. The response-root key is
/// prefixed whenever the node's model is non-native (declares a namespace),
/// matching RFC 8040 top-level naming.
pub fn tree_to_json(
    schema: &SchemaInstance,
    sid: SchemaId,
    node: &Node,
    flags: &FormatFlags,
) -> Option<Value> {
    let body = encode_node(schema, sid, node, flags)?;
    let prefixed = flags.namespace
        && flags.ns_prefix
        && schema.model(sid).and_then(|m| m.namespace.as_ref()).is_some();
    let key = if prefixed {
        match schema.model(sid) {
            Some(model) => format!("{}:{}", model.name, node.name()),
            None => node.name().to_string(),
        }
    } else {
        child_key(schema, sid, node.name(), flags)
    };
    let mut map = Map::new();
    map.insert(key, body);
    Some(Value::Object(map))
}

fn encode_node(
    schema: &SchemaInstance,
    sid: SchemaId,
    node: &Node,
    flags: &FormatFlags,
) -> Option<Value> {
    if schema.is_hidden(sid) {
        return None;
    }
    if schema.is_leaf(sid) {
        if !schema.is_readable(sid) {
            return None;
        }
        if flags.config_only && !schema.is_config(sid) {
            return None;
        }
        if flags.nonconfig_only && schema.is_config(sid) {
            return None;
        }
        return Some(encode_leaf(schema, sid, node.value().unwrap_or(""), flags));
    }
    if schema.is_list(sid) && flags.arrays {
        let star = schema.named_child(sid, "*")?;
        let mut items = Vec::new();
        for instance in node.children() {
            if let Some(v) = encode_node(schema, star, instance, flags) {
                items.push(v);
            }
        }
        return Some(Value::Array(items));
    }
    let mut map = Map::new();
    for child in node.children() {
        let Some(child_sid) = schema.child(sid, child.name()) else {
            continue;
        };
        if let Some(v) = encode_node(schema, child_sid, child, flags) {
            map.insert(child_key(schema, child_sid, child.name(), flags), v);
        }
    }
    Some(Value::Object(map))
}

/// Inject default leaves absent from the tree for every container present.
/// Does not fabricate missing interior nodes. On a leaf, fills in the
/// default value when the tree carries none.
pub fn add_defaults(schema: &SchemaInstance, sid: SchemaId, node: &mut Node) {
    if schema.is_leaf(sid) {
        if let (None, Some(default)) = (node.value(), schema.default(sid)) {
            node.set_value(default);
        }
        return;
    }
    for child_sid in schema.children(sid).collect::<Vec<_>>() {
        let name = schema.name(child_sid).to_string();
        if schema.is_hidden(child_sid) {
            continue;
        }
        if schema.is_leaf(child_sid) {
            if let Some(default) = schema.default(child_sid) {
                if name != "*" && node.child(&name).is_none() {
                    node.append(Node::leaf(name.clone(), default.to_string()));
                }
            }
        } else if name == "*" {
            // Wildcard: recurse into every present instance.
            for instance in node.children_mut() {
                add_defaults(schema, child_sid, instance);
            }
        } else if let Some(existing) = node.child_mut(&name) {
            add_defaults(schema, child_sid, existing);
        }
    }
}

/// Remove leaves whose value equals the schema default.
pub fn trim_defaults(schema: &SchemaInstance, sid: SchemaId, node: &mut Node) {
    let mut remove = Vec::new();
    for (idx, child) in node.children().iter().enumerate() {
        let Some(child_sid) = schema.child(sid, child.name()) else {
            continue;
        };
        if schema.is_leaf(child_sid) {
            if let (Some(default), Some(value)) = (schema.default(child_sid), child.value()) {
                if default == value {
                    remove.push(idx);
                }
            }
        }
    }
    for idx in remove.into_iter().rev() {
        node.children_mut().remove(idx);
    }
    for child in node.children_mut() {
        if let Some(child_sid) = schema.child(sid, child.name()) {
            if !schema.is_leaf(child_sid) {
                trim_defaults(schema, child_sid, child);
            }
        }
    }
}

/// PUT replace semantics: emit an empty leaf for every writable schema leaf
/// missing from the tree so the store overwrite clears the full subtree.
pub fn add_missing_empty(schema: &SchemaInstance, sid: SchemaId, node: &mut Node) {
    for child_sid in schema.children(sid).collect::<Vec<_>>() {
        let name = schema.name(child_sid).to_string();
        if schema.is_hidden(child_sid) {
            continue;
        }
        if name == "*" {
            for instance in node.children_mut() {
                if !schema.is_leaf(child_sid) {
                    add_missing_empty(schema, child_sid, instance);
                }
            }
            continue;
        }
        if schema.is_leaf(child_sid) {
            if schema.is_writable(child_sid) && node.child(&name).is_none() {
                node.append(Node::leaf(name, String::new()));
            }
        } else if let Some(existing) = node.child_mut(&name) {
            add_missing_empty(schema, child_sid, existing);
        }
    }
}

/// Truncate the tree beyond `depth` levels from `node` (1-based; depth 1
/// keeps only the node itself).
pub fn trim_tree_depth(node: &mut Node, depth: u32) {
    if depth <= 1 {
        node.children_mut().clear();
        return;
    }
    for child in node.children_mut() {
        trim_tree_depth(child, depth - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixture::test_schema;

    fn flags() -> FormatFlags {
        FormatFlags { root: true, ..FormatFlags::default() }
    }

    #[test]
    fn decode_simple_leaf() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let tree = json_to_tree(&schema, test, &json!({"debug": "1"}), false).unwrap();
        assert_eq!(tree.name(), "test");
        assert_eq!(tree.child("debug").unwrap().value(), Some("1"));
    }

    #[test]
    fn decode_translates_enum_names() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let tree = json_to_tree(&schema, test, &json!({"debug": "enable"}), false).unwrap();
        assert_eq!(tree.child("debug").unwrap().value(), Some("1"));
    }

    #[test]
    fn decode_rejects_pattern_mismatch() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let err = json_to_tree(&schema, test, &json!({"debug": "not_valid"}), false).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn decode_rejects_unknown_node() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let err = json_to_tree(&schema, test, &json!({"cabbage": "0"}), false).unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn decode_rejects_unwritable_and_hidden() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let err = json_to_tree(&schema, test, &json!({"state": "up"}), false).unwrap_err();
        assert_eq!(err.http_status(), 403);
        let err = json_to_tree(&schema, test, &json!({"secret": "0"}), false).unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[test]
    fn decode_list_object_and_array_forms() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let from_obj = json_to_tree(
            &schema,
            test,
            &json!({"list": {"fred": {"name": "fred"}, "tom": {"name": "tom"}}}),
            false,
        )
        .unwrap();
        let from_arr = json_to_tree(
            &schema,
            test,
            &json!({"list": [{"name": "fred"}, {"name": "tom"}]}),
            false,
        )
        .unwrap();
        for tree in [&from_obj, &from_arr] {
            assert_eq!(tree.find_path("list/fred/name").unwrap().value(), Some("fred"));
            assert_eq!(tree.find_path("list/tom/name").unwrap().value(), Some("tom"));
        }
    }

    #[test]
    fn decode_leaf_list_array() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let tree = json_to_tree(&schema, test, &json!({"trivial-list": ["a", "b"]}), false).unwrap();
        let list = tree.child("trivial-list").unwrap();
        assert_eq!(list.children()[0].name(), "a");
        assert_eq!(list.children()[0].value(), Some("a"));
        assert_eq!(list.children()[1].name(), "b");
    }

    #[test]
    fn decode_typed_scalars() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let tree = json_to_tree(&schema, test, &json!({"debug": 1}), false).unwrap();
        assert_eq!(tree.child("debug").unwrap().value(), Some("1"));
    }

    #[test]
    fn encode_simple_tree() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let mut node = Node::new("test");
        node.append(Node::leaf("debug", "1"));
        let json = tree_to_json(&schema, test, &node, &flags()).unwrap();
        assert_eq!(json, json!({"test": {"debug": "1"}}));
    }

    #[test]
    fn encode_skips_hidden_and_unreadable() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let mut node = Node::new("test");
        node.append(Node::leaf("secret", "0"));
        node.append(Node::leaf("kick", "1"));
        node.append(Node::leaf("debug", "1"));
        let json = tree_to_json(&schema, test, &node, &flags()).unwrap();
        assert_eq!(json, json!({"test": {"debug": "1"}}));
    }

    #[test]
    fn encode_list_as_object_and_array() {
        let schema = test_schema();
        let list_sid = schema.lookup("/test/list").unwrap();
        let mut list = Node::new("list");
        list.append(Node::new("fred")).append(Node::leaf("name", "fred"));
        list.append(Node::new("tom")).append(Node::leaf("name", "tom"));

        let json = tree_to_json(&schema, list_sid, &list, &flags()).unwrap();
        assert_eq!(json, json!({"list": {"fred": {"name": "fred"}, "tom": {"name": "tom"}}}));

        let arr_flags = FormatFlags { arrays: true, ..flags() };
        let json = tree_to_json(&schema, list_sid, &list, &arr_flags).unwrap();
        assert_eq!(json, json!({"list": [{"name": "fred"}, {"name": "tom"}]}));
    }

    #[test]
    fn encode_typed_values() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let mut node = Node::new("test");
        node.append(Node::leaf("debug", "1"));
        let typed = FormatFlags { types: true, ..flags() };
        let json = tree_to_json(&schema, test, &node, &typed).unwrap();
        assert_eq!(json, json!({"test": {"debug": 1}}));
    }

    #[test]
    fn encode_enum_names_with_idref_values() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let mut node = Node::new("test");
        node.append(Node::leaf("debug", "1"));
        let f = FormatFlags { idref_values: true, ..flags() };
        let json = tree_to_json(&schema, test, &node, &f).unwrap();
        assert_eq!(json, json!({"test": {"debug": "enable"}}));
    }

    #[test]
    fn roundtrip_preserves_tree() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let mut node = Node::new("test");
        node.append(Node::leaf("debug", "1"));
        let mut list = Node::new("list");
        list.append(Node::new("fred")).append(Node::leaf("name", "fred"));
        node.children_mut().push(list);

        let f = FormatFlags { arrays: true, types: true, root: true, ..FormatFlags::default() };
        let json = tree_to_json(&schema, test, &node, &f).unwrap();
        let decoded = json_to_tree(&schema, test, &json["test"], false).unwrap();
        assert_eq!(decoded.child("debug").unwrap().value(), Some("1"));
        assert_eq!(decoded.find_path("list/fred/name").unwrap().value(), Some("fred"));
    }

    #[test]
    fn defaults_add_and_trim() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let mut node = Node::new("test");
        node.append(Node::leaf("state", "1"));
        add_defaults(&schema, test, &mut node);
        assert_eq!(node.child("debug").unwrap().value(), Some("0"));

        trim_defaults(&schema, test, &mut node);
        assert!(node.child("debug").is_none());
        assert_eq!(node.child("state").unwrap().value(), Some("1"));
    }

    #[test]
    fn replace_adds_empty_leaves() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let mut node = Node::new("test");
        node.append(Node::leaf("debug", "1"));
        add_missing_empty(&schema, test, &mut node);
        assert_eq!(node.child("kick").unwrap().value(), Some(""));
        // Read-only and hidden leaves stay untouched.
        assert!(node.child("state").is_none());
        assert!(node.child("secret").is_none());
    }

    #[test]
    fn depth_trimming() {
        let mut node = Node::new("test");
        let list = node.append(Node::new("list"));
        list.append(Node::new("fred")).append(Node::leaf("name", "fred"));
        trim_tree_depth(&mut node, 2);
        assert!(node.child("list").unwrap().children().is_empty());
    }

    #[test]
    fn config_filtering() {
        let schema = test_schema();
        let test = schema.lookup("/test").unwrap();
        let mut node = Node::new("test");
        node.append(Node::leaf("debug", "1"));
        node.append(Node::leaf("state", "0"));
        let cfg = FormatFlags { config_only: true, ..flags() };
        let json = tree_to_json(&schema, test, &node, &cfg).unwrap();
        assert_eq!(json, json!({"test": {"debug": "1"}}));
        let state = FormatFlags { nonconfig_only: true, ..flags() };
        let json = tree_to_json(&schema, test, &node, &state).unwrap();
        assert_eq!(json, json!({"test": {"state": "0"}}));
    }
}
