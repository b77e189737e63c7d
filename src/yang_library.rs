//!
//! YANG library and RESTCONF monitoring publisher
//! ----------------------------------------------
//! Populates the RFC 8525 yang-library (loaded modules, content-id) and the
//! RFC 8040 restconf-state capability list in the store at startup, backed
//! by two built-in schema modules merged into every loaded instance.

use crate::schema::SchemaInstance;
use crate::store::Store;
use crate::tree::Node;
use tracing::info;

/// Built-in schema module for the RFC 8525 yang-library subtree.
pub const YANG_LIBRARY_MODULE: &str = r#"{
    "model": "ietf-yang-library",
    "prefix": "yanglib",
    "namespace": "urn:ietf:params:xml:ns:yang:ietf-yang-library",
    "revision": "2019-01-04",
    "nodes": [
        {"name": "yang-library", "children": [
            {"name": "module-set", "children": [
                {"name": "*", "children": [
                    {"name": "name"},
                    {"name": "module", "children": [
                        {"name": "*", "children": [
                            {"name": "name"},
                            {"name": "revision"},
                            {"name": "namespace"}
                        ]}
                    ]}
                ]}
            ]},
            {"name": "content-id"}
        ]}
    ]
}"#;

/// Built-in schema module for the RFC 8040 restconf-state subtree.
pub const RESTCONF_MONITORING_MODULE: &str = r#"{
    "model": "ietf-restconf-monitoring",
    "prefix": "rcmon",
    "namespace": "urn:ietf:params:xml:ns:yang:ietf-restconf-monitoring",
    "nodes": [
        {"name": "restconf-state", "children": [
            {"name": "capabilities", "children": [
                {"name": "capability", "children": [{"name": "*"}]}
            ]}
        ]}
    ]
}"#;

pub const BUILTIN_MODULES: [&str; 2] = [YANG_LIBRARY_MODULE, RESTCONF_MONITORING_MODULE];

/// Supported RESTCONF capability URNs. If a capability is added in the
/// code this table needs updating.
/// Ref: http://www.iana.org/assignments/restconf-capability-urns/restconf-capability-urns.xhtml
pub const RESTCONF_CAPABILITIES: [&str; 4] = [
    "urn:ietf:params:restconf:capability:defaults:1.0?basic-mode=explicit",
    "urn:ietf:params:restconf:capability:depth:1.0",
    "urn:ietf:params:restconf:capability:fields:1.0",
    "urn:ietf:params:restconf:capability:with-defaults:1.0",
];

/// Write the module list, content-id and capability list into the store.
pub fn publish(schema: &SchemaInstance, store: &Store, boot_epoch: i64) {
    let mut root = Node::root();
    for model in schema.loaded_models() {
        let base = format!("/yang-library/module-set/modules/module/{}", model.name);
        root.insert_path(&format!("{}/name", base), Some(&model.name));
        if let Some(revision) = &model.revision {
            root.insert_path(&format!("{}/revision", base), Some(revision));
        }
        if let Some(namespace) = &model.namespace {
            root.insert_path(&format!("{}/namespace", base), Some(namespace));
        }
    }
    root.insert_path("/yang-library/module-set/modules/name", Some("modules"));
    root.insert_path("/yang-library/content-id", Some(&format!("{:x}", boot_epoch)));

    for capability in RESTCONF_CAPABILITIES {
        root.insert_path(
            &format!("/restconf-state/capabilities/capability/{}", capability),
            Some(capability),
        );
    }

    let _ = store.set_tree(&root);
    info!(
        target: "yang_library",
        "published yang-library with {} modules",
        schema.loaded_models().len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixture::test_schema;

    #[test]
    fn publishes_modules_and_capabilities() {
        let schema = test_schema();
        let store = Store::new();
        publish(&schema, &store, 0x5f00_0000);

        assert_eq!(
            store.get("/yang-library/module-set/modules/module/test/name"),
            Some("test".to_string())
        );
        assert_eq!(
            store.get("/yang-library/module-set/modules/module/test/namespace"),
            Some("https://example.com/ns/test".to_string())
        );
        assert_eq!(store.get("/yang-library/content-id"), Some("5f000000".to_string()));

        let caps = store.paths_under("/restconf-state/capabilities/capability/");
        assert_eq!(caps.len(), RESTCONF_CAPABILITIES.len());
    }

    #[test]
    fn builtin_modules_parse() {
        let schema = SchemaInstance::from_modules(&BUILTIN_MODULES).unwrap();
        assert!(schema.lookup("/yang-library/content-id").is_ok());
        assert!(schema.lookup("/restconf-state/capabilities/capability").is_ok());
        let lib = schema.lookup("/yang-library").unwrap();
        assert!(schema.is_readable(lib));
        assert!(!schema.is_writable(lib));
    }
}
