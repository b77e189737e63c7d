#![allow(dead_code)]

use grove_rest::logging::LogConfig;
use grove_rest::request::{Accept, FormatFlags, Method, Request};
use grove_rest::rest::RestContext;
use grove_rest::rpc::RpcRegistry;
use grove_rest::schema::SchemaInstance;
use grove_rest::store::Store;
use grove_rest::yang_library;
use std::sync::Arc;

pub const TEST_MODULE: &str = r#"{
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
}"#;

pub const STATE_MODULE: &str = r#"{
    "model": "test2",
    "nodes": [
        {"name": "test", "children": [
            {"name": "state", "mode": "r", "default": "0",
             "values": {"up": "0", "down": "1"}},
            {"name": "kick", "mode": "w", "pattern": "^(0|1)$"},
            {"name": "secret", "mode": "h"}
        ]}
    ]
}"#;

pub const OPS_MODULE: &str = r#"{
    "model": "ops",
    "prefix": "ops",
    "namespace": "https://example.com/ns/ops",
    "nodes": [
        {"name": "reboot", "mode": "rx", "children": [
            {"name": "input", "children": [
                {"name": "delay", "mode": "w"}
            ]},
            {"name": "output", "children": [
                {"name": "status", "mode": "r"}
            ]}
        ]}
    ]
}"#;

pub fn test_schema() -> SchemaInstance {
    SchemaInstance::from_modules(&[
        TEST_MODULE,
        STATE_MODULE,
        OPS_MODULE,
        yang_library::YANG_LIBRARY_MODULE,
        yang_library::RESTCONF_MONITORING_MODULE,
    ])
    .expect("test schema")
}

pub fn context() -> RestContext {
    RestContext::new(
        Arc::new(test_schema()),
        Store::new(),
        Arc::new(RpcRegistry::empty()),
        LogConfig::disabled(),
    )
}

pub fn context_with_rpcs(rpcs: RpcRegistry) -> RestContext {
    RestContext::new(
        Arc::new(test_schema()),
        Store::new(),
        Arc::new(rpcs),
        LogConfig::disabled(),
    )
}

/// A plain /api request with default formatting.
pub fn request(method: Method, path: &str) -> Request {
    Request {
        method,
        accept: Accept::Json,
        flags: FormatFlags { root: true, ..FormatFlags::default() },
        path: path.to_string(),
        query: None,
        doc_root: "/api".to_string(),
        if_match: None,
        if_none_match: None,
        if_modified_since: None,
        if_unmodified_since: None,
        server_name: "router.example.com".to_string(),
        server_port: "443".to_string(),
        remote_addr: "192.168.1.1".to_string(),
        remote_user: "manager".to_string(),
        body: String::new(),
    }
}

pub fn request_with_body(method: Method, path: &str, body: &str) -> Request {
    let mut req = request(method, path);
    req.body = body.to_string();
    req
}

/// A RESTCONF request: yang-data framing plus the formatting it forces.
pub fn restconf_request(method: Method, path: &str) -> Request {
    let mut req = request(method, path);
    req.doc_root = "/restconf".to_string();
    req.flags = FormatFlags {
        restconf: true,
        root: true,
        arrays: true,
        types: true,
        namespace: true,
        put_replace: method == Method::Put,
        put_key_value: method == Method::Put,
        ..FormatFlags::default()
    };
    req
}

pub fn restconf_request_with_body(method: Method, path: &str, body: &str) -> Request {
    let mut req = restconf_request(method, path);
    req.body = body.to_string();
    req
}
