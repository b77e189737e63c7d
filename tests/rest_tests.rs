//! End-to-end tests of the permissive /api surface: reads, writes,
//! searches, deletes and the conditional-request protocol.

mod common;

use common::*;
use grove_rest::request::Method;
use grove_rest::rest::rest_api;

#[test]
fn set_then_get_leaf() {
    let ctx = context();
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test", r#"{"debug": "1"}"#));
    assert_eq!(resp.status, 204);
    assert_eq!(ctx.store.get("/test/debug"), Some("1".to_string()));

    let resp = rest_api(&ctx, &request(Method::Get, "/test/debug"));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, r#"{"debug":"1"}"#);
    assert!(resp.etag.unwrap() > 0);
    assert!(resp.last_modified.unwrap().ends_with("GMT"));
}

#[test]
fn set_invalid_value_rejected() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("1"));
    let resp =
        rest_api(&ctx, &request_with_body(Method::Post, "/test", r#"{"debug": "not_valid"}"#));
    assert_eq!(resp.status, 400);
    // The old value is untouched.
    assert_eq!(ctx.store.get("/test/debug"), Some("1".to_string()));
}

#[test]
fn enum_names_accepted_on_write() {
    let ctx = context();
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test", r#"{"debug": "enable"}"#));
    assert_eq!(resp.status, 204);
    assert_eq!(ctx.store.get("/test/debug"), Some("1".to_string()));
}

#[test]
fn conditional_get_not_modified() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("1"));
    let first = rest_api(&ctx, &request(Method::Get, "/test/debug"));
    assert_eq!(first.status, 200);
    let etag = format!("{:X}", first.etag.unwrap());

    let mut again = request(Method::Get, "/test/debug");
    again.if_none_match = Some(etag.clone());
    let resp = rest_api(&ctx, &again);
    assert_eq!(resp.status, 304);
    assert!(resp.body.is_empty());

    // A write moves the timestamp and revalidates.
    ctx.store.set("/test/debug", Some("0"));
    let mut after = request(Method::Get, "/test/debug");
    after.if_none_match = Some(etag);
    let resp = rest_api(&ctx, &after);
    assert_eq!(resp.status, 200);
}

#[test]
fn etag_stable_until_write() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("0"));
    let a = rest_api(&ctx, &request(Method::Get, "/test/debug")).etag.unwrap();
    let b = rest_api(&ctx, &request(Method::Get, "/test/debug")).etag.unwrap();
    assert_eq!(a, b);
    ctx.store.set("/test/debug", Some("1"));
    let c = rest_api(&ctx, &request(Method::Get, "/test/debug")).etag.unwrap();
    assert_ne!(a, c);
}

#[test]
fn hidden_node_is_invisible() {
    let ctx = context();
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test", r#"{"secret": "0"}"#));
    assert_eq!(resp.status, 403);

    ctx.store.set("/test/secret", Some("0"));
    let resp = rest_api(&ctx, &request(Method::Get, "/test/secret"));
    assert_eq!(resp.status, 403);

    // Hidden leaves are skipped in subtree reads.
    ctx.store.set("/test/debug", Some("1"));
    let resp = rest_api(&ctx, &request(Method::Get, "/test"));
    assert!(!resp.body.contains("secret"));
}

#[test]
fn write_only_leaf_not_readable() {
    let ctx = context();
    ctx.store.set("/test/kick", Some("0"));
    let resp = rest_api(&ctx, &request(Method::Get, "/test/kick"));
    assert_eq!(resp.status, 403);
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test", r#"{"kick": "1"}"#));
    assert_eq!(resp.status, 204);
}

#[test]
fn read_only_leaf_not_writable() {
    let ctx = context();
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test", r#"{"state": "up"}"#));
    assert_eq!(resp.status, 403);
}

#[test]
fn unknown_path_404() {
    let ctx = context();
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test", r#"{"cabbage": "0"}"#));
    assert_eq!(resp.status, 404);
    let resp = rest_api(&ctx, &request(Method::Get, "/test/cabbage"));
    assert_eq!(resp.status, 404);
}

#[test]
fn malformed_body_400() {
    let ctx = context();
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test", "cabbage"));
    assert_eq!(resp.status, 400);
}

#[test]
fn bare_scalar_write_on_leaf() {
    let ctx = context();
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test/debug", "1"));
    assert_eq!(resp.status, 204);
    assert_eq!(ctx.store.get("/test/debug"), Some("1".to_string()));

    // Quoted scalars work the same way.
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test/debug", "\"0\""));
    assert_eq!(resp.status, 204);
    assert_eq!(ctx.store.get("/test/debug"), Some("0".to_string()));
}

#[test]
fn set_list_and_read_back() {
    let ctx = context();
    let body = r#"{"list": {"fred": {"name": "fred"}, "tom": {"name": "tom"}}}"#;
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test", body));
    assert_eq!(resp.status, 204);
    assert_eq!(ctx.store.get("/test/list/fred/name"), Some("fred".to_string()));
    assert_eq!(ctx.store.get("/test/list/tom/name"), Some("tom".to_string()));

    let resp = rest_api(&ctx, &request(Method::Get, "/test/list"));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, r#"{"list":{"fred":{"name":"fred"},"tom":{"name":"tom"}}}"#);
}

#[test]
fn arrays_flag_formats_lists() {
    let ctx = context();
    let body = r#"{"list": [{"name": "fred"}, {"name": "tom"}]}"#;
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test", body));
    assert_eq!(resp.status, 204);

    let mut req = request(Method::Get, "/test/list");
    req.flags.arrays = true;
    let resp = rest_api(&ctx, &req);
    assert_eq!(resp.body, r#"{"list":[{"name":"fred"},{"name":"tom"}]}"#);
}

#[test]
fn search_lists_sorted_children() {
    let ctx = context();
    ctx.store.set("/test/list/tom/name", Some("tom"));
    ctx.store.set("/test/list/fred/name", Some("fred"));
    let resp = rest_api(&ctx, &request(Method::Get, "/test/list/"));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, r#"{"list":["fred","tom"]}"#);

    // A leaf has no children to search.
    let resp = rest_api(&ctx, &request(Method::Get, "/test/list/fred/name/"));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, r#"{"name":[]}"#);
}

#[test]
fn search_honours_if_none_match() {
    let ctx = context();
    ctx.store.set("/test/list/fred/name", Some("fred"));
    let first = rest_api(&ctx, &request(Method::Get, "/test/list/"));
    let etag = format!("{:X}", first.etag.unwrap());
    let mut again = request(Method::Get, "/test/list/");
    again.if_none_match = Some(etag);
    let resp = rest_api(&ctx, &again);
    assert_eq!(resp.status, 304);
}

#[test]
fn delete_is_idempotent_until_404() {
    let ctx = context();
    ctx.store.set("/test/list/fred/name", Some("fred"));
    ctx.store.set("/test/list/tom/name", Some("tom"));

    let resp = rest_api(&ctx, &request(Method::Delete, "/test/list"));
    assert_eq!(resp.status, 204);
    assert_eq!(ctx.store.get("/test/list/fred/name"), None);
    assert_eq!(ctx.store.get("/test/list/tom/name"), None);

    let resp = rest_api(&ctx, &request(Method::Delete, "/test/list"));
    assert_eq!(resp.status, 404);
}

#[test]
fn delete_leaf() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("1"));
    let resp = rest_api(&ctx, &request(Method::Delete, "/test/debug"));
    assert_eq!(resp.status, 204);
    assert_eq!(ctx.store.get("/test/debug"), None);
}

#[test]
fn delete_leaf_list_instance() {
    let ctx = context();
    ctx.store.set("/test/trivial-list/a", Some("a"));
    ctx.store.set("/test/trivial-list/b", Some("b"));
    let resp = rest_api(&ctx, &request(Method::Delete, "/test/trivial-list/a"));
    assert_eq!(resp.status, 204);
    assert_eq!(ctx.store.get("/test/trivial-list/a"), None);
    assert_eq!(ctx.store.get("/test/trivial-list/b"), Some("b".to_string()));
}

#[test]
fn delete_hidden_silently_succeeds() {
    let ctx = context();
    ctx.store.set("/test/secret", Some("0"));
    let resp = rest_api(&ctx, &request(Method::Delete, "/test/secret"));
    assert_eq!(resp.status, 204);
    // The hidden leaf is untouched, the delete just pretends.
    assert_eq!(ctx.store.get("/test/secret"), Some("0".to_string()));
}

#[test]
fn empty_value_deletes_leaf() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("1"));
    let resp = rest_api(&ctx, &request_with_body(Method::Post, "/test", r#"{"debug": ""}"#));
    assert_eq!(resp.status, 204);
    assert_eq!(ctx.store.get("/test/debug"), None);
}

#[test]
fn with_defaults_report_all() {
    let ctx = context();
    ctx.store.set("/test/state", Some("1"));
    let mut req = request(Method::Get, "/test");
    req.query = Some("with-defaults=report-all".to_string());
    let resp = rest_api(&ctx, &req);
    assert_eq!(resp.status, 200);
    let json: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(json["test"]["debug"], "0");
    assert_eq!(json["test"]["state"], "1");
}

#[test]
fn with_defaults_trim() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("0"));
    ctx.store.set("/test/state", Some("1"));
    let mut req = request(Method::Get, "/test");
    req.query = Some("with-defaults=trim".to_string());
    let resp = rest_api(&ctx, &req);
    let json: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
    assert!(json["test"].get("debug").is_none());
    assert_eq!(json["test"]["state"], "1");
}

#[test]
fn depth_limits_response() {
    let ctx = context();
    ctx.store.set("/test/list/fred/name", Some("fred"));
    let mut req = request(Method::Get, "/test");
    req.query = Some("depth=2".to_string());
    let resp = rest_api(&ctx, &req);
    let json: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(json["test"]["list"], serde_json::json!({}));
}

#[test]
fn fields_select_subset() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("1"));
    ctx.store.set("/test/state", Some("0"));
    let mut req = request(Method::Get, "/test");
    req.query = Some("fields=debug".to_string());
    let resp = rest_api(&ctx, &req);
    let json: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(json["test"]["debug"], "1");
    assert!(json["test"].get("state").is_none());
}

#[test]
fn content_filters_by_config_mode() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("1"));
    ctx.store.set("/test/state", Some("0"));
    let mut req = request(Method::Get, "/test");
    req.query = Some("content=config".to_string());
    let resp = rest_api(&ctx, &req);
    let json: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(json["test"]["debug"], "1");
    assert!(json["test"].get("state").is_none());

    let mut req = request(Method::Get, "/test");
    req.query = Some("content=nonconfig".to_string());
    let resp = rest_api(&ctx, &req);
    let json: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
    assert!(json["test"].get("debug").is_none());
    assert_eq!(json["test"]["state"], "0");
}

#[test]
fn unknown_query_parameter_rejected() {
    let ctx = context();
    let mut req = request(Method::Get, "/test");
    req.query = Some("cabbage=1".to_string());
    let resp = rest_api(&ctx, &req);
    assert_eq!(resp.status, 400);
}

#[test]
fn root_flag_off_unwraps_response() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("1"));
    let mut req = request(Method::Get, "/test/debug");
    req.flags.root = false;
    let resp = rest_api(&ctx, &req);
    assert_eq!(resp.body, "\"1\"");
}

#[test]
fn multi_flag_wraps_in_array() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("1"));
    let mut req = request(Method::Get, "/test/debug");
    req.flags.multi = true;
    let resp = rest_api(&ctx, &req);
    assert_eq!(resp.body, r#"[{"debug":"1"}]"#);
}

#[test]
fn typed_values_on_read() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("1"));
    let mut req = request(Method::Get, "/test/debug");
    req.flags.types = true;
    let resp = rest_api(&ctx, &req);
    assert_eq!(resp.body, r#"{"debug":1}"#);
}

#[test]
fn if_unmodified_since_precondition() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("1"));
    // A time well before boot: the stored timestamp is newer.
    let mut req = request_with_body(Method::Post, "/test", r#"{"debug": "0"}"#);
    req.if_unmodified_since = Some("Mon, 01 Jan 2001 00:00:00 GMT".to_string());
    let resp = rest_api(&ctx, &req);
    assert_eq!(resp.status, 412);
    assert_eq!(ctx.store.get("/test/debug"), Some("1".to_string()));
}

#[test]
fn if_match_precondition() {
    let ctx = context();
    ctx.store.set("/test/debug", Some("1"));
    let mut req = request_with_body(Method::Post, "/test/debug", "0");
    req.if_match = Some("DEADBEEF".to_string());
    let resp = rest_api(&ctx, &req);
    assert_eq!(resp.status, 412);

    let current = rest_api(&ctx, &request(Method::Get, "/test/debug")).etag.unwrap();
    let mut req = request_with_body(Method::Post, "/test/debug", "0");
    req.if_match = Some(format!("{:X}", current));
    let resp = rest_api(&ctx, &req);
    assert_eq!(resp.status, 204);
    assert_eq!(ctx.store.get("/test/debug"), Some("0".to_string()));
}

#[test]
fn get_on_readable_rpc_invokes_it() {
    let script = r#"
        return {
            {
                path = "/reboot",
                methods = { "GET", "POST" },
                handler = function(input, path, method)
                    return { status = method }
                end,
            },
        }
    "#;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ops.lua"), script).unwrap();
    let ctx = context_with_rpcs(grove_rest::rpc::RpcRegistry::load(dir.path()).unwrap());

    let resp = rest_api(&ctx, &request(Method::Get, "/reboot"));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, r#"{"status":"GET"}"#);
}
