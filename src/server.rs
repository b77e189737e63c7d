//!
//! grove-rest HTTP front-end
//! -------------------------
//! Axum-based listener translating HTTP requests into the method-handler
//! pipeline. Serves on a UNIX socket behind the reverse proxy (a TCP port
//! is supported for development with the FastCGI-style ":port" notation).
//!
//! Responsibilities:
//! - Content negotiation and per-request flag computation.
//! - Document-root routing for the permissive (/api) and RESTCONF
//!   (/restconf) surfaces.
//! - Streaming subscriptions (SSE and NDJSON) for event-stream GETs.
//! - Graceful shutdown on SIGINT/SIGTERM with socket-path cleanup.

use crate::error::RestError;
use crate::request::{
    negotiate, Accept, EncodingDefaults, FormatFlags, JsonHeaders, Method, Request, Response,
};
use crate::rest::{self, RestContext};
use crate::watch::{self, WatchRegistry};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response as HttpResponse;
use axum::Router;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tracing::{error, info};

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Server configuration resolved from the command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UNIX socket path, or ":port" for a TCP listener.
    pub listen: String,
    /// Document root for the permissive JSON-tree surface.
    pub api_root: String,
    /// Document root for the RESTCONF surface.
    pub restconf_root: String,
    pub defaults: EncodingDefaults,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "/var/run/grove-rest.sock".to_string(),
            api_root: "/api".to_string(),
            restconf_root: "/restconf".to_string(),
            defaults: EncodingDefaults::default(),
        }
    }
}

/// Shared server state injected into the dispatch handler.
#[derive(Clone)]
pub struct AppState {
    pub ctx: RestContext,
    pub watches: WatchRegistry,
    pub config: Arc<ServerConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

/// Run the listener until shutdown; in-flight requests complete, the
/// socket path is unlinked on the way out.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let listen = state.config.listen.clone();
    let app = router(state);

    if let Some(port) = listen.strip_prefix(':') {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        info!("starting server on {}", addr);
        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    } else {
        let path = PathBuf::from(&listen);
        let _ = std::fs::remove_file(&path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let listener = UnixListener::bind(&path)?;
        info!("starting server on {}", path.display());
        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
        let _ = std::fs::remove_file(&path);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn plain_response(status: u16, body: &str) -> HttpResponse {
    HttpResponse::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, "text/html")
        .body(Body::from(body.to_string()))
        .expect("static response")
}

fn error_http(flags: &FormatFlags, err: &RestError) -> HttpResponse {
    to_http(Response::from_error(flags, err))
}

fn to_http(resp: Response) -> HttpResponse {
    let mut builder = HttpResponse::builder()
        .status(StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, resp.content_type);
    if let Some(etag) = resp.etag {
        builder = builder.header(header::ETAG, format!("{:X}", etag));
    }
    if let Some(last_modified) = &resp.last_modified {
        builder = builder.header(header::LAST_MODIFIED, last_modified);
    }
    if let Some(location) = &resp.location {
        builder = builder.header(header::LOCATION, location);
    }
    if let Some(allow) = &resp.allow {
        builder = builder.header(header::ALLOW, allow);
    }
    if let Some(accept_patch) = resp.accept_patch {
        builder = builder.header("Accept-Patch", accept_patch);
    }
    builder.body(Body::from(resp.body)).unwrap_or_else(|e| {
        error!("response assembly failed: {}", e);
        plain_response(500, "internal error")
    })
}

/// Strip a document root from the decoded path; the remainder must be
/// empty or continue with '/' or '.' (schema dump suffixes).
fn strip_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(root)?;
    if rest.is_empty() || rest.starts_with('/') || rest.starts_with('.') {
        Some(rest)
    } else {
        None
    }
}

async fn dispatch(State(state): State<AppState>, req: axum::extract::Request) -> HttpResponse {
    let (parts, body) = req.into_parts();
    let headers = parts.headers;

    // Content negotiation from method, media types and extension headers.
    let json_headers = JsonHeaders {
        root: header_string(&headers, "x-json-root"),
        multi: header_string(&headers, "x-json-multi"),
        arrays: header_string(&headers, "x-json-array"),
        types: header_string(&headers, "x-json-types"),
        namespace: header_string(&headers, "x-json-namespace"),
        idref_values: header_string(&headers, "x-json-idref-values"),
        conditions: header_string(&headers, "x-json-conditions"),
    };
    let content_type = header_string(&headers, "content-type");
    let accept_header = header_string(&headers, "accept");
    let (method, accept, mut flags) = match negotiate(
        parts.method.as_str(),
        content_type.as_deref(),
        accept_header.as_deref(),
        &json_headers,
        state.config.defaults,
    ) {
        Ok(n) => n,
        Err(e) => return error_http(&FormatFlags::default(), &e),
    };

    // Percent-decode and route by document root.
    let raw_path = parts.uri.path();
    let decoded = urlencoding::decode(raw_path)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw_path.to_string());
    let query = parts.uri.query().map(|q| {
        urlencoding::decode(q).map(|s| s.into_owned()).unwrap_or_else(|_| q.to_string())
    });

    let (doc_root, rel_path) =
        if let Some(rest) = strip_root(&decoded, &state.config.restconf_root) {
            // The RESTCONF surface always speaks RESTCONF framing.
            if !flags.restconf {
                flags.restconf = true;
                flags.arrays = json_headers.arrays.as_deref() != Some("off");
                flags.types = json_headers.types.as_deref() != Some("off");
                flags.namespace = json_headers.namespace.as_deref() != Some("off");
                if method == Method::Put {
                    flags.put_replace = true;
                    flags.put_key_value = true;
                }
            }
            (state.config.restconf_root.clone(), rest.to_string())
        } else if let Some(rest) = strip_root(&decoded, &state.config.api_root) {
            (state.config.api_root.clone(), rest.to_string())
        } else {
            return plain_response(
                404,
                &format!("The requested URL {} was not found on this server.\n", decoded),
            );
        };

    let host = header_string(&headers, "x-forwarded-host")
        .or_else(|| header_string(&headers, "host"))
        .unwrap_or_else(|| "localhost".to_string());
    let (server_name, host_port) = match host.split_once(':') {
        Some((name, port)) => (name.to_string(), Some(port.to_string())),
        None => (host, None),
    };
    let server_port = header_string(&headers, "x-forwarded-port")
        .or(host_port)
        .unwrap_or_else(|| "443".to_string());
    let remote_addr = header_string(&headers, "x-forwarded-for")
        .map(|v| v.split(',').next().unwrap_or("").trim().to_string())
        .unwrap_or_else(|| "-".to_string());
    let remote_user = header_string(&headers, "remote-user").unwrap_or_default();

    let mut request = Request {
        method,
        accept,
        flags,
        path: rel_path,
        query,
        doc_root,
        if_match: header_string(&headers, "if-match"),
        if_none_match: header_string(&headers, "if-none-match"),
        if_modified_since: header_string(&headers, "if-modified-since"),
        if_unmodified_since: header_string(&headers, "if-unmodified-since"),
        server_name,
        server_port,
        remote_addr,
        remote_user,
        body: String::new(),
    };

    // Streaming subscriptions take over the response before the method
    // handlers run.
    if request.method == Method::Get
        && matches!(request.accept, Accept::EventStream | Accept::StreamJson)
    {
        // RESTCONF /data prefix also applies to streams.
        if request.flags.restconf {
            if let Some(rest) = request.path.strip_prefix("/data") {
                request.path = rest.to_string();
            }
        }
        let filter = request.query.as_deref().and_then(|q| {
            q.split('&')
                .find_map(|p| p.strip_prefix("filter=").map(str::to_string))
        });
        let sub = match watch::subscribe(&state.ctx, &state.watches, &request, filter) {
            Ok(sub) => sub,
            Err(_) => {
                return plain_response(
                    404,
                    &format!(
                        "The requested URL {} was not found on this server.\n",
                        request.path
                    ),
                );
            }
        };
        let content_type = sub.content_type();
        let stream = async_stream::stream! {
            let mut sub = sub;
            while let Some(frame) = sub.next_event().await {
                yield Ok::<Bytes, Infallible>(Bytes::from(frame));
            }
        };
        return HttpResponse::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| plain_response(500, "internal error"));
    }

    // Collect the request body up front.
    match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => request.body = String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            error!("failed to read request body: {}", e);
            return plain_response(400, "Error. Check device log for more detail\n");
        }
    }

    to_http(rest::rest_api(&state.ctx, &request))
}
