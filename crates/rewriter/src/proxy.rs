//! The transparent proxy: transforms requests toward the upstream API and
//! responses on their way back, streaming watch events frame by frame.

use std::convert::Infallible;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use http::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, HOST};
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Server};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use tracing::{debug, info, warn};

use crate::patches::rewrite_patch;
use crate::rewriter::rewrite_payload;
use crate::rules::RewriteRules;
use crate::stream::{is_clean_stream_end, rewrite_watch_frame, FrameDecoder};
use crate::target::{rename_query, PathTarget, RequestClass};
use crate::{Action, RewriteError};

/// Bound on the initial upstream sync at startup.
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(600);

const UPSTREAM_PROBE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
    #[error("upstream sync timed out after {0:?}")]
    UpstreamSyncTimeout(Duration),

    #[error("upstream endpoint is unusable: {0}")]
    BadUpstream(String),

    #[error(transparent)]
    Http(#[from] hyper::Error),
}

/// Which leg of the traffic this proxy instance carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Clients → API server: rename requests, restore responses.
    Api,
    /// API server → webhook backend: restore admission reviews in, fix
    /// their patches on the way out.
    Webhook,
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub upstream: Uri,
    pub mode: ProxyMode,
}

type HttpClient = Client<HttpsConnector<hyper::client::HttpConnector>, Body>;

pub struct ProxyState {
    rules: Arc<RewriteRules>,
    client: HttpClient,
    upstream: Uri,
    mode: ProxyMode,
}

impl ProxyState {
    pub fn new(rules: Arc<RewriteRules>, upstream: Uri, mode: ProxyMode) -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        ProxyState {
            rules,
            client: Client::builder().build(connector),
            upstream,
            mode,
        }
    }
}

/// Runs the proxy until the surrounding task is cancelled. Traffic is
/// accepted only after the upstream answers, bounded by
/// [`CACHE_SYNC_TIMEOUT`].
pub async fn serve(state: Arc<ProxyState>, listen: SocketAddr) -> Result<(), ServeError> {
    wait_for_upstream(&state).await?;
    info!(addr = %listen, "starting API rewriter proxy");
    let make = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(state, req).await) }
            }))
        }
    });
    Server::bind(&listen).serve(make).await.map_err(ServeError::from)
}

/// Initial upstream sync: probe the readiness endpoint until anything
/// answers. Any HTTP status counts; only transport failures keep waiting.
async fn wait_for_upstream(state: &ProxyState) -> Result<(), ServeError> {
    let uri = upstream_uri(&state.upstream, "/readyz").map_err(ServeError::BadUpstream)?;
    let probe = async {
        loop {
            match state.client.get(uri.clone()).await {
                Ok(resp) => {
                    info!(upstream = %state.upstream, status = %resp.status(), "upstream reachable");
                    return;
                }
                Err(err) => {
                    debug!(upstream = %state.upstream, error = %err, "upstream not reachable yet");
                    tokio::time::sleep(UPSTREAM_PROBE_INTERVAL).await;
                }
            }
        }
    };
    tokio::time::timeout(CACHE_SYNC_TIMEOUT, probe)
        .await
        .map_err(|_| ServeError::UpstreamSyncTimeout(CACHE_SYNC_TIMEOUT))
}

async fn handle(state: Arc<ProxyState>, req: Request<Body>) -> Response<Body> {
    match state.mode {
        ProxyMode::Api => handle_api(state, req).await,
        ProxyMode::Webhook => handle_webhook(state, req).await,
    }
}

async fn handle_api(state: Arc<ProxyState>, req: Request<Body>) -> Response<Body> {
    let (mut parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    let target = match PathTarget::parse(&state.rules, &path, query.as_deref()) {
        Ok(target) => target,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "BadRequest", &err.to_string()),
    };

    let body_bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, "BadRequest", &err.to_string())
        }
    };

    let rewritten_body = if body_bytes.is_empty() {
        None
    } else if parts.method == Method::PATCH {
        match rewrite_patch(&state.rules, Action::Rename, &body_bytes) {
            Ok(rewritten) => rewritten,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, "BadRequest", &err.to_string())
            }
        }
    } else {
        match rewrite_payload(&state.rules, Action::Rename, &body_bytes) {
            Ok(rewritten) => rewritten,
            Err(RewriteError::SkipItem) => None,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, "BadRequest", &err.to_string())
            }
        }
    };
    let out_body = rewritten_body.unwrap_or_else(|| body_bytes.to_vec());

    let new_path = target.rename_path(&state.rules);
    let new_query = query
        .as_deref()
        .map(|q| rename_query(&state.rules, &target, q))
        .filter(|q| !q.is_empty());
    let path_and_query = match &new_query {
        Some(q) => format!("{}?{}", new_path, q),
        None => new_path,
    };
    let uri = match upstream_uri(&state.upstream, &path_and_query) {
        Ok(uri) => uri,
        Err(message) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", &message)
        }
    };
    parts.uri = uri;

    parts.headers.remove(CONTENT_LENGTH);
    if !out_body.is_empty() {
        parts
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(out_body.len() as u64));
    }
    if let Some(authority) = state.upstream.authority() {
        if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
            parts.headers.insert(HOST, host);
        }
    }
    if target.is_watch {
        // Watch frames are rewritten one at a time; compressed or
        // non-JSON streams would make that impossible.
        parts.headers.remove(ACCEPT_ENCODING);
        if target.class() == RequestClass::Core {
            parts
                .headers
                .insert(ACCEPT, HeaderValue::from_static("application/json"));
        }
    }

    let upstream_req = Request::from_parts(parts, Body::from(out_body));
    let upstream_resp = match state.client.request(upstream_req).await {
        Ok(resp) => resp,
        Err(err) => {
            return error_response(StatusCode::BAD_GATEWAY, "ServiceUnavailable", &err.to_string())
        }
    };

    if target.is_watch && upstream_resp.status() == StatusCode::OK {
        return stream_watch_response(state, upstream_resp);
    }
    transform_response(&state, upstream_resp).await
}

/// Buffered response path: decode, restore, fix headers.
async fn transform_response(state: &ProxyState, resp: Response<Body>) -> Response<Body> {
    let (mut parts, body) = resp.into_parts();
    let bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(StatusCode::BAD_GATEWAY, "ServiceUnavailable", &err.to_string())
        }
    };

    let encoding = parts
        .headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_lowercase);
    let decoded = match decode_body(encoding.as_deref(), &bytes) {
        Ok(decoded) => decoded,
        Err(err) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                "ServiceUnavailable",
                &format!("content decoding failed: {}", err),
            )
        }
    };

    let rewritten = match rewrite_payload(&state.rules, Action::Restore, &decoded) {
        Ok(rewritten) => rewritten,
        Err(RewriteError::SkipItem) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "NotFound",
                "the requested resource is not served",
            )
        }
        Err(err) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", &err.to_string())
        }
    };

    // Whether rewritten or passed through raw, the body leaves decoded.
    let out = rewritten.unwrap_or(decoded);
    parts.headers.remove(CONTENT_ENCODING);
    parts.headers.remove(CONTENT_LENGTH);
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(out.len() as u64));
    Response::from_parts(parts, Body::from(out))
}

/// Streaming watch path: each upstream frame is restored and flushed to
/// the client immediately.
fn stream_watch_response(state: Arc<ProxyState>, resp: Response<Body>) -> Response<Body> {
    let (mut parts, mut upstream_body) = resp.into_parts();
    parts.headers.remove(CONTENT_LENGTH);
    parts.headers.remove(CONTENT_ENCODING);

    let (mut sender, client_body) = Body::channel();
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        while let Some(chunk) = upstream_body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let message = err.to_string();
                    if is_clean_stream_end(&message) {
                        debug!("watch stream ended: {}", message);
                    } else {
                        warn!(error = %message, "watch stream failed");
                    }
                    return;
                }
            };
            decoder.push(&chunk);
            while let Some(frame) = decoder.next_frame() {
                let rewritten = match rewrite_watch_frame(&state.rules, Action::Restore, &frame) {
                    Ok(rewritten) => rewritten,
                    Err(err) => {
                        warn!(error = %err, "terminating watch on bad frame");
                        return;
                    }
                };
                // send_data flushes the frame to the client before the
                // next upstream read.
                if sender.send_data(rewritten.into()).await.is_err() {
                    debug!("watch client went away");
                    return;
                }
            }
        }
    });

    Response::from_parts(parts, client_body)
}

async fn handle_webhook(state: Arc<ProxyState>, req: Request<Body>) -> Response<Body> {
    let (mut parts, body) = req.into_parts();
    let bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, "BadRequest", &err.to_string())
        }
    };

    let rewritten = match rewrite_payload(&state.rules, Action::Restore, &bytes) {
        Ok(rewritten) => rewritten,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, "BadRequest", &err.to_string())
        }
    };
    let out = rewritten.unwrap_or_else(|| bytes.to_vec());

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = match upstream_uri(&state.upstream, &path_and_query) {
        Ok(uri) => uri,
        Err(message) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", &message)
        }
    };
    parts.headers.remove(CONTENT_LENGTH);
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(out.len() as u64));

    let upstream_req = Request::from_parts(parts, Body::from(out));
    let resp = match state.client.request(upstream_req).await {
        Ok(resp) => resp,
        Err(err) => {
            return error_response(StatusCode::BAD_GATEWAY, "ServiceUnavailable", &err.to_string())
        }
    };

    let (mut parts, body) = resp.into_parts();
    let bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(StatusCode::BAD_GATEWAY, "ServiceUnavailable", &err.to_string())
        }
    };
    let rewritten = match rewrite_payload(&state.rules, Action::Restore, &bytes) {
        Ok(rewritten) => rewritten,
        Err(err) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", &err.to_string())
        }
    };
    let out = rewritten.unwrap_or_else(|| bytes.to_vec());
    parts.headers.remove(CONTENT_LENGTH);
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(out.len() as u64));
    Response::from_parts(parts, Body::from(out))
}

fn upstream_uri(upstream: &Uri, path_and_query: &str) -> Result<Uri, String> {
    let mut builder = Uri::builder();
    if let Some(scheme) = upstream.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = upstream.authority() {
        builder = builder.authority(authority.clone());
    }
    builder
        .path_and_query(path_and_query)
        .build()
        .map_err(|err| err.to_string())
}

fn decode_body(encoding: Option<&str>, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding {
        Some("gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(bytes).read_to_end(&mut out)?;
            Ok(out)
        }
        Some("deflate") => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(bytes).read_to_end(&mut out)?;
            Ok(out)
        }
        _ => Ok(bytes.to_vec()),
    }
}

/// Conventional Kubernetes Status body.
fn error_response(code: StatusCode, reason: &str, message: &str) -> Response<Body> {
    let status = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code.as_u16(),
    });
    let body = serde_json::to_vec(&status).unwrap_or_default();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = code;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}
