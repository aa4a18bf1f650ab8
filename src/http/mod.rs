// src/http/mod.rs
//! HTTP surface: the rate-limited demo endpoints and read-only monitoring routes.

mod service;


pub use service::{RateLimitingService, RUN1_KEY, RUN2_KEY, SUCCESS_MESSAGE};

use hyper::header::{ALLOW, CONTENT_TYPE, RETRY_AFTER};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache_stats::CacheStatisticsReporter;
use crate::code_cache::CodeCacheService;
use crate::error::{RateLimiterError, Result};
use crate::storage::StorageBackend;

/// Everything the request handlers share
#[derive(Debug)]
pub struct AppState<S>
where
    S: StorageBackend,
{
    pub service: RateLimitingService<S>,
    pub reporter: CacheStatisticsReporter,
    pub codes: Arc<CodeCacheService>,
}

/// Serves requests on `addr` until `shutdown` resolves
pub async fn serve<S>(
    addr: SocketAddr,
    state: Arc<AppState<S>>,
    shutdown: impl Future<Output = ()>,
) -> Result<()>
where
    S: StorageBackend + 'static,
{
    let make_svc = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(route(req, &state).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| RateLimiterError::Config(format!("cannot bind {}: {}", addr, e)))?
        .serve(make_svc);

    info!(%addr, "HTTP server listening");

    server
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| RateLimiterError::Internal(format!("HTTP server error: {}", e)))?;

    info!("HTTP server stopped");
    Ok(())
}

enum Endpoint<'a> {
    Run1,
    Run2,
    CacheStats,
    Codes(&'a str),
}

impl<'a> Endpoint<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/test/1" => Some(Endpoint::Run1),
            "/test/2" => Some(Endpoint::Run2),
            "/api/monitor/cache/stats" => Some(Endpoint::CacheStats),
            other => match other.strip_prefix("/api/codes/") {
                Some(group) if !group.is_empty() && !group.contains('/') => {
                    Some(Endpoint::Codes(group))
                }
                _ => None,
            },
        }
    }
}

/// Dispatches one request
pub async fn route<S>(req: Request<Body>, state: &AppState<S>) -> Response<Body>
where
    S: StorageBackend,
{
    let Some(endpoint) = Endpoint::parse(req.uri().path()) else {
        return not_found();
    };
    if req.method() != Method::GET {
        return method_not_allowed();
    }

    let result = match endpoint {
        Endpoint::Run1 => state.service.run1().await.map(text),
        Endpoint::Run2 => state.service.run2().await.map(text),
        Endpoint::CacheStats => json(StatusCode::OK, &state.reporter.get_cache_statistics()),
        Endpoint::Codes(raw) => match percent_decode(raw) {
            Some(group) => codes_in_group(&state.codes, &group).await,
            None => return bad_request("code group is not valid percent-encoded UTF-8"),
        },
    };

    result.unwrap_or_else(|err| error_response(&err))
}

/// Decodes `%XX` escapes in a path segment. `None` if the result is not UTF-8.
fn percent_decode(raw: &str) -> Option<String> {
    fn hex(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = match bytes.get(i..i + 3) {
            Some([b'%', hi, lo]) => hex(*hi).zip(hex(*lo)).map(|(hi, lo)| hi << 4 | lo),
            _ => None,
        };
        match escaped {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            // Malformed escapes stay literal
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }

    String::from_utf8(out).ok()
}

fn text(body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>> {
    let body = serde_json::to_vec(body)?;
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| RateLimiterError::Internal(e.to_string()))
}

fn status_of(err: &RateLimiterError) -> StatusCode {
    match err {
        RateLimiterError::LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        RateLimiterError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        RateLimiterError::Config(_) | RateLimiterError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Maps an error to a JSON `{error, message}` response
pub fn error_response(err: &RateLimiterError) -> Response<Body> {
    let status = status_of(err);
    let kind = match err {
        RateLimiterError::LimitExceeded { .. } => "rate_limit_exceeded",
        RateLimiterError::Storage(_) => "storage_unavailable",
        RateLimiterError::Config(_) => "config_error",
        RateLimiterError::Internal(_) => "internal_error",
    };
    if status.is_server_error() {
        warn!(error = %err, status = status.as_u16(), "Request failed");
    }

    let body = serde_json::json!({
        "error": kind,
        "message": err.to_string(),
    });

    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json");
    if let RateLimiterError::LimitExceeded { retry_after, .. } = err {
        builder = builder.header(RETRY_AFTER, retry_after_secs(*retry_after));
    }

    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

/// Whole seconds, rounded up, never below one
fn retry_after_secs(wait: std::time::Duration) -> u64 {
    let millis = wait.as_millis() as u64;
    millis.div_ceil(1000).max(1)
}

fn not_found() -> Response<Body> {
    plain_error(StatusCode::NOT_FOUND, "not_found", "Not Found")
}

fn method_not_allowed() -> Response<Body> {
    let mut response = plain_error(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        "Only GET is supported",
    );
    response
        .headers_mut()
        .insert(ALLOW, hyper::header::HeaderValue::from_static("GET"));
    response
}

fn bad_request(message: &str) -> Response<Body> {
    plain_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn plain_error(status: StatusCode, kind: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({ "error": kind, "message": message });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
