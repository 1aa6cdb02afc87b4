//! The proxy listener: request entry, CORS injection, upstream forwarding.

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, Request, State, WebSocketUpgrade},
    http::{header, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, error, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::router::ProxyRouter;
use super::websocket::relay_to_upstream;

/// Connect retry backoff schedule after the initial attempt.
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_millis(50), Duration::from_millis(200)];

/// Largest request body the proxy will buffer.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Shared state for the proxy listener.
#[derive(Clone)]
pub struct ProxyContext {
    pub router: Arc<ProxyRouter>,
    pub http_client: Client<HttpConnector, Body>,
    pub idle_timeout: Duration,
}

impl ProxyContext {
    pub fn new(router: Arc<ProxyRouter>, idle_timeout: Duration) -> Self {
        let http_client: Client<HttpConnector, Body> =
            Client::builder(TokioExecutor::new()).build_http();
        Self {
            router,
            http_client,
            idle_timeout,
        }
    }
}

/// Build the proxy application: every request funnels through one handler.
pub fn proxy_app(ctx: ProxyContext) -> Router {
    Router::new().fallback(proxy_entry).with_state(ctx)
}

/// Append the permissive CORS headers every proxied response carries.
fn apply_cors(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,PUT,PATCH,DELETE,OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, X-Lab-Session-Id"),
    );
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let mut response = (status, message.to_string()).into_response();
    apply_cors(&mut response);
    response
}

fn wants_websocket(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

async fn proxy_entry(State(ctx): State<ProxyContext>, req: Request<Body>) -> Response {
    // Preflight succeeds unconditionally.
    if req.method() == Method::OPTIONS {
        return error_response(StatusCode::NO_CONTENT, "");
    }

    let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
    else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid subdomain");
    };

    let (session_id, port) = match ctx.router.parse_host(&host) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!("host rejected: {err}");
            return error_response(StatusCode::BAD_REQUEST, "Invalid subdomain");
        }
    };

    let Some(upstream) = ctx.router.resolve(&session_id, port) else {
        return error_response(StatusCode::NOT_FOUND, "Session or port not available");
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if wants_websocket(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &ctx).await {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };
        let target = format!(
            "ws://{}:{}{}",
            upstream.host, upstream.port, path_and_query
        );
        let idle_timeout = ctx.idle_timeout;
        let session = session_id.clone();
        let mut response = ws.on_upgrade(move |socket| async move {
            if let Err(err) = relay_to_upstream(socket, target, idle_timeout).await {
                warn!("websocket relay for session {session} ended: {err:#}");
            }
        });
        apply_cors(&mut response);
        return response;
    }

    // The serve loop registers the TCP peer; without it (in-process tests)
    // the forwarded-for chain is left as received.
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    match forward_http(&ctx, req, &upstream.host, upstream.port, &path_and_query, &host, peer_ip)
        .await
    {
        Ok(mut response) => {
            apply_cors(&mut response);
            response
        }
        Err(status) => {
            let message = match status {
                StatusCode::BAD_GATEWAY => "Upstream unavailable",
                _ => "Proxy failure",
            };
            error_response(status, message)
        }
    }
}

/// Extend an `X-Forwarded-For` chain with the observed peer.
///
/// The convention is append-only: hops a client (or earlier proxy) already
/// recorded are preserved, and the address we saw on the wire goes last.
fn forwarded_for_chain(existing: Option<&HeaderValue>, peer_ip: Option<&str>) -> Option<String> {
    let existing = existing.and_then(|value| value.to_str().ok());
    match (existing, peer_ip) {
        (Some(chain), Some(peer)) => Some(format!("{chain}, {peer}")),
        (Some(chain), None) => Some(chain.to_string()),
        (None, Some(peer)) => Some(peer.to_string()),
        (None, None) => None,
    }
}

/// Forward one HTTP request, retrying connect failures on the backoff
/// schedule before giving up with 502.
async fn forward_http(
    ctx: &ProxyContext,
    req: Request<Body>,
    host: &str,
    port: u16,
    path_and_query: &str,
    client_host: &str,
    peer_ip: Option<String>,
) -> Result<Response, StatusCode> {
    let target: Uri = format!("http://{host}:{port}{path_and_query}")
        .parse()
        .map_err(|err| {
            error!("invalid upstream uri: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|err| {
            warn!("failed to buffer proxy body: {err}");
            StatusCode::BAD_GATEWAY
        })?;

    let forwarded_for = forwarded_for_chain(
        parts.headers.get("x-forwarded-for"),
        peer_ip.as_deref(),
    );

    let mut attempt = 0;
    loop {
        let mut forwarded = Request::builder()
            .method(parts.method.clone())
            .uri(target.clone())
            .version(parts.version)
            .body(Body::from(body_bytes.clone()))
            .map_err(|err| {
                error!("failed to build forwarded request: {err}");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;

        *forwarded.headers_mut() = parts.headers.clone();
        let headers = forwarded.headers_mut();
        // The client's Host names the proxy; the upstream gets its own,
        // with the original preserved as X-Forwarded-Host.
        headers.remove(header::HOST);
        if let Some(authority) = target.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(header::HOST, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(client_host) {
            headers.insert("x-forwarded-host", value);
        }
        if let Some(ref chain) = forwarded_for {
            if let Ok(value) = HeaderValue::from_str(chain) {
                headers.insert("x-forwarded-for", value);
            }
        }

        let result = tokio::time::timeout(ctx.idle_timeout, ctx.http_client.request(forwarded)).await;

        match result {
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                return Ok(Response::from_parts(parts, Body::new(body)));
            }
            Ok(Err(err)) if err.is_connect() && attempt < RETRY_BACKOFF.len() => {
                debug!(
                    "upstream connect failed (attempt {}): {err}; retrying",
                    attempt + 1
                );
                tokio::time::sleep(RETRY_BACKOFF[attempt]).await;
                attempt += 1;
            }
            Ok(Err(err)) => {
                warn!("proxy request to {target} failed: {err}");
                return Err(StatusCode::BAD_GATEWAY);
            }
            Err(_) => {
                warn!("proxy request to {target} timed out");
                return Err(StatusCode::BAD_GATEWAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(raw: &str) -> HeaderValue {
        HeaderValue::from_str(raw).unwrap()
    }

    #[test]
    fn forwarded_for_appends_peer_to_existing_chain() {
        let existing = value("203.0.113.7");
        let chain = forwarded_for_chain(Some(&existing), Some("10.0.0.9"));
        assert_eq!(chain.as_deref(), Some("203.0.113.7, 10.0.0.9"));
    }

    #[test]
    fn forwarded_for_starts_chain_from_peer() {
        assert_eq!(
            forwarded_for_chain(None, Some("10.0.0.9")).as_deref(),
            Some("10.0.0.9")
        );
    }

    #[test]
    fn forwarded_for_without_peer_keeps_existing() {
        let existing = value("203.0.113.7, 10.0.0.1");
        assert_eq!(
            forwarded_for_chain(Some(&existing), None).as_deref(),
            Some("203.0.113.7, 10.0.0.1")
        );
        assert_eq!(forwarded_for_chain(None, None), None);
    }
}
