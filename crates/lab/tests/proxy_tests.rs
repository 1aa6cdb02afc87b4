//! Subdomain proxy pass-through tests against a live upstream.

use axum::extract::ConnectInfo;
use axum::{body::Body, http::{header, Method, Request, StatusCode}, routing::get, Router};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;
use uuid::Uuid;

use lab::proxy::{proxy_app, ClusterContainer, ProxyContext, ProxyRouter};

const BASE: &str = "lab.test";

async fn upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = Router::new()
        .route("/foo", get(|| async { "hello" }))
        .route(
            "/echo-host",
            get(|req: Request<Body>| async move {
                req.headers()
                    .get(header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("none")
                    .to_string()
            }),
        )
        .route(
            "/echo-forwarded",
            get(|req: Request<Body>| async move {
                let value = |name: &str| {
                    req.headers()
                        .get(name)
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("none")
                        .to_string()
                };
                format!("{}|{}", value("x-forwarded-for"), value("x-forwarded-host"))
            }),
        );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn proxy_for(session_id: &str, container_port: u16, host_port: Option<u16>) -> axum::Router {
    let router = Arc::new(ProxyRouter::new(BASE));
    router.register_cluster(
        session_id,
        &format!("lab-{session_id}"),
        vec![ClusterContainer {
            container_id: "def".to_string(),
            hostname: "s-x-y".to_string(),
            ports: HashMap::from([(container_port, host_port)]),
        }],
    );
    proxy_app(ProxyContext::new(router, Duration::from_secs(5)))
}

async fn send(
    app: &axum::Router,
    method: Method,
    host: &str,
    path: &str,
) -> (StatusCode, axum::http::HeaderMap, String) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(path)
                .header(header::HOST, host)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    (status, headers, String::from_utf8_lossy(&bytes).to_string())
}

#[tokio::test]
async fn http_pass_through_with_cors() {
    let session_id = Uuid::new_v4().to_string();
    let port = upstream().await;
    let app = proxy_for(&session_id, 3000, Some(port));

    let host = format!("{session_id}--3000.{BASE}");
    let (status, headers, body) = send(&app, Method::GET, &host, "/foo").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello");
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
        "GET,POST,PUT,PATCH,DELETE,OPTIONS"
    );
}

#[tokio::test]
async fn host_header_is_rewritten_for_upstream() {
    let session_id = Uuid::new_v4().to_string();
    let port = upstream().await;
    let app = proxy_for(&session_id, 3000, Some(port));

    let host = format!("{session_id}--3000.{BASE}");
    let (status, _, body) = send(&app, Method::GET, &host, "/echo-host").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, format!("127.0.0.1:{port}"));
}

#[tokio::test]
async fn forwarded_headers_carry_peer_and_original_host() {
    let session_id = Uuid::new_v4().to_string();
    let port = upstream().await;
    let app = proxy_for(&session_id, 3000, Some(port));

    let host = format!("{session_id}--3000.{BASE}");
    let peer: SocketAddr = "198.51.100.4:49152".parse().unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/echo-forwarded")
                .header(header::HOST, &host)
                // A chain forged (or legitimately built) by an earlier hop
                // is preserved; the observed peer is appended after it.
                .header("x-forwarded-for", "203.0.113.7")
                .extension(ConnectInfo(peer))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024)
        .await
        .unwrap();
    let body = String::from_utf8_lossy(&bytes);
    assert_eq!(body, format!("203.0.113.7, 198.51.100.4|{host}"));
}

#[tokio::test]
async fn forwarded_for_starts_at_observed_peer_without_prior_chain() {
    let session_id = Uuid::new_v4().to_string();
    let port = upstream().await;
    let app = proxy_for(&session_id, 3000, Some(port));

    let host = format!("{session_id}--3000.{BASE}");
    let peer: SocketAddr = "198.51.100.4:49152".parse().unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/echo-forwarded")
                .header(header::HOST, &host)
                .extension(ConnectInfo(peer))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let bytes = axum::body::to_bytes(response.into_body(), 1024)
        .await
        .unwrap();
    let body = String::from_utf8_lossy(&bytes);
    assert_eq!(body, format!("198.51.100.4|{host}"));
}

#[tokio::test]
async fn options_preflight_short_circuits() {
    let session_id = Uuid::new_v4().to_string();
    let app = proxy_for(&session_id, 3000, Some(1));

    let host = format!("{session_id}--3000.{BASE}");
    let (status, headers, _) = send(&app, Method::OPTIONS, &host, "/anything").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
        "Content-Type, Authorization, X-Lab-Session-Id"
    );
}

#[tokio::test]
async fn invalid_subdomain_is_bad_request() {
    let session_id = Uuid::new_v4().to_string();
    let app = proxy_for(&session_id, 3000, Some(1));

    for host in [
        format!("not-a-uuid--3000.{BASE}"),
        format!("{session_id}.{BASE}"),
        format!("{session_id}--99999999.{BASE}"),
        "plain.other.domain".to_string(),
    ] {
        let (status, _, body) = send(&app, Method::GET, &host, "/").await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "host {host}");
        assert_eq!(body, "Invalid subdomain");
    }
}

#[tokio::test]
async fn unknown_session_or_port_is_not_found() {
    let session_id = Uuid::new_v4().to_string();
    let app = proxy_for(&session_id, 3000, Some(1));

    // Registered session, undeclared port.
    let host = format!("{session_id}--4000.{BASE}");
    let (status, _, body) = send(&app, Method::GET, &host, "/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Session or port not available");

    // Unregistered session.
    let other = Uuid::new_v4().to_string();
    let host = format!("{other}--3000.{BASE}");
    let (status, _, _) = send(&app, Method::GET, &host, "/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn dead_upstream_becomes_bad_gateway() {
    let session_id = Uuid::new_v4().to_string();
    // Port 1 on loopback: connection refused, exhausting the retries.
    let app = proxy_for(&session_id, 3000, Some(1));

    let host = format!("{session_id}--3000.{BASE}");
    let (status, headers, _) = send(&app, Method::GET, &host, "/").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    // Even failures carry CORS so browsers surface them.
    assert!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_some());
}
