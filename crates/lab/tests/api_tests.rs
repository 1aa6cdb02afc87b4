//! API integration tests.

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

mod common;
use common::{seed_project, test_app, wait_until};

async fn request(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(method);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ))
    };
    (status, json)
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 64).await.unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn api_responses_carry_cors_headers() {
    let app = test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .header(header::ORIGIN, "http://studio.lab.test")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );

    // Preflight gets the method and header allowances.
    let preflight = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .method(Method::OPTIONS)
                .header(header::ORIGIN, "http://studio.lab.test")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        preflight
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );
    let methods = preflight
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_METHODS)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(methods.contains("POST"));
    assert!(methods.contains("DELETE"));
}

#[tokio::test]
async fn projects_list_includes_seeded_project() {
    let app = test_app().await;
    seed_project(&app, "demo", 0, &[3000]).await;

    let (status, body) = request(&app.router, Method::GET, "/projects", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["name"], "demo");
    assert_eq!(body[0]["containerCount"], 1);
}

#[tokio::test]
async fn create_session_returns_starting_containers() {
    let app = test_app().await;
    let project_id = seed_project(&app, "demo", 0, &[3000]).await;

    let (status, body) = request(
        &app.router,
        Method::POST,
        "/sessions",
        Some(json!({"projectId": project_id, "title": "  fix   login  "})),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "creating");
    assert_eq!(body["title"], "fix login");
    let containers = body["containers"].as_array().unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0]["status"], "starting");

    // Background initialization drives the session to running and
    // registers proxy routes.
    let session_id = body["id"].as_str().unwrap().to_string();
    let sessions = app.sessions.clone();
    let running = wait_until(Duration::from_secs(5), || {
        let sessions = sessions.clone();
        let session_id = session_id.clone();
        async move {
            sessions
                .get_session(&session_id)
                .await
                .unwrap()
                .map(|s| s.session.status.to_string() == "running")
                .unwrap_or(false)
        }
    })
    .await;
    assert!(running, "session never reached running");

    let urls = app.state.router.get_urls(&session_id);
    assert_eq!(urls.len(), 1);
    assert_eq!(urls[0].container_port, 3000);
    assert_eq!(
        urls[0].url,
        format!("http://{session_id}--3000.{}", common::BASE_DOMAIN)
    );
}

#[tokio::test]
async fn create_session_without_definitions_is_rejected() {
    let app = test_app().await;
    let project = app
        .sessions
        .project_repo()
        .create("empty", None, 0, &[])
        .await
        .unwrap();

    let (status, body) = request(
        &app.router,
        Method::POST,
        "/sessions",
        Some(json!({"projectId": project.id})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("no container definitions"));
}

#[tokio::test]
async fn create_session_unknown_project_is_not_found() {
    let app = test_app().await;
    let (status, _) = request(
        &app.router,
        Method::POST,
        "/sessions",
        Some(json!({"projectId": "nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_session_unknown_is_not_found() {
    let app = test_app().await;
    let (status, body) = request(&app.router, Method::GET, "/sessions/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn patch_session_updates_title_and_agent_id() {
    let app = test_app().await;
    let project_id = seed_project(&app, "demo", 0, &[3000]).await;
    let (_, created) = request(
        &app.router,
        Method::POST,
        "/sessions",
        Some(json!({"projectId": project_id})),
    )
    .await;
    let session_id = created["id"].as_str().unwrap();

    let (status, body) = request(
        &app.router,
        Method::PATCH,
        &format!("/sessions/{session_id}"),
        Some(json!({"title": "renamed", "agentSessionId": "acp-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "renamed");
    assert_eq!(body["agentSessionId"], "acp-1");
}

#[tokio::test]
async fn delete_session_returns_no_content_and_cleans_up() {
    let app = test_app().await;
    let project_id = seed_project(&app, "demo", 0, &[3000]).await;
    let (_, created) = request(
        &app.router,
        Method::POST,
        "/sessions",
        Some(json!({"projectId": project_id})),
    )
    .await;
    let session_id = created["id"].as_str().unwrap().to_string();

    let (status, _) = request(
        &app.router,
        Method::DELETE,
        &format!("/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let sessions = app.sessions.clone();
    let gone = wait_until(Duration::from_secs(5), || {
        let sessions = sessions.clone();
        let session_id = session_id.clone();
        async move { sessions.get_session(&session_id).await.unwrap().is_none() }
    })
    .await;
    assert!(gone, "session row survived cleanup");
    assert!(app.state.router.get_urls(&session_id).is_empty());
}

#[tokio::test]
async fn orchestrate_accepts_and_resolves_a_session() {
    let app = test_app().await;
    seed_project(&app, "demo", 0, &[3000]).await;

    let (status, body) = request(
        &app.router,
        Method::POST,
        "/orchestrate",
        Some(json!({"content": "add a login page to demo"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let orchestration_id = body["orchestrationId"].as_str().unwrap().to_string();

    let orchestration = app.state.orchestration.clone();
    let complete = wait_until(Duration::from_secs(5), || {
        let orchestration = orchestration.clone();
        let id = orchestration_id.clone();
        async move {
            orchestration
                .status_snapshot(&id)
                .await
                .unwrap()
                .map(|view| view.status == "complete")
                .unwrap_or(false)
        }
    })
    .await;
    assert!(complete, "orchestration never completed");

    let view = app
        .state
        .orchestration
        .status_snapshot(&orchestration_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.project_name.as_deref(), Some("demo"));
    assert!(view.session_id.is_some());
}

#[tokio::test]
async fn orchestrate_rejects_empty_content() {
    let app = test_app().await;
    let (status, _) = request(
        &app.router,
        Method::POST,
        "/orchestrate",
        Some(json!({"content": "   "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn github_settings_roundtrip() {
    let app = test_app().await;

    let (status, body) = request(&app.router, Method::GET, "/github/settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["configured"], false);

    let (status, body) = request(
        &app.router,
        Method::POST,
        "/github/settings",
        Some(json!({"token": "ghp_secret", "username": "octocat"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["configured"], true);
    assert_eq!(body["username"], "octocat");
    assert!(body.get("token").is_none(), "token must never be echoed");

    let (status, _) = request(&app.router, Method::DELETE, "/github/settings", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = request(&app.router, Method::GET, "/github/settings", None).await;
    assert_eq!(body["configured"], false);
}
