//! Browser reconciler behavior against a scripted daemon controller.

use std::time::Duration;

use lab::browser::{ActualState, DesiredState};
use lab::ports::PortKind;

mod common;
use common::{seed_project, test_app, test_app_with, wait_until, TestOptions};

/// Spawn a session and wait until its cluster is up.
async fn running_session(app: &common::TestApp) -> String {
    let project_id = seed_project(app, "demo", 0, &[3000]).await;
    let spawned = app
        .sessions
        .spawn_session(lab::session::SpawnRequest {
            project_id,
            title: Some("test".to_string()),
            initial_message: None,
        })
        .await
        .unwrap();
    let session_id = spawned.session.id;

    let sessions = app.sessions.clone();
    let id = session_id.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let sessions = sessions.clone();
            let id = id.clone();
            async move {
                sessions
                    .get_session(&id)
                    .await
                    .unwrap()
                    .map(|s| s.session.status.to_string() == "running")
                    .unwrap_or(false)
            }
        })
        .await
    );
    session_id
}

#[tokio::test]
async fn viewer_subscription_drives_daemon_to_running() {
    let app = test_app().await;
    let session_id = running_session(&app).await;

    app.browser.subscribe(&session_id).await.unwrap();

    // Two passes: StartDaemon, then WaitForReady observes readiness.
    app.browser.reconcile(&session_id).await.unwrap();
    app.browser.reconcile(&session_id).await.unwrap();

    let state = app
        .browser
        .state_repo()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.desired, DesiredState::Running);
    assert_eq!(state.actual, ActualState::Running);

    let port = state.stream_port_u16().expect("stream port assigned");
    assert!((9300..=9500).contains(&port));
    assert!(app.allocator.is_allocated(port, PortKind::Stream));
    assert_eq!(app.reservations.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn last_unsubscribe_debounces_then_stops() {
    let app = test_app_with(TestOptions {
        cleanup_delay: Duration::from_millis(30),
        ..TestOptions::default()
    })
    .await;
    let session_id = running_session(&app).await;

    app.browser.subscribe(&session_id).await.unwrap();
    app.browser.reconcile(&session_id).await.unwrap();
    app.browser.reconcile(&session_id).await.unwrap();
    let port = app
        .browser
        .state_repo()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap()
        .stream_port_u16()
        .unwrap();

    app.browser.unsubscribe(&session_id).await.unwrap();

    let browser = app.browser.clone();
    let id = session_id.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let browser = browser.clone();
            let id = id.clone();
            async move {
                let state = browser.state_repo().get(&id).await.unwrap().unwrap();
                state.desired == DesiredState::Stopped && state.actual == ActualState::Stopped
            }
        })
        .await,
        "daemon never stopped after debounce"
    );

    // The reservation went with it.
    assert!(!app.allocator.is_allocated(port, PortKind::Stream));
    assert!(app.reservations.list().await.unwrap().is_empty());
    let state = app
        .browser
        .state_repo()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.stream_port, None);
    assert_eq!(state.retry_count, 0);
}

#[tokio::test]
async fn resubscribe_within_debounce_keeps_daemon() {
    let app = test_app_with(TestOptions {
        cleanup_delay: Duration::from_millis(80),
        ..TestOptions::default()
    })
    .await;
    let session_id = running_session(&app).await;

    app.browser.subscribe(&session_id).await.unwrap();
    app.browser.reconcile(&session_id).await.unwrap();
    app.browser.reconcile(&session_id).await.unwrap();

    app.browser.unsubscribe(&session_id).await.unwrap();
    // A reload: the viewer comes right back.
    app.browser.subscribe(&session_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(160)).await;
    let state = app
        .browser
        .state_repo()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.desired, DesiredState::Running);
    assert_eq!(state.actual, ActualState::Running);
}

#[tokio::test]
async fn failing_daemon_parks_in_error_after_max_retries() {
    let app = test_app().await;
    let session_id = running_session(&app).await;
    app.controller.always_fail();

    app.browser.subscribe(&session_id).await.unwrap();

    // Each failed start needs a reset pass before the next attempt; give
    // the loop more than enough passes to exhaust the retry budget.
    for _ in 0..10 {
        app.browser.reconcile(&session_id).await.unwrap();
    }

    let state = app
        .browser
        .state_repo()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.actual, ActualState::Error);
    assert_eq!(state.retry_count, 3);
    assert!(state.error_message.is_some());
    assert_eq!(app.controller.starts(), 3, "start attempts beyond the cap");

    // Parked: further passes do nothing.
    app.browser.reconcile(&session_id).await.unwrap();
    assert_eq!(app.controller.starts(), 3);

    // An explicit reset re-arms the retry budget.
    app.browser.reset(&session_id).await.unwrap();
    app.browser.reconcile(&session_id).await.unwrap();
    assert_eq!(app.controller.starts(), 4);
}

#[tokio::test]
async fn vanished_daemon_recovers_to_stopped_then_restarts() {
    let app = test_app().await;
    let session_id = running_session(&app).await;

    app.browser.subscribe(&session_id).await.unwrap();
    app.browser.reconcile(&session_id).await.unwrap();
    app.browser.reconcile(&session_id).await.unwrap();

    // Daemon crashes out from under us.
    app.controller.kill(&session_id);
    app.browser.reconcile(&session_id).await.unwrap();

    let state = app
        .browser
        .state_repo()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.actual, ActualState::Stopped);
    assert_eq!(state.stream_port, None);
    assert!(app.reservations.list().await.unwrap().is_empty());

    // Still desired: the next pass starts it again.
    app.browser.reconcile(&session_id).await.unwrap();
    let state = app
        .browser
        .state_repo()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.actual, ActualState::Starting);
}

#[tokio::test]
async fn reconcile_of_converged_state_is_quiet() {
    let app = test_app().await;
    let session_id = running_session(&app).await;

    // Never subscribed: stopped/stopped.
    app.browser
        .state_repo()
        .get_or_create(&session_id)
        .await
        .unwrap();
    app.browser.reconcile(&session_id).await.unwrap();

    assert_eq!(app.controller.starts(), 0);
    let state = app
        .browser
        .state_repo()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.actual, ActualState::Stopped);
    assert!(state.stream_port.is_none());
}

#[tokio::test]
async fn stop_preserves_last_url_for_next_start() {
    let app = test_app().await;
    let session_id = running_session(&app).await;

    app.browser.subscribe(&session_id).await.unwrap();
    app.browser.reconcile(&session_id).await.unwrap();
    app.browser.reconcile(&session_id).await.unwrap();

    app.browser
        .navigate(&session_id, "http://example.test/docs")
        .await
        .unwrap();

    app.browser
        .state_repo()
        .set_desired(&session_id, DesiredState::Stopped)
        .await
        .unwrap();
    app.browser.reconcile(&session_id).await.unwrap();

    let state = app
        .browser
        .state_repo()
        .get(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.actual, ActualState::Stopped);
    assert_eq!(state.last_url.as_deref(), Some("http://example.test/docs"));
}
