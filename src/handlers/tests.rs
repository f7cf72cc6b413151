use super::*;
use axum::body::Body;
use axum::http::Request;
use tower::ServiceExt;

fn test_state(consumer: ConsumerState) -> (AppState, watch::Sender<ConsumerState>) {
    let (tx, rx) = watch::channel(consumer);
    let state = AppState {
        hub: Arc::new(BroadcastHub::default()),
        consumer_state: rx,
        write_timeout: Duration::from_secs(1),
    };
    (state, tx)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_running() {
    let (state, _tx) = test_state(ConsumerState::Running);
    let _a = state.hub.open().await.unwrap();
    let _b = state.hub.open().await.unwrap();

    let (status, json) = get_json(router(state, "/"), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["connections"], 2);
    assert_eq!(json["consumer"], "running");
}

#[tokio::test]
async fn test_health_reports_consumer_down() {
    let (state, tx) = test_state(ConsumerState::Running);
    tx.send_replace(ConsumerState::Connecting);

    let (status, json) = get_json(router(state, "/"), "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["connections"], 0);
    assert_eq!(json["consumer"], "connecting");
}

#[tokio::test]
async fn test_plain_get_on_upgrade_path_is_rejected() {
    let (state, _tx) = test_state(ConsumerState::Running);
    let app = router(state.clone(), "/");

    for uri in ["/", "/ws"] {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error(), "{} -> {}", uri, resp.status());
    }
    assert!(state.hub.is_empty().await);
}

#[tokio::test]
async fn test_custom_path_overlapping_ws_is_served_once() {
    let (state, _tx) = test_state(ConsumerState::Stopped);
    let app = router(state, "/ws");

    let req = Request::builder().uri("/").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
