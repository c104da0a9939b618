use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use super::test_router;

fn payload_body(region: &str) -> String {
    serde_json::json!({
        "region": region,
        "brand": {"name": "Acme"},
        "emailFirst": {"subject": "hi", "email_body": "body"},
        "max_creators": 5,
        "target_new_creators": 2,
    })
    .to_string()
}

#[tokio::test]
async fn health_check_is_reachable_without_a_key() {
    let app = test_router("secret").await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn submit_without_an_api_key_is_rejected_when_one_is_configured() {
    let app = test_router("secret").await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/tasks")
        .header("content-type", "application/json")
        .body(Body::from(payload_body("US")))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submit_then_get_round_trips_through_the_router() {
    let app = test_router("").await;

    let submit_request = Request::builder()
        .method("POST")
        .uri("/api/v1/tasks")
        .header("content-type", "application/json")
        .header("x-created-by", "tester")
        .body(Body::from(payload_body("US")))
        .unwrap();
    let submit_response = app.clone().oneshot(submit_request).await.unwrap();
    assert_eq!(submit_response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(submit_response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let task_id = json["task_id"].as_str().unwrap().to_string();

    let get_request =
        Request::builder().uri(format!("/api/v1/tasks/{task_id}")).body(Body::empty()).unwrap();
    let get_response = app.oneshot(get_request).await.unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(get_response.into_body(), usize::MAX).await.unwrap();
    let snapshot: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot["task_id"], task_id);
    assert_eq!(snapshot["region"], "US");
}

#[tokio::test]
async fn get_on_an_unknown_task_id_is_a_404() {
    let app = test_router("").await;
    let request = Request::builder().uri("/api/v1/tasks/0000000000").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn submit_with_a_missing_region_is_a_bad_request() {
    let app = test_router("").await;
    let bad_body = serde_json::json!({
        "brand": {"name": "Acme"},
        "emailFirst": {"subject": "hi", "email_body": "body"},
    })
    .to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/tasks")
        .header("content-type", "application/json")
        .body(Body::from(bad_body))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_surfaces_task_account_and_session_counts() {
    let app = test_router("").await;
    let request = Request::builder().uri("/api/v1/status").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["accounts"].is_array());
    assert!(json["sessions"]["max"].as_u64().is_some());
}

#[tokio::test]
async fn cancelling_an_unknown_task_surfaces_the_not_found_mapping() {
    let app = test_router("").await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/tasks/0000000000/cancel")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
