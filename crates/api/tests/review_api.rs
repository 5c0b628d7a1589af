//! Integration tests for `/api/v1/reviews`.

mod common;

use axum::http::{Method, StatusCode};
use common::{body_json, render_body, TestApp, ORG, REVIEWER};
use serde_json::json;

/// Submit and process a high-quality render, which always waits for a
/// human decision. Returns `(render_id, review_id)`.
async fn pending_review(app: &TestApp) -> (String, String) {
    let created = body_json(
        app.post("/api/v1/renders", render_body(1024, 1024, 90))
            .await,
    )
    .await;
    let render_id = created["data"]["id"].as_str().unwrap().to_string();
    app.process_next().await;

    let list = body_json(
        app.call_as_reviewer(Method::GET, "/api/v1/reviews?status=pending", None)
            .await,
    )
    .await;
    let review = list["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["render_id"] == render_id.as_str())
        .expect("pending review for the render")
        .clone();
    (render_id, review["id"].as_str().unwrap().to_string())
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_filters_by_status() {
    let app = common::build_test_app();
    app.provision(10).await;
    pending_review(&app).await;

    let pending = body_json(
        app.call_as_reviewer(Method::GET, "/api/v1/reviews?status=pending", None)
            .await,
    )
    .await;
    let approved = body_json(
        app.call_as_reviewer(Method::GET, "/api/v1/reviews?status=approved", None)
            .await,
    )
    .await;

    assert_eq!(pending["data"].as_array().unwrap().len(), 1);
    assert!(approved["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn get_review_returns_quality_details() {
    let app = common::build_test_app();
    app.provision(10).await;
    let (render_id, review_id) = pending_review(&app).await;

    let response = app
        .call_as_reviewer(Method::GET, &format!("/api/v1/reviews/{review_id}"), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["render_id"], render_id.as_str());
    assert_eq!(json["data"]["status"], "pending");
    assert_eq!(json["data"]["quality_score"], 1.0);
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approve_marks_render_approved_once() {
    let app = common::build_test_app();
    app.provision(10).await;
    let (render_id, review_id) = pending_review(&app).await;

    let response = app
        .call_as_reviewer(
            Method::POST,
            &format!("/api/v1/reviews/{review_id}/approve"),
            Some(json!({ "notes": "Looks great" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "approved");
    assert_eq!(json["data"]["reviewed_by"], REVIEWER);

    let render = body_json(app.get(&format!("/api/v1/renders/{render_id}")).await).await;
    assert_eq!(render["data"]["quality_status"], "approved");

    let again = app
        .call_as_reviewer(
            Method::POST,
            &format!("/api/v1/reviews/{review_id}/approve"),
            Some(json!({})),
        )
        .await;
    assert_eq!(again.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn reject_fails_render_without_refund() {
    let app = common::build_test_app();
    app.provision(10).await;
    let (render_id, review_id) = pending_review(&app).await;

    let response = app
        .call_as_reviewer(
            Method::POST,
            &format!("/api/v1/reviews/{review_id}/reject"),
            Some(json!({ "notes": "Patio overlaps the pool" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let render = body_json(app.get(&format!("/api/v1/renders/{render_id}")).await).await;
    assert_eq!(render["data"]["render_status"], "failed");
    assert_eq!(render["data"]["quality_status"], "rejected");
    assert_eq!(render["data"]["error"], "Patio overlaps the pool");

    let quota = body_json(app.get(&format!("/api/v1/organizations/{ORG}/quota")).await).await;
    assert_eq!(quota["data"]["used"], 2);
}

#[tokio::test]
async fn reject_without_notes_returns_400() {
    let app = common::build_test_app();
    app.provision(10).await;
    let (_, review_id) = pending_review(&app).await;

    let response = app
        .call_as_reviewer(
            Method::POST,
            &format!("/api/v1/reviews/{review_id}/reject"),
            Some(json!({ "notes": "   " })),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "validation_error");
}

#[tokio::test]
async fn unknown_review_returns_404() {
    let app = common::build_test_app();

    let response = app
        .call_as_reviewer(
            Method::POST,
            "/api/v1/reviews/missing/approve",
            Some(json!({})),
        )
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Access
// ---------------------------------------------------------------------------

#[tokio::test]
async fn members_cannot_list_reviews() {
    let app = common::build_test_app();

    let response = app.get("/api/v1/reviews").await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "forbidden");
}

#[tokio::test]
async fn members_cannot_decide_reviews() {
    let app = common::build_test_app();
    app.provision(10).await;
    let (render_id, review_id) = pending_review(&app).await;

    let approve = app
        .post(&format!("/api/v1/reviews/{review_id}/approve"), json!({}))
        .await;
    let reject = app
        .post(
            &format!("/api/v1/reviews/{review_id}/reject"),
            json!({ "notes": "Not mine to judge" }),
        )
        .await;
    assert_eq!(approve.status(), StatusCode::FORBIDDEN);
    assert_eq!(reject.status(), StatusCode::FORBIDDEN);

    let render = body_json(app.get(&format!("/api/v1/renders/{render_id}")).await).await;
    assert_eq!(render["data"]["quality_status"], "pending");
}

#[tokio::test]
async fn unknown_role_is_not_a_reviewer() {
    let app = common::build_test_app();
    let request = common::with_role(
        common::authed(Method::GET, "/api/v1/reviews", None, "mallory", ORG),
        "superuser",
    );

    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
