//! HTTP contract tests for the guarded purchase, wallet, dispute and admin
//! endpoints.
//!
//! Requests go through the real router with `tower::ServiceExt::oneshot`;
//! storage is in memory, so no external services are needed.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

mod common;

use axum::body::Body;
use axum::http::StatusCode;
use serde_json::json;

use common::{TestApp, build_app, list_material, new_key, request, send, send_json};
use escrow_gateway::domain::UserId;

async fn deposit(app: &TestApp, user: UserId, amount: i64) {
    let (status, _, _) = send_json(
        app,
        request("POST", "/wallet/deposit", Some(user), false),
        Some(&new_key()),
        json!({ "amount": amount }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

async fn wallet(app: &TestApp, user: UserId) -> (i64, i64) {
    let (status, _, body) = send(
        app,
        request("GET", "/wallet", Some(user), false)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    (
        body["available"].as_i64().unwrap(),
        body["escrow"].as_i64().unwrap(),
    )
}

async fn purchase(
    app: &TestApp,
    buyer: UserId,
    material_id: uuid::Uuid,
    key: &str,
) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
    send_json(
        app,
        request("POST", "/marketplace/purchase", Some(buyer), false),
        Some(key),
        json!({ "material_id": material_id }),
    )
    .await
}

// == Guarded purchase ==========================================================

#[tokio::test]
async fn purchase_moves_funds_into_escrow() {
    let app = build_app();
    let (buyer, seller) = (UserId::new(), UserId::new());
    let material = list_material(&app, seller, 1_000).await;
    deposit(&app, buyer, 5_000).await;

    let (status, headers, body) = purchase(&app, buyer, material, &new_key()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("x-idempotent-replay").is_none());
    let tx = &body["transaction"];
    assert_eq!(tx["status"], "escrow_hold");
    assert_eq!(tx["type"], "purchase");
    assert_eq!(tx["amount"], 1_000);
    assert_eq!(tx["platform_fee"], 100);
    assert_eq!(tx["net_amount"], 900);
    assert!(body["escrow_release_at"].is_string());
    assert!(
        body["file_url"]
            .as_str()
            .is_some_and(|url| url.ends_with(&format!("materials/{material}.pdf")))
    );

    assert_eq!(wallet(&app, buyer).await, (4_000, 0));
    assert_eq!(wallet(&app, seller).await, (0, 900));
}

#[tokio::test]
async fn repeated_key_replays_without_charging_twice() {
    let app = build_app();
    let (buyer, seller) = (UserId::new(), UserId::new());
    let material = list_material(&app, seller, 1_000).await;
    deposit(&app, buyer, 5_000).await;
    let key = new_key();

    let (first_status, _, first) = purchase(&app, buyer, material, &key).await;
    let (second_status, headers, second) = purchase(&app, buyer, material, &key).await;

    assert_eq!(first_status, StatusCode::OK);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(
        headers.get("x-idempotent-replay").and_then(|v| v.to_str().ok()),
        Some("true")
    );
    assert_eq!(first, second);
    assert_eq!(wallet(&app, buyer).await, (4_000, 0));
}

#[tokio::test]
async fn keys_are_scoped_per_user() {
    let app = build_app();
    let (alice, bob, seller) = (UserId::new(), UserId::new(), UserId::new());
    let material = list_material(&app, seller, 1_000).await;
    deposit(&app, alice, 2_000).await;
    deposit(&app, bob, 2_000).await;
    let key = new_key();

    let (_, _, first) = purchase(&app, alice, material, &key).await;
    let (status, headers, second) = purchase(&app, bob, material, &key).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("x-idempotent-replay").is_none());
    assert_ne!(first["transaction"]["id"], second["transaction"]["id"]);
    assert_eq!(wallet(&app, seller).await, (0, 1_800));
}

#[tokio::test]
async fn failed_purchase_releases_the_key() {
    let app = build_app();
    let (buyer, seller) = (UserId::new(), UserId::new());
    let material = list_material(&app, seller, 1_000).await;
    deposit(&app, buyer, 500).await;
    let key = new_key();

    let (status, _, body) = purchase(&app, buyer, material, &key).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INSUFFICIENT_FUNDS");
    assert_eq!(wallet(&app, buyer).await, (500, 0));

    deposit(&app, buyer, 500).await;
    let (status, headers, _) = purchase(&app, buyer, material, &key).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("x-idempotent-replay").is_none());
    assert_eq!(wallet(&app, buyer).await, (0, 0));
}

#[tokio::test]
async fn missing_and_malformed_keys_are_rejected() {
    let app = build_app();
    let buyer = UserId::new();
    let body = json!({ "material_id": uuid::Uuid::new_v4() });

    let (status, _, missing) = send_json(
        &app,
        request("POST", "/marketplace/purchase", Some(buyer), false),
        None,
        body.clone(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(missing["error"]["code"], "MISSING_IDEMPOTENCY_KEY");

    let (status, _, invalid) = send_json(
        &app,
        request("POST", "/marketplace/purchase", Some(buyer), false),
        Some("not-a-uuid"),
        body,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(invalid["error"]["code"], "INVALID_IDEMPOTENCY_KEY");
}

#[tokio::test]
async fn unknown_material_is_not_found() {
    let app = build_app();
    let buyer = UserId::new();
    deposit(&app, buyer, 1_000).await;

    let (status, _, body) = purchase(&app, buyer, uuid::Uuid::new_v4(), &new_key()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "SUBJECT_NOT_FOUND");
}

#[tokio::test]
async fn donation_requires_positive_amount() {
    let app = build_app();
    let buyer = UserId::new();

    let (status, _, body) = send_json(
        &app,
        request("POST", "/streams/donate", Some(buyer), false),
        Some(&new_key()),
        json!({ "stream_id": uuid::Uuid::new_v4(), "amount": 0 }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

// == Authentication ============================================================

#[tokio::test]
async fn anonymous_and_non_admin_callers_are_refused() {
    let app = build_app();

    let (status, _, body) = send(
        &app,
        request("GET", "/wallet", None, false)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "AUTH_UNAUTHORIZED");

    let (status, _, body) = send(
        &app,
        request("GET", "/admin/disputes", Some(UserId::new()), false)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "AUTH_FORBIDDEN");
}

// == Disputes ==================================================================

#[tokio::test]
async fn refund_returns_gross_amount_to_buyer() {
    let app = build_app();
    let (buyer, seller, admin) = (UserId::new(), UserId::new(), UserId::new());
    let material = list_material(&app, seller, 1_000).await;
    deposit(&app, buyer, 1_000).await;
    let (_, _, bought) = purchase(&app, buyer, material, &new_key()).await;
    let tx_id = bought["transaction"]["id"].clone();

    let (status, _, dispute) = send_json(
        &app,
        request("POST", "/disputes", Some(buyer), false),
        None,
        json!({ "transaction_id": tx_id, "reason": "file is empty" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dispute["status"], "pending");

    let (status, _, duplicate) = send_json(
        &app,
        request("POST", "/disputes", Some(buyer), false),
        None,
        json!({ "transaction_id": tx_id, "reason": "still empty" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(duplicate["error"]["code"], "DISPUTE_ALREADY_EXISTS");

    let (_, _, open) = send(
        &app,
        request("GET", "/admin/disputes", Some(admin), true)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(open["count"], 1);

    let uri = format!("/admin/resolve-dispute/{}", dispute["id"].as_str().unwrap());
    let (status, _, resolved) = send_json(
        &app,
        request("PUT", &uri, Some(admin), true),
        None,
        json!({ "status": "resolved_refund" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["dispute"]["status"], "resolved_refund");
    assert_eq!(resolved["transaction"]["status"], "refunded");
    assert_eq!(wallet(&app, buyer).await, (1_000, 0));
    assert_eq!(wallet(&app, seller).await, (0, 0));

    let (status, _, again) = send_json(
        &app,
        request("PUT", &uri, Some(admin), true),
        None,
        json!({ "status": "resolved_reject" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(again["error"]["code"], "DISPUTE_NOT_OPEN");
}

#[tokio::test]
async fn only_the_buyer_may_dispute() {
    let app = build_app();
    let (buyer, seller) = (UserId::new(), UserId::new());
    let material = list_material(&app, seller, 1_000).await;
    deposit(&app, buyer, 1_000).await;
    let (_, _, bought) = purchase(&app, buyer, material, &new_key()).await;

    let (status, _, body) = send_json(
        &app,
        request("POST", "/disputes", Some(seller), false),
        None,
        json!({ "transaction_id": bought["transaction"]["id"], "reason": "nope" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "TRANSACTION_NOT_ELIGIBLE");
}

// == System ====================================================================

#[tokio::test]
async fn health_reports_queue_depths() {
    let app = build_app();
    let (status, _, body) = send(
        &app,
        request("GET", "/health", None, false)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["role"], "all");
    assert!(body["queues"].as_array().is_some_and(|q| !q.is_empty()));
}
