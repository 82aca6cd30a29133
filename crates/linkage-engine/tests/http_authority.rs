use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use linkage_engine::{CanonicalStatus, EngineConfig, LinkOutcome, LinkageEngine, PromptKind};
use linkage_sdk::{InMemoryRecordStore, RecordStore, RejectionReason};
use serde_json::{json, Value};
use test_timeout::tokio_timeout_test;

async fn link(Path(id): Path<String>) -> (StatusCode, Json<Value>) {
    match id.as_str() {
        "401" => (StatusCode::UNAUTHORIZED, Json(json!({"code": "TOKEN_EXPIRED"}))),
        "403" => (StatusCode::FORBIDDEN, Json(json!({}))),
        "409" => (StatusCode::CONFLICT, Json(json!({"code": "SUSPENDED"}))),
        _ => (StatusCode::OK, Json(json!({"status": "INVITED"}))),
    }
}

async fn serve() -> SocketAddr {
    let app = Router::new().route("/api/accounts/:id/link", post(link));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server");
    });
    addr
}

async fn engine(base_path: &str) -> LinkageEngine {
    let addr = serve().await;
    let config = EngineConfig {
        authority_base_url: format!("http://{addr}{base_path}"),
        authority_token: Some("stale".into()),
        ..EngineConfig::default()
    };
    let store: Arc<dyn RecordStore> = InMemoryRecordStore::new();
    LinkageEngine::from_config(config, store).expect("engine")
}

fn prompt(engine: &LinkageEngine) -> Option<PromptKind> {
    engine.snapshot().prompts.first().map(|prompt| prompt.kind)
}

#[tokio_timeout_test]
async fn credential_failures_never_mark_the_account_rejected() {
    let engine = engine("/api").await;
    for id in ["401", "403"] {
        let outcome = engine.request_link(id).await.unwrap();
        assert!(matches!(outcome, LinkOutcome::Failed(_)), "{id}: {outcome:?}");
        let account = engine.account(id).unwrap().unwrap();
        assert_eq!(account.status(), CanonicalStatus::Unknown, "{id}");
    }
    assert!(engine
        .snapshot()
        .prompts
        .iter()
        .all(|prompt| prompt.kind == PromptKind::GenericError));
}

#[tokio_timeout_test]
async fn wrong_base_path_is_a_failure_not_a_rejection() {
    let engine = engine("/v0").await;
    let outcome = engine.request_link("12").await.unwrap();
    assert!(matches!(outcome, LinkOutcome::Failed(_)));
    assert_eq!(
        engine.account("12").unwrap().unwrap().status(),
        CanonicalStatus::Unknown
    );
    assert_eq!(prompt(&engine), Some(PromptKind::GenericError));
}

#[tokio_timeout_test]
async fn business_refusals_still_reject() {
    let engine = engine("/api").await;
    let outcome = engine.request_link("409").await.unwrap();
    assert_eq!(outcome, LinkOutcome::Rejected(RejectionReason::Suspended));
    assert_eq!(
        engine.account("409").unwrap().unwrap().status(),
        CanonicalStatus::Rejected
    );
    assert_eq!(prompt(&engine), Some(PromptKind::Suspended));
}

#[tokio_timeout_test]
async fn invited_answer_awaits_acceptance() {
    let engine = engine("/api").await;
    assert_eq!(
        engine.request_link("77").await.unwrap(),
        LinkOutcome::AwaitingAcceptance
    );
    assert_eq!(
        engine.account("77").unwrap().unwrap().status(),
        CanonicalStatus::Pending
    );
    assert_eq!(prompt(&engine), Some(PromptKind::AwaitingAcceptance));
}
