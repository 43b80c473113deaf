use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

use crate::notes::NoteStore;
use crate::tests::support::{harness, FakeReference, Harness, DIMENSIONS};
use crate::web::router;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn setup(dir: &std::path::Path) -> (Harness, Router) {
    let h = harness(
        dir,
        FakeReference::new(&[("a", "alpha. beta"), ("b", "gamma"), ("c", "delta")]),
    );
    for uri in ["a", "b", "c"] {
        h.store.create(uri).unwrap();
    }
    let app = router(h.synchronizer.clone());
    (h, app)
}

#[tokio::test]
async fn test_empty_query_lists_notes() {
    let tmp = tempfile::tempdir().unwrap();
    let (_h, app) = setup(tmp.path());

    let (status, body) = send(&app, get("/notes?q=&offset=0&count=2")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{"id": 0, "uri": "a"}, {"id": 1, "uri": "b"}]));
}

#[tokio::test]
async fn test_search_by_text() {
    let tmp = tempfile::tempdir().unwrap();
    let (_h, app) = setup(tmp.path());

    let (status, body) = send(&app, get("/notes?q=gamma&count=1")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{"id": 1, "uri": "b"}]));
}

#[tokio::test]
async fn test_note_lookup() {
    let tmp = tempfile::tempdir().unwrap();
    let (_h, app) = setup(tmp.path());

    let (status, body) = send(&app, get("/notes/c")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"id": 2, "uri": "c"}));

    let (status, body) = send(&app, get("/notes/zzz")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("zzz"));
}

#[tokio::test]
async fn test_note_embeddings() {
    let tmp = tempfile::tempdir().unwrap();
    let (_h, app) = setup(tmp.path());

    let (status, body) = send(&app, get("/notes/a/embeddings")).await;

    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].as_array().unwrap().len(), DIMENSIONS);
}

#[tokio::test]
async fn test_batch_embeddings_keep_ids() {
    let tmp = tempfile::tempdir().unwrap();
    let (_h, app) = setup(tmp.path());

    let request = json!({"texts": [{"id": 7, "text": "one. two"}, {"id": 3, "text": "three"}]});
    let (status, body) = send(&app, post("/embeddings", request)).await;

    assert_eq!(status, StatusCode::OK);
    let texts = body["texts"].as_array().unwrap();
    assert_eq!(texts[0]["id"], 7);
    assert_eq!(texts[0]["embeddings"].as_array().unwrap().len(), 2);
    assert_eq!(texts[1]["id"], 3);
    assert_eq!(texts[1]["embeddings"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_malformed_markup_is_bad_request() {
    let tmp = tempfile::tempdir().unwrap();
    let (_h, app) = setup(tmp.path());

    let request = json!({"texts": [{"id": 1, "text": "fine\n<p>broken <b attr=\"x"}]});
    let (status, body) = send(&app, post("/embeddings", request)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("line 2"));
}

#[tokio::test]
async fn test_notification_applies_in_background() {
    let tmp = tempfile::tempdir().unwrap();
    let (h, app) = setup(tmp.path());
    h.reference.set("d", "brand new");

    let data = STANDARD.encode(r#"{"type":"upsert","uri":"d"}"#);
    let (status, _) = send(
        &app,
        post("/notes/notifications", json!({"message": {"data": data}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut applied = false;
    for _ in 0..100 {
        if h.store.find_by_uri("d").unwrap().is_some() {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(applied);
}

#[tokio::test]
async fn test_malformed_notification_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let (_h, app) = setup(tmp.path());

    let (status, _) = send(
        &app,
        post("/notes/notifications", json!({"message": {"data": "%%%"}})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_reload_returns_immediately_and_status() {
    let tmp = tempfile::tempdir().unwrap();
    let (h, app) = setup(tmp.path());

    let (status, body) = send(&app, get("/notes:index-status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "unloaded");
    assert_eq!(body["notes"], 3);

    let (status, _) = send(&app, get("/notes:reload-index")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut ready = false;
    for _ in 0..100 {
        if h.synchronizer.index_len().await == Some(4) {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ready);

    let (_, body) = send(&app, get("/notes:index-status")).await;
    assert_eq!(body["state"], "ready");
    assert_eq!(body["rows"], 4);
}
