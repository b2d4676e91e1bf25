//! Explicit session lifecycle over HTTP.

mod common;

use common::spawn_bridge;
use serde_json::Value;

#[tokio::test]
async fn two_creates_yield_two_distinct_sessions() {
    let server = spawn_bridge(|_| {}).await;
    let client = reqwest::Client::new();

    let first: Value = client
        .post(server.url("/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: Value = client
        .post(server.url("/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let a = first["session_id"].as_str().unwrap();
    let b = second["session_id"].as_str().unwrap();
    assert_ne!(a, b);
    assert_eq!(server.state.broker.sessions.count(), 2);
}

#[tokio::test]
async fn delete_removes_the_session() {
    let server = spawn_bridge(|_| {}).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(server.url("/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["session_id"].as_str().unwrap();

    let response = client
        .delete(server.url(&format!("/sessions/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // A second delete finds nothing.
    let response = client
        .delete(server.url(&format!("/sessions/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(server.state.broker.sessions.count(), 0);
}

#[tokio::test]
async fn delete_unknown_session_is_404() {
    let server = spawn_bridge(|_| {}).await;
    let client = reqwest::Client::new();

    let response = client
        .delete(server.url("/sessions/not-a-session"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
