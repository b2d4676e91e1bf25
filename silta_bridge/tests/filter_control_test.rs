//! Runtime filter control endpoints.

mod common;

use common::spawn_bridge;
use serde_json::{Value, json};

fn find<'a>(filters: &'a [Value], name: &str) -> &'a Value {
    filters
        .iter()
        .find(|f| f["name"] == name)
        .unwrap_or_else(|| panic!("filter {name} not listed"))
}

#[tokio::test]
async fn built_in_filters_are_listed_with_defaults() {
    let server = spawn_bridge(|_| {}).await;
    let client = reqwest::Client::new();

    let filters: Vec<Value> = client
        .get(server.url("/filters"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let redact = find(&filters, "redact_secrets");
    assert_eq!(redact["enabled"], true);
    assert_eq!(redact["direction_mask"], "both");

    let meta = find(&filters, "add_bridge_meta");
    assert_eq!(meta["enabled"], false);
}

#[tokio::test]
async fn toggling_is_idempotent_and_visible() {
    let server = spawn_bridge(|_| {}).await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let response = client
            .post(server.url("/filters/add_bridge_meta"))
            .json(&json!({"enabled": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let filters: Vec<Value> = client
        .get(server.url("/filters"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(find(&filters, "add_bridge_meta")["enabled"], true);
}

#[tokio::test]
async fn unknown_filter_is_404() {
    let server = spawn_bridge(|_| {}).await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/filters/no_such_filter"))
        .json(&json!({"enabled": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn config_reload_requires_content_filtering() {
    let server = spawn_bridge(|_| {}).await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/filters/config"))
        .json(&json!({"blocked_domains": ["evil.example"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn config_reload_validates_before_swapping() {
    let server = spawn_bridge(|c| c.content_filters = true).await;
    let client = reqwest::Client::new();

    // Invalid regex: rejected, old config untouched.
    let response = client
        .post(server.url("/filters/config"))
        .json(&json!({"blocked_patterns": ["("]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .post(server.url("/filters/config"))
        .json(&json!({"blocked_domains": ["evil.example"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let state = server.state.content_state.as_ref().unwrap();
    assert_eq!(
        state.snapshot().config.blocked_domains,
        vec!["evil.example"]
    );
}

#[tokio::test]
async fn content_filters_appear_in_the_listing_when_enabled() {
    let server = spawn_bridge(|c| c.content_filters = true).await;
    let client = reqwest::Client::new();

    let filters: Vec<Value> = client
        .get(server.url("/filters"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    for name in ["blacklist", "html_sanitizer", "pii_redactor", "size_manager"] {
        find(&filters, name);
    }
}
