mod common;

use common::{StubCompletion, TestAppBuilder};
use reqwest::Client;

#[tokio::test]
async fn blocked_content_returns_policy_outcome_not_an_error() {
    let completion = StubCompletion::new("ok");
    let app = TestAppBuilder::new()
        .completion(completion.clone())
        .blocklist(&["forbidden"])
        .spawn()
        .await;
    let resp = Client::new()
        .post(app.url("/chat"))
        .json(&serde_json::json!({"message": "tell me something FORBIDDEN"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body.get("blocked").unwrap(), &serde_json::json!(true));
    assert_eq!(
        body.get("reason").unwrap(),
        "Content blocked by safety filter"
    );
    assert_eq!(
        body.get("categories").unwrap(),
        &serde_json::json!(["blocklist"])
    );
    assert!(body.get("correlationId").unwrap().is_string());
    assert!(body.get("answer").is_none());
}

#[tokio::test]
async fn blocked_request_never_reaches_completion() {
    let completion = StubCompletion::new("ok");
    let app = TestAppBuilder::new()
        .completion(completion.clone())
        .blocklist(&["forbidden"])
        .spawn()
        .await;
    let resp = Client::new()
        .post(app.url("/chat"))
        .json(&serde_json::json!({"message": "forbidden topic"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(completion.call_count(), 0);
}

#[tokio::test]
async fn clean_content_passes_the_filter() {
    let app = TestAppBuilder::new()
        .blocklist(&["forbidden"])
        .spawn()
        .await;
    let resp = Client::new()
        .post(app.url("/chat"))
        .json(&serde_json::json!({"message": "a perfectly fine question"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body.get("answer").unwrap(), "ok");
    assert!(body.get("blocked").is_none());
}
