mod common;

use std::collections::HashSet;

use common::TestAppBuilder;
use reqwest::Client;

fn read_records(path: &std::path::Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn one_request_exports_root_and_phase_spans() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("spans.log");
    let app = TestAppBuilder::new()
        .export_file(path.to_str().unwrap())
        .spawn()
        .await;

    let resp = Client::new()
        .post(app.url("/chat"))
        .json(&serde_json::json!({"message": "hello there"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let records = read_records(&path);
    let names: HashSet<&str> = records
        .iter()
        .map(|r| r.get("span").unwrap().as_str().unwrap())
        .collect();
    for expected in ["chat_request", "auth", "parse", "validate", "safety", "complete", "respond"] {
        assert!(names.contains(expected), "missing span {expected}");
    }
    // RAG was off: no retrieve span at all.
    assert!(!names.contains("retrieve"));

    // All spans of the request share one correlation id.
    let ids: HashSet<&str> = records
        .iter()
        .map(|r| r.get("correlationId").unwrap().as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 1);

    // Phase spans name the root as parent.
    for record in &records {
        match record.get("span").unwrap().as_str().unwrap() {
            "chat_request" => assert!(record.get("parent").unwrap().is_null()),
            _ => assert_eq!(record.get("parent").unwrap(), "chat_request"),
        }
    }

    let root = records
        .iter()
        .find(|r| r.get("span").unwrap() == "chat_request")
        .unwrap();
    assert_eq!(root.get("status").unwrap(), "ok");
}

#[tokio::test]
async fn exported_telemetry_never_contains_request_content() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("spans.log");
    let app = TestAppBuilder::new()
        .export_file(path.to_str().unwrap())
        .spawn()
        .await;

    let marker = "zebra-quantum-billing-refund-7781";
    let resp = Client::new()
        .post(app.url("/chat"))
        .json(&serde_json::json!({"message": format!("please help with {marker}")}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.is_empty());
    assert!(
        !raw.contains(marker),
        "request content leaked into the span export"
    );
    assert!(!raw.contains("please help"));
}

#[tokio::test]
async fn blocked_request_exports_an_error_root_with_categories_event() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("spans.log");
    let app = TestAppBuilder::new()
        .blocklist(&["forbidden"])
        .export_file(path.to_str().unwrap())
        .spawn()
        .await;

    let resp = Client::new()
        .post(app.url("/chat"))
        .json(&serde_json::json!({"message": "a forbidden request"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let records = read_records(&path);
    let root = records
        .iter()
        .find(|r| r.get("span").unwrap() == "chat_request")
        .unwrap();
    assert_eq!(root.get("status").unwrap(), "error");
    let attrs = root.get("attributes").unwrap();
    assert_eq!(attrs.get("request.blocked").unwrap(), &serde_json::json!(true));
    let events = root.get("events").unwrap().as_array().unwrap();
    let blocked = events
        .iter()
        .find(|e| e.get("name").unwrap() == "request.blocked")
        .expect("blocked event present");
    assert_eq!(
        blocked
            .get("attributes")
            .unwrap()
            .get("blocked_categories")
            .unwrap(),
        "blocklist"
    );
    // No complete/respond spans after the block.
    assert!(!records.iter().any(|r| r.get("span").unwrap() == "complete"));
}
