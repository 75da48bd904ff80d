use std::sync::Arc;

use runner_backend::mock::MatchedMockRuntime;
use runner_backend::ModelRuntime;
use runner_common::config::RunnerConfig;
use serde_json::Value;

fn test_app() -> axum::Router {
    let runtime: Arc<dyn ModelRuntime> = Arc::new(MatchedMockRuntime::new(41));
    let mut cfg = RunnerConfig::default();
    cfg.block_size = 16;
    cfg.n_blocks = 256;
    runner_api::app(runtime, Arc::new(cfg), true)
}

async fn spawn(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}:{}", addr.ip(), addr.port())
}

#[tokio::test]
async fn health_and_metrics_and_generate_round_trip() {
    let base = spawn(test_app()).await;
    let client = reqwest::Client::new();

    let r = client.get(format!("{base}/health")).send().await.unwrap();
    assert!(r.status().is_success());
    let body: Value = r.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["model_loaded"], true);

    let r = client.get(format!("{base}/ping")).send().await.unwrap();
    assert_eq!(r.text().await.unwrap(), "pong");

    let r = client.get(format!("{base}/metrics")).send().await.unwrap();
    assert!(r.status().is_success());
    let text = r.text().await.unwrap();
    assert!(text.contains("free_blocks"));

    let payload = serde_json::json!({"prompt": "The capital of France is", "max_tokens": 5, "temperature": 0.0, "seed": 1});
    let r = client.post(format!("{base}/generate")).json(&payload).send().await.unwrap();
    assert!(r.status().is_success());
    let body: Value = r.json().await.unwrap();
    assert_eq!(body["tokens_generated"], 5);
    assert!(body["stop_reason"].is_string());
}

#[tokio::test]
async fn generate_stream_emits_ndjson_lines() {
    let base = spawn(test_app()).await;
    let client = reqwest::Client::new();

    let payload = serde_json::json!({"prompt": "hello there", "max_tokens": 3, "temperature": 0.0, "seed": 7});
    let r = client.post(format!("{base}/generate/stream")).json(&payload).send().await.unwrap();
    assert!(r.status().is_success());
    assert_eq!(r.headers().get("content-type").unwrap(), "application/x-ndjson");

    let body = r.text().await.unwrap();
    let lines: Vec<&str> = body.lines().filter(|l| !l.is_empty()).collect();
    assert!(!lines.is_empty());
    for line in &lines {
        let parsed: Value = serde_json::from_str(line).expect("every line must be a JSON object");
        assert!(parsed["event_type"].is_string());
    }
    assert!(lines.iter().any(|l| l.contains("\"event_type\":\"done\"")));
}

#[tokio::test]
async fn empty_prompt_is_rejected_with_bad_request() {
    let base = spawn(test_app()).await;
    let client = reqwest::Client::new();

    let payload = serde_json::json!({"prompt": ""});
    let r = client.post(format!("{base}/generate")).json(&payload).send().await.unwrap();
    assert_eq!(r.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batch_endpoint_runs_every_sub_request() {
    let base = spawn(test_app()).await;
    let client = reqwest::Client::new();

    let payload = serde_json::json!({
        "requests": [
            {"prompt": "one", "max_tokens": 2, "temperature": 0.0},
            {"prompt": "two", "max_tokens": 2, "temperature": 0.0},
        ]
    });
    let r = client.post(format!("{base}/generate/batch")).json(&payload).send().await.unwrap();
    assert!(r.status().is_success());
    let body: Value = r.json().await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 2);
}
