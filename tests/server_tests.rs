use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use port_scan_rs::server::{router, AppState};
use port_scan_rs::{PortStatus, ProbeInfrastructureError, ProbeResult, Prober};
use serde_json::Value;
use tower::ServiceExt;

/// Marks ports divisible by three as open after a short delay.
struct FakeProber {
    delay: Duration,
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(
        &self,
        _host: Ipv4Addr,
        port: u16,
        _timeout: Duration,
    ) -> Result<ProbeResult, ProbeInfrastructureError> {
        tokio::time::sleep(self.delay).await;
        let status = if port % 3 == 0 {
            PortStatus::Open
        } else {
            PortStatus::Closed
        };
        Ok(ProbeResult {
            port,
            status,
            latency_ms: self.delay.as_millis() as u64,
        })
    }
}

fn app(delay_ms: u64) -> Router {
    let state = AppState::with_prober(Arc::new(FakeProber {
        delay: Duration::from_millis(delay_ms),
    }));
    router(state, None)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_lines(resp: axum::response::Response) -> Vec<Value> {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn validate_endpoint_reports_field() {
    let app = app(1);
    let resp = app
        .clone()
        .oneshot(post_json(
            "/api/validate",
            serde_json::json!({"host": "999.1.1.1", "start_port": "1", "end_port": "5"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let v = body_json(resp).await;
    assert_eq!(v["field"], "host");

    let resp = app
        .oneshot(post_json(
            "/api/validate",
            serde_json::json!({"host": "10.0.0.1", "start_port": 80, "end_port": "90"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
    let v = body_json(resp).await;
    assert_eq!(v["host"], "10.0.0.1");
    assert_eq!(v["port_start"], 80);
    assert_eq!(v["port_end"], 90);
}

#[tokio::test]
async fn scan_streams_progress_then_finished() {
    let app = app(1);
    let resp = app
        .clone()
        .oneshot(post_json(
            "/api/scan",
            serde_json::json!({
                "host": "10.0.0.1",
                "start_port": 1,
                "end_port": 9,
                "concurrency": 3
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "application/x-ndjson");

    let lines = body_lines(resp).await;
    assert_eq!(lines.len(), 10);
    assert!(lines[..9].iter().all(|l| l["type"] == "progress"));
    let last = &lines[9];
    assert_eq!(last["type"], "finished");
    assert_eq!(last["state"], "completed");
    let results = last["results"].as_array().unwrap();
    let ports: Vec<u64> = results.iter().map(|r| r["port"].as_u64().unwrap()).collect();
    assert_eq!(ports, (1..=9).collect::<Vec<_>>());
    assert_eq!(results[2]["status"], "open");

    let resp = app
        .clone()
        .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let v = body_json(resp).await;
    assert_eq!(v["state"], "completed");
    assert_eq!(v["scanned"], 9);
    assert_eq!(v["total"], 9);

    let resp = app
        .oneshot(Request::get("/api/results").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let v = body_json(resp).await;
    assert_eq!(v["results"].as_array().unwrap().len(), 9);
}

#[tokio::test]
async fn scan_rejects_invalid_range() {
    let resp = app(1)
        .oneshot(post_json(
            "/api/scan",
            serde_json::json!({"host": "10.0.0.1", "start_port": "10", "end_port": "5"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(resp).await["field"], "range");
}

#[tokio::test]
async fn non_text_fields_get_field_errors() {
    let app = app(1);
    let cases = [
        (
            "/api/validate",
            serde_json::json!({"host": "10.0.0.1", "start_port": -5, "end_port": null}),
            "port_start",
        ),
        (
            "/api/validate",
            serde_json::json!({"host": true, "start_port": 1, "end_port": 5}),
            "host",
        ),
        (
            "/api/validate",
            serde_json::json!({"host": "10.0.0.1", "start_port": 1}),
            "port_end",
        ),
        (
            "/api/validate",
            serde_json::json!({"host": "10.0.0.1", "start_port": 1.5, "end_port": 5}),
            "port_start",
        ),
        (
            "/api/scan",
            serde_json::json!({"host": "10.0.0.1", "start_port": 1, "end_port": false}),
            "port_end",
        ),
    ];
    for (uri, body, field) in cases {
        let resp = app.clone().oneshot(post_json(uri, body.clone())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY, "{body}");
        let v = body_json(resp).await;
        assert_eq!(v["field"], field, "{body}");
        assert!(v["message"].is_string(), "{body}");
    }

    // A rejected scan never replaces the session.
    let resp = app
        .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["state"], "idle");
}

#[tokio::test]
async fn second_scan_conflicts_and_cancel_ends_stream() {
    let app = app(30);
    let first = app
        .clone()
        .oneshot(post_json(
            "/api/scan",
            serde_json::json!({
                "host": "10.0.0.1",
                "start_port": 1,
                "end_port": 200,
                "concurrency": 2
            }),
        ))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .clone()
        .oneshot(post_json(
            "/api/scan",
            serde_json::json!({"host": "10.0.0.1", "start_port": 1, "end_port": 2}),
        ))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);

    for _ in 0..2 {
        let resp = app
            .clone()
            .oneshot(Request::post("/api/cancel").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    let lines = body_lines(first).await;
    let last = lines.last().unwrap();
    assert_eq!(last["type"], "finished");
    assert_eq!(last["state"], "cancelled");
    assert!(last["results"].as_array().unwrap().len() < 200);
}

#[tokio::test]
async fn results_empty_before_any_scan() {
    let resp = app(1)
        .oneshot(Request::get("/api/results").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}
