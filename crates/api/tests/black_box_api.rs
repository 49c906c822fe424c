use std::sync::Arc;

use crmflow_ai::{StageOutput, TextNormalizer};
use crmflow_api::app::build_router;
use crmflow_api::app::services::{InMemoryBackends, services_with_backends};
use crmflow_api::middleware::ServiceKeyState;
use crmflow_core::{OrganizationId, WorkerGroup};
use crmflow_infra::config::PipelineConfig;
use crmflow_infra::jobs::JobStatus;
use crmflow_infra::messages::{DerivedRecord, DerivedRecordStore, Message};
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(backends: &InMemoryBackends, service_key: Option<&str>) -> Self {
        // Same router as prod, in-memory stores, ephemeral port.
        let config = PipelineConfig {
            service_key: service_key.map(str::to_string),
            ..PipelineConfig::default()
        };
        let services = services_with_backends(&config, backends.backends()).unwrap();
        let app = build_router(Arc::new(services), ServiceKeyState::new(config.service_key));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn seed_messages(backends: &InMemoryBackends, org: OrganizationId, total: usize, normalized: usize) {
    for i in 0..total {
        let text = format!("Hello, I would like to pay for lesson {i}");
        let mut message = Message::incoming(org, text.clone());
        message.created_at -= chrono::Duration::seconds(i as i64);
        if i < normalized {
            let output = StageOutput::Normalized(TextNormalizer.normalize(&text).unwrap());
            backends
                .derived
                .save(&DerivedRecord::new(org, message.id, output))
                .await
                .unwrap();
        }
        backends.messages.insert(message).unwrap();
    }
}

#[tokio::test]
async fn health_is_served_at_root_and_under_prefix() {
    let server = TestServer::spawn(&InMemoryBackends::new(), None).await;
    let client = reqwest::Client::new();

    for path in ["/health", "/pipeline-scheduler/health"] {
        let res = client.get(server.url(path)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK, "{path}");
    }
}

#[tokio::test]
async fn preflight_and_cors_headers() {
    let server = TestServer::spawn(&InMemoryBackends::new(), None).await;
    let client = reqwest::Client::new();

    let res = client
        .request(reqwest::Method::OPTIONS, server.url("/backfill"))
        .header("origin", "https://app.example.com")
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "authorization, apikey, content-type")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["access-control-allow-origin"], "*");
    let allowed = res.headers()["access-control-allow-headers"].to_str().unwrap().to_lowercase();
    for header in ["authorization", "x-client-info", "apikey", "content-type"] {
        assert!(allowed.contains(header), "{allowed}");
    }
    assert!(res.text().await.unwrap().is_empty());

    let res = client
        .get(server.url("/stats"))
        .header("origin", "https://app.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn bare_options_gets_an_empty_ok_on_every_route() {
    let backends = InMemoryBackends::new();
    let server = TestServer::spawn(&backends, Some("sk-test")).await;
    let client = reqwest::Client::new();

    for path in [
        "/tick",
        "/backfill",
        "/stats",
        "/enqueue",
        "/requeue-failed",
        "/pipeline-worker",
        "/pipeline-scheduler/tick",
        "/pipeline-scheduler/stats",
        "/pipeline-scheduler/pipeline-worker",
        "/no-such-path",
    ] {
        let res = client
            .request(reqwest::Method::OPTIONS, server.url(path))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK, "{path}");
        assert!(res.text().await.unwrap().is_empty(), "{path}");
    }

    assert!(backends.jobs.is_empty().unwrap());
}

#[tokio::test]
async fn backfill_without_organization_is_rejected_without_writes() {
    let backends = InMemoryBackends::new();
    let server = TestServer::spawn(&backends, None).await;
    let client = reqwest::Client::new();

    let res = client.post(server.url("/backfill")).json(&json!({})).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "organization_id required");

    let res = client
        .post(server.url("/backfill"))
        .json(&json!({ "organization_id": "not-a-uuid" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(server.url("/backfill"))
        .json(&json!({ "organization_id": OrganizationId::new(), "limit": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    assert!(backends.jobs.is_empty().unwrap());
}

#[tokio::test]
async fn backfill_enqueues_unprocessed_messages_then_tick_processes_them() {
    let backends = InMemoryBackends::new();
    let org = OrganizationId::new();
    seed_messages(&backends, org, 120, 100).await;

    let server = TestServer::spawn(&backends, None).await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/pipeline-scheduler/backfill"))
        .json(&json!({ "organization_id": org }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: serde_json::Value = res.json().await.unwrap();
    assert_eq!(report["status"], "backfill_enqueued");
    assert_eq!(report["total_messages"], 120);
    assert_eq!(report["already_processed"], 100);
    assert_eq!(report["enqueued"], 20);

    let jobs = backends.jobs.all().unwrap();
    assert_eq!(jobs.len(), 20);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Pending
        && j.job_type.as_str() == "normalize_message"
        && j.entity_type.as_str() == "message"));

    let stats: serde_json::Value = client
        .get(server.url(&format!("/stats?organization_id={org}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["queue_depth"], 20);
    assert_eq!(stats["failed_jobs"], 0);

    let res = client.post(server.url("/tick")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let tick: serde_json::Value = res.json().await.unwrap();
    assert_eq!(tick["status"], "tick_complete");
    assert_eq!(tick["results"]["normalize"]["succeeded"], 20);
    assert_eq!(tick["results"]["embed"]["succeeded"], 20);
    assert_eq!(tick["results"]["annotate"]["succeeded"], 20);

    let again: serde_json::Value = client
        .post(server.url("/backfill"))
        .json(&json!({ "organization_id": org }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["enqueued"], 0);
    assert_eq!(again["already_processed"], 120);

    let stats: serde_json::Value = client
        .get(server.url("/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["queue_depth"], 0);
    let stages = stats["pipeline_stats"].as_array().unwrap();
    assert_eq!(stages.len(), WorkerGroup::ALL.len());
    assert!(stages.iter().all(|s| s["done"] == 20));
}

#[tokio::test]
async fn stats_rejects_malformed_organization() {
    let server = TestServer::spawn(&InMemoryBackends::new(), None).await;
    let res = reqwest::Client::new()
        .get(server.url("/stats?organization_id=nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_post_path_runs_a_tick() {
    let server = TestServer::spawn(&InMemoryBackends::new(), None).await;
    let client = reqwest::Client::new();

    for path in ["/pipeline-scheduler", "/anything/else"] {
        let res = client.post(server.url(path)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK, "{path}");
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["status"], "tick_complete");
        assert_eq!(body["results"]["normalize"]["claimed"], 0);
    }

    let res = client.get(server.url("/anything/else")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn live_enqueue_is_idempotent() {
    let backends = InMemoryBackends::new();
    let server = TestServer::spawn(&backends, None).await;
    let client = reqwest::Client::new();
    let body = json!({
        "organization_id": OrganizationId::new(),
        "message_id": crmflow_core::MessageId::new(),
    });

    let first: serde_json::Value = client
        .post(server.url("/enqueue"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["status"], "enqueued");

    let second: serde_json::Value = client
        .post(server.url("/enqueue"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["status"], "already_queued");
    assert_eq!(second["job_id"], first["job_id"]);
    assert_eq!(backends.jobs.len().unwrap(), 1);

    let res = client
        .post(server.url("/enqueue"))
        .json(&json!({ "organization_id": OrganizationId::new() }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn requeue_failed_reports_count() {
    let server = TestServer::spawn(&InMemoryBackends::new(), None).await;
    let res = reqwest::Client::new()
        .post(server.url("/requeue-failed"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "requeued");
    assert_eq!(body["requeued"], 0);
}

#[tokio::test]
async fn worker_endpoint_requires_service_key() {
    let backends = InMemoryBackends::new();
    let org = OrganizationId::new();
    seed_messages(&backends, org, 3, 0).await;

    let server = TestServer::spawn(&backends, Some("sk-test")).await;
    let client = reqwest::Client::new();
    let body = json!({ "worker_group": "normalize", "batch_size": 10 });

    let res = client.post(server.url("/pipeline-worker")).json(&body).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(server.url("/pipeline-worker"))
        .bearer_auth("wrong")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    client
        .post(server.url("/backfill"))
        .json(&json!({ "organization_id": org }))
        .send()
        .await
        .unwrap();

    let res = client
        .post(server.url("/pipeline-scheduler/pipeline-worker"))
        .bearer_auth("sk-test")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: serde_json::Value = res.json().await.unwrap();
    assert_eq!(report["worker_group"], "normalize");
    assert_eq!(report["claimed"], 3);
    assert_eq!(report["succeeded"], 3);

    let res = client
        .post(server.url("/pipeline-worker"))
        .bearer_auth("sk-test")
        .json(&json!({ "worker_group": "summarize" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
