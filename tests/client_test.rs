//! Producer client tests against a mock coordinator

use std::time::Duration;

use judgeworks::coordinator::{ClientConfig, ClientError, RpcClient};
use judgeworks::models::{BatchId, CancelOutcome, Environ, JobSpec, JobState};
use judgeworks::utils::RetryConfig;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> RpcClient {
    RpcClient::new(
        ClientConfig::new(server.uri())
            .with_timeout(Duration::from_secs(2))
            .with_retry(RetryConfig::with_delays(2, 10, 50))
            .with_poll_interval(Duration::from_millis(10)),
    )
    .unwrap()
}

fn ping() -> Vec<JobSpec> {
    vec![JobSpec::new("ping", Environ::new().with("ping", "x"))]
}

fn report_json(batch_id: BatchId) -> serde_json::Value {
    json!({
        "batch_id": batch_id,
        "finished_at": "2024-05-01T12:00:00Z",
        "jobs": [{
            "job_id": judgeworks::JobId::new(),
            "kind": "ping",
            "state": "done",
            "retries": 0,
            "result_code": "OK",
            "parameters": {"ping": "x", "pong": "x", "result_code": "OK"}
        }]
    })
}

#[tokio::test]
async fn test_submit_returns_batch_id() {
    let server = MockServer::start().await;
    let batch_id = BatchId::new();

    Mock::given(method("POST"))
        .and(path("/api/batches"))
        .and(body_partial_json(json!({"wait": false, "jobs": [{"kind": "ping"}]})))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "success": true,
            "batch_id": batch_id
        })))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(client(&server).submit(ping()).await.unwrap(), batch_id);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let server = MockServer::start().await;
    let batch_id = BatchId::new();

    Mock::given(method("POST"))
        .and(path("/api/batches"))
        .respond_with(
            ResponseTemplate::new(503)
                .set_body_json(json!({"success": false, "error": "Coordinator is shutting down"})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/batches"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "success": true,
            "batch_id": batch_id
        })))
        .mount(&server)
        .await;

    assert_eq!(client(&server).submit(ping()).await.unwrap(), batch_id);
}

#[tokio::test]
async fn test_validation_error_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/batches"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "success": false,
            "error": "Validation error: job 0: unknown job kind 'bogus'"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).submit(ping()).await.unwrap_err();
    match err {
        ClientError::Rejected(message) => assert!(message.contains("bogus")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_wait_polls_until_finished() {
    let server = MockServer::start().await;
    let batch_id = BatchId::new();
    let batch_path = format!("/api/batches/{batch_id}");

    Mock::given(method("GET"))
        .and(path(batch_path.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "status": "pending",
            "remaining": 1
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    let mut finished = json!({"success": true, "status": "finished"});
    finished["report"] = report_json(batch_id);
    Mock::given(method("GET"))
        .and(path(batch_path.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(finished))
        .mount(&server)
        .await;

    let report = client(&server).wait(batch_id).await.unwrap();
    assert_eq!(report.batch_id, batch_id);
    assert_eq!(report.jobs[0].state, JobState::Done);
    assert!(report.all_ok());
}

#[tokio::test]
async fn test_submit_and_wait_returns_report() {
    let server = MockServer::start().await;
    let batch_id = BatchId::new();

    let mut body = report_json(batch_id);
    body["success"] = json!(true);
    Mock::given(method("POST"))
        .and(path("/api/batches"))
        .and(body_partial_json(json!({"wait": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let report = client(&server).submit_and_wait(ping()).await.unwrap();
    assert_eq!(report.batch_id, batch_id);
    assert_eq!(report.jobs[0].parameters.get_str("pong"), Some("x"));
}

#[tokio::test]
async fn test_cancel_and_not_found() {
    let server = MockServer::start().await;
    let known = BatchId::new();
    let unknown = BatchId::new();

    Mock::given(method("DELETE"))
        .and(path(format!("/api/batches/{known}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "outcome": "cancelled",
            "removed": 3,
            "in_flight": 1
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/api/batches/{unknown}").as_str()))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "success": false,
            "error": format!("Batch not found: {unknown}")
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    assert_eq!(
        client.cancel(known).await.unwrap(),
        CancelOutcome::Cancelled {
            removed: 3,
            in_flight: 1
        }
    );
    assert!(matches!(
        client.cancel(unknown).await,
        Err(ClientError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_unreachable_coordinator() {
    let client = RpcClient::new(
        ClientConfig::new("http://127.0.0.1:1")
            .with_timeout(Duration::from_millis(200))
            .with_retry(RetryConfig::with_delays(1, 1, 1)),
    )
    .unwrap();

    let err = client.health_check().await.unwrap_err();
    assert!(err.is_transient());
}
