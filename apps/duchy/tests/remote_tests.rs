//! # Remote Client Tests
//!
//! Run the HTTP clients against small axum services on a local port.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use duchy::chunk::chunk_stream;
use duchy::clients::{
    ClientError, ComputationControl, GlobalComputations, GlobalState, MetricValues,
};
use duchy::remote::{COMPUTATION_ID_HEADER, KingdomClient, MetricValuesClient, PeerClient};
use duchy_core::{CompletedReason, RequisitionKey};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Recorded = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{}", addr)
}

// =============================================================================
// KINGDOM
// =============================================================================

async fn active(Query(params): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
    let after = params.get("continuation_token").cloned().unwrap_or_default();
    Json(serde_json::json!({
        "computations": [{
            "global_id": "321",
            "state": "CONFIRMING",
            "requisitions": [{
                "data_provider_id": "alice",
                "campaign_id": "a",
                "metric_requisition_id": "1234",
            }],
            "continuation_token": format!("{}+321", after),
        }, {
            "global_id": "654",
            "state": "ARCHIVED",
            "continuation_token": format!("{}+654", after),
        }]
    }))
}

async fn record(
    State(recorded): State<Recorded>,
    Path((id, action)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    recorded
        .lock()
        .expect("lock")
        .push((format!("{}/{}", id, action), body));
    StatusCode::OK
}

async fn kingdom() -> (KingdomClient, Recorded) {
    let recorded = Recorded::default();
    let router = Router::new()
        .route("/v1/computations/active", get(active))
        .route("/v1/computations/{id}/{action}", post(record))
        .with_state(Arc::clone(&recorded));
    let url = serve(router).await;
    (KingdomClient::new(reqwest::Client::new(), url), recorded)
}

#[tokio::test]
async fn kingdom_streams_active_computations_after_the_token() {
    let (client, _) = kingdom().await;

    let items: Vec<_> = client
        .stream_active_computations("TOKEN")
        .await
        .expect("stream")
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    let first = items[0].as_ref().expect("first");
    assert_eq!(first.state, GlobalState::Confirming);
    assert_eq!(first.requisitions, vec![RequisitionKey::new("alice", "a", "1234")]);
    assert_eq!(first.continuation_token, "TOKEN+321");
    let second = items[1].as_ref().expect("second");
    assert_eq!(second.state, GlobalState::Unknown);
    assert!(second.requisitions.is_empty());
}

#[tokio::test]
async fn kingdom_receives_confirmations_and_outcomes() {
    let (client, recorded) = kingdom().await;

    client
        .confirm_requisitions("321", &[RequisitionKey::new("alice", "a", "1234")])
        .await
        .expect("confirm");
    client
        .report_outcome("321", CompletedReason::Failed)
        .await
        .expect("outcome");

    let recorded = recorded.lock().expect("lock").clone();
    assert_eq!(recorded[0].0, "321/confirm");
    assert_eq!(
        recorded[0].1["ready_requisitions"][0]["metric_requisition_id"],
        "1234"
    );
    assert_eq!(recorded[1].0, "321/outcome");
    assert_eq!(recorded[1].1["reason"], "failed");
}

#[tokio::test]
async fn unreachable_kingdom_is_a_connection_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let client = KingdomClient::new(reqwest::Client::new(), format!("http://{}", addr));

    let result = client.report_outcome("321", CompletedReason::Succeeded).await;
    assert!(matches!(result, Err(ClientError::ConnectionFailed(_))));
}

// =============================================================================
// METRIC VALUES
// =============================================================================

async fn metric_value(
    Path((_provider, _campaign, requisition)): Path<(String, String, String)>,
) -> (StatusCode, Vec<u8>) {
    match requisition.as_str() {
        "missing" => (StatusCode::NOT_FOUND, Vec::new()),
        "lost" => (StatusCode::GONE, Vec::new()),
        "broken" => (StatusCode::INTERNAL_SERVER_ERROR, b"disk on fire".to_vec()),
        _ => (StatusCode::OK, vec![1, 2, 3]),
    }
}

async fn metric_values() -> MetricValuesClient {
    let router = Router::new().route(
        "/v1/metric_values/{provider}/{campaign}/{requisition}",
        get(metric_value),
    );
    MetricValuesClient::new(reqwest::Client::new(), serve(router).await)
}

#[tokio::test]
async fn metric_values_returns_the_payload() {
    let client = metric_values().await;
    let bytes = client
        .fetch(&RequisitionKey::new("alice", "a", "1234"))
        .await
        .expect("fetch");
    assert_eq!(bytes, vec![1, 2, 3]);
}

#[tokio::test]
async fn metric_value_statuses_map_to_client_errors() {
    let client = metric_values().await;
    let fetch = |requisition: &'static str| {
        let client = client.clone();
        async move {
            client
                .fetch(&RequisitionKey::new("alice", "a", requisition))
                .await
                .expect_err("error status")
        }
    };

    let missing = fetch("missing").await;
    assert!(matches!(missing, ClientError::NotFound(_)));
    assert!(missing.is_missing_data());

    let lost = fetch("lost").await;
    assert!(matches!(lost, ClientError::DataLoss(_)));
    assert!(lost.is_missing_data());

    let broken = fetch("broken").await;
    assert!(matches!(
        &broken,
        ClientError::ServerError(500, body) if body == "disk on fire"
    ));
    assert!(!broken.is_missing_data());
}

// =============================================================================
// PEERS
// =============================================================================

type Received = Arc<Mutex<Vec<(String, Option<String>, Vec<u8>)>>>;

async fn receive(
    State(received): State<Received>,
    Path(endpoint): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let global_id = headers
        .get(COMPUTATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    received
        .lock()
        .expect("lock")
        .push((endpoint, global_id, body.to_vec()));
    StatusCode::OK
}

async fn peer() -> (PeerClient, Received) {
    let received = Received::default();
    let router = Router::new()
        .route("/v1/control/{endpoint}", post(receive))
        .with_state(Arc::clone(&received));
    let url = serve(router).await;
    (PeerClient::new(reqwest::Client::new(), url), received)
}

#[tokio::test]
async fn peer_receives_chunks_as_one_tagged_body() {
    let (client, received) = peer().await;

    client
        .handle_concatenated_sketch(chunk_stream("321", Bytes::from_static(b"abcdefghij"), 4))
        .await
        .expect("sketch");
    client
        .handle_encrypted_flags_and_counts(chunk_stream("321", Bytes::from_static(b"fc"), 4))
        .await
        .expect("flag counts");

    let received = received.lock().expect("lock").clone();
    assert_eq!(
        received,
        vec![
            (
                "concatenated_sketch".to_string(),
                Some("321".to_string()),
                b"abcdefghij".to_vec()
            ),
            (
                "encrypted_flags_and_counts".to_string(),
                Some("321".to_string()),
                b"fc".to_vec()
            ),
        ]
    );
}

#[tokio::test]
async fn empty_payload_sends_no_request() {
    let (client, received) = peer().await;

    client
        .handle_concatenated_sketch(chunk_stream("321", Bytes::new(), 4))
        .await
        .expect("nothing to send");

    assert!(received.lock().expect("lock").is_empty());
}
