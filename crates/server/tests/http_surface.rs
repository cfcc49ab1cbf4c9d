//! HTTP surface tests driven through the router with `tower::oneshot` —
//! no sockets involved.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use tidemark_core::messages::{HttpSyncRequest, HttpSyncResponse, Operation, OpBody, SyncReqPayload};
use tidemark_core::{Timestamp, Value};

use tidemark_server::http::{app, AppState, SharedSecretVerifier};
use tidemark_server::{Engine, EngineConfig, EngineDeps};

async fn state(debug: bool) -> Arc<AppState> {
    let config = EngineConfig {
        node_id: "http-node".to_string(),
        debug_endpoints: debug,
        ..EngineConfig::default()
    };
    let engine = Engine::assemble(config.clone(), EngineDeps::default())
        .await
        .unwrap();
    AppState::new(
        config,
        &engine,
        Arc::new(SharedSecretVerifier::new("hunter2")),
    )
}

fn client_hlc() -> Timestamp {
    Timestamp {
        millis: 1,
        counter: 0,
        node_id: "c1".into(),
    }
}

fn sync_body(request: &HttpSyncRequest) -> Body {
    Body::from(serde_json::to_vec(request).unwrap())
}

async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_answers_ok() {
    let app = app(state(false).await);
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = read_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn ready_is_503_until_partition_map_loads() {
    let state = state(false).await;
    let response = app(state.clone())
        .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let map = tidemark_core::PartitionMap::from_snapshot(1, vec![], vec![]).unwrap();
    state.router.apply_snapshot(map);

    let response = app(state)
        .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = read_json(response).await;
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn sync_requires_bearer_auth() {
    let app = app(state(false).await);
    let request = HttpSyncRequest {
        client_id: "c1".into(),
        client_hlc: client_hlc(),
        operations: None,
        sync_maps: None,
        queries: None,
        searches: None,
    };

    // Missing header.
    let response = app
        .clone()
        .oneshot(
            Request::post("/sync")
                .header(header::CONTENT_TYPE, "application/json")
                .body(sync_body(&request))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong token.
    let response = app
        .oneshot(
            Request::post("/sync")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(sync_body(&request))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sync_rejects_malformed_body_with_400() {
    let app = app(state(false).await);
    let response = app
        .oneshot(
            Request::post("/sync")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, "Bearer hunter2")
                .body(Body::from("{\"not\": \"a sync request\"}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sync_applies_ops_and_returns_deltas() {
    let app = app(state(false).await);
    let op = Operation {
        id: 7,
        map_name: "users".into(),
        key: "user/1".into(),
        body: OpBody::Put {
            value: Value::from("Alice"),
            timestamp: Timestamp {
                millis: 1_000,
                counter: 0,
                node_id: "c1".into(),
            },
            ttl_ms: None,
        },
        write_concern: None,
        timeout_ms: None,
    };
    let request = HttpSyncRequest {
        client_id: "c1".into(),
        client_hlc: client_hlc(),
        operations: Some(vec![op]),
        sync_maps: Some(vec![SyncReqPayload {
            map_name: "users".into(),
            last_sync_timestamp: Timestamp::zero(),
        }]),
        queries: None,
        searches: None,
    };

    let response = app
        .oneshot(
            Request::post("/sync")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, "Bearer hunter2")
                .body(sync_body(&request))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: HttpSyncResponse = read_json(response).await;

    let ack = body.ack.expect("ack for pushed ops");
    assert_eq!(ack.last_id, 7);
    let deltas = body.deltas.expect("deltas for requested map");
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].map_name, "users");
    assert_eq!(deltas[0].records.len(), 1);
    assert_eq!(deltas[0].records[0].key, "user/1");
}

#[tokio::test]
async fn msgpack_negotiation_roundtrips() {
    let app = app(state(false).await);
    let request = HttpSyncRequest {
        client_id: "c1".into(),
        client_hlc: client_hlc(),
        operations: None,
        sync_maps: None,
        queries: None,
        searches: None,
    };
    let response = app
        .oneshot(
            Request::post("/sync")
                .header(header::CONTENT_TYPE, "application/x-msgpack")
                .header(header::AUTHORIZATION, "Bearer hunter2")
                .body(Body::from(rmp_serde::to_vec_named(&request).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/x-msgpack")
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: HttpSyncResponse = rmp_serde::from_slice(&bytes).unwrap();
    assert_eq!(body.server_hlc.node_id, "http-node");
}

#[tokio::test]
async fn shutdown_signal_is_idempotent_and_observable() {
    let state = state(false).await;
    assert!(!state.is_shutting_down());
    assert_eq!(state.open_connections(), 0);

    state.begin_shutdown();
    state.begin_shutdown();
    assert!(state.is_shutting_down());

    // The HTTP surface keeps answering health checks while sessions drain.
    let response = app(state)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn debug_endpoints_gate_on_config() {
    // Off: 404.
    let response = app(state(false).await)
        .oneshot(Request::get("/debug/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // On: read-only stats answer.
    let state = state(true).await;
    state
        .store
        .lww_set("users", "u1", Value::Int(1), None)
        .unwrap();
    let response = app(state.clone())
        .oneshot(Request::get("/debug/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = read_json(response).await;
    assert_eq!(body["nodeId"], "http-node");

    let response = app(state)
        .oneshot(Request::get("/debug/crdt/users").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = read_json(response).await;
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);
}
