//! HTTP surface: `POST /sync`, health and readiness probes, the gated debug
//! endpoints, and the WebSocket upgrade feeding the session loop.
//!
//! `/sync` negotiates MsgPack or JSON by `Content-Type` and answers in
//! kind. Authentication is a bearer token compared in constant time; token
//! *verification* (JWT et al.) is the embedder's concern behind
//! [`AuthVerifier`].

mod ws;

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, watch};

use tidemark_core::hlc::ClockSource;
use tidemark_core::messages::{
    AckPayload, HealthResponse, HttpSyncRequest, HttpSyncResponse, KeyRecord, OpBatchPayload,
    ReadyResponse, SyncDeltaPayload,
};
use tidemark_core::{HybridClock, Message, SystemClock, Timestamp};

use crate::ack::WriteAckManager;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::query::{QueryCoordinator, SearchCatalog, SubscriptionManager};
use crate::replication::ReplicationQueue;
use crate::resolve::{ConflictResolver, MergeRejection};
use crate::routing::PartitionRouter;
use crate::store::maps::MapStore;
use crate::sync::apply::InboundApplier;

/// Verifies bearer credentials; the engine ships the shared-secret
/// implementation and treats anything richer as external.
pub trait AuthVerifier: Send + Sync {
    /// Whether the presented token grants access.
    fn verify(&self, token: &str) -> bool;
}

/// Constant-time shared-secret verifier.
pub struct SharedSecretVerifier {
    secret: Vec<u8>,
}

impl SharedSecretVerifier {
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }
}

impl AuthVerifier for SharedSecretVerifier {
    fn verify(&self, token: &str) -> bool {
        token.as_bytes().ct_eq(&self.secret).into()
    }
}

/// Recent merge rejections kept for the debug surface.
const REJECTION_RING: usize = 128;

/// Shared state behind every HTTP handler.
pub struct AppState {
    pub config: EngineConfig,
    pub node_id: String,
    pub clock: Mutex<HybridClock>,
    pub store: Arc<MapStore>,
    pub router: Arc<PartitionRouter>,
    pub applier: Arc<InboundApplier>,
    pub coordinator: Arc<QueryCoordinator>,
    pub catalog: Arc<SearchCatalog>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub acks: Arc<WriteAckManager>,
    pub replication: Arc<ReplicationQueue>,
    pub resolver: Arc<ConflictResolver>,
    pub auth: Arc<dyn AuthVerifier>,
    pub recent_rejections: Mutex<VecDeque<MergeRejection>>,
    pub next_connection_id: AtomicU64,
    /// Outbound channel of every open WebSocket session, so shutdown can
    /// reach them with a reason frame.
    connections: DashMap<u64, mpsc::Sender<Message>>,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Builds the handler state over an assembled engine.
    #[must_use]
    pub fn new(config: EngineConfig, engine: &Engine, auth: Arc<dyn AuthVerifier>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            node_id: engine.node_id.clone(),
            clock: Mutex::new(HybridClock::new(
                engine.node_id.clone(),
                Box::new(SystemClock),
            )),
            store: engine.store.clone(),
            router: engine.router.clone(),
            applier: engine.applier.clone(),
            coordinator: engine.coordinator.clone(),
            catalog: engine.catalog.clone(),
            subscriptions: engine.subscriptions.clone(),
            acks: engine.acks.clone(),
            replication: engine.replication.clone(),
            resolver: engine.resolver.clone(),
            auth,
            recent_rejections: Mutex::new(VecDeque::new()),
            next_connection_id: AtomicU64::new(1),
            connections: DashMap::new(),
            shutdown,
        })
    }

    /// Signals every open session to send its shutdown reason frame and
    /// close. Idempotent; call before tearing the engine down.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Whether shutdown has been signaled.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Number of open WebSocket sessions.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn register_connection(&self, id: u64, tx: mpsc::Sender<Message>) {
        self.connections.insert(id, tx);
    }

    pub(crate) fn unregister_connection(&self, id: u64) {
        self.connections.remove(&id);
    }

    /// Records a rejection for the debug ring.
    pub fn record_rejection(&self, rejection: MergeRejection) {
        let mut ring = self.recent_rejections.lock();
        if ring.len() == REJECTION_RING {
            ring.pop_front();
        }
        ring.push_back(rejection);
    }

    /// Starts the task mirroring resolver rejections into the debug ring.
    pub fn spawn_rejection_collector(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        let mut rejections = state.resolver.rejections();
        tokio::spawn(async move {
            while let Ok(rejection) = rejections.recv().await {
                state.record_rejection(rejection);
            }
        })
    }
}

/// Builds the full router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/sync", post(http_sync))
        .route("/ws", get(ws::upgrade))
        .route("/debug/stats", get(debug_stats))
        .route("/debug/crdt/{map}", get(debug_crdt))
        .route("/debug/conflicts", get(debug_conflicts))
        .route("/debug/search", get(debug_search))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::timeout::TimeoutLayer::new(
            std::time::Duration::from_secs(30),
        ))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: SystemClock.wall_millis(),
    })
}

async fn ready(State(state): State<Arc<AppState>>) -> Response {
    let ready = state.router.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(ReadyResponse { ready })).into_response()
}

/// Whether the request negotiated MsgPack (the default is JSON).
fn wants_msgpack(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("msgpack"))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn http_sync(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !state.auth.verify(token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let msgpack = wants_msgpack(&headers);
    let request: HttpSyncRequest = if msgpack {
        match rmp_serde::from_slice(&body) {
            Ok(request) => request,
            Err(error) => {
                return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
            }
        }
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(error) => {
                return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
            }
        }
    };

    match handle_sync(&state, request).await {
        Ok(response) => {
            if msgpack {
                match rmp_serde::to_vec_named(&response) {
                    Ok(bytes) => (
                        [(header::CONTENT_TYPE, "application/x-msgpack")],
                        bytes,
                    )
                        .into_response(),
                    Err(error) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
                    }
                }
            } else {
                axum::Json(response).into_response()
            }
        }
        Err(error) => error_response(&error),
    }
}

fn error_response(error: &EngineError) -> Response {
    let status = match error {
        EngineError::Auth(_) => StatusCode::UNAUTHORIZED,
        EngineError::Schema(_) | EngineError::Protocol(_) => StatusCode::BAD_REQUEST,
        EngineError::Backpressure { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string()).into_response()
}

async fn handle_sync(
    state: &Arc<AppState>,
    request: HttpSyncRequest,
) -> Result<HttpSyncResponse, EngineError> {
    // Fold the client clock before stamping anything on its behalf.
    {
        let mut clock = state.clock.lock();
        if let Err(drift) = clock.observe(&request.client_hlc) {
            return Err(EngineError::ClockDrift(drift));
        }
    }

    let ack: Option<AckPayload> = match request.operations {
        Some(operations) if !operations.is_empty() => Some(
            state
                .applier
                .apply_batch(
                    OpBatchPayload {
                        ops: operations,
                        routing: None,
                    },
                    &request.client_id,
                )
                .await?,
        ),
        _ => None,
    };

    let deltas = request.sync_maps.map(|maps| {
        maps.into_iter()
            .map(|entry| build_delta(state, &entry.map_name, &entry.last_sync_timestamp))
            .collect::<Vec<_>>()
    });

    let mut query_results = None;
    if let Some(queries) = request.queries {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(
                state
                    .coordinator
                    .execute(&query.request_id, &query.map_name, &query.query)
                    .await?,
            );
        }
        query_results = Some(results);
    }

    let mut search_results = None;
    if let Some(searches) = request.searches {
        let mut results = Vec::with_capacity(searches.len());
        for search in searches {
            results.push(state.coordinator.search(
                &search.request_id,
                &search.map_name,
                &search.search_options,
            )?);
        }
        search_results = Some(results);
    }

    let server_hlc = state.clock.lock().now();
    Ok(HttpSyncResponse {
        server_hlc,
        ack,
        deltas,
        query_results,
        search_results,
    })
}

/// Builds one map's delta frame for a pull watermark.
pub fn build_delta(
    state: &Arc<AppState>,
    map_name: &str,
    since: &Timestamp,
) -> SyncDeltaPayload {
    let records = state
        .store
        .records_since(map_name, since)
        .into_iter()
        .map(|(key, record)| KeyRecord { key, record })
        .collect();
    SyncDeltaPayload {
        map_name: map_name.to_string(),
        records,
        server_timestamp: state.clock.lock().now(),
    }
}

// ---------------------------------------------------------------------------
// Debug endpoints (read-only; 404 unless enabled)
// ---------------------------------------------------------------------------

fn debug_gate(state: &AppState) -> Result<(), StatusCode> {
    if state.config.debug_endpoints {
        Ok(())
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn debug_stats(State(state): State<Arc<AppState>>) -> Response {
    if let Err(status) = debug_gate(&state) {
        return status.into_response();
    }
    let pending_by_level: Vec<(String, usize)> = state
        .acks
        .pending_by_level()
        .into_iter()
        .map(|(level, count)| (format!("{level:?}"), count))
        .collect();
    axum::Json(serde_json::json!({
        "nodeId": state.node_id,
        "partitionMapVersion": state.router.version(),
        "maps": state.store.map_names(),
        "writeAck": {
            "pending": state.acks.pending_count(),
            "pendingByLevel": pending_by_level,
        },
        "replication": {
            "queued": state.replication.queued_len(),
            "lag": state.replication.lag_stats(),
        },
        "subscriptions": state.subscriptions.len(),
        "connections": state.open_connections(),
        "resolvers": state.resolver.binding_counts(),
    }))
    .into_response()
}

async fn debug_crdt(
    State(state): State<Arc<AppState>>,
    Path(map): Path<String>,
) -> Response {
    if let Err(status) = debug_gate(&state) {
        return status.into_response();
    }
    let snapshot = state.store.snapshot(&map);
    axum::Json(serde_json::json!({
        "mapName": map,
        "kind": state.store.kind(&map).map(|k| format!("{k:?}")),
        "entries": snapshot
            .into_iter()
            .map(|(key, value)| serde_json::json!({"key": key, "value": value}))
            .collect::<Vec<_>>(),
    }))
    .into_response()
}

async fn debug_conflicts(State(state): State<Arc<AppState>>) -> Response {
    if let Err(status) = debug_gate(&state) {
        return status.into_response();
    }
    let rejections: Vec<serde_json::Value> = state
        .recent_rejections
        .lock()
        .iter()
        .map(|r| {
            serde_json::json!({
                "mapName": r.map_name,
                "key": r.key,
                "remoteNodeId": r.remote_node_id,
                "reason": r.reason,
            })
        })
        .collect();
    axum::Json(rejections).into_response()
}

async fn debug_search(State(state): State<Arc<AppState>>) -> Response {
    if let Err(status) = debug_gate(&state) {
        return status.into_response();
    }
    let stats: Vec<serde_json::Value> = state
        .catalog
        .stats()
        .into_iter()
        .map(|(map, stats)| serde_json::json!({"mapName": map, "stats": stats}))
        .collect();
    axum::Json(stats).into_response()
}
