//! WebSocket session loop.
//!
//! One logical [`Message`] per binary frame. The read half drives protocol
//! handling; the write half drains a bounded per-connection channel so a
//! slow socket backpressures the producers instead of buffering unbounded.
//! Closing the connection cancels its subscriptions and removes its
//! resolver bindings.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use tidemark_core::hlc::ClockSource;
use tidemark_core::messages::{OpBatchPayload, PartitionMapPayload};
use tidemark_core::{Message, SystemClock};

use crate::error::{EngineError, RoutingError};

use super::{build_delta, AppState};

/// Upgrades the HTTP request into a session loop.
pub async fn upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| session(state, socket))
}

async fn session(state: Arc<AppState>, socket: WebSocket) {
    let connection_id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
    let client_label = format!("conn-{connection_id}");
    tracing::debug!(connection_id, "websocket session opened");
    metrics::counter!("ws_sessions_opened").increment(1);

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    state.register_connection(connection_id, tx.clone());
    let mut shutdown = state.subscribe_shutdown();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let frame = WsMessage::Binary(message.encode().into());
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut authenticated = false;
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            changed = shutdown.changed() => {
                // Node is going down (or the watch sender is gone, which
                // means the same thing): say why, then close.
                if changed.is_err() || *shutdown.borrow() {
                    let _ = tx
                        .send(Message::Error {
                            code: "SHUTDOWN".to_string(),
                            message: "node shutting down".to_string(),
                        })
                        .await;
                    break;
                }
                continue;
            }
        };
        let Some(frame) = frame else { break };
        let bytes = match frame {
            Ok(WsMessage::Binary(bytes)) => bytes,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Text(_)) => continue,
        };
        let message = match Message::decode(&bytes) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(connection_id, %error, "undecodable frame");
                let _ = tx
                    .send(Message::Error {
                        code: "PROTOCOL".to_string(),
                        message: "undecodable frame".to_string(),
                    })
                    .await;
                break;
            }
        };
        if handle_frame(
            &state,
            connection_id,
            &client_label,
            &mut authenticated,
            message,
            &tx,
        )
        .await
        .is_err()
        {
            break;
        }
    }

    state.subscriptions.close_connection(connection_id);
    state.resolver.remove_for_client(&client_label);
    state.unregister_connection(connection_id);
    drop(tx);
    let _ = writer.await;
    metrics::counter!("ws_sessions_closed").increment(1);
    tracing::debug!(connection_id, "websocket session closed");
}

/// Handles one inbound frame. `Err(())` tears the session down.
#[allow(clippy::too_many_lines)]
async fn handle_frame(
    state: &Arc<AppState>,
    connection_id: u64,
    client_label: &str,
    authenticated: &mut bool,
    message: Message,
    tx: &mpsc::Sender<Message>,
) -> Result<(), ()> {
    let send = |message: Message| {
        let tx = tx.clone();
        async move { tx.send(message).await.map_err(|_| ()) }
    };

    match message {
        Message::Auth { token } => {
            if state.auth.verify(&token) {
                *authenticated = true;
                send(Message::AuthOk {
                    node_id: state.node_id.clone(),
                })
                .await?;
            } else {
                let _ = send(Message::Error {
                    code: "AUTH".to_string(),
                    message: "invalid credentials".to_string(),
                })
                .await;
                return Err(());
            }
        }
        Message::Ping { timestamp } => {
            send(Message::Pong {
                timestamp,
                server_time: SystemClock.wall_millis(),
            })
            .await?;
        }
        _ if !*authenticated => {
            let _ = send(Message::Error {
                code: "AUTH".to_string(),
                message: "authenticate first".to_string(),
            })
            .await;
            return Err(());
        }
        Message::Op(payload) => {
            let batch = OpBatchPayload {
                ops: vec![payload.op],
                routing: payload.routing,
            };
            apply_batch(state, batch, client_label, &send).await?;
        }
        Message::OpBatch(batch) => {
            apply_batch(state, batch, client_label, &send).await?;
        }
        Message::SyncReq(request) => {
            let delta = build_delta(state, &request.map_name, &request.last_sync_timestamp);
            send(Message::SyncDelta(delta)).await?;
        }
        Message::QuerySub(payload) => {
            match state
                .coordinator
                .execute(&payload.subscription_id, &payload.map_name, &payload.query)
                .await
            {
                Ok(response) => {
                    let initial: Vec<(String, tidemark_core::Value)> = response
                        .results
                        .iter()
                        .map(|row| (row.key.clone(), row.value.clone()))
                        .collect();
                    if let Err(error) = state.subscriptions.open_query(
                        connection_id,
                        &payload.subscription_id,
                        &payload.map_name,
                        &payload.query,
                        &initial,
                        tx.clone(),
                    ) {
                        send(engine_error_frame(&error)).await?;
                    } else {
                        send(Message::QueryResp(response)).await?;
                    }
                }
                Err(error) => send(engine_error_frame(&error)).await?,
            }
        }
        Message::QueryUnsub(payload) => {
            state.subscriptions.close(connection_id, &payload.subscription_id);
        }
        Message::SearchSub(payload) => {
            match state.coordinator.search(
                &payload.subscription_id,
                &payload.map_name,
                &payload.search_options,
            ) {
                Ok(response) => {
                    let initial: Vec<(String, f64)> = response
                        .results
                        .iter()
                        .map(|hit| (hit.key.clone(), hit.score))
                        .collect();
                    state.subscriptions.open_search(
                        connection_id,
                        &payload.subscription_id,
                        &payload.map_name,
                        &payload.search_options,
                        &initial,
                        tx.clone(),
                    );
                    send(Message::SearchResp(response)).await?;
                }
                Err(error) => send(engine_error_frame(&error)).await?,
            }
        }
        Message::SearchUnsub(payload) => {
            state.subscriptions.close(connection_id, &payload.subscription_id);
        }
        Message::PartitionMapRequest(request) => {
            match state.router.snapshot() {
                Some(map) if Some(map.version()) != request.current_version => {
                    send(Message::PartitionMap(PartitionMapPayload {
                        map: (*map).clone(),
                    }))
                    .await?;
                }
                Some(_) => {} // Client is current; nothing to send.
                None => {
                    send(Message::Error {
                        code: "NO_MAP".to_string(),
                        message: "partition map not loaded".to_string(),
                    })
                    .await?;
                }
            }
        }
        other => {
            tracing::debug!(kind = other.kind(), "unexpected frame for client session");
            send(Message::Error {
                code: "PROTOCOL".to_string(),
                message: format!("unexpected frame {}", other.kind()),
            })
            .await?;
        }
    }
    Ok(())
}

async fn apply_batch<F, Fut>(
    state: &Arc<AppState>,
    batch: OpBatchPayload,
    client_label: &str,
    send: &F,
) -> Result<(), ()>
where
    F: Fn(Message) -> Fut,
    Fut: std::future::Future<Output = Result<(), ()>>,
{
    match state.applier.apply_batch(batch, client_label).await {
        Ok(ack) => send(Message::Ack(ack)).await,
        Err(EngineError::Routing(RoutingError::NotOwner {
            partition_id,
            current_owner,
            map_version,
        })) => {
            send(Message::NotOwner(tidemark_core::messages::NotOwnerPayload {
                partition_id,
                current_owner,
                map_version,
            }))
            .await
        }
        Err(EngineError::Routing(RoutingError::StaleMap {
            client_version,
            server_version,
        })) => {
            send(Message::StaleMap(tidemark_core::messages::StaleMapPayload {
                client_version,
                server_version,
            }))
            .await
        }
        Err(error) => {
            send(Message::Error {
                code: error.code().to_string(),
                message: error.to_string(),
            })
            .await
        }
    }
}

fn engine_error_frame(error: &EngineError) -> Message {
    Message::Error {
        code: error.code().to_string(),
        message: error.to_string(),
    }
}
