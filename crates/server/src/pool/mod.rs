//! Per-node connection pool: session state, health probes, reconnect with
//! jittered exponential backoff, and primary selection.
//!
//! The pool knows nothing about partitions; it reacts to
//! [`ClusterEvent`](crate::routing::ClusterEvent)s published by the router
//! (dial a hinted owner on a routing miss) and publishes node health events
//! back on the same bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use tidemark_core::Message;

use crate::config::ConnectionPoolConfig;
use crate::routing::{ClusterBus, ClusterEvent};

/// Lifecycle state of one node session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; the node is unhealthy until a probe
    /// succeeds again.
    Failed,
}

/// Health bookkeeping for one node.
#[derive(Debug, Clone, Default)]
pub struct NodeHealth {
    /// Latest ping round-trip, milliseconds.
    pub last_rtt_ms: Option<u64>,
    /// Probe failures since the last success.
    pub consecutive_failures: u32,
    /// Reconnect attempts since the last established connection.
    pub reconnect_attempts: u32,
}

/// Dialer abstraction over the physical transport (out of the engine's
/// scope); tests stub it.
#[async_trait]
pub trait NodeDialer: Send + Sync {
    /// Establishes (and authenticates) a connection to the node.
    async fn dial(&self, node_id: &str) -> anyhow::Result<()>;

    /// Round-trip probe; returns the RTT in milliseconds.
    async fn ping(&self, node_id: &str) -> anyhow::Result<u64>;
}

struct NodeSession {
    state: SessionState,
    health: NodeHealth,
    outbound: Vec<Message>,
}

impl NodeSession {
    fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            health: NodeHealth::default(),
            outbound: Vec::new(),
        }
    }
}

/// Jittered exponential backoff delay for a reconnect attempt.
///
/// `base * 2^attempt`, capped at `cap`, with up to 25% random jitter added
/// so a restarted cluster does not see synchronized reconnect storms.
#[must_use]
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64, rng: &mut impl Rng) -> Duration {
    let exp = base_ms.saturating_mul(1_u64 << attempt.min(16));
    let capped = exp.min(cap_ms);
    let jitter = rng.random_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}

/// The node connection pool.
pub struct ConnectionPool {
    config: ConnectionPoolConfig,
    dialer: Arc<dyn NodeDialer>,
    sessions: DashMap<String, Mutex<NodeSession>>,
    bus: ClusterBus,
}

impl ConnectionPool {
    /// Creates a pool over a dialer.
    #[must_use]
    pub fn new(
        config: ConnectionPoolConfig,
        dialer: Arc<dyn NodeDialer>,
        bus: ClusterBus,
    ) -> Self {
        Self {
            config,
            dialer,
            sessions: DashMap::new(),
            bus,
        }
    }

    /// Current state for a node; `Disconnected` when never seen.
    #[must_use]
    pub fn state(&self, node_id: &str) -> SessionState {
        self.sessions
            .get(node_id)
            .map_or(SessionState::Disconnected, |s| s.lock().state)
    }

    /// Health snapshot for a node.
    #[must_use]
    pub fn health(&self, node_id: &str) -> NodeHealth {
        self.sessions
            .get(node_id)
            .map_or_else(NodeHealth::default, |s| s.lock().health.clone())
    }

    /// Health snapshot of the whole pool, for the debug surface.
    #[must_use]
    pub fn health_snapshot(&self) -> Vec<(String, SessionState, NodeHealth)> {
        let mut out: Vec<(String, SessionState, NodeHealth)> = self
            .sessions
            .iter()
            .map(|entry| {
                let session = entry.value().lock();
                (entry.key().clone(), session.state, session.health.clone())
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Connects to a node, driving the reconnect loop on failure.
    ///
    /// Backoff starts at `reconnect_delay_ms`, doubles with jitter, caps at
    /// `max_reconnect_delay_ms`, and gives up after
    /// `max_reconnect_attempts`, marking the node [`SessionState::Failed`]
    /// and publishing `NodeUnhealthy`.
    pub async fn connect(&self, node_id: &str) -> bool {
        self.set_state(node_id, SessionState::Connecting);
        let mut attempt = 0_u32;
        loop {
            let deadline = Duration::from_millis(self.config.connection_timeout_ms);
            let dialed = tokio::time::timeout(deadline, self.dialer.dial(node_id)).await;
            match dialed {
                Ok(Ok(())) => {
                    self.with_session(node_id, |session| {
                        session.state = SessionState::Connected;
                        session.health.reconnect_attempts = 0;
                        session.health.consecutive_failures = 0;
                    });
                    if attempt > 0 {
                        self.bus.publish(ClusterEvent::NodeRecovered {
                            node_id: node_id.to_string(),
                        });
                    }
                    metrics::counter!("pool_connects").increment(1);
                    return true;
                }
                Ok(Err(error)) => {
                    tracing::warn!(node_id, attempt, %error, "dial failed");
                }
                Err(_) => {
                    tracing::warn!(node_id, attempt, "dial timed out");
                }
            }

            attempt += 1;
            self.with_session(node_id, |session| {
                session.state = SessionState::Reconnecting;
                session.health.reconnect_attempts = attempt;
            });
            if attempt >= self.config.max_reconnect_attempts {
                self.set_state(node_id, SessionState::Failed);
                self.bus.publish(ClusterEvent::NodeUnhealthy {
                    node_id: node_id.to_string(),
                });
                metrics::counter!("pool_connect_failures").increment(1);
                return false;
            }
            let delay = backoff_delay(
                attempt - 1,
                self.config.reconnect_delay_ms,
                self.config.max_reconnect_delay_ms,
                &mut rand::rng(),
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Probes a node and updates its health record.
    pub async fn probe(&self, node_id: &str) {
        match self.dialer.ping(node_id).await {
            Ok(rtt_ms) => self.with_session(node_id, |session| {
                session.health.last_rtt_ms = Some(rtt_ms);
                session.health.consecutive_failures = 0;
                if session.state == SessionState::Failed {
                    session.state = SessionState::Disconnected;
                }
            }),
            Err(error) => {
                tracing::debug!(node_id, %error, "health probe failed");
                self.with_session(node_id, |session| {
                    session.health.consecutive_failures += 1;
                });
            }
        }
    }

    /// Starts the periodic health probe worker over the given node list
    /// provider.
    pub fn spawn_prober(
        self: &Arc<Self>,
        nodes: Arc<dyn Fn() -> Vec<String> + Send + Sync>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis(pool.config.health_check_interval_ms.max(1));
            loop {
                tokio::time::sleep(interval).await;
                for node in nodes() {
                    pool.probe(&node).await;
                }
            }
        })
    }

    /// The primary node: lowest-RTT healthy session, ties and unmeasured
    /// nodes falling back deterministically to the smallest node id.
    #[must_use]
    pub fn primary(&self) -> Option<String> {
        let mut best: Option<(u64, String)> = None;
        for entry in &self.sessions {
            let session = entry.value().lock();
            if session.state == SessionState::Failed {
                continue;
            }
            let rtt = session.health.last_rtt_ms.unwrap_or(u64::MAX);
            let candidate = (rtt, entry.key().clone());
            best = match best {
                None => Some(candidate),
                Some(current) if candidate < current => Some(candidate),
                Some(current) => Some(current),
            };
        }
        best.map(|(_, node_id)| node_id)
    }

    /// Queues an outbound message for a node; the transport layer drains it.
    pub fn enqueue(&self, node_id: &str, message: Message) {
        self.with_session(node_id, |session| session.outbound.push(message));
    }

    /// Drains a node's outbound queue.
    #[must_use]
    pub fn drain_outbound(&self, node_id: &str) -> Vec<Message> {
        self.sessions
            .get(node_id)
            .map(|s| std::mem::take(&mut s.lock().outbound))
            .unwrap_or_default()
    }

    fn set_state(&self, node_id: &str, state: SessionState) {
        self.with_session(node_id, |session| session.state = state);
    }

    fn with_session(&self, node_id: &str, f: impl FnOnce(&mut NodeSession)) {
        let entry = self
            .sessions
            .entry(node_id.to_string())
            .or_insert_with(|| Mutex::new(NodeSession::new()));
        f(&mut entry.lock());
    }
}
