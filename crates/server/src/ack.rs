//! Write-acknowledgment manager.
//!
//! Every write that asks for a durability level registers here and gets a
//! future. Progress notifications record the highest level reached; the
//! future resolves the first time the recorded level satisfies the target,
//! or unsuccessfully at the deadline with whatever level was achieved.
//! Levels only move up, duplicate notifications are idempotent, and unknown
//! op ids are ignored. Promises never leak: every registration resolves.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};

use tidemark_core::messages::WriteConcern;

/// How a pending write acknowledgment concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    /// Whether the target level was reached in time.
    pub success: bool,
    /// Highest durability level reached.
    pub achieved_level: WriteConcern,
    /// Failure detail when `success` is false.
    pub error: Option<String>,
}

/// Lifecycle events observable from the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    Resolved { op_id: u64 },
    Failed { op_id: u64 },
    TimedOut { op_id: u64 },
}

struct PendingAck {
    target: WriteConcern,
    achieved: WriteConcern,
    waiter: Option<oneshot::Sender<AckOutcome>>,
}

/// Registry of pending write acknowledgments.
pub struct WriteAckManager {
    pending: Arc<DashMap<u64, PendingAck>>,
    default_timeout: Duration,
    events: broadcast::Sender<AckEvent>,
}

impl WriteAckManager {
    /// Creates a manager with the given default resolution deadline.
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            pending: Arc::new(DashMap::new()),
            default_timeout,
            events,
        }
    }

    /// Subscribes to resolution events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<AckEvent> {
        self.events.subscribe()
    }

    /// Registers a pending write and returns a future resolving to its
    /// outcome.
    ///
    /// The future resolves successfully the first time the recorded level
    /// satisfies `target`, or unsuccessfully at the deadline (the override,
    /// or the manager default) carrying the highest achieved level.
    pub fn register_pending(
        &self,
        op_id: u64,
        target: WriteConcern,
        timeout: Option<Duration>,
    ) -> impl std::future::Future<Output = AckOutcome> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        // FIRE_AND_FORGET resolves immediately; nothing to wait for.
        if target == WriteConcern::FireAndForget {
            let _ = tx.send(AckOutcome {
                success: true,
                achieved_level: WriteConcern::FireAndForget,
                error: None,
            });
        } else {
            self.pending.insert(
                op_id,
                PendingAck {
                    target,
                    achieved: WriteConcern::FireAndForget,
                    waiter: Some(tx),
                },
            );
            metrics::gauge!("write_ack_pending").set(self.pending.len() as f64);
            self.spawn_timeout(op_id, timeout.unwrap_or(self.default_timeout), target);
        }

        async move {
            rx.await.unwrap_or(AckOutcome {
                success: false,
                achieved_level: WriteConcern::FireAndForget,
                error: Some("ack manager dropped".to_string()),
            })
        }
    }

    /// Records that an operation reached a durability level.
    ///
    /// Idempotent and monotonic: lower or repeated levels change nothing.
    /// Unknown op ids are ignored.
    pub fn notify_level(&self, op_id: u64, level: WriteConcern) {
        let mut resolved = false;
        if let Some(mut entry) = self.pending.get_mut(&op_id) {
            if level.rank() > entry.achieved.rank() {
                entry.achieved = level;
            }
            if entry.achieved.satisfies(entry.target) {
                if let Some(tx) = entry.waiter.take() {
                    let _ = tx.send(AckOutcome {
                        success: true,
                        achieved_level: entry.achieved,
                        error: None,
                    });
                }
                resolved = true;
            }
        }
        if resolved {
            self.pending.remove(&op_id);
            metrics::counter!("write_ack_resolved").increment(1);
            let _ = self.events.send(AckEvent::Resolved { op_id });
        }
    }

    /// Records a level for many operations atomically with respect to each
    /// id (each id resolves at most once).
    pub fn notify_level_batch(&self, op_ids: &[u64], level: WriteConcern) {
        for op_id in op_ids {
            self.notify_level(*op_id, level);
        }
    }

    /// Resolves a pending write unsuccessfully with the given error.
    pub fn fail_pending(&self, op_id: u64, error: impl Into<String>) {
        if let Some((_, mut entry)) = self.pending.remove(&op_id) {
            if let Some(tx) = entry.waiter.take() {
                let _ = tx.send(AckOutcome {
                    success: false,
                    achieved_level: entry.achieved,
                    error: Some(error.into()),
                });
            }
            metrics::counter!("write_ack_failed").increment(1);
            let _ = self.events.send(AckEvent::Failed { op_id });
        }
    }

    /// Fails every pending write, used at shutdown.
    pub fn fail_all(&self, error: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for op_id in ids {
            self.fail_pending(op_id, error);
        }
    }

    /// Pending registrations by level currently achieved.
    #[must_use]
    pub fn pending_by_level(&self) -> Vec<(WriteConcern, usize)> {
        let levels = [
            WriteConcern::FireAndForget,
            WriteConcern::Memory,
            WriteConcern::Applied,
            WriteConcern::Replicated,
            WriteConcern::Persisted,
        ];
        levels
            .into_iter()
            .map(|level| {
                let count = self.pending.iter().filter(|e| e.achieved == level).count();
                (level, count)
            })
            .collect()
    }

    /// Number of unresolved registrations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn spawn_timeout(&self, op_id: u64, timeout: Duration, target: WriteConcern) {
        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, mut entry)) = pending.remove(&op_id) {
                let achieved = entry.achieved;
                if let Some(tx) = entry.waiter.take() {
                    let _ = tx.send(AckOutcome {
                        success: false,
                        achieved_level: achieved,
                        error: Some(format!(
                            "timeout waiting for write ack: achieved {achieved:?}, requested {target:?}"
                        )),
                    });
                }
                metrics::counter!("write_ack_timeout").increment(1);
                let _ = events.send(AckEvent::TimedOut { op_id });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> WriteAckManager {
        WriteAckManager::new(Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_when_target_level_reached() {
        let mgr = manager();
        let fut = mgr.register_pending(1, WriteConcern::Applied, None);
        mgr.notify_level(1, WriteConcern::Memory);
        mgr.notify_level(1, WriteConcern::Applied);
        let outcome = fut.await;
        assert!(outcome.success);
        assert_eq!(outcome.achieved_level, WriteConcern::Applied);
        assert_eq!(mgr.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn higher_level_satisfies_lower_target() {
        let mgr = manager();
        let fut = mgr.register_pending(1, WriteConcern::Memory, None);
        mgr.notify_level(1, WriteConcern::Persisted);
        let outcome = fut.await;
        assert!(outcome.success);
        assert_eq!(outcome.achieved_level, WriteConcern::Persisted);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_highest_achieved_level() {
        let mgr = manager();
        let fut = mgr.register_pending(1, WriteConcern::Persisted, Some(Duration::from_millis(100)));
        mgr.notify_level(1, WriteConcern::Applied);

        let outcome = fut.await;
        assert!(!outcome.success);
        assert_eq!(outcome.achieved_level, WriteConcern::Applied);
        let error = outcome.error.expect("timeout carries error");
        assert!(error.contains("Applied"), "got: {error}");
        assert!(error.contains("Persisted"), "got: {error}");
        assert_eq!(mgr.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_and_lower_notifications_are_idempotent() {
        let mgr = manager();
        let fut = mgr.register_pending(1, WriteConcern::Replicated, None);
        mgr.notify_level(1, WriteConcern::Applied);
        mgr.notify_level(1, WriteConcern::Applied);
        mgr.notify_level(1, WriteConcern::Memory);
        assert_eq!(mgr.pending_count(), 1);
        mgr.notify_level(1, WriteConcern::Replicated);
        assert!(fut.await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_op_ids_are_ignored() {
        let mgr = manager();
        mgr.notify_level(99, WriteConcern::Persisted);
        mgr.fail_pending(99, "nope");
        assert_eq!(mgr.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_pending_resolves_unsuccessfully() {
        let mgr = manager();
        let fut = mgr.register_pending(1, WriteConcern::Replicated, None);
        mgr.notify_level(1, WriteConcern::Applied);
        mgr.fail_pending(1, "backup unreachable");
        let outcome = fut.await;
        assert!(!outcome.success);
        assert_eq!(outcome.achieved_level, WriteConcern::Applied);
        assert_eq!(outcome.error.as_deref(), Some("backup unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_notification_resolves_many() {
        let mgr = manager();
        let f1 = mgr.register_pending(1, WriteConcern::Applied, None);
        let f2 = mgr.register_pending(2, WriteConcern::Applied, None);
        let f3 = mgr.register_pending(3, WriteConcern::Persisted, None);
        mgr.notify_level_batch(&[1, 2, 3], WriteConcern::Applied);
        assert!(f1.await.success);
        assert!(f2.await.success);
        // Op 3 still waiting on a higher level.
        assert_eq!(mgr.pending_count(), 1);
        drop(f3);
    }

    #[tokio::test(start_paused = true)]
    async fn fire_and_forget_resolves_immediately() {
        let mgr = manager();
        let outcome = mgr
            .register_pending(1, WriteConcern::FireAndForget, None)
            .await;
        assert!(outcome.success);
        assert_eq!(mgr.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_and_events() {
        let mgr = manager();
        let mut events = mgr.events();
        let fut = mgr.register_pending(1, WriteConcern::Applied, None);
        mgr.notify_level(1, WriteConcern::Memory);
        let by_level = mgr.pending_by_level();
        assert!(by_level.contains(&(WriteConcern::Memory, 1)));

        mgr.notify_level(1, WriteConcern::Applied);
        fut.await;
        assert_eq!(events.recv().await.unwrap(), AckEvent::Resolved { op_id: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn fail_all_clears_everything() {
        let mgr = manager();
        let f1 = mgr.register_pending(1, WriteConcern::Applied, None);
        let f2 = mgr.register_pending(2, WriteConcern::Persisted, None);
        mgr.fail_all("shutting down");
        assert!(!f1.await.success);
        assert!(!f2.await.success);
        assert_eq!(mgr.pending_count(), 0);
    }
}
