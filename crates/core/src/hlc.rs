//! Hybrid logical clock for cross-node causality.
//!
//! Every mutation in the engine is stamped by a [`HybridClock`], which
//! combines wall-clock milliseconds with a logical counter and the node id.
//! The resulting [`Timestamp`] is totally ordered, which is what makes
//! last-write-wins merges deterministic across replicas.
//!
//! # Wire format
//!
//! Timestamps print as `"millis:counter:nodeId"`. The same string doubles as
//! the observation tag format for observed-remove entries. Node ids must not
//! contain `:`.

use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Default tolerated forward drift of a remote clock: 60 seconds.
pub const DEFAULT_MAX_DRIFT_MS: u64 = 60_000;

/// A hybrid logical timestamp.
///
/// Total order: `millis`, then `counter`, then `node_id` byte-wise. Two
/// timestamps from different nodes are never equal unless all three fields
/// coincide, so ties between concurrent writers resolve by node id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    /// Wall-clock milliseconds since the Unix epoch at stamp time.
    pub millis: u64,
    /// Logical counter disambiguating events within one millisecond.
    pub counter: u32,
    /// Id of the node that issued this timestamp.
    pub node_id: String,
}

impl Timestamp {
    /// The zero timestamp, ordered before every real stamp. Used as the
    /// initial sync watermark.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            millis: 0,
            counter: 0,
            node_id: String::new(),
        }
    }

    /// Parses the `"millis:counter:nodeId"` wire form.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampParseError`] when the string does not have three
    /// colon-separated parts or the numeric parts do not parse.
    pub fn parse(s: &str) -> Result<Self, TimestampParseError> {
        let mut parts = s.splitn(3, ':');
        let (Some(millis), Some(counter), Some(node_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(TimestampParseError::Shape(s.to_string()));
        };
        if node_id.is_empty() {
            return Err(TimestampParseError::Shape(s.to_string()));
        }
        Ok(Self {
            millis: millis
                .parse()
                .map_err(|_| TimestampParseError::Millis(s.to_string()))?,
            counter: counter
                .parse()
                .map_err(|_| TimestampParseError::Counter(s.to_string()))?,
            node_id: node_id.to_string(),
        })
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.millis, self.counter, self.node_id)
    }
}

/// Failure to parse a timestamp wire string.
#[derive(Debug, thiserror::Error)]
pub enum TimestampParseError {
    #[error("timestamp `{0}` is not millis:counter:nodeId")]
    Shape(String),
    #[error("timestamp `{0}` has a non-numeric millis part")]
    Millis(String),
    #[error("timestamp `{0}` has a non-numeric counter part")]
    Counter(String),
}

/// A remote timestamp ran further ahead of local wall time than the clock
/// tolerates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "clock drift: remote {remote_millis} is {drift_ms}ms ahead of local {local_millis} \
     (max {max_drift_ms}ms)"
)]
pub struct ClockDriftError {
    pub remote_millis: u64,
    pub local_millis: u64,
    pub drift_ms: u64,
    pub max_drift_ms: u64,
}

/// Source of wall-clock milliseconds, injectable for deterministic tests.
pub trait ClockSource: Send + Sync {
    /// Current time as milliseconds since the Unix epoch.
    fn wall_millis(&self) -> u64;
}

/// Production clock source backed by `SystemTime`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn wall_millis(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock is before the Unix epoch")
                .as_millis() as u64
        }
    }
}

/// Hybrid logical clock.
///
/// [`HybridClock::now`] issues strictly increasing timestamps; when the wall
/// clock stalls or steps backwards the logical counter keeps the order. When
/// the wall clock steps backwards the clock clamps to its high-water mark and
/// keeps counting instead of failing, so local writes stay available.
///
/// [`HybridClock::observe`] folds in a remote timestamp before applying a
/// remote event, guaranteeing that subsequent local stamps sort after
/// everything this node has seen. Remote stamps more than `max_drift_ms`
/// ahead of local wall time fail with [`ClockDriftError`] in strict mode and
/// are accepted with a warning otherwise.
pub struct HybridClock {
    node_id: String,
    last_millis: u64,
    last_counter: u32,
    strict: bool,
    max_drift_ms: u64,
    source: Box<dyn ClockSource>,
}

impl HybridClock {
    /// Creates a non-strict clock with the default 60 s drift tolerance.
    #[must_use]
    pub fn new(node_id: impl Into<String>, source: Box<dyn ClockSource>) -> Self {
        Self::with_options(node_id, source, false, DEFAULT_MAX_DRIFT_MS)
    }

    /// Creates a clock with explicit strictness and drift tolerance.
    #[must_use]
    pub fn with_options(
        node_id: impl Into<String>,
        source: Box<dyn ClockSource>,
        strict: bool,
        max_drift_ms: u64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            last_millis: 0,
            last_counter: 0,
            strict,
            max_drift_ms,
            source,
        }
    }

    /// Id of the node this clock stamps for.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The wall-clock source, shared with TTL expiry checks.
    #[must_use]
    pub fn source(&self) -> &dyn ClockSource {
        &*self.source
    }

    /// Issues a fresh timestamp, strictly greater than every timestamp this
    /// clock has produced or observed.
    pub fn now(&mut self) -> Timestamp {
        let wall = self.source.wall_millis();
        if wall > self.last_millis {
            self.last_millis = wall;
            self.last_counter = 0;
        } else {
            self.last_counter += 1;
        }
        Timestamp {
            millis: self.last_millis,
            counter: self.last_counter,
            node_id: self.node_id.clone(),
        }
    }

    /// Folds a remote timestamp into the clock state.
    ///
    /// After this returns, the next [`HybridClock::now`] sorts after
    /// `remote`. Counter rules: equal millis on both sides take
    /// `max(local, remote) + 1`; a side that stays ahead increments its own
    /// counter; a fresh wall-clock step resets the counter to zero.
    ///
    /// # Errors
    ///
    /// [`ClockDriftError`] when `remote.millis` exceeds local wall time by
    /// more than the configured drift and the clock is strict.
    pub fn observe(&mut self, remote: &Timestamp) -> Result<(), ClockDriftError> {
        let wall = self.source.wall_millis();

        if remote.millis > wall {
            let drift_ms = remote.millis - wall;
            if drift_ms > self.max_drift_ms {
                let err = ClockDriftError {
                    remote_millis: remote.millis,
                    local_millis: wall,
                    drift_ms,
                    max_drift_ms: self.max_drift_ms,
                };
                if self.strict {
                    return Err(err);
                }
                tracing::warn!(
                    drift_ms,
                    remote_millis = remote.millis,
                    local_millis = wall,
                    "accepting remote timestamp beyond drift tolerance"
                );
            }
        }

        let next = self.last_millis.max(wall).max(remote.millis);
        if next == self.last_millis && next == remote.millis {
            self.last_counter = self.last_counter.max(remote.counter) + 1;
        } else if next == self.last_millis {
            self.last_counter += 1;
        } else if next == remote.millis {
            self.last_counter = remote.counter + 1;
        } else {
            self.last_counter = 0;
        }
        self.last_millis = next;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::ClockSource;

    /// Manually advanced clock source for deterministic tests.
    pub struct ManualClock {
        millis: Arc<AtomicU64>,
    }

    impl ManualClock {
        pub fn new(initial: u64) -> (Self, Arc<AtomicU64>) {
            let millis = Arc::new(AtomicU64::new(initial));
            (
                Self {
                    millis: millis.clone(),
                },
                millis,
            )
        }
    }

    impl ClockSource for ManualClock {
        fn wall_millis(&self) -> u64 {
            self.millis.load(Ordering::Relaxed)
        }
    }
}
