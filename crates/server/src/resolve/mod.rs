//! Conflict-resolution pipeline and entry processors.
//!
//! Inbound remote records pass through priority-ordered resolver bindings
//! before touching the map. A binding accepts (possibly transforming the
//! value), rejects (emitting a [`MergeRejection`]), or defers to the next
//! binding; when nothing fires, the built-in LWW policy decides by
//! timestamp. Bindings supplied as code never run in-process: they are
//! validated against a deny-list and size limits here, then executed by a
//! [`SandboxHost`] with CPU and memory quotas (process isolation is the real
//! boundary; the deny-list is input validation).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use tidemark_core::{Timestamp, Value};

use crate::config::ProcessorConfig;
use crate::error::EngineError;

/// Context handed to each resolver binding for one inbound record.
pub struct MergeContext<'a> {
    pub map_name: &'a str,
    pub key: &'a str,
    /// Local live value, if any.
    pub local_value: Option<&'a Value>,
    /// Incoming value; `None` for a remote tombstone.
    pub remote_value: Option<&'a Value>,
    pub local_timestamp: Option<&'a Timestamp>,
    pub remote_timestamp: &'a Timestamp,
    pub remote_node_id: &'a str,
    /// Read-only access to other entries of the same map.
    pub read_entry: &'a dyn Fn(&str) -> Option<Value>,
}

/// What one binding decided.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverAction {
    /// Apply this value (the remote one, or a transformation of it).
    Accept { value: Value },
    /// Refuse the remote write; local state stands.
    Reject { reason: String },
    /// No opinion; ask the next binding.
    Local,
}

/// Final decision of the pipeline for one inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    /// Merge the value into the map.
    Accept { value: Option<Value> },
    /// Keep local state; the remote record lost.
    KeepLocal,
    /// A binding vetoed the write.
    Rejected { resolver: String, reason: String },
}

/// Event emitted when a binding rejects a remote write.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRejection {
    pub map_name: String,
    pub key: String,
    pub attempted_value: Option<Value>,
    pub remote_node_id: String,
    pub reason: String,
}

/// A natively implemented merge policy.
pub trait MergePolicy: Send + Sync {
    /// Decides for one inbound record.
    fn resolve(&self, ctx: &MergeContext<'_>) -> ResolverAction;
}

/// Host-side executor for sandboxed resolver/processor code.
///
/// The engine never interprets user code; implementations isolate it in a
/// worker or subprocess with CPU and memory quotas and must not share object
/// graphs with the host.
pub trait SandboxHost: Send + Sync {
    /// Runs resolver code against a merge context.
    fn execute_resolver(
        &self,
        code: &str,
        ctx: &MergeContext<'_>,
    ) -> anyhow::Result<ResolverAction>;

    /// Runs entry-processor code against a value.
    fn execute_processor(
        &self,
        code: &str,
        value: Option<Value>,
        key: &str,
        args: Option<&Value>,
    ) -> anyhow::Result<ProcessorOutcome>;
}

/// Result of an entry-processor execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorOutcome {
    /// New value for the entry; `None` removes it.
    pub value: Option<Value>,
    /// Value returned to the caller.
    pub result: Option<Value>,
}

enum PolicyImpl {
    Native(Arc<dyn MergePolicy>),
    Code(String),
}

struct Binding {
    name: String,
    priority: i32,
    key_pattern: Option<String>,
    policy: PolicyImpl,
    client_id: Option<String>,
    insertion: u64,
}

/// Identifiers that resolver/processor code may not reference. Validation
/// gate only; the sandbox is the enforcement boundary.
const DENY_LIST: &[&str] = &[
    "eval",
    "Function",
    "require",
    "import",
    "process",
    "global",
    "fetch",
    "XMLHttpRequest",
    "setTimeout",
    "setInterval",
    "setImmediate",
];

/// Matches a glob pattern with `*` (any run) and `?` (one character).
#[must_use]
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = input.chars().collect();
    // dp[j] = pattern[..i] matches input[..j]
    let mut dp = vec![false; s.len() + 1];
    dp[0] = true;
    for pc in &p {
        let mut next = vec![false; s.len() + 1];
        if *pc == '*' {
            next[0] = dp[0];
            for j in 1..=s.len() {
                next[j] = next[j - 1] || dp[j];
            }
        } else {
            for j in 1..=s.len() {
                next[j] = dp[j - 1] && (*pc == '?' || *pc == s[j - 1]);
            }
        }
        dp = next;
    }
    dp[s.len()]
}

/// The resolver registry and pipeline.
pub struct ConflictResolver {
    config: ProcessorConfig,
    bindings: RwLock<ahash::AHashMap<String, Vec<Binding>>>,
    sandbox: Arc<dyn SandboxHost>,
    rejections: broadcast::Sender<MergeRejection>,
    next_insertion: std::sync::atomic::AtomicU64,
}

impl ConflictResolver {
    /// Creates a pipeline executing code bindings on the given sandbox.
    #[must_use]
    pub fn new(config: ProcessorConfig, sandbox: Arc<dyn SandboxHost>) -> Self {
        let (rejections, _) = broadcast::channel(256);
        Self {
            config,
            bindings: RwLock::new(ahash::AHashMap::new()),
            sandbox,
            rejections,
            next_insertion: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Subscribes to rejection events.
    #[must_use]
    pub fn rejections(&self) -> broadcast::Receiver<MergeRejection> {
        self.rejections.subscribe()
    }

    /// Registers a native policy binding.
    ///
    /// # Errors
    ///
    /// [`EngineError::Sandbox`] when the map already holds
    /// `max_resolvers_per_map` bindings.
    pub fn register(
        &self,
        map_name: &str,
        name: &str,
        priority: i32,
        key_pattern: Option<String>,
        policy: Arc<dyn MergePolicy>,
    ) -> Result<(), EngineError> {
        self.insert(
            map_name,
            name,
            priority,
            key_pattern,
            PolicyImpl::Native(policy),
            None,
        )
    }

    /// Registers a code binding on behalf of a client, validating it first.
    ///
    /// # Errors
    ///
    /// [`EngineError::Sandbox`] when the code exceeds the size limit,
    /// references a denied identifier, or the map's binding capacity is
    /// full.
    pub fn register_code(
        &self,
        map_name: &str,
        name: &str,
        priority: i32,
        key_pattern: Option<String>,
        code: &str,
        client_id: Option<String>,
    ) -> Result<(), EngineError> {
        self.validate_code(code)?;
        self.insert(
            map_name,
            name,
            priority,
            key_pattern,
            PolicyImpl::Code(code.to_string()),
            client_id,
        )
    }

    /// Removes a named binding. Unknown names are a no-op.
    pub fn unregister(&self, map_name: &str, name: &str) {
        if let Some(bindings) = self.bindings.write().get_mut(map_name) {
            bindings.retain(|b| b.name != name);
        }
    }

    /// Removes every binding a client registered; called when its
    /// connection closes.
    pub fn remove_for_client(&self, client_id: &str) {
        let mut map = self.bindings.write();
        for bindings in map.values_mut() {
            bindings.retain(|b| b.client_id.as_deref() != Some(client_id));
        }
    }

    /// Binding counts per map, for the debug surface.
    #[must_use]
    pub fn binding_counts(&self) -> Vec<(String, usize)> {
        let map = self.bindings.read();
        let mut out: Vec<(String, usize)> =
            map.iter().map(|(k, v)| (k.clone(), v.len())).collect();
        out.sort();
        out
    }

    /// Runs the pipeline for one inbound record.
    ///
    /// Bindings for the map whose pattern matches the key run in priority
    /// order (descending, insertion order on ties) until one returns a
    /// non-`Local` action. A binding that panics or errors is logged and
    /// skipped. With no decisive binding, the built-in LWW policy compares
    /// timestamps.
    pub fn resolve(&self, ctx: &MergeContext<'_>) -> MergeDecision {
        let bindings = self.bindings.read();
        if let Some(candidates) = bindings.get(ctx.map_name) {
            let mut selected: Vec<&Binding> = candidates
                .iter()
                .filter(|b| {
                    b.key_pattern
                        .as_deref()
                        .is_none_or(|p| glob_match(p, ctx.key))
                })
                .collect();
            selected.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.insertion.cmp(&b.insertion))
            });

            for binding in selected {
                let action = match &binding.policy {
                    PolicyImpl::Native(policy) => policy.resolve(ctx),
                    PolicyImpl::Code(code) => {
                        match self.sandbox.execute_resolver(code, ctx) {
                            Ok(action) => action,
                            Err(error) => {
                                tracing::warn!(
                                    resolver = %binding.name,
                                    map = ctx.map_name,
                                    %error,
                                    "resolver binding failed, continuing pipeline"
                                );
                                continue;
                            }
                        }
                    }
                };
                match action {
                    ResolverAction::Accept { value } => {
                        return MergeDecision::Accept { value: Some(value) };
                    }
                    ResolverAction::Reject { reason } => {
                        let rejection = MergeRejection {
                            map_name: ctx.map_name.to_string(),
                            key: ctx.key.to_string(),
                            attempted_value: ctx.remote_value.cloned(),
                            remote_node_id: ctx.remote_node_id.to_string(),
                            reason: reason.clone(),
                        };
                        metrics::counter!("merge_rejections").increment(1);
                        let _ = self.rejections.send(rejection);
                        return MergeDecision::Rejected {
                            resolver: binding.name.clone(),
                            reason,
                        };
                    }
                    ResolverAction::Local => {}
                }
            }
        }
        drop(bindings);
        self.builtin_lww(ctx)
    }

    /// Validates processor/resolver code against the size limit and deny
    /// list.
    ///
    /// # Errors
    ///
    /// [`EngineError::Sandbox`] naming the violated rule.
    pub fn validate_code(&self, code: &str) -> Result<(), EngineError> {
        if code.len() > self.config.max_code_size_bytes {
            return Err(EngineError::Sandbox(format!(
                "code size {} exceeds limit {}",
                code.len(),
                self.config.max_code_size_bytes
            )));
        }
        for denied in DENY_LIST {
            if code.contains(denied) {
                return Err(EngineError::Sandbox(format!(
                    "code references denied identifier `{denied}`"
                )));
            }
        }
        Ok(())
    }

    fn builtin_lww(&self, ctx: &MergeContext<'_>) -> MergeDecision {
        let accept = match ctx.local_timestamp {
            None => true,
            Some(local) => ctx.remote_timestamp > local,
        };
        if accept {
            MergeDecision::Accept {
                value: ctx.remote_value.cloned(),
            }
        } else {
            MergeDecision::KeepLocal
        }
    }

    fn insert(
        &self,
        map_name: &str,
        name: &str,
        priority: i32,
        key_pattern: Option<String>,
        policy: PolicyImpl,
        client_id: Option<String>,
    ) -> Result<(), EngineError> {
        let mut map = self.bindings.write();
        let bindings = map.entry(map_name.to_string()).or_default();
        if bindings.len() >= self.config.max_resolvers_per_map {
            return Err(EngineError::Sandbox(format!(
                "map `{map_name}` already has {} resolver bindings",
                bindings.len()
            )));
        }
        bindings.push(Binding {
            name: name.to_string(),
            priority,
            key_pattern,
            policy,
            client_id,
            insertion: self
                .next_insertion
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst),
        });
        Ok(())
    }
}

/// Per-client rate limiter and validator for entry processors.
pub struct EntryProcessorGate {
    config: ProcessorConfig,
    sandbox: Arc<dyn SandboxHost>,
    buckets: DashMap<String, TokenBucket>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: tokio::time::Instant,
}

impl EntryProcessorGate {
    /// Creates a gate executing on the given sandbox.
    #[must_use]
    pub fn new(config: ProcessorConfig, sandbox: Arc<dyn SandboxHost>) -> Self {
        Self {
            config,
            sandbox,
            buckets: DashMap::new(),
        }
    }

    /// Executes an entry processor for a client against a current value.
    ///
    /// A `None` outcome value removes the entry; results apply atomically on
    /// the owning partition (the caller holds the map's writer lane while
    /// applying).
    ///
    /// # Errors
    ///
    /// [`EngineError::Sandbox`] on validation failure, rate-limit
    /// exhaustion, or sandbox execution failure.
    pub fn execute(
        &self,
        client_id: &str,
        key: &str,
        code: &str,
        args: Option<&Value>,
        current_value: Option<Value>,
    ) -> Result<ProcessorOutcome, EngineError> {
        if code.len() > self.config.max_code_size_bytes {
            return Err(EngineError::Sandbox(format!(
                "processor code size {} exceeds limit {}",
                code.len(),
                self.config.max_code_size_bytes
            )));
        }
        for denied in DENY_LIST {
            if code.contains(denied) {
                return Err(EngineError::Sandbox(format!(
                    "processor references denied identifier `{denied}`"
                )));
            }
        }
        if let Some(args) = args {
            let size = rmp_serde::to_vec(args).map(|v| v.len()).unwrap_or(usize::MAX);
            if size > self.config.max_args_size_bytes {
                return Err(EngineError::Sandbox(format!(
                    "processor args size {size} exceeds limit {}",
                    self.config.max_args_size_bytes
                )));
            }
        }
        self.take_token(client_id)?;

        self.sandbox
            .execute_processor(code, current_value, key, args)
            .map_err(|e| EngineError::Sandbox(e.to_string()))
    }

    fn take_token(&self, client_id: &str) -> Result<(), EngineError> {
        let capacity = f64::from(self.config.max_executions_per_second);
        let mut bucket = self
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: capacity,
                last_refill: tokio::time::Instant::now(),
            });
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * capacity).min(capacity);
        bucket.last_refill = now;
        if bucket.tokens < 1.0 {
            return Err(EngineError::Sandbox(format!(
                "client `{client_id}` exceeded {} processor executions per second",
                self.config.max_executions_per_second
            )));
        }
        bucket.tokens -= 1.0;
        Ok(())
    }
}
