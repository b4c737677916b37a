//! Pipeline interception hooks.
//!
//! Each pipeline stage is preceded by one [`HookPoint`]. Handlers registered
//! for a point run sequentially in priority order; each one may rewrite the
//! in-flight envelope attributes or reply and may stop the chain, in which
//! case the stage skips its default behavior.

use std::{
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    futures::FutureExt,
    serde::{Deserialize, Serialize},
    tracing::{debug, error, info, warn},
};

use crate::{
    error::panic_message,
    types::{Envelope, Reply},
};

// ── HookPoint ───────────────────────────────────────────────────────────────

/// Named extension points, one per pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    /// Before compose. Stopping drops the envelope.
    OnReceive,
    /// Before generate. Stopping skips the generator and keeps the hook's reply.
    OnGenerate,
    /// Before decorate. Stopping sends the hook's reply undecorated.
    OnDecorate,
    /// Before each delivered segment. Stopping skips the send.
    OnDeliver,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OnReceive => "on_receive",
            Self::OnGenerate => "on_generate",
            Self::OnDecorate => "on_decorate",
            Self::OnDeliver => "on_deliver",
        };
        f.write_str(name)
    }
}

impl HookPoint {
    pub const ALL: &'static [HookPoint] = &[
        Self::OnReceive,
        Self::OnGenerate,
        Self::OnDecorate,
        Self::OnDeliver,
    ];
}

// ── HookContext / HookFlow ──────────────────────────────────────────────────

/// State handed to handlers at a hook point.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub point: HookPoint,
    pub envelope: Envelope,
    pub reply: Option<Reply>,
}

impl HookContext {
    pub fn new(point: HookPoint, envelope: Envelope, reply: Option<Reply>) -> Self {
        Self {
            point,
            envelope,
            reply,
        }
    }
}

/// What a handler wants the pipeline to do next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HookFlow {
    #[default]
    Continue,
    /// Stop the handler chain and skip the stage's default behavior.
    Stop,
}

// ── HookHandler trait ───────────────────────────────────────────────────────

#[async_trait]
pub trait HookHandler: Send + Sync {
    /// A human-readable name for this handler.
    fn name(&self) -> &str;

    /// Points this handler subscribes to.
    fn points(&self) -> &[HookPoint];

    /// Priority for ordering. Higher values run first. Default is 0.
    fn priority(&self) -> i32 {
        0
    }

    /// Inspect or rewrite the context. Changes made before an `Err` is
    /// returned are discarded.
    async fn handle(&self, ctx: &mut HookContext) -> Result<HookFlow>;
}

// ── HookStats ───────────────────────────────────────────────────────────────

/// Per-handler health statistics for circuit breaker logic.
pub struct HookStats {
    pub call_count: AtomicU64,
    pub failure_count: AtomicU64,
    pub consecutive_failures: AtomicU64,
    pub total_latency_us: AtomicU64,
    pub disabled: AtomicBool,
    pub disabled_at: std::sync::Mutex<Option<Instant>>,
}

impl HookStats {
    pub fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
            disabled_at: std::sync::Mutex::new(None),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn avg_latency(&self) -> Duration {
        let calls = self.call_count.load(Ordering::Relaxed);
        if calls == 0 {
            return Duration::ZERO;
        }
        let total = self.total_latency_us.load(Ordering::Relaxed);
        Duration::from_micros(total / calls)
    }
}

impl Default for HookStats {
    fn default() -> Self {
        Self::new()
    }
}

struct HandlerEntry {
    handler: Arc<dyn HookHandler>,
    stats: Arc<HookStats>,
}

// ── HookRegistry ────────────────────────────────────────────────────────────

/// Handlers for every hook point, scoped to one dispatcher instance.
///
/// Built at startup and then shared read-only behind an `Arc`.
pub struct HookRegistry {
    handlers: HashMap<HookPoint, Vec<HandlerEntry>>,
    /// Maximum consecutive failures before auto-disabling a handler.
    circuit_breaker_threshold: u64,
    /// Cooldown period before re-enabling a circuit-broken handler.
    circuit_breaker_cooldown: Duration,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }

    /// Set circuit breaker parameters.
    pub fn with_circuit_breaker(mut self, threshold: u64, cooldown: Duration) -> Self {
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_cooldown = cooldown;
        self
    }

    /// Register a handler for every point it subscribes to.
    /// Handlers are sorted by priority (descending) within each point.
    pub fn register(&mut self, handler: Arc<dyn HookHandler>) {
        let stats = Arc::new(HookStats::new());
        for &point in handler.points() {
            let handlers = self.handlers.entry(point).or_default();
            handlers.push(HandlerEntry {
                handler: Arc::clone(&handler),
                stats: Arc::clone(&stats),
            });
            handlers.sort_by_key(|h| std::cmp::Reverse(h.handler.priority()));
        }
        info!(handler = handler.name(), "hook handler registered");
    }

    pub fn has_handlers(&self, point: HookPoint) -> bool {
        self.handlers.get(&point).is_some_and(|v| !v.is_empty())
    }

    /// Get stats for a named handler. Returns None if not found.
    pub fn handler_stats(&self, name: &str) -> Option<Arc<HookStats>> {
        self.handlers
            .values()
            .flatten()
            .find(|entry| entry.handler.name() == name)
            .map(|entry| Arc::clone(&entry.stats))
    }

    /// List all registered handler names (deduplicated).
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .values()
            .flatten()
            .map(|e| e.handler.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Returns true while the handler is disabled; trips or resets the
    /// breaker as a side effect.
    fn check_circuit_breaker(&self, entry: &HandlerEntry) -> bool {
        if !entry.stats.disabled.load(Ordering::Relaxed) {
            let consecutive_failures = entry.stats.consecutive_failures.load(Ordering::Relaxed);
            if consecutive_failures < self.circuit_breaker_threshold {
                return false;
            }
            entry.stats.disabled.store(true, Ordering::Relaxed);
            *entry
                .stats
                .disabled_at
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            warn!(
                handler = entry.handler.name(),
                avg_latency_ms = entry.stats.avg_latency().as_millis() as u64,
                "hook circuit breaker tripped after {} consecutive failures",
                self.circuit_breaker_threshold
            );
            return true;
        }

        let disabled_at = entry
            .stats
            .disabled_at
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(at) = *disabled_at
            && at.elapsed() >= self.circuit_breaker_cooldown
        {
            drop(disabled_at);
            entry.stats.disabled.store(false, Ordering::Relaxed);
            entry.stats.consecutive_failures.store(0, Ordering::Relaxed);
            info!(
                handler = entry.handler.name(),
                "hook circuit breaker reset after cooldown"
            );
            return false;
        }
        true
    }

    /// Run every handler registered for `ctx.point`, in priority order.
    ///
    /// A handler returning [`HookFlow::Stop`] short-circuits the chain.
    /// Failing handlers are logged and skipped; their partial changes to the
    /// context are rolled back.
    pub async fn dispatch(&self, ctx: &mut HookContext) -> HookFlow {
        let point = ctx.point;
        let handlers = match self.handlers.get(&point) {
            Some(h) if !h.is_empty() => h,
            _ => return HookFlow::Continue,
        };

        debug!(point = %point, count = handlers.len(), "dispatching hook point");

        for entry in handlers {
            if self.check_circuit_breaker(entry) {
                continue;
            }

            let snapshot = ctx.clone();
            let start = Instant::now();
            let result = AssertUnwindSafe(entry.handler.handle(ctx))
                .catch_unwind()
                .await;
            let latency = start.elapsed();

            match result {
                Ok(Ok(HookFlow::Continue)) => entry.stats.record_success(latency),
                Ok(Ok(HookFlow::Stop)) => {
                    entry.stats.record_success(latency);
                    debug!(handler = entry.handler.name(), point = %point, "hook stopped chain");
                    return HookFlow::Stop;
                },
                Ok(Err(e)) => {
                    entry.stats.record_failure(latency);
                    *ctx = snapshot;
                    warn!(handler = entry.handler.name(), point = %point, error = %e, "hook handler failed");
                },
                Err(panic) => {
                    entry.stats.record_failure(latency);
                    *ctx = snapshot;
                    error!(
                        handler = entry.handler.name(),
                        point = %point,
                        panic = %panic_message(panic.as_ref()),
                        "hook handler panicked"
                    );
                },
            }
        }

        HookFlow::Continue
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}
