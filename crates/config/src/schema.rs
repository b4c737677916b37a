//! Config schema types (dispatch, compose, decorate, delivery, hooks, metrics).
use std::time::Duration;

use {
    courier_channels::gating::{DmPolicy, GroupPolicy, MentionMode},
    courier_common::{ReplyKind, hooks::HookRegistry},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub dispatch: DispatchConfig,
    pub compose: ComposeConfig,
    pub decorate: DecorateConfig,
    pub delivery: DeliveryConfig,
    pub hooks: HooksConfig,
    pub metrics: MetricsConfig,
}

/// Session table, worker pool and dispatcher loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum envelopes processed concurrently within one session.
    pub session_concurrency: usize,
    /// Pipeline runs executing at once across all sessions.
    pub worker_pool_size: usize,
    /// Sleep between sweeps that admitted nothing.
    pub idle_sweep_interval_ms: u64,
    /// Poll interval while waiting for in-flight runs during shutdown.
    pub cancel_check_interval_ms: u64,
    /// Upper bound on the shutdown join and drain.
    pub shutdown_timeout_ms: u64,
    /// Text prefixes that mark an envelope as a priority command.
    pub priority_prefixes: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            session_concurrency: 4,
            worker_pool_size: 8,
            idle_sweep_interval_ms: 200,
            cancel_check_interval_ms: 100,
            shutdown_timeout_ms: 5_000,
            priority_prefixes: vec!["#".into()],
        }
    }
}

impl DispatchConfig {
    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_interval_ms)
    }

    pub fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_check_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Filtering and routing rules applied by the compose stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    pub group_policy: GroupPolicy,
    /// Group ids or names (glob patterns) for `group_policy = "allowlist"`.
    pub group_allowlist: Vec<String>,
    pub mention_mode: MentionMode,
    /// Text prefixes that address the bot in a group. Stripped when matched.
    pub group_prefixes: Vec<String>,
    /// Keywords that address the bot in a group anywhere in the text.
    pub group_keywords: Vec<String>,
    pub dm_policy: DmPolicy,
    pub dm_allowlist: Vec<String>,
    /// When non-empty, direct messages must start with one of these.
    pub direct_prefixes: Vec<String>,
    /// Senders ignored everywhere.
    pub sender_blocklist: Vec<String>,
    /// Prefixes turning a text message into an image-creation request.
    pub image_create_prefixes: Vec<String>,
    pub voice_reply_to_voice: bool,
    pub text_reply_as_voice: bool,
    /// Display name used for mention detection in group text.
    pub bot_name: Option<String>,
}

/// Presentation settings applied by the decorate stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecorateConfig {
    pub group_reply_prefix: String,
    pub group_reply_suffix: String,
    pub direct_reply_prefix: String,
    pub direct_reply_suffix: String,
    /// Splits a text reply into separately delivered segments.
    pub segment_delimiter: String,
    /// Prepend `@sender` to group replies.
    pub mention_sender: bool,
    /// Reply kinds that are converted to errors before delivery, in addition
    /// to those the transport declares.
    pub unsupported_reply_kinds: Vec<ReplyKind>,
}

impl Default for DecorateConfig {
    fn default() -> Self {
        Self {
            group_reply_prefix: String::new(),
            group_reply_suffix: String::new(),
            direct_reply_prefix: String::new(),
            direct_reply_suffix: String::new(),
            segment_delimiter: "/$".into(),
            mention_sender: true,
            unsupported_reply_kinds: Vec::new(),
        }
    }
}

/// Retry policy for transport sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Backoff unit; retry `n` waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: 3_000,
        }
    }
}

impl DeliveryConfig {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Circuit breaker applied to every registered hook handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Consecutive failures (errors or panics) that disable a handler.
    pub circuit_breaker_threshold: u64,
    /// How long a disabled handler stays skipped.
    pub circuit_breaker_cooldown_ms: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_ms: 60_000,
        }
    }
}

impl HooksConfig {
    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_cooldown_ms)
    }

    /// An empty registry carrying these breaker settings.
    pub fn registry(&self) -> HookRegistry {
        HookRegistry::new().with_circuit_breaker(
            self.circuit_breaker_threshold,
            self.circuit_breaker_cooldown(),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Labels attached to every exported series.
    pub labels: std::collections::BTreeMap<String, String>,
}
