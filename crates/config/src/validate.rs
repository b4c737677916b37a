//! Config validation: syntax, unknown keys and semantic checks.

use std::path::{Path, PathBuf};

use crate::schema::CourierConfig;

/// Retry counts above this are almost certainly a unit mistake.
const MAX_SANE_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation finding.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// One of "syntax", "unknown-field", "type-error", "value", "file-ref".
    pub category: &'static str,
    /// Dotted path, e.g. "dispatch.session_concurrency"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}: {}", self.severity, self.message)
        } else {
            write!(f, "{} [{}]: {}", self.severity, self.path, self.message)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

/// Known keys per section, mirroring `schema.rs`.
const KNOWN_KEYS: &[(&str, &[&str])] = &[
    ("dispatch", &[
        "session_concurrency",
        "worker_pool_size",
        "idle_sweep_interval_ms",
        "cancel_check_interval_ms",
        "shutdown_timeout_ms",
        "priority_prefixes",
    ]),
    ("compose", &[
        "group_policy",
        "group_allowlist",
        "mention_mode",
        "group_prefixes",
        "group_keywords",
        "dm_policy",
        "dm_allowlist",
        "direct_prefixes",
        "sender_blocklist",
        "image_create_prefixes",
        "voice_reply_to_voice",
        "text_reply_as_voice",
        "bot_name",
    ]),
    ("decorate", &[
        "group_reply_prefix",
        "group_reply_suffix",
        "direct_reply_prefix",
        "direct_reply_suffix",
        "segment_delimiter",
        "mention_sender",
        "unsupported_reply_kinds",
    ]),
    ("delivery", &["max_retries", "retry_backoff_ms"]),
    ("hooks", &["circuit_breaker_threshold", "circuit_breaker_cooldown_ms"]),
    ("metrics", &["enabled", "labels"]),
];

/// Validate a config file, or the discovered one when `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path
        .map(Path::to_path_buf)
        .or_else(crate::loader::find_config_file);

    let Some(actual_path) = config_path else {
        let mut result = ValidationResult::default();
        result.diagnostics.push(Diagnostic::new(
            Severity::Info,
            "file-ref",
            "",
            "no config file found; using defaults",
        ));
        result
            .diagnostics
            .extend(check_config(&CourierConfig::default()));
        return result;
    };

    let mut result = match std::fs::read_to_string(&actual_path) {
        Ok(raw) => {
            let ext = actual_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("toml");
            validate_str(&crate::env_subst::substitute_env(&raw), ext)
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Error,
                "file-ref",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate raw config text in the format named by `ext`.
#[must_use]
pub fn validate_str(raw: &str, ext: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    // 1. Syntax
    let value: serde_json::Value = match parse_value(raw, ext) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("syntax error: {e}"),
            ));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    // 2. Unknown keys
    check_unknown_fields(&value, &mut diagnostics);

    // 3. Types, then semantics on the typed config
    match serde_json::from_value::<CourierConfig>(value) {
        Ok(config) => diagnostics.extend(check_config(&config)),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn parse_value(raw: &str, ext: &str) -> anyhow::Result<serde_json::Value> {
    match ext {
        "toml" => {
            let v: toml::Value = toml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value = serde_yaml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

fn check_unknown_fields(value: &serde_json::Value, diagnostics: &mut Vec<Diagnostic>) {
    let Some(root) = value.as_object() else {
        return;
    };
    for (section, body) in root {
        let Some((_, keys)) = KNOWN_KEYS.iter().find(|(name, _)| name == section) else {
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                "unknown-field",
                section.clone(),
                format!("unknown section `{section}`"),
            ));
            continue;
        };
        let Some(fields) = body.as_object() else {
            continue;
        };
        for key in fields.keys() {
            if !keys.contains(&key.as_str()) {
                diagnostics.push(Diagnostic::new(
                    Severity::Warning,
                    "unknown-field",
                    format!("{section}.{key}"),
                    format!("unknown field `{key}` in [{section}]"),
                ));
            }
        }
    }
}

/// Semantic checks on a parsed config.
#[must_use]
pub fn check_config(config: &CourierConfig) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let dispatch = &config.dispatch;

    if dispatch.session_concurrency == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "dispatch.session_concurrency",
            "must be at least 1, otherwise no envelope is ever admitted",
        ));
    }
    if dispatch.worker_pool_size == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "dispatch.worker_pool_size",
            "must be at least 1",
        ));
    }
    if dispatch.idle_sweep_interval_ms == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "dispatch.idle_sweep_interval_ms",
            "must be positive; a zero interval busy-spins the dispatcher",
        ));
    }
    if dispatch.cancel_check_interval_ms == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "dispatch.cancel_check_interval_ms",
            "must be positive",
        ));
    }
    if dispatch.session_concurrency > dispatch.worker_pool_size && dispatch.worker_pool_size > 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "value",
            "dispatch.session_concurrency",
            format!(
                "exceeds worker_pool_size ({}); a single session can never use its full ceiling",
                dispatch.worker_pool_size
            ),
        ));
    }
    if dispatch
        .priority_prefixes
        .iter()
        .any(|prefix| prefix.is_empty())
    {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "value",
            "dispatch.priority_prefixes",
            "an empty prefix marks every envelope as priority",
        ));
    }

    if config.decorate.segment_delimiter.is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "decorate.segment_delimiter",
            "must not be empty",
        ));
    }

    if config.delivery.max_retries > MAX_SANE_RETRIES {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "value",
            "delivery.max_retries",
            format!(
                "{} retries with linear backoff can hold a worker for a long time",
                config.delivery.max_retries
            ),
        ));
    }

    if config.hooks.circuit_breaker_threshold == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "hooks.circuit_breaker_threshold",
            "must be at least 1, otherwise every hook handler is disabled before its first call",
        ));
    }

    diagnostics
}
