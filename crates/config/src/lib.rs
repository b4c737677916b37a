//! Configuration loading, env substitution and validation.
//!
//! Config files: `courier.toml`, `courier.yaml`, `courier.yml` or
//! `courier.json`. Searched in `./` then the user config directory
//! (`~/.config/courier/` on Linux).
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution in the raw
//! file before parsing.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        ComposeConfig, CourierConfig, DecorateConfig, DeliveryConfig, DispatchConfig,
        MetricsConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
