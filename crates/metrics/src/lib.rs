//! Metrics collection and export for courier.
//!
//! Crates record through the `metrics` facade macros re-exported here, using
//! the names in [`definitions`]. Call sites are gated behind each crate's
//! `metrics` feature. With the `prometheus` feature, [`init_metrics`]
//! installs a Prometheus recorder whose output [`MetricsHandle::render`]
//! returns.
//!
//! ```rust,ignore
//! use courier_metrics::{counter, dispatch};
//!
//! counter!(dispatch::ENVELOPES_SUBMITTED_TOTAL).increment(1);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
