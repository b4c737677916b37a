//! Shared types, error definitions, and hook plumbing used across all courier crates.

pub mod error;
pub mod hooks;
pub mod types;

pub use {
    error::{Error, FromMessage, Result, panic_message},
    types::{Attributes, Envelope, EnvelopeKind, Payload, Reply, ReplyContent, ReplyKind},
};
