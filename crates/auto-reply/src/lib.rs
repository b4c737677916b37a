//! Inbound message pipeline: the glue between transports and reply back ends.
//!
//! Flow for one admitted envelope: on_receive hook → compose (routing and
//! filtering) → on_generate hook → generator for the envelope kind →
//! on_decorate hook → decorate (wrapping, voice, segments) → per-segment
//! on_deliver hook → send through the originating transport with retries.

pub mod compose;
pub mod decorate;
pub mod deliver;
pub mod error;
pub mod generate;
pub mod pipeline;

pub use {
    compose::{Composer, DropReason},
    decorate::{Decorator, SpeechSynthesizer},
    deliver::{DeliveryReport, Deliverer},
    error::{Error, Result},
    generate::{GeneratorRegistry, ReplyGenerator},
    pipeline::{Pipeline, PipelineOutcome},
};
