//! Transport-facing plumbing.
//!
//! Each messaging platform (chat apps, webhooks, the console) implements
//! [`ChannelOutbound`] and registers it in a [`ChannelRegistry`]; the
//! pipeline resolves the transport an envelope arrived on and sends replies
//! back through it. Access gating helpers live here too since every
//! transport shares the same allowlist and mention semantics.

pub mod error;
pub mod gating;
pub mod outbound;
pub mod registry;

pub use {
    error::{Error, Result},
    outbound::ChannelOutbound,
    registry::ChannelRegistry,
};
