use {
    anyhow::Result,
    async_trait::async_trait,
    courier_common::{Envelope, Reply, ReplyKind},
};

/// Send replies through a messaging transport.
///
/// Implemented by each platform adapter. Implementations own their wire
/// protocol, timeouts and authentication; the pipeline only retries on error.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    /// Transport identifier (e.g. "telegram", "console"). Envelopes name
    /// their originating transport through the `channel` attribute.
    fn id(&self) -> &str;

    /// Reply kinds this transport cannot carry. Replies of these kinds are
    /// converted to errors before delivery.
    fn unsupported_reply_kinds(&self) -> &[ReplyKind] {
        &[]
    }

    /// Deliver one reply segment to `to`. `envelope` is the inbound message
    /// being answered, for transports that thread or quote replies.
    async fn send(&self, to: &str, reply: &Reply, envelope: &Envelope) -> Result<()>;

    /// Send a "typing" indicator. No-op by default.
    async fn send_typing(&self, _to: &str) -> Result<()> {
        Ok(())
    }
}
