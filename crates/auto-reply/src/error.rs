use courier_common::{EnvelopeKind, FromMessage};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Envelope(#[from] courier_common::Error),

    #[error(transparent)]
    Channel(#[from] courier_channels::Error),

    /// No transport could be resolved for the envelope.
    #[error("no transport for envelope {envelope_id} (channel: {channel})")]
    NoTransport {
        envelope_id: String,
        channel: String,
    },

    #[error("generator `{existing}` already handles {kind} envelopes")]
    DuplicateGenerator {
        kind: EnvelopeKind,
        existing: String,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn no_transport(envelope_id: impl ToString, channel: Option<&str>) -> Self {
        Self::NoTransport {
            envelope_id: envelope_id.to_string(),
            channel: channel.unwrap_or("<default>").to_string(),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
