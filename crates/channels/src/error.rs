use std::error::Error as StdError;

/// Crate-wide result type for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed channel errors shared across transports.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input payload or parameter is invalid.
    #[error("invalid channel input: {message}")]
    InvalidInput { message: String },

    /// No transport with this id is registered.
    #[error("unknown channel transport: {channel_id}")]
    UnknownTransport { channel_id: String },

    /// The transport cannot carry this reply kind.
    #[error("channel {channel_id} cannot send {kind} replies")]
    UnsupportedReply {
        channel_id: String,
        kind: courier_common::ReplyKind,
    },

    /// Wrapped source error from an external dependency.
    #[error("channel operation failed: {context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unknown_transport(channel_id: impl std::fmt::Display) -> Self {
        Self::UnknownTransport {
            channel_id: channel_id.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}
