use courier_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error("envelope {envelope_id} has no session id")]
    MissingSessionId { envelope_id: String },

    /// `submit` after `shutdown` began.
    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("worker pool is saturated")]
    PoolSaturated,

    #[error("worker pool is closed")]
    PoolClosed,

    /// Slot bookkeeping no longer adds up. Fatal for the dispatcher loop.
    #[error("session {session_id}: {message}")]
    Invariant { session_id: String, message: String },
}

impl Error {
    #[must_use]
    pub fn invariant(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invariant {
            session_id: session_id.into(),
            message: message.into(),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

courier_common::impl_context!();
