use thiserror::Error;

/// Errors raised while reading or building envelopes and replies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    /// A reserved envelope attribute was absent or not a string.
    #[error("envelope {envelope_id} is missing required attribute `{key}`")]
    MissingAttribute { envelope_id: String, key: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn missing_attribute(envelope_id: impl ToString, key: impl Into<String>) -> Self {
        Self::MissingAttribute {
            envelope_id: envelope_id.to_string(),
            key: key.into(),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Text of a caught panic payload, for logging.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Error types that can be built from a bare message. Required by
/// [`impl_context!`].
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Defines a crate-local `Context` trait adding `.context("...")` to any
/// `Result` with a displayable error and to `Option`.
///
/// Expects `Error: FromMessage` and a `Result<T>` alias in the invoking
/// module:
///
/// ```ignore
/// // crates/dispatch/src/error.rs
/// courier_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.map_err(|source| {
                    let context = context.into();
                    <Error as $crate::FromMessage>::from_message(format!("{context}: {source}"))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(context.into()))
            }
        }
    };
}
