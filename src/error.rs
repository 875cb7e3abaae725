//! Error taxonomy shared by every backend variant.
//!
//! The four signal kinds that the backends translate at their boundary
//! (`NoOp`, `InvalidResource`, `MalformedEnvelope`,
//! `UnsupportedAsyncCallback`) live here next to the unclassified kinds
//! that fall through to the unhandled-exception handler.

use std::fmt;
use std::io;

/// Raised when the ambient request context is read outside a bound call.
///
/// This is always a programming error: some code reached for
/// [`crate::context::current`] without running under a backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// No request is bound to the current task, coroutine or thread.
    Unbound,
    /// An unbind was attempted with a token that does not own a binding.
    ForeignToken {
        /// Id carried by the rejected token
        token: u64,
    },
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::Unbound => write!(f, "no active request in context"),
            ContextError::ForeignToken { token } => {
                write!(f, "binding token {token} does not own an active binding")
            }
        }
    }
}

impl std::error::Error for ContextError {}

/// Crate-wide error type.
#[derive(Debug)]
pub enum Error {
    /// The dispatch body was not a valid JSON envelope.
    MalformedEnvelope(String),
    /// A static resource path is not registered for its package.
    InvalidResource(String),
    /// Control-flow signal: the callback decided not to update anything.
    NoOp,
    /// An awaitable was produced on a backend that cannot await it.
    UnsupportedAsyncCallback(String),
    /// Request context misuse.
    Context(ContextError),
    /// No route matched the request path.
    NotFound(String),
    /// A route matched the path but not the method.
    MethodNotAllowed(String),
    /// Duplicate or unknown registration (routes, backends, streams).
    Registration(String),
    /// Invalid configuration value.
    Config(String),
    /// The consumer of a push channel has gone away.
    StreamClosed,
    /// A handler panicked; the payload is the panic message.
    Panic(String),
    /// I/O failure while serving.
    Io(io::Error),
    /// Any other failure raised by user code.
    Callback(anyhow::Error),
}

impl Error {
    /// Wrap an arbitrary user error.
    pub fn callback<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Error::Callback(err.into())
    }

    /// HTTP status the backend boundary maps this error to.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Error::NoOp => 204,
            Error::MalformedEnvelope(_) => 400,
            Error::InvalidResource(_) | Error::NotFound(_) => 404,
            Error::MethodNotAllowed(_) => 405,
            _ => 500,
        }
    }

    /// Short stable name of the error kind, used in logs and renderers.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedEnvelope(_) => "MalformedEnvelopeError",
            Error::InvalidResource(_) => "InvalidResourceError",
            Error::NoOp => "NoOpSignal",
            Error::UnsupportedAsyncCallback(_) => "UnsupportedAsyncCallbackError",
            Error::Context(_) => "ContextError",
            Error::NotFound(_) => "NotFound",
            Error::MethodNotAllowed(_) => "MethodNotAllowed",
            Error::Registration(_) => "RegistrationError",
            Error::Config(_) => "ConfigError",
            Error::StreamClosed => "StreamClosed",
            Error::Panic(_) => "Panic",
            Error::Io(_) => "IoError",
            Error::Callback(_) => "CallbackError",
        }
    }

    /// Whether the backend boundary translates this error itself instead of
    /// handing it to the unhandled-exception handler.
    #[must_use]
    pub fn is_signal(&self) -> bool {
        matches!(
            self,
            Error::NoOp
                | Error::InvalidResource(_)
                | Error::MalformedEnvelope(_)
                | Error::NotFound(_)
                | Error::MethodNotAllowed(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedEnvelope(msg) => write!(f, "malformed dispatch envelope: {msg}"),
            Error::InvalidResource(msg) => write!(f, "{msg}"),
            Error::NoOp => write!(f, "no update"),
            Error::UnsupportedAsyncCallback(name) => write!(
                f,
                "callback '{name}' returned an awaitable, but this backend cannot await. \
                 Serve the app with an async backend (axum or hyper) to use async callbacks."
            ),
            Error::Context(err) => write!(f, "{err}"),
            Error::NotFound(path) => write!(f, "no route for {path}"),
            Error::MethodNotAllowed(path) => write!(f, "method not allowed for {path}"),
            Error::Registration(msg) => write!(f, "registration error: {msg}"),
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::StreamClosed => write!(f, "stream consumer has disconnected"),
            Error::Panic(msg) => write!(f, "handler panicked: {msg}"),
            Error::Io(err) => write!(f, "i/o error: {err}"),
            Error::Callback(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Context(err) => Some(err),
            Error::Io(err) => Some(err),
            // The outer message is already our Display; start at its cause.
            Error::Callback(err) => err.source(),
            _ => None,
        }
    }
}

impl From<ContextError> for Error {
    fn from(err: ContextError) -> Self {
        Error::Context(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Callback(err)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_statuses() {
        assert_eq!(Error::NoOp.status(), 204);
        assert_eq!(Error::InvalidResource("x".into()).status(), 404);
        assert_eq!(Error::MalformedEnvelope("x".into()).status(), 400);
        assert_eq!(Error::UnsupportedAsyncCallback("cb".into()).status(), 500);
        assert_eq!(Error::callback(anyhow::anyhow!("boom")).status(), 500);
    }

    #[test]
    fn test_unsupported_async_message_names_callback() {
        let msg = Error::UnsupportedAsyncCallback("set_b".into()).to_string();
        assert!(msg.contains("set_b"));
        assert!(msg.contains("awaitable"));
    }

    #[test]
    fn test_panic_message_downcasts() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("bad");
        assert_eq!(panic_message(payload.as_ref()), "bad");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("worse"));
        assert_eq!(panic_message(payload.as_ref()), "worse");
    }
}
