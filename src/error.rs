use crate::hi::request::Phase;

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FastcgiError>;

/// Everything that can go wrong between the wire and the application hooks.
///
/// The numeric [`code`](FastcgiError::code) of a variant becomes the
/// `appStatus` of the EndRequest record sent when a hook fails.
#[derive(Debug, Error)]
pub enum FastcgiError {
    /// The request already sent its EndRequest. Further output is a no-op.
    #[error("request already completed")]
    RequestCompleted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A rendered record payload exceeded `MAX_PAYLOAD`; the record was discarded.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("begin-request handler failed")]
    UserBeginRequest,

    #[error("params handler failed")]
    UserParams,

    #[error("stdin handler failed")]
    UserStdin,

    /// The requested mutation is not legal in the request's current phase.
    #[error("operation not allowed in request phase {0:?}")]
    RequestState(Phase),

    #[error("query term is missing or empty")]
    QueryTermNull,

    #[error("query term is not a valid number")]
    QueryTermInvalid,

    /// Malformed input from the peer. Fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection interrupted")]
    Interrupted,

    /// Application-defined failure carrying its own app status.
    #[error("application error {0}")]
    App(u32),
}

impl FastcgiError {
    pub fn code(&self) -> u32 {
        match self {
            FastcgiError::RequestCompleted => 1,
            FastcgiError::Io(_) => 2,
            FastcgiError::PayloadTooLarge(_) => 3,
            FastcgiError::UserBeginRequest => 4,
            FastcgiError::UserParams => 5,
            FastcgiError::UserStdin => 6,
            FastcgiError::RequestState(_) => 7,
            FastcgiError::QueryTermNull => 8,
            FastcgiError::QueryTermInvalid => 9,
            FastcgiError::Protocol(_) => 10,
            FastcgiError::Interrupted => 11,
            FastcgiError::App(status) => *status,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, FastcgiError::RequestCompleted)
    }

    /// Errors after which the connection cannot be used any more.
    pub fn is_fatal(&self) -> bool {
        matches!(self,
            FastcgiError::Io(_) | FastcgiError::Protocol(_) | FastcgiError::Interrupted)
    }
}

pub(crate) fn protocol_error<T: Into<String>>(msg: T) -> FastcgiError {
    let msg = msg.into();
    error!("{}", msg);
    FastcgiError::Protocol(msg)
}

/// Treats the "already completed" signal as success.
pub(crate) fn ignore_completed(result: Result<()>) -> Result<()> {
    match result {
        Err(FastcgiError::RequestCompleted) => Ok(()),
        other => other,
    }
}
