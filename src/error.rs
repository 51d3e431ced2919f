//! strongly typed library error.

use std::{error, fmt, io};

/// error produced by the agent, a single transfer, or the transport underneath it.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// a single easy handle reported an error through curl's completion message
    /// or through one of its callbacks.
    Curl(curl::Error),
    /// the multi handle itself reported an error (`perform`, `wait`, `add2`, ...).
    Multi(curl::MultiError),
    /// the wakeup channel or another OS resource failed.
    Io(io::Error),
    /// the request was cancelled before or during its transfer.
    Cancelled,
    /// cumulative response header bytes exceeded the configured cap.
    HeadersTooLarge,
    /// the agent's worker thread exited unexpectedly; the request never ran.
    AgentShutDown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Curl(e) => write!(f, "transfer error: {e}"),
            Self::Multi(e) => write!(f, "multi handle error: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Cancelled => f.write_str("request was cancelled"),
            Self::HeadersTooLarge => f.write_str("response headers exceeded length"),
            Self::AgentShutDown => f.write_str("agent worker thread is not running"),
        }
    }
}

impl error::Error for Error {}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::Curl(e) => Self::Curl(e.clone()),
            Self::Multi(e) => Self::Multi(e.clone()),
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Cancelled => Self::Cancelled,
            Self::HeadersTooLarge => Self::HeadersTooLarge,
            Self::AgentShutDown => Self::AgentShutDown,
        }
    }
}

impl From<curl::Error> for Error {
    fn from(e: curl::Error) -> Self {
        Self::Curl(e)
    }
}

impl From<curl::MultiError> for Error {
    fn from(e: curl::MultiError) -> Self {
        Self::Multi(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            e => io::Error::other(e),
        }
    }
}
