/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Error handling

use std::{error, fmt, io};

use futures_channel::{mpsc, oneshot};

use crate::protocol::resp;

#[derive(Debug)]
pub enum Error {
    /// A non-specific internal error that prevented an operation from completing
    Internal(String),

    /// An IO error occurred
    IO(io::Error),

    /// A RESP parsing/serialising error occurred. When raised while decoding a stream the
    /// connection that produced it is torn down.
    RESP(String, Option<resp::RespValue>),

    /// An error reply sent by the server
    Remote(ServerError),

    /// Error creating a connection, or an error with a connection being closed unexpectedly
    Connection(ConnectionReason),

    /// The pool has no free connection, no capacity to grow, and its waiting queue is full
    PoolExhausted,

    /// The connection has reached its limit of outstanding requests
    Backpressure,

    /// A multi-key command touches keys that hash to different cluster slots
    CrossSlot(Vec<u16>),

    /// Cluster redirects kept arriving beyond the configured ceiling
    Redirect(String),

    /// The cluster topology could not be obtained from any known node
    Cluster(String),

    /// A credentials provider failed, the inner error is the provider's own
    CredentialProvider(Box<dyn error::Error + Send + Sync>),

    /// An operation did not complete within its deadline
    Timeout,

    /// A stream ended unexpectedly
    EndOfStream,

    /// An unexpected error.  In this context "unexpected" means
    /// "unexpected because we check ahead of time", it used to maintain the type signature of
    /// chains of futures; but it occurring at runtime should be considered a catastrophic
    /// failure.
    ///
    /// If any error is propagated this way that needs to be handled, then it should be made into
    /// a proper option.
    Unexpected(String),

    #[cfg(feature = "tls")]
    InvalidDnsName,

    #[cfg(feature = "tls")]
    Tls(String),
}

impl Error {
    /// Whether a fresh connection attempt might succeed where this one failed
    pub(crate) fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::IO(_) | Error::Connection(_) | Error::Timeout | Error::EndOfStream
        )
    }

    /// The error reply sent by the server, if this is one
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Remote(err) => Some(err),
            _ => None,
        }
    }
}

pub(crate) fn internal(msg: impl Into<String>) -> Error {
    Error::Internal(msg.into())
}

pub(crate) fn unexpected(msg: impl Into<String>) -> Error {
    Error::Unexpected(msg.into())
}

pub(crate) fn resp(msg: impl Into<String>, resp: resp::RespValue) -> Error {
    Error::RESP(msg.into(), Some(resp))
}

/// Wrap the failure of a user supplied credentials provider
pub fn credential_provider(err: impl Into<Box<dyn error::Error + Send + Sync>>) -> Error {
    Error::CredentialProvider(err.into())
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<oneshot::Canceled> for Error {
    fn from(err: oneshot::Canceled) -> Error {
        Error::Unexpected(format!("Oneshot was cancelled before use: {}", err))
    }
}

impl<T: 'static + Send> From<mpsc::TrySendError<T>> for Error {
    fn from(err: mpsc::TrySendError<T>) -> Error {
        Error::Unexpected(format!("Cannot write to channel: {}", err))
    }
}

impl From<mpsc::SendError> for Error {
    fn from(err: mpsc::SendError) -> Error {
        Error::Unexpected(format!("Cannot write to channel: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Error {
        Error::Timeout
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IO(err) => Some(err),
            Error::CredentialProvider(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Internal(s) => f.write_str(s),
            Error::IO(err) => fmt::Display::fmt(err, f),
            Error::RESP(s, resp) => write!(f, "{}: {:?}", s, resp),
            Error::Remote(err) => fmt::Display::fmt(err, f),
            Error::Connection(ConnectionReason::ConnectionFailed) => {
                f.write_str("The last attempt to establish a connection failed")
            }
            Error::Connection(ConnectionReason::NotConnected) => {
                f.write_str("Connection has been closed")
            }
            Error::PoolExhausted => f.write_str("Connection pool and its waiting queue are full"),
            Error::Backpressure => f.write_str("Too many outstanding requests on connection"),
            Error::CrossSlot(slots) => {
                write!(f, "Keys in request hash to different slots: {:?}", slots)
            }
            Error::Redirect(s) => write!(f, "Too many cluster redirects: {}", s),
            Error::Cluster(s) => write!(f, "Cluster unavailable: {}", s),
            Error::CredentialProvider(err) => fmt::Display::fmt(err, f),
            Error::Timeout => f.write_str("Operation timed out"),
            Error::EndOfStream => f.write_str("End of stream"),
            Error::Unexpected(err) => f.write_str(err),
            #[cfg(feature = "tls")]
            Error::InvalidDnsName => f.write_str("Invalid dns name"),
            #[cfg(feature = "tls")]
            Error::Tls(err) => write!(f, "TLS error: {}", err),
        }
    }
}

/// Details of a `ConnectionError`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionReason {
    /// Connecting failed, and every retry allowed by the backoff policy failed too
    ConnectionFailed,
    /// The connection is not currently connected, any request outstanding on it has failed
    NotConnected,
}

/// An error reply from the server.
///
/// The first word of the reply is the error code by convention (e.g. `ERR`, `WRONGTYPE`,
/// `MOVED`), the full line is kept as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    line: String,
}

impl ServerError {
    pub(crate) fn new(line: impl Into<String>) -> Self {
        ServerError { line: line.into() }
    }

    /// The error code, e.g. `WRONGTYPE`
    pub fn code(&self) -> &str {
        self.line.split(' ').next().unwrap_or("")
    }

    /// The remainder of the line after the code
    pub fn message(&self) -> &str {
        match self.line.split_once(' ') {
            Some((_, message)) => message,
            None => "",
        }
    }

    /// The line exactly as the server sent it
    pub fn as_str(&self) -> &str {
        &self.line
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.line)
    }
}
