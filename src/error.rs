/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::{error, fmt, io, sync::Arc};

use crate::protocol::resp::RespValue;

/// All the errors this crate can produce.
///
/// `Error` is cloneable: losing a single connection terminates every command
/// still in flight on it, so one error value fans out to many pending
/// completion handles.  IO errors are held behind an `Arc` for this reason.
#[derive(Debug, Clone)]
pub enum Error {
    /// An internal invariant was broken; either a bug in this library or in
    /// the way it is being driven
    Internal(String),

    /// An IO error occurred
    IO(Arc<io::Error>),

    /// A RESP parsing or conversion error occurred
    RESP(String, Option<RespValue>),

    /// An error returned by the Redis server; the message is verbatim
    Remote(String),

    /// An error establishing or using a connection
    Connection(ConnectionReason),

    /// An argument the library cannot act on
    InvalidArgument(String),

    /// A reply arrived with no command waiting for it; the connection it
    /// arrived on is closed and cannot be used again
    OutOfSync,

    /// The connection closed before a required reply arrived
    EndOfStream,
}

/// Details of a connection-state failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionReason {
    /// An attempt to establish a connection did not succeed
    ConnectionFailed,

    /// The connection closed while commands were in flight
    ConnectionDropped,

    /// No connection is currently established
    NotConnected,

    /// The retry budget is exhausted; `reconnect` must be called before any
    /// further commands can be accepted
    InFailedState,
}

pub(crate) fn internal(msg: impl Into<String>) -> Error {
    Error::Internal(msg.into())
}

pub(crate) fn resp(msg: impl Into<String>, value: RespValue) -> Error {
    Error::RESP(msg.into(), Some(value))
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(Arc::new(err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::IO(err) => write!(f, "IO error: {}", err),
            Error::RESP(msg, _) => write!(f, "RESP error: {}", msg),
            Error::Remote(msg) => write!(f, "server error: {}", msg),
            Error::Connection(reason) => write!(f, "connection error: {}", reason),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::OutOfSync => write!(f, "replies out of sync with commands"),
            Error::EndOfStream => write!(f, "connection closed before a reply arrived"),
        }
    }
}

impl fmt::Display for ConnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ConnectionReason::ConnectionFailed => "the connection attempt failed",
            ConnectionReason::ConnectionDropped => "the connection was lost",
            ConnectionReason::NotConnected => "not connected",
            ConnectionReason::InFailedState => "the client is in the failed state",
        };
        f.write_str(msg)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IO(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
