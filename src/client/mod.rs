/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The two client personas and their shared connection machinery.
//!
//! [`CommandClient`] serves ordinary request/response commands;
//! [`PubsubClient`] serves channel and pattern subscriptions.  Both own a
//! supervisor that drives one reconnecting connection, mirror its lifecycle
//! events to user listeners, and carry their user-visible state (queued
//! commands, subscription registries) across reconnects.

use std::fmt;

use futures_channel::oneshot;

use crate::error::Error;
use crate::protocol::RespValue;

pub mod command;
pub mod endpoint;
pub mod pubsub;

pub(crate) mod connect;
pub(crate) mod inactivity;
pub(crate) mod request;
pub(crate) mod supervisor;

#[cfg(test)]
pub(crate) mod testserver;

pub use command::CommandClient;
pub use endpoint::Endpoint;
pub use pubsub::{PubsubClient, PubsubEvent, SubscriptionId};
pub use supervisor::{ClientEvent, LifecycleState};

/// The resolving half of a command's completion handle.  Resolved exactly
/// once, with the decoded reply or a typed failure; the issuing side holds
/// the receiving half and may await it whenever it likes.
pub(crate) type ReplySender = oneshot::Sender<Result<RespValue, Error>>;

/// The error observed when a handle outlives its client's actor task.
pub(crate) fn client_gone() -> Error {
    crate::error::internal("the client task is no longer running")
}

/// Why a connection worker stopped.
#[derive(Debug)]
pub(crate) enum CloseReason {
    /// The peer closed the stream
    Eof,
    /// An IO, protocol or server error (`Error::OutOfSync` for a reply with
    /// nothing waiting for it)
    Error(Error),
    /// The inactivity probe went unanswered
    InactivityTimeout,
    /// The owner asked the connection to close
    Requested,
}

impl CloseReason {
    /// Desyncs are the one reason worth shouting about; everything else is
    /// ordinary connection churn handled by the supervisor.
    pub(crate) fn is_desync(&self) -> bool {
        matches!(self, CloseReason::Error(Error::OutOfSync))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CloseReason::Eof => f.write_str("closed by peer"),
            CloseReason::Error(e) => write!(f, "{}", e),
            CloseReason::InactivityTimeout => f.write_str("inactivity probe went unanswered"),
            CloseReason::Requested => f.write_str("closed on request"),
        }
    }
}

/// Sleeps until the supervisor's scheduled retry, or forever when none is
/// scheduled; raced against the client actor's mailboxes.
pub(crate) async fn retry_timer(at: Option<tokio::time::Instant>) {
    match at {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures_util::future::pending().await,
    }
}
