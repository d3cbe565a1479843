/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A resilient asynchronous Redis client for Tokio.
//!
//! Two client personas share one supervised, reconnecting transport:
//!
//! * [`CommandClient`](client::CommandClient) for request/response
//!   commands.  Commands are pipelined: each `send`/`call` enqueues
//!   immediately and returns a future for its reply, and replies pair with
//!   commands in issue order.  Commands issued while no connection is up
//!   are queued and flushed, still in order, once one is; every new
//!   connection runs `auth` and `select` first when the endpoint calls for
//!   them.
//! * [`PubsubClient`](client::PubsubClient) for channel and pattern
//!   subscriptions.  Callbacks are registered per channel or pattern, and
//!   the registry is replayed onto every fresh connection, so subscribers
//!   keep receiving messages across reconnects without doing anything.
//!
//! Both personas drive the same lifecycle: a lost connection is retried
//! immediately, a failed attempt is retried after a configurable interval,
//! and once the retry budget is exhausted the client enters a terminal
//! failed state that only an explicit `reconnect` leaves.  Lifecycle
//! events (`connected`, `reconnected`, `disconnected`, `reconnect_failed`,
//! `failed`) are surfaced to registered listeners on either client.
//!
//! Servers are named by an [`Endpoint`](client::Endpoint), built directly
//! or parsed from a `redis://[:password@]host[:port][/db]` URI.
//!
//! ```no_run
//! use redis_steward::{client::CommandClient, resp_array, Endpoint};
//!
//! # async fn example() -> Result<(), redis_steward::error::Error> {
//! let endpoint = Endpoint::from_uri("redis://127.0.0.1/2")?;
//! let client = CommandClient::connect_to(endpoint).await?;
//!
//! client.send_and_forget(resp_array!["set", "greeting", "hello"]);
//! let greeting: String = client.send(resp_array!["get", "greeting"]).await?;
//! assert_eq!(greeting, "hello");
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod protocol;

pub mod client;
pub mod error;
pub mod event;

pub(crate) mod state;

pub use client::{ClientEvent, CommandClient, Endpoint, LifecycleState, PubsubClient, PubsubEvent};
pub use protocol::{FromResp, RespValue};
