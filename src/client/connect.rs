/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Establishing a framed RESP transport over TCP.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Framed};

use crate::error::Error;
use crate::protocol::{RespCodec, RespValue};

use super::endpoint::Endpoint;

/// One TCP session speaking whole RESP frames in both directions.
pub(crate) type RespConnection = Framed<TcpStream, RespCodec>;

pub(crate) async fn connect(endpoint: &Endpoint) -> Result<RespConnection, Error> {
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    Ok(RespCodec.framed(stream))
}

/// Sends one command and waits for its single reply.
///
/// Connection factories use this for `auth` and `select` on the raw framed
/// stream, before any worker owns it; that is what guarantees setup
/// commands precede all queued traffic on every new connection.  A server
/// error reply surfaces as `Error::Remote` and fails the attempt.
pub(crate) async fn exchange(
    connection: &mut RespConnection,
    command: RespValue,
) -> Result<RespValue, Error> {
    connection.send(command).await?;
    match connection.next().await {
        Some(Ok(value)) => value.into_result(),
        Some(Err(e)) => Err(e),
        None => Err(Error::EndOfStream),
    }
}
