/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A scripted in-process RESP peer for tests.
//!
//! Tests own the server side of the socket directly, so every exchange is
//! deterministic: the test asserts exactly which command arrives and
//! chooses exactly what to reply, including nothing at all.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Framed};

use crate::protocol::{RespCodec, RespValue};

use super::endpoint::Endpoint;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct TestServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TestServer {
    pub(crate) async fn start() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("cannot bind a loopback listener");
        let addr = listener.local_addr().expect("listener has no address");
        TestServer { listener, addr }
    }

    /// An endpoint that nothing is listening on; connection attempts are
    /// refused immediately.
    pub(crate) async fn dead_endpoint() -> Endpoint {
        let server = TestServer::start().await;
        let addr = server.addr;
        drop(server);
        Endpoint::new(addr.ip().to_string(), addr.port())
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.addr.ip().to_string(), self.addr.port())
    }

    /// Waits for the next inbound connection.
    pub(crate) async fn accept(&mut self) -> ServerSession {
        let (stream, _) = timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("timed out waiting for a connection")
            .expect("accept failed");
        ServerSession {
            framed: RespCodec.framed(stream),
        }
    }
}

/// One accepted connection, driven frame by frame from the test body.
pub(crate) struct ServerSession {
    framed: Framed<TcpStream, RespCodec>,
}

impl ServerSession {
    pub(crate) async fn recv(&mut self) -> RespValue {
        timeout(STEP_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("peer closed the connection")
            .expect("malformed frame")
    }

    /// Asserts that the next inbound frame is exactly this command.
    pub(crate) async fn expect(&mut self, command: &[&str]) {
        let frame = self.recv().await;
        let expected = RespValue::Array(
            command
                .iter()
                .map(|part| RespValue::BulkString(part.as_bytes().to_vec()))
                .collect(),
        );
        assert_eq!(frame, expected);
    }

    pub(crate) async fn send(&mut self, value: RespValue) {
        timeout(STEP_TIMEOUT, self.framed.send(value))
            .await
            .expect("timed out sending a frame")
            .expect("send failed");
    }

    /// True when the peer has closed its end of the connection.
    pub(crate) async fn recv_eof(&mut self) -> bool {
        matches!(
            timeout(STEP_TIMEOUT, self.framed.next())
                .await
                .expect("timed out waiting for EOF"),
            None
        )
    }

    /// A `[kind, name, count]` subscription acknowledgement.
    pub(crate) async fn ack(&mut self, kind: &str, name: &str, count: i64) {
        self.send(RespValue::Array(vec![
            kind.into(),
            name.into(),
            RespValue::Integer(count),
        ]))
        .await;
    }

    /// A `[message, channel, payload]` delivery.
    pub(crate) async fn publish(&mut self, channel: &str, payload: &str) {
        self.send(RespValue::Array(vec![
            "message".into(),
            channel.into(),
            payload.into(),
        ]))
        .await;
    }

    /// A `[pmessage, pattern, channel, payload]` delivery.
    pub(crate) async fn ppublish(&mut self, pattern: &str, channel: &str, payload: &str) {
        self.send(RespValue::Array(vec![
            "pmessage".into(),
            pattern.into(),
            channel.into(),
            payload.into(),
        ]))
        .await;
    }
}

pub(crate) fn ok() -> RespValue {
    RespValue::SimpleString("OK".to_owned())
}
