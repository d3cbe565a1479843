/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! One TCP session speaking pipelined request/response.
//!
//! Commands and their completion handles enter through a cheap handle; a
//! spawned worker owns the socket and pairs every incoming reply with the
//! head of a FIFO of handles.  The handle is enqueued before the command's
//! bytes leave, so the pairing can never skew.  A reply with nothing
//! waiting for it means the pairing *has* skewed, and the connection is
//! torn down rather than guessed about.

use std::collections::VecDeque;
use std::time::Duration;

use futures_channel::{mpsc, oneshot};
use futures_util::{SinkExt, StreamExt};

use crate::error::{ConnectionReason, Error};
use crate::protocol::RespValue;

use super::connect::RespConnection;
use super::inactivity::{tick_or_never, InactivityProbe, ProbeEvent};
use super::{CloseReason, ReplySender};

/// Tells the owning client that a connection stopped, and why.
#[derive(Debug)]
pub(crate) struct ConnectionNotice {
    pub(crate) generation: u64,
    pub(crate) reason: CloseReason,
}

/// Handle to a running request/response connection.
#[derive(Clone)]
pub(crate) struct RequestConnection {
    out_tx: mpsc::UnboundedSender<Outbound>,
}

enum Outbound {
    Command { command: RespValue, reply: ReplySender },
    Close,
}

impl RequestConnection {
    /// Takes ownership of an established framed stream and spawns the
    /// worker that serves it.
    pub(crate) fn start(
        connection: RespConnection,
        generation: u64,
        inactivity: Option<(Duration, Duration)>,
        notice_tx: mpsc::UnboundedSender<ConnectionNotice>,
    ) -> RequestConnection {
        let (out_tx, out_rx) = mpsc::unbounded();
        let worker = RequestWorker {
            connection,
            out_rx,
            replies: VecDeque::new(),
            probe: inactivity.map(|(trigger, response)| InactivityProbe::new(trigger, response)),
        };
        tokio::spawn(worker.run(generation, notice_tx));
        RequestConnection { out_tx }
    }

    /// Hands a command and its completion handle to the worker; returns
    /// them both if the worker is already gone so the caller can requeue.
    pub(crate) fn send(
        &self,
        command: RespValue,
        reply: ReplySender,
    ) -> Result<(), (RespValue, ReplySender)> {
        match self.out_tx.unbounded_send(Outbound::Command { command, reply }) {
            Ok(()) => Ok(()),
            Err(rejected) => match rejected.into_inner() {
                Outbound::Command { command, reply } => Err((command, reply)),
                Outbound::Close => Ok(()),
            },
        }
    }

    pub(crate) fn close(&self) {
        let _ = self.out_tx.unbounded_send(Outbound::Close);
    }
}

struct RequestWorker {
    connection: RespConnection,
    out_rx: mpsc::UnboundedReceiver<Outbound>,
    replies: VecDeque<ReplySender>,
    probe: Option<InactivityProbe>,
}

enum Step {
    Outbound(Option<Outbound>),
    Inbound(Option<Result<RespValue, Error>>),
    Probe(ProbeEvent),
}

impl RequestWorker {
    async fn run(mut self, generation: u64, notice_tx: mpsc::UnboundedSender<ConnectionNotice>) {
        let reason = self.serve().await;
        match &reason {
            reason if reason.is_desync() => log::error!("connection closing: {}", reason),
            CloseReason::Requested | CloseReason::Eof => {
                log::debug!("connection closing: {}", reason)
            }
            _ => log::warn!("connection closing: {}", reason),
        }

        // every in-flight handle fails before the loss is announced
        let lost = Error::Connection(ConnectionReason::ConnectionDropped);
        for reply in self.replies.drain(..) {
            let _ = reply.send(Err(lost.clone()));
        }
        self.out_rx.close();
        loop {
            match self.out_rx.try_next() {
                Ok(Some(Outbound::Command { reply, .. })) => {
                    let _ = reply.send(Err(lost.clone()));
                }
                Ok(Some(Outbound::Close)) => (),
                Ok(None) | Err(_) => break,
            }
        }

        let _ = notice_tx.unbounded_send(ConnectionNotice { generation, reason });
    }

    async fn serve(&mut self) -> CloseReason {
        loop {
            let step = tokio::select! {
                out = self.out_rx.next() => Step::Outbound(out),
                frame = self.connection.next() => Step::Inbound(frame),
                event = tick_or_never(&self.probe) => Step::Probe(event),
            };

            match step {
                Step::Outbound(Some(Outbound::Command { command, reply })) => {
                    // handle first, bytes second
                    self.replies.push_back(reply);
                    if let Err(e) = self.connection.send(command).await {
                        return CloseReason::Error(e);
                    }
                }
                Step::Outbound(Some(Outbound::Close)) | Step::Outbound(None) => {
                    return CloseReason::Requested;
                }
                Step::Inbound(Some(Ok(value))) => {
                    if let Some(probe) = self.probe.as_mut() {
                        probe.mark_activity();
                    }
                    match self.replies.pop_front() {
                        // a dropped receiver just means nobody is waiting
                        Some(reply) => {
                            let _ = reply.send(value.into_result());
                        }
                        None => return CloseReason::Error(Error::OutOfSync),
                    }
                }
                Step::Inbound(Some(Err(e))) => return CloseReason::Error(e),
                Step::Inbound(None) => return CloseReason::Eof,
                Step::Probe(ProbeEvent::SendPing) => {
                    let (reply, _) = oneshot::channel();
                    self.replies.push_back(reply);
                    if let Err(e) = self.connection.send(resp_array!["ping"]).await {
                        return CloseReason::Error(e);
                    }
                    if let Some(probe) = self.probe.as_mut() {
                        probe.note_ping_sent();
                    }
                }
                Step::Probe(ProbeEvent::Expired) => return CloseReason::InactivityTimeout,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_channel::{mpsc, oneshot};
    use futures_util::StreamExt;

    use crate::error::{ConnectionReason, Error};
    use crate::protocol::RespValue;

    use super::super::connect;
    use super::super::testserver::{ok, TestServer};
    use super::super::CloseReason;
    use super::RequestConnection;

    async fn start(
        server: &mut TestServer,
        inactivity: Option<(Duration, Duration)>,
    ) -> (
        RequestConnection,
        crate::client::testserver::ServerSession,
        mpsc::UnboundedReceiver<super::ConnectionNotice>,
    ) {
        let endpoint = server.endpoint();
        let (notice_tx, notice_rx) = mpsc::unbounded();
        let (framed, session) = tokio::join!(connect::connect(&endpoint), server.accept());
        let connection = RequestConnection::start(framed.unwrap(), 7, inactivity, notice_tx);
        (connection, session, notice_rx)
    }

    fn command(
        connection: &RequestConnection,
        cmd: RespValue,
    ) -> oneshot::Receiver<Result<RespValue, Error>> {
        let (tx, rx) = oneshot::channel();
        connection.send(cmd, tx).expect("worker is alive");
        rx
    }

    #[tokio::test]
    async fn replies_resolve_in_issue_order() {
        let mut server = TestServer::start().await;
        let (connection, mut session, _notices) = start(&mut server, None).await;

        let first = command(&connection, resp_array!["get", "a"]);
        let second = command(&connection, resp_array!["get", "b"]);
        let third = command(&connection, resp_array!["get", "c"]);

        session.expect(&["get", "a"]).await;
        session.expect(&["get", "b"]).await;
        session.expect(&["get", "c"]).await;
        session.send(RespValue::BulkString(b"1".to_vec())).await;
        session.send(RespValue::BulkString(b"2".to_vec())).await;
        session.send(RespValue::BulkString(b"3".to_vec())).await;

        assert_eq!(first.await.unwrap().unwrap(), RespValue::BulkString(b"1".to_vec()));
        assert_eq!(second.await.unwrap().unwrap(), RespValue::BulkString(b"2".to_vec()));
        assert_eq!(third.await.unwrap().unwrap(), RespValue::BulkString(b"3".to_vec()));
    }

    #[tokio::test]
    async fn an_error_reply_fails_only_its_own_command() {
        let mut server = TestServer::start().await;
        let (connection, mut session, _notices) = start(&mut server, None).await;

        let first = command(&connection, resp_array!["incr", "k"]);
        let second = command(&connection, resp_array!["get", "k"]);

        session.expect(&["incr", "k"]).await;
        session.expect(&["get", "k"]).await;
        session.send(RespValue::Error("ERR not an integer".to_owned())).await;
        session.send(ok()).await;

        match first.await.unwrap() {
            Err(Error::Remote(message)) => assert_eq!(message, "ERR not an integer"),
            other => panic!("expected a remote error: {:?}", other),
        }
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn losing_the_socket_fails_in_flight_commands_then_notifies() {
        let mut server = TestServer::start().await;
        let (connection, mut session, mut notices) = start(&mut server, None).await;

        let pending = command(&connection, resp_array!["get", "k"]);
        session.expect(&["get", "k"]).await;
        drop(session);

        match pending.await.unwrap() {
            Err(Error::Connection(ConnectionReason::ConnectionDropped)) => (),
            other => panic!("expected a dropped-connection error: {:?}", other),
        }
        let notice = notices.next().await.expect("a notice");
        assert_eq!(notice.generation, 7);
        assert!(matches!(notice.reason, CloseReason::Eof));
    }

    #[tokio::test]
    async fn an_unsolicited_reply_is_fatal() {
        let mut server = TestServer::start().await;
        let (_connection, mut session, mut notices) = start(&mut server, None).await;

        session.send(ok()).await;

        let notice = notices.next().await.expect("a notice");
        assert!(notice.reason.is_desync());
        // the worker dropped the socket too
        assert!(session.recv_eof().await);
    }

    #[tokio::test]
    async fn close_notifies_the_owner() {
        let mut server = TestServer::start().await;
        let (connection, _session, mut notices) = start(&mut server, None).await;

        connection.close();
        let notice = notices.next().await.expect("a notice");
        assert!(matches!(notice.reason, CloseReason::Requested));
    }

    #[tokio::test]
    async fn silence_triggers_a_ping_then_a_teardown() {
        let mut server = TestServer::start().await;
        let inactivity = Some((Duration::from_millis(150), Duration::from_millis(150)));
        let (_connection, mut session, mut notices) = start(&mut server, inactivity).await;

        session.expect(&["ping"]).await;

        // never answer; the probe expires and the worker gives up
        let notice = notices.next().await.expect("a notice");
        assert!(matches!(notice.reason, CloseReason::InactivityTimeout));
    }

    #[tokio::test]
    async fn an_answered_ping_keeps_the_connection_alive() {
        let mut server = TestServer::start().await;
        let inactivity = Some((Duration::from_millis(150), Duration::from_millis(500)));
        let (connection, mut session, _notices) = start(&mut server, inactivity).await;

        session.expect(&["ping"]).await;
        session.send(RespValue::SimpleString("PONG".to_owned())).await;

        // the connection is still serving commands afterwards
        let reply = command(&connection, resp_array!["get", "k"]);
        session.expect(&["get", "k"]).await;
        session.send(ok()).await;
        assert!(reply.await.unwrap().is_ok());
    }
}
