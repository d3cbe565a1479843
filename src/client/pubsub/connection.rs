/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! One TCP session dedicated to pub/sub traffic.
//!
//! A pub/sub connection carries only the four subscription verbs, each for
//! exactly one channel or pattern; the op enum makes anything else
//! unrepresentable.  Unlike the request connection there is no global reply
//! queue: the server acknowledges subscription commands per name, so
//! acknowledgement handles queue per name and resolve with the server's
//! running subscription count.
//!
//! The worker issues the resubscription snapshot it was created with before
//! serving anything else, which is how a fresh connection comes up already
//! subscribed to everything its client's registry wants.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use futures_channel::{mpsc, oneshot};
use futures_util::{SinkExt, StreamExt};

use crate::error::{ConnectionReason, Error};
use crate::protocol::RespValue;

use super::super::connect::RespConnection;
use super::super::inactivity::{tick_or_never, InactivityProbe, ProbeEvent};
use super::super::CloseReason;

/// The reserved channel the inactivity probe subscribes to and immediately
/// unsubscribes from, a pub/sub connection being unable to send `ping`.
pub(crate) const PING_CHANNEL: &str = "__steward-ping";

/// The four operations a pub/sub connection accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Subscribe,
    Unsubscribe,
    Psubscribe,
    Punsubscribe,
}

impl OpKind {
    pub(crate) fn verb(self) -> &'static str {
        match self {
            OpKind::Subscribe => "subscribe",
            OpKind::Unsubscribe => "unsubscribe",
            OpKind::Psubscribe => "psubscribe",
            OpKind::Punsubscribe => "punsubscribe",
        }
    }

    fn is_pattern(self) -> bool {
        matches!(self, OpKind::Psubscribe | OpKind::Punsubscribe)
    }

    fn from_ack(verb: &[u8]) -> Option<OpKind> {
        match verb {
            b"subscribe" => Some(OpKind::Subscribe),
            b"unsubscribe" => Some(OpKind::Unsubscribe),
            b"psubscribe" => Some(OpKind::Psubscribe),
            b"punsubscribe" => Some(OpKind::Punsubscribe),
            _ => None,
        }
    }
}

/// Resolves one subscription op with the server's reported count.
pub(crate) type AckSender = oneshot::Sender<Result<i64, Error>>;

/// Everything a pub/sub connection reports to its owning client.
#[derive(Debug)]
pub(crate) enum PubsubNotice {
    Message {
        channel: String,
        payload: Vec<u8>,
    },
    Pmessage {
        pattern: String,
        channel: String,
        payload: Vec<u8>,
    },
    Ack {
        kind: OpKind,
        name: String,
        count: i64,
    },
    Closed {
        generation: u64,
        reason: CloseReason,
    },
}

/// Handle to a running pub/sub connection.
#[derive(Clone)]
pub(crate) struct PubsubConnection {
    out_tx: mpsc::UnboundedSender<Outbound>,
}

enum Outbound {
    Op {
        kind: OpKind,
        name: String,
        ack: AckSender,
    },
    Close,
}

impl PubsubConnection {
    pub(crate) fn start(
        connection: RespConnection,
        generation: u64,
        inactivity: Option<(Duration, Duration)>,
        resubscribe: Vec<(OpKind, String)>,
        notice_tx: mpsc::UnboundedSender<PubsubNotice>,
    ) -> PubsubConnection {
        let (out_tx, out_rx) = mpsc::unbounded();
        let worker = PubsubWorker {
            connection,
            out_rx,
            acks: AckQueues::default(),
            probe: inactivity.map(|(trigger, response)| InactivityProbe::new(trigger, response)),
        };
        tokio::spawn(worker.run(generation, resubscribe, notice_tx));
        PubsubConnection { out_tx }
    }

    /// Hands one subscription op to the worker; returns the pieces if the
    /// worker is already gone.
    pub(crate) fn send(
        &self,
        kind: OpKind,
        name: String,
        ack: AckSender,
    ) -> Result<(), (OpKind, String, AckSender)> {
        match self.out_tx.unbounded_send(Outbound::Op { kind, name, ack }) {
            Ok(()) => Ok(()),
            Err(rejected) => match rejected.into_inner() {
                Outbound::Op { kind, name, ack } => Err((kind, name, ack)),
                Outbound::Close => Ok(()),
            },
        }
    }

    pub(crate) fn close(&self) {
        let _ = self.out_tx.unbounded_send(Outbound::Close);
    }
}

/// Per-name acknowledgement FIFOs, channels and patterns kept apart since a
/// channel and a pattern may share a name.
#[derive(Default)]
struct AckQueues {
    channels: HashMap<String, VecDeque<AckSender>>,
    patterns: HashMap<String, VecDeque<AckSender>>,
}

impl AckQueues {
    fn push(&mut self, kind: OpKind, name: &str, ack: AckSender) {
        let map = if kind.is_pattern() {
            &mut self.patterns
        } else {
            &mut self.channels
        };
        map.entry(name.to_owned()).or_default().push_back(ack);
    }

    fn pop(&mut self, kind: OpKind, name: &str) -> Option<AckSender> {
        let map = if kind.is_pattern() {
            &mut self.patterns
        } else {
            &mut self.channels
        };
        let queue = map.get_mut(name)?;
        let ack = queue.pop_front();
        if queue.is_empty() {
            map.remove(name);
        }
        ack
    }

    fn drain(&mut self) -> Vec<AckSender> {
        self.channels
            .drain()
            .chain(self.patterns.drain())
            .flat_map(|(_, queue)| queue)
            .collect()
    }
}

struct PubsubWorker {
    connection: RespConnection,
    out_rx: mpsc::UnboundedReceiver<Outbound>,
    acks: AckQueues,
    probe: Option<InactivityProbe>,
}

enum Step {
    Outbound(Option<Outbound>),
    Inbound(Option<Result<RespValue, Error>>),
    Probe(ProbeEvent),
}

impl PubsubWorker {
    async fn run(
        mut self,
        generation: u64,
        resubscribe: Vec<(OpKind, String)>,
        notice_tx: mpsc::UnboundedSender<PubsubNotice>,
    ) {
        let reason = self.serve(resubscribe, &notice_tx).await;
        match &reason {
            reason if reason.is_desync() => {
                log::error!("pub/sub connection closing: {}", reason)
            }
            CloseReason::Requested | CloseReason::Eof => {
                log::debug!("pub/sub connection closing: {}", reason)
            }
            _ => log::warn!("pub/sub connection closing: {}", reason),
        }

        let lost = Error::Connection(ConnectionReason::ConnectionDropped);
        for ack in self.acks.drain() {
            let _ = ack.send(Err(lost.clone()));
        }
        self.out_rx.close();
        loop {
            match self.out_rx.try_next() {
                Ok(Some(Outbound::Op { ack, .. })) => {
                    let _ = ack.send(Err(lost.clone()));
                }
                Ok(Some(Outbound::Close)) => (),
                Ok(None) | Err(_) => break,
            }
        }

        let _ = notice_tx.unbounded_send(PubsubNotice::Closed { generation, reason });
    }

    async fn serve(
        &mut self,
        resubscribe: Vec<(OpKind, String)>,
        notice_tx: &mpsc::UnboundedSender<PubsubNotice>,
    ) -> CloseReason {
        for (kind, name) in resubscribe {
            let (ack, _) = oneshot::channel();
            if let Err(reason) = self.issue(kind, &name, ack).await {
                return reason;
            }
        }

        loop {
            let step = tokio::select! {
                out = self.out_rx.next() => Step::Outbound(out),
                frame = self.connection.next() => Step::Inbound(frame),
                event = tick_or_never(&self.probe) => Step::Probe(event),
            };

            match step {
                Step::Outbound(Some(Outbound::Op { kind, name, ack })) => {
                    if let Err(reason) = self.issue(kind, &name, ack).await {
                        return reason;
                    }
                }
                Step::Outbound(Some(Outbound::Close)) | Step::Outbound(None) => {
                    return CloseReason::Requested;
                }
                Step::Inbound(Some(Ok(frame))) => {
                    if let Some(probe) = self.probe.as_mut() {
                        probe.mark_activity();
                    }
                    if let Err(reason) = self.handle_frame(frame, notice_tx) {
                        return reason;
                    }
                }
                Step::Inbound(Some(Err(e))) => return CloseReason::Error(e),
                Step::Inbound(None) => return CloseReason::Eof,
                Step::Probe(ProbeEvent::SendPing) => {
                    // a pub/sub connection cannot ping; touching the
                    // reserved channel provokes two acknowledgements instead
                    for kind in [OpKind::Subscribe, OpKind::Unsubscribe] {
                        let (ack, _) = oneshot::channel();
                        if let Err(reason) = self.issue(kind, PING_CHANNEL, ack).await {
                            return reason;
                        }
                    }
                    if let Some(probe) = self.probe.as_mut() {
                        probe.note_ping_sent();
                    }
                }
                Step::Probe(ProbeEvent::Expired) => return CloseReason::InactivityTimeout,
            }
        }
    }

    /// Enqueues the acknowledgement handle, then writes the command.
    async fn issue(&mut self, kind: OpKind, name: &str, ack: AckSender) -> Result<(), CloseReason> {
        self.acks.push(kind, name, ack);
        self.connection
            .send(resp_array![kind.verb(), name])
            .await
            .map_err(CloseReason::Error)
    }

    fn handle_frame(
        &mut self,
        frame: RespValue,
        notice_tx: &mpsc::UnboundedSender<PubsubNotice>,
    ) -> Result<(), CloseReason> {
        let items = match frame {
            RespValue::Array(items) => items,
            RespValue::Error(message) => {
                return Err(CloseReason::Error(Error::Remote(message)));
            }
            other => {
                log::error!("non-array frame on a pub/sub connection: {:?}", other);
                return Err(CloseReason::Error(Error::OutOfSync));
            }
        };
        let mut parts = items.into_iter();
        let Some(RespValue::BulkString(kind)) = parts.next() else {
            return Err(CloseReason::Error(Error::OutOfSync));
        };

        match kind.as_slice() {
            b"message" => {
                let (Some(channel), Some(RespValue::BulkString(payload)), None) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(CloseReason::Error(Error::OutOfSync));
                };
                let channel = as_text(channel)?;
                let _ = notice_tx.unbounded_send(PubsubNotice::Message { channel, payload });
            }
            b"pmessage" => {
                let (Some(pattern), Some(channel), Some(RespValue::BulkString(payload)), None) =
                    (parts.next(), parts.next(), parts.next(), parts.next())
                else {
                    return Err(CloseReason::Error(Error::OutOfSync));
                };
                let pattern = as_text(pattern)?;
                let channel = as_text(channel)?;
                let _ = notice_tx.unbounded_send(PubsubNotice::Pmessage {
                    pattern,
                    channel,
                    payload,
                });
            }
            ack_verb => {
                let Some(kind) = OpKind::from_ack(ack_verb) else {
                    log::error!(
                        "unexpected frame kind on a pub/sub connection: {}",
                        String::from_utf8_lossy(ack_verb)
                    );
                    return Err(CloseReason::Error(Error::OutOfSync));
                };
                let (Some(name), Some(RespValue::Integer(count)), None) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(CloseReason::Error(Error::OutOfSync));
                };
                let name = as_text(name)?;
                match self.acks.pop(kind, &name) {
                    Some(ack) => {
                        let _ = ack.send(Ok(count));
                    }
                    None => log::warn!(
                        "unexpected {} acknowledgement for {}",
                        kind.verb(),
                        name
                    ),
                }
                let _ = notice_tx.unbounded_send(PubsubNotice::Ack { kind, name, count });
            }
        }
        Ok(())
    }
}

fn as_text(value: RespValue) -> Result<String, CloseReason> {
    match value {
        RespValue::BulkString(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        RespValue::SimpleString(string) => Ok(string),
        _ => Err(CloseReason::Error(Error::OutOfSync)),
    }
}
