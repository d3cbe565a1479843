/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The pub/sub client persona.
//!
//! A `PubsubClient` keeps two registries, channel name to callbacks and
//! pattern to callbacks, and treats them as the ground truth for what the
//! wire should be subscribed to: subscribing an already-registered channel
//! adds a callback with no wire traffic, removing the last callback of a
//! channel unsubscribes it, and every fresh connection is brought up
//! already subscribed to the whole registry before it serves anything else.
//! Registered callbacks therefore keep firing across reconnects without the
//! caller doing anything.
//!
//! Delivered messages reach both the per-channel callbacks and any
//! listeners on the raw `message` / `pmessage` events; subscription
//! acknowledgements surface as `subscribe` / `unsubscribe` / `psubscribe` /
//! `punsubscribe` events.

mod connection;

use std::collections::{HashMap, HashSet};
use std::future::Future;

use futures_channel::{mpsc, oneshot};
use futures_util::StreamExt;

use crate::error::{ConnectionReason, Error};
use crate::event::{EventBus, Listener, ListenerId};

use self::connection::{AckSender, OpKind, PubsubConnection, PubsubNotice};

use super::connect;
use super::endpoint::Endpoint;
use super::supervisor::{ClientEvent, Directive, LifecycleState, Supervisor};
use super::{client_gone, retry_timer};

/// Identifies one registered subscription callback, for selective removal.
pub type SubscriptionId = ListenerId;

/// Everything a `PubsubClient` can report to its event listeners.  The
/// names are stable strings, usable as `on(..)` event keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubsubEvent {
    Connected,
    Reconnected,
    Disconnected,
    ReconnectFailed(u32),
    Failed,
    /// A message published to a subscribed channel
    Message { channel: String, payload: Vec<u8> },
    /// A message delivered through a pattern subscription
    Pmessage {
        pattern: String,
        channel: String,
        payload: Vec<u8>,
    },
    /// The server confirmed a channel subscription
    Subscribe { channel: String, count: i64 },
    /// The server confirmed a channel unsubscription
    Unsubscribe { channel: String, count: i64 },
    /// The server confirmed a pattern subscription
    Psubscribe { pattern: String, count: i64 },
    /// The server confirmed a pattern unsubscription
    Punsubscribe { pattern: String, count: i64 },
}

impl PubsubEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PubsubEvent::Connected => "connected",
            PubsubEvent::Reconnected => "reconnected",
            PubsubEvent::Disconnected => "disconnected",
            PubsubEvent::ReconnectFailed(_) => "reconnect_failed",
            PubsubEvent::Failed => "failed",
            PubsubEvent::Message { .. } => "message",
            PubsubEvent::Pmessage { .. } => "pmessage",
            PubsubEvent::Subscribe { .. } => "subscribe",
            PubsubEvent::Unsubscribe { .. } => "unsubscribe",
            PubsubEvent::Psubscribe { .. } => "psubscribe",
            PubsubEvent::Punsubscribe { .. } => "punsubscribe",
        }
    }

    fn lifecycle(event: ClientEvent) -> PubsubEvent {
        match event {
            ClientEvent::Connected => PubsubEvent::Connected,
            ClientEvent::Reconnected => PubsubEvent::Reconnected,
            ClientEvent::Disconnected => PubsubEvent::Disconnected,
            ClientEvent::ReconnectFailed(attempt) => PubsubEvent::ReconnectFailed(attempt),
            ClientEvent::Failed => PubsubEvent::Failed,
        }
    }
}

/// The pub/sub client.  Cloning is cheap; clones share one connection and
/// one registry.
#[derive(Clone)]
pub struct PubsubClient {
    msg_tx: mpsc::UnboundedSender<Msg>,
}

enum Msg {
    Subscribe {
        channel: String,
        callback: Listener<Vec<u8>>,
        done: oneshot::Sender<Result<SubscriptionId, Error>>,
    },
    Psubscribe {
        pattern: String,
        callback: Listener<(String, Vec<u8>)>,
        done: oneshot::Sender<Result<SubscriptionId, Error>>,
    },
    Unsubscribe {
        channel: String,
        done: oneshot::Sender<Result<i64, Error>>,
    },
    Punsubscribe {
        pattern: String,
        done: oneshot::Sender<Result<i64, Error>>,
    },
    UnsubscribeId {
        channel: String,
        id: SubscriptionId,
        done: oneshot::Sender<Result<i64, Error>>,
    },
    PunsubscribeId {
        pattern: String,
        id: SubscriptionId,
        done: oneshot::Sender<Result<i64, Error>>,
    },
    Connect {
        ready: oneshot::Sender<Result<(), Error>>,
    },
    Reconnect {
        endpoint: Option<Endpoint>,
    },
    On {
        event: String,
        listener: Box<dyn FnMut(&PubsubEvent) + Send>,
        id: oneshot::Sender<ListenerId>,
    },
    Off {
        event: String,
        id: ListenerId,
    },
    State {
        reply: oneshot::Sender<LifecycleState>,
    },
}

impl PubsubClient {
    /// Creates a client for `endpoint` without connecting.  Subscriptions
    /// made now are registered locally and go on the wire once
    /// [`connect`](Self::connect) succeeds.
    pub fn new(endpoint: Endpoint) -> PubsubClient {
        let (msg_tx, msg_rx) = mpsc::unbounded();
        let (notice_tx, notice_rx) = mpsc::unbounded();
        let (factory_tx, factory_rx) = mpsc::unbounded();
        let supervisor = Supervisor::new(endpoint.reconnect_interval, endpoint.retry_budget);
        let task = PubsubTask {
            endpoint,
            supervisor,
            channels: Side::new(OpKind::Subscribe, OpKind::Unsubscribe),
            patterns: Side::new(OpKind::Psubscribe, OpKind::Punsubscribe),
            bus: EventBus::new(),
            ready_waiters: Vec::new(),
            connection: None,
            factory_snapshot: Vec::new(),
            msg_rx,
            notice_tx,
            notice_rx,
            factory_tx,
            factory_rx,
        };
        tokio::spawn(task.run());
        PubsubClient { msg_tx }
    }

    /// Creates a client and resolves once the first connection is ready.
    pub async fn connect_to(endpoint: Endpoint) -> Result<PubsubClient, Error> {
        let client = PubsubClient::new(endpoint);
        client.connect().await?;
        Ok(client)
    }

    /// Starts connecting; the returned future tracks first-successful
    /// readiness.
    pub fn connect(&self) -> impl Future<Output = Result<(), Error>> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let early = self.deliver(Msg::Connect { ready: ready_tx });
        async move {
            early?;
            match ready_rx.await {
                Ok(result) => result,
                Err(_) => Err(client_gone()),
            }
        }
    }

    /// Drops the current connection (if any) and establishes a fresh one,
    /// optionally against a replacement endpoint.  The registry is carried
    /// over verbatim.
    pub fn reconnect(&self, endpoint: Option<Endpoint>) {
        let _ = self.deliver(Msg::Reconnect { endpoint });
    }

    /// Subscribes `callback` to a channel.  If the channel is already in
    /// the registry the callback is added with no wire traffic; otherwise
    /// the future resolves once the server has acknowledged the
    /// subscription.
    pub fn subscribe(
        &self,
        channel: impl Into<String>,
        mut callback: impl FnMut(&[u8]) + Send + 'static,
    ) -> impl Future<Output = Result<SubscriptionId, Error>> {
        let (done_tx, done_rx) = oneshot::channel();
        let early = self.deliver(Msg::Subscribe {
            channel: channel.into(),
            callback: Box::new(move |payload: &Vec<u8>| callback(payload)),
            done: done_tx,
        });
        async move {
            early?;
            match done_rx.await {
                Ok(result) => result,
                Err(_) => Err(client_gone()),
            }
        }
    }

    /// Subscribes `callback` to a pattern; the callback receives the
    /// concrete channel along with the payload.
    pub fn psubscribe(
        &self,
        pattern: impl Into<String>,
        mut callback: impl FnMut(&str, &[u8]) + Send + 'static,
    ) -> impl Future<Output = Result<SubscriptionId, Error>> {
        let (done_tx, done_rx) = oneshot::channel();
        let early = self.deliver(Msg::Psubscribe {
            pattern: pattern.into(),
            callback: Box::new(move |delivery: &(String, Vec<u8>)| {
                callback(&delivery.0, &delivery.1)
            }),
            done: done_tx,
        });
        async move {
            early?;
            match done_rx.await {
                Ok(result) => result,
                Err(_) => Err(client_gone()),
            }
        }
    }

    /// Drops every callback for a channel and unsubscribes it.  Resolves
    /// with the server's remaining subscription count, 0 when nothing was
    /// on the wire.
    pub fn unsubscribe(&self, channel: impl Into<String>) -> impl Future<Output = Result<i64, Error>> {
        let (done_tx, done_rx) = oneshot::channel();
        let early = self.deliver(Msg::Unsubscribe {
            channel: channel.into(),
            done: done_tx,
        });
        async move {
            early?;
            match done_rx.await {
                Ok(result) => result,
                Err(_) => Err(client_gone()),
            }
        }
    }

    /// Drops every callback for a pattern and unsubscribes it.
    pub fn punsubscribe(&self, pattern: impl Into<String>) -> impl Future<Output = Result<i64, Error>> {
        let (done_tx, done_rx) = oneshot::channel();
        let early = self.deliver(Msg::Punsubscribe {
            pattern: pattern.into(),
            done: done_tx,
        });
        async move {
            early?;
            match done_rx.await {
                Ok(result) => result,
                Err(_) => Err(client_gone()),
            }
        }
    }

    /// Removes the one callback identified by `id`.  Removing the last
    /// callback of a channel unsubscribes it from the server; removing an
    /// unknown callback fails.
    pub fn unsubscribe_id(
        &self,
        channel: impl Into<String>,
        id: SubscriptionId,
    ) -> impl Future<Output = Result<(), Error>> {
        let (done_tx, done_rx) = oneshot::channel();
        let early = self.deliver(Msg::UnsubscribeId {
            channel: channel.into(),
            id,
            done: done_tx,
        });
        async move {
            early?;
            match done_rx.await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(client_gone()),
            }
        }
    }

    /// Removes the one pattern callback identified by `id`.
    pub fn punsubscribe_id(
        &self,
        pattern: impl Into<String>,
        id: SubscriptionId,
    ) -> impl Future<Output = Result<(), Error>> {
        let (done_tx, done_rx) = oneshot::channel();
        let early = self.deliver(Msg::PunsubscribeId {
            pattern: pattern.into(),
            id,
            done: done_tx,
        });
        async move {
            early?;
            match done_rx.await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(client_gone()),
            }
        }
    }

    /// Registers a listener for a raw event by its stable name: the
    /// lifecycle names, `message`, `pmessage`, or one of the four
    /// acknowledgement names.
    pub fn on(
        &self,
        event: impl Into<String>,
        listener: impl FnMut(&PubsubEvent) + Send + 'static,
    ) -> impl Future<Output = Result<ListenerId, Error>> {
        let (id_tx, id_rx) = oneshot::channel();
        let early = self.deliver(Msg::On {
            event: event.into(),
            listener: Box::new(listener),
            id: id_tx,
        });
        async move {
            early?;
            id_rx.await.map_err(|_| client_gone())
        }
    }

    /// Removes one previously registered event listener.
    pub fn off(&self, event: impl Into<String>, id: ListenerId) {
        let _ = self.deliver(Msg::Off {
            event: event.into(),
            id,
        });
    }

    /// The current lifecycle state.
    pub fn state(&self) -> impl Future<Output = Result<LifecycleState, Error>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let early = self.deliver(Msg::State { reply: reply_tx });
        async move {
            early?;
            reply_rx.await.map_err(|_| client_gone())
        }
    }

    fn deliver(&self, msg: Msg) -> Result<(), Error> {
        self.msg_tx.unbounded_send(msg).map_err(|_| client_gone())
    }
}

/// One half of the subscription state: the registry bus, the subscriptions
/// awaiting their acknowledgement, and the unsubscribe waiters.  Channels
/// and patterns are each a `Side`, differing only in payload type and verbs.
struct Side<P> {
    registry: EventBus<P>,
    pending: HashMap<String, Vec<PendingSub<P>>>,
    unsub_waiters: HashMap<String, Vec<oneshot::Sender<Result<i64, Error>>>>,
    subscribe_kind: OpKind,
    unsubscribe_kind: OpKind,
}

struct PendingSub<P> {
    callback: Listener<P>,
    done: oneshot::Sender<Result<SubscriptionId, Error>>,
}

impl<P: 'static> Side<P> {
    fn new(subscribe_kind: OpKind, unsubscribe_kind: OpKind) -> Side<P> {
        Side {
            registry: EventBus::new(),
            pending: HashMap::new(),
            unsub_waiters: HashMap::new(),
            subscribe_kind,
            unsubscribe_kind,
        }
    }

    fn subscribe(
        &mut self,
        connection: Option<&PubsubConnection>,
        name: String,
        callback: Listener<P>,
        done: oneshot::Sender<Result<SubscriptionId, Error>>,
    ) {
        if self.registry.contains(&name) {
            // already subscribed on the wire; no traffic needed
            let id = self.registry.subscribe(name, callback);
            let _ = done.send(Ok(id));
            return;
        }
        if let Some(pending) = self.pending.get_mut(&name) {
            // a subscribe command is already in flight; share its ack
            pending.push(PendingSub { callback, done });
            return;
        }
        if let Some(connection) = connection {
            if connection
                .send(self.subscribe_kind, name.clone(), internal_ack())
                .is_ok()
            {
                self.pending.insert(name, vec![PendingSub { callback, done }]);
                return;
            }
        }
        // offline: the registry is ground truth, the wire subscription
        // follows when a connection comes up
        let id = self.registry.subscribe(name, callback);
        let _ = done.send(Ok(id));
    }

    fn unsubscribe_all(
        &mut self,
        connection: Option<&PubsubConnection>,
        name: String,
        done: oneshot::Sender<Result<i64, Error>>,
    ) {
        let had_callbacks = self.registry.clear(&name) > 0;
        let had_pending = match self.pending.remove(&name) {
            Some(pending) => {
                let withdrawn =
                    crate::error::internal("subscription withdrawn before acknowledgement");
                for entry in pending {
                    let _ = entry.done.send(Err(withdrawn.clone()));
                }
                true
            }
            None => false,
        };
        if had_callbacks || had_pending {
            if let Some(connection) = connection {
                if connection
                    .send(self.unsubscribe_kind, name.clone(), internal_ack())
                    .is_ok()
                {
                    self.unsub_waiters.entry(name).or_default().push(done);
                    return;
                }
            }
        }
        let _ = done.send(Ok(0));
    }

    fn unsubscribe_id(
        &mut self,
        connection: Option<&PubsubConnection>,
        name: String,
        id: SubscriptionId,
        done: oneshot::Sender<Result<i64, Error>>,
    ) {
        if !self.registry.unsubscribe(&name, id) {
            let _ = done.send(Err(Error::InvalidArgument(format!(
                "no such subscription on {}",
                name
            ))));
            return;
        }
        if self.registry.contains(&name) {
            // other callbacks remain; the wire subscription stays
            let _ = done.send(Ok(0));
            return;
        }
        if let Some(connection) = connection {
            if connection
                .send(self.unsubscribe_kind, name.clone(), internal_ack())
                .is_ok()
            {
                self.unsub_waiters.entry(name).or_default().push(done);
                return;
            }
        }
        let _ = done.send(Ok(0));
    }

    /// The server confirmed a subscription: move the pending callbacks into
    /// the registry and resolve their futures with the assigned ids.
    fn on_subscribe_ack(&mut self, name: &str) {
        if let Some(pending) = self.pending.remove(name) {
            for entry in pending {
                let id = self.registry.subscribe(name.to_owned(), entry.callback);
                let _ = entry.done.send(Ok(id));
            }
        }
    }

    fn on_unsubscribe_ack(&mut self, name: &str, count: i64) {
        if let Some(waiters) = self.unsub_waiters.remove(name) {
            for done in waiters {
                let _ = done.send(Ok(count));
            }
        }
    }

    fn dispatch(&mut self, name: &str, payload: &P) {
        self.registry.emit(name, payload);
    }

    /// Fails every in-flight waiter; acknowledged registry entries are kept
    /// (they survive reconnects), unacknowledged callbacks go with their
    /// failed futures.
    fn fail_in_flight(&mut self, error: &Error) {
        for (_, pending) in self.pending.drain() {
            for entry in pending {
                let _ = entry.done.send(Err(error.clone()));
            }
        }
        for (_, waiters) in self.unsub_waiters.drain() {
            for done in waiters {
                let _ = done.send(Err(error.clone()));
            }
        }
    }

    /// What a fresh connection must subscribe to for this side.
    fn snapshot(&self) -> impl Iterator<Item = (OpKind, String)> + '_ {
        self.registry
            .event_names()
            .map(|name| (self.subscribe_kind, name.to_owned()))
    }

    /// Brings the wire in line with the registry after a connection came up
    /// on a snapshot that may have gone stale while it was being built.
    fn reconcile(&mut self, connection: &PubsubConnection, snapshot: &[(OpKind, String)]) {
        let snapshotted: HashSet<&str> = snapshot
            .iter()
            .filter(|(kind, _)| *kind == self.subscribe_kind)
            .map(|(_, name)| name.as_str())
            .collect();
        for &name in &snapshotted {
            if !self.registry.contains(name) {
                let _ = connection.send(self.unsubscribe_kind, name.to_owned(), internal_ack());
            }
        }
        let missing: Vec<String> = self
            .registry
            .event_names()
            .filter(|name| !snapshotted.contains(name))
            .map(str::to_owned)
            .collect();
        for name in missing {
            let _ = connection.send(self.subscribe_kind, name, internal_ack());
        }
    }
}

/// An acknowledgement handle whose outcome nobody awaits; the client acts
/// on the acknowledgement event instead.
fn internal_ack() -> AckSender {
    let (ack, _) = oneshot::channel();
    ack
}

struct FactoryDone {
    generation: u64,
    result: Result<PubsubConnection, Error>,
}

struct PubsubTask {
    endpoint: Endpoint,
    supervisor: Supervisor,
    channels: Side<Vec<u8>>,
    patterns: Side<(String, Vec<u8>)>,
    bus: EventBus<PubsubEvent>,
    ready_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
    connection: Option<PubsubConnection>,
    /// What the most recent factory was asked to subscribe to.
    factory_snapshot: Vec<(OpKind, String)>,
    msg_rx: mpsc::UnboundedReceiver<Msg>,
    notice_tx: mpsc::UnboundedSender<PubsubNotice>,
    notice_rx: mpsc::UnboundedReceiver<PubsubNotice>,
    factory_tx: mpsc::UnboundedSender<FactoryDone>,
    factory_rx: mpsc::UnboundedReceiver<FactoryDone>,
}

enum Wake {
    Msg(Option<Msg>),
    Notice(PubsubNotice),
    Factory(FactoryDone),
    RetryDue,
}

impl PubsubTask {
    async fn run(mut self) {
        loop {
            let wake = {
                let retry_at = self.supervisor.retry_deadline();
                tokio::select! {
                    msg = self.msg_rx.next() => Wake::Msg(msg),
                    Some(notice) = self.notice_rx.next() => Wake::Notice(notice),
                    Some(done) = self.factory_rx.next() => Wake::Factory(done),
                    _ = retry_timer(retry_at) => Wake::RetryDue,
                }
            };
            match wake {
                Wake::Msg(Some(msg)) => self.handle_msg(msg),
                Wake::Msg(None) => {
                    self.shutdown();
                    return;
                }
                Wake::Notice(notice) => self.handle_notice(notice),
                Wake::Factory(done) => self.handle_factory(done),
                Wake::RetryDue => {
                    let directives = self.supervisor.retry_due();
                    self.apply(directives);
                }
            }
        }
    }

    fn wired(&self) -> Option<&PubsubConnection> {
        match self.supervisor.state() {
            LifecycleState::Connected => self.connection.as_ref(),
            _ => None,
        }
    }

    fn handle_msg(&mut self, msg: Msg) {
        match msg {
            Msg::Subscribe {
                channel,
                callback,
                done,
            } => {
                let connection = self.wired().cloned();
                self.channels
                    .subscribe(connection.as_ref(), channel, callback, done);
            }
            Msg::Psubscribe {
                pattern,
                callback,
                done,
            } => {
                let connection = self.wired().cloned();
                self.patterns
                    .subscribe(connection.as_ref(), pattern, callback, done);
            }
            Msg::Unsubscribe { channel, done } => {
                let connection = self.wired().cloned();
                self.channels
                    .unsubscribe_all(connection.as_ref(), channel, done);
            }
            Msg::Punsubscribe { pattern, done } => {
                let connection = self.wired().cloned();
                self.patterns
                    .unsubscribe_all(connection.as_ref(), pattern, done);
            }
            Msg::UnsubscribeId { channel, id, done } => {
                let connection = self.wired().cloned();
                self.channels
                    .unsubscribe_id(connection.as_ref(), channel, id, done);
            }
            Msg::PunsubscribeId { pattern, id, done } => {
                let connection = self.wired().cloned();
                self.patterns
                    .unsubscribe_id(connection.as_ref(), pattern, id, done);
            }
            Msg::Connect { ready } => match self.supervisor.state() {
                LifecycleState::Connected => {
                    let _ = ready.send(Ok(()));
                }
                LifecycleState::Initial | LifecycleState::Failed => {
                    self.ready_waiters.push(ready);
                    let directives = self.supervisor.connect();
                    self.apply(directives);
                }
                LifecycleState::Connecting | LifecycleState::Disconnected => {
                    self.ready_waiters.push(ready);
                }
            },
            Msg::Reconnect { endpoint } => {
                if let Some(endpoint) = endpoint {
                    self.supervisor
                        .set_policy(endpoint.reconnect_interval, endpoint.retry_budget);
                    self.endpoint = endpoint;
                }
                let directives = self.supervisor.reconnect();
                self.apply(directives);
            }
            Msg::On {
                event,
                listener,
                id,
            } => {
                let listener_id = self.bus.subscribe(event, listener);
                let _ = id.send(listener_id);
            }
            Msg::Off { event, id } => {
                self.bus.unsubscribe(&event, id);
            }
            Msg::State { reply } => {
                let _ = reply.send(self.supervisor.state());
            }
        }
    }

    fn handle_notice(&mut self, notice: PubsubNotice) {
        match notice {
            PubsubNotice::Message { channel, payload } => {
                self.channels.dispatch(&channel, &payload);
                self.emit(PubsubEvent::Message { channel, payload });
            }
            PubsubNotice::Pmessage {
                pattern,
                channel,
                payload,
            } => {
                let delivery = (channel, payload);
                self.patterns.dispatch(&pattern, &delivery);
                let (channel, payload) = delivery;
                self.emit(PubsubEvent::Pmessage {
                    pattern,
                    channel,
                    payload,
                });
            }
            PubsubNotice::Ack { kind, name, count } => match kind {
                OpKind::Subscribe => {
                    self.channels.on_subscribe_ack(&name);
                    self.emit(PubsubEvent::Subscribe {
                        channel: name,
                        count,
                    });
                }
                OpKind::Unsubscribe => {
                    self.channels.on_unsubscribe_ack(&name, count);
                    self.emit(PubsubEvent::Unsubscribe {
                        channel: name,
                        count,
                    });
                }
                OpKind::Psubscribe => {
                    self.patterns.on_subscribe_ack(&name);
                    self.emit(PubsubEvent::Psubscribe {
                        pattern: name,
                        count,
                    });
                }
                OpKind::Punsubscribe => {
                    self.patterns.on_unsubscribe_ack(&name, count);
                    self.emit(PubsubEvent::Punsubscribe {
                        pattern: name,
                        count,
                    });
                }
            },
            PubsubNotice::Closed { generation, reason } => {
                if !self.supervisor.is_current(generation) {
                    return;
                }
                if reason.is_desync() {
                    log::error!("pub/sub connection lost: {}", reason);
                } else {
                    log::debug!("pub/sub connection lost: {}", reason);
                }
                self.connection = None;
                // in-flight waiters fail before the disconnect is announced
                let lost = Error::Connection(ConnectionReason::ConnectionDropped);
                self.channels.fail_in_flight(&lost);
                self.patterns.fail_in_flight(&lost);
                let directives = self.supervisor.connection_lost(generation);
                self.apply(directives);
            }
        }
    }

    fn handle_factory(&mut self, done: FactoryDone) {
        if !self.supervisor.is_current(done.generation) {
            if let Ok(connection) = done.result {
                connection.close();
            }
            return;
        }
        match done.result {
            Ok(connection) => {
                self.connection = Some(connection);
                let directives = self.supervisor.factory_succeeded(done.generation);
                self.apply(directives);
            }
            // the factory already logged the cause when it wrapped the error
            Err(_) => {
                let directives = self.supervisor.factory_failed(done.generation);
                self.apply(directives);
            }
        }
    }

    fn apply(&mut self, directives: Result<Vec<Directive>, Error>) {
        match directives {
            Ok(directives) => {
                for directive in directives {
                    self.run_directive(directive);
                }
            }
            Err(e) => log::error!("lifecycle fault: {}", e),
        }
    }

    fn run_directive(&mut self, directive: Directive) {
        match directive {
            Directive::StartFactory { generation } => {
                let snapshot: Vec<(OpKind, String)> = self
                    .channels
                    .snapshot()
                    .chain(self.patterns.snapshot())
                    .collect();
                self.factory_snapshot = snapshot.clone();
                let endpoint = self.endpoint.clone();
                let notice_tx = self.notice_tx.clone();
                let factory_tx = self.factory_tx.clone();
                tokio::spawn(async move {
                    let result = build_connection(&endpoint, generation, snapshot, notice_tx)
                        .await
                        .map_err(|e| {
                            log::warn!("pub/sub connection attempt failed: {}", e);
                            Error::Connection(ConnectionReason::ConnectionFailed)
                        });
                    let _ = factory_tx.unbounded_send(FactoryDone { generation, result });
                });
            }
            Directive::CloseConnection => {
                if let Some(connection) = &self.connection {
                    connection.close();
                }
            }
            Directive::Emit(event) => self.emit(PubsubEvent::lifecycle(event)),
            Directive::EnteredConnected => {
                for ready in self.ready_waiters.drain(..) {
                    let _ = ready.send(Ok(()));
                }
                // the registry may have moved while the factory ran
                if let Some(connection) = self.connection.clone() {
                    self.channels.reconcile(&connection, &self.factory_snapshot);
                    self.patterns.reconcile(&connection, &self.factory_snapshot);
                }
            }
            Directive::EnteredFailed => {
                let failed = Error::Connection(ConnectionReason::InFailedState);
                for ready in self.ready_waiters.drain(..) {
                    let _ = ready.send(Err(failed.clone()));
                }
                self.channels.fail_in_flight(&failed);
                self.patterns.fail_in_flight(&failed);
                self.connection = None;
            }
        }
    }

    fn emit(&mut self, event: PubsubEvent) {
        log::debug!("event: {:?}", event);
        self.bus.emit(event.name(), &event);
    }

    fn shutdown(mut self) {
        if let Some(connection) = &self.connection {
            connection.close();
        }
        // in-flight subscription work dies with its connection; readiness
        // waiters were never tied to one
        let lost = Error::Connection(ConnectionReason::ConnectionDropped);
        self.channels.fail_in_flight(&lost);
        self.patterns.fail_in_flight(&lost);
        let gone = Error::Connection(ConnectionReason::NotConnected);
        for ready in self.ready_waiters.drain(..) {
            let _ = ready.send(Err(gone.clone()));
        }
    }
}

/// The pub/sub connection factory: open the socket, authenticate, and hand
/// the stream to a worker that immediately replays the registry snapshot.
async fn build_connection(
    endpoint: &Endpoint,
    generation: u64,
    resubscribe: Vec<(OpKind, String)>,
    notice_tx: mpsc::UnboundedSender<PubsubNotice>,
) -> Result<PubsubConnection, Error> {
    let mut connection = connect::connect(endpoint).await?;
    if let Some(password) = endpoint.password.as_deref() {
        connect::exchange(&mut connection, resp_array!["auth", password]).await?;
    }
    Ok(PubsubConnection::start(
        connection,
        generation,
        endpoint.inactivity,
        resubscribe,
        notice_tx,
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use crate::error::{ConnectionReason, Error};
    use crate::protocol::RespValue;

    use super::super::testserver::{ServerSession, TestServer};
    use super::{PubsubClient, PubsubEvent};

    type Log = Arc<Mutex<Vec<String>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn recorder(log: &Log) -> impl FnMut(&[u8]) + Send + 'static {
        let log = log.clone();
        move |payload| {
            log.lock()
                .unwrap()
                .push(String::from_utf8_lossy(payload).into_owned())
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            loop {
                if check() {
                    return;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never met");
    }

    async fn connected_client(server: &mut TestServer) -> (PubsubClient, ServerSession) {
        let (client, session) =
            tokio::join!(PubsubClient::connect_to(server.endpoint()), server.accept());
        (client.expect("connected"), session)
    }

    #[tokio::test]
    async fn subscribe_confirms_and_delivers() {
        let mut server = TestServer::start().await;
        let (client, mut session) = connected_client(&mut server).await;
        let seen = log();

        let subscribed = client.subscribe("events", recorder(&seen));
        session.expect(&["subscribe", "events"]).await;
        session.ack("subscribe", "events", 1).await;
        subscribed.await.expect("subscription confirmed");

        session.publish("events", "hello").await;
        wait_until(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(*seen.lock().unwrap(), vec!["hello"]);
    }

    #[tokio::test]
    async fn second_subscription_to_a_channel_stays_off_the_wire() {
        let mut server = TestServer::start().await;
        let (client, mut session) = connected_client(&mut server).await;
        let (first, second) = (log(), log());

        let subscribed = client.subscribe("events", recorder(&first));
        session.expect(&["subscribe", "events"]).await;
        session.ack("subscribe", "events", 1).await;
        subscribed.await.unwrap();

        // resolves with no traffic; the next frame the server sees is the
        // barrier subscription below
        client.subscribe("events", recorder(&second)).await.unwrap();

        let barrier = client.subscribe("barrier", recorder(&log()));
        session.expect(&["subscribe", "barrier"]).await;
        session.ack("subscribe", "barrier", 2).await;
        barrier.await.unwrap();

        session.publish("events", "x").await;
        wait_until(|| second.lock().unwrap().len() == 1).await;
        assert_eq!(*first.lock().unwrap(), vec!["x"]);
    }

    #[tokio::test]
    async fn selective_removal_then_last_callback_unsubscribes() {
        let mut server = TestServer::start().await;
        let (client, mut session) = connected_client(&mut server).await;
        let (a_seen, b_seen) = (log(), log());

        let subscribed = client.subscribe("c", recorder(&a_seen));
        session.expect(&["subscribe", "c"]).await;
        session.ack("subscribe", "c", 1).await;
        let a = subscribed.await.unwrap();
        let b = client.subscribe("c", recorder(&b_seen)).await.unwrap();

        // removing one of two callbacks is a local affair
        client.unsubscribe_id("c", a).await.unwrap();

        session.publish("c", "for-b").await;
        wait_until(|| b_seen.lock().unwrap().len() == 1).await;
        assert!(a_seen.lock().unwrap().is_empty());

        // removing the last callback goes to the server
        let removed = client.unsubscribe_id("c", b);
        session.expect(&["unsubscribe", "c"]).await;
        session.ack("unsubscribe", "c", 0).await;
        removed.await.unwrap();

        // further publishes land nowhere
        session.publish("c", "ignored").await;
        let barrier = client.subscribe("barrier", recorder(&log()));
        session.expect(&["subscribe", "barrier"]).await;
        session.ack("subscribe", "barrier", 1).await;
        barrier.await.unwrap();
        assert!(a_seen.lock().unwrap().is_empty());
        assert_eq!(*b_seen.lock().unwrap(), vec!["for-b"]);
    }

    #[tokio::test]
    async fn removing_an_unknown_callback_fails() {
        let mut server = TestServer::start().await;
        let (client, mut session) = connected_client(&mut server).await;

        let subscribed = client.subscribe("c", recorder(&log()));
        session.expect(&["subscribe", "c"]).await;
        session.ack("subscribe", "c", 1).await;
        subscribed.await.unwrap();

        let other = client.subscribe("d", recorder(&log()));
        session.expect(&["subscribe", "d"]).await;
        session.ack("subscribe", "d", 2).await;
        let foreign_id = other.await.unwrap();

        match client.unsubscribe_id("c", foreign_id).await {
            Err(Error::InvalidArgument(_)) => (),
            other => panic!("expected an invalid-argument error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unsubscribe_all_resolves_with_the_server_count() {
        let mut server = TestServer::start().await;
        let (client, mut session) = connected_client(&mut server).await;

        let subscribed = client.subscribe("one", recorder(&log()));
        session.expect(&["subscribe", "one"]).await;
        session.ack("subscribe", "one", 1).await;
        subscribed.await.unwrap();

        let subscribed = client.subscribe("two", recorder(&log()));
        session.expect(&["subscribe", "two"]).await;
        session.ack("subscribe", "two", 2).await;
        subscribed.await.unwrap();

        let removed = client.unsubscribe("one");
        session.expect(&["unsubscribe", "one"]).await;
        session.ack("unsubscribe", "one", 1).await;
        assert_eq!(removed.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn patterns_deliver_channel_and_payload() {
        let mut server = TestServer::start().await;
        let (client, mut session) = connected_client(&mut server).await;
        let seen = log();

        let sink = seen.clone();
        let subscribed = client.psubscribe("news.*", move |channel, payload| {
            sink.lock().unwrap().push(format!(
                "{}:{}",
                channel,
                String::from_utf8_lossy(payload)
            ))
        });
        session.expect(&["psubscribe", "news.*"]).await;
        session.ack("psubscribe", "news.*", 1).await;
        subscribed.await.unwrap();

        session.ppublish("news.*", "news.uk", "rain").await;
        wait_until(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(*seen.lock().unwrap(), vec!["news.uk:rain"]);
    }

    #[tokio::test]
    async fn raw_events_mirror_messages_and_acknowledgements() {
        let mut server = TestServer::start().await;
        let (client, mut session) = connected_client(&mut server).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        for name in ["subscribe", "message", "unsubscribe"] {
            let sink = events.clone();
            client
                .on(name, move |event: &PubsubEvent| {
                    sink.lock().unwrap().push(event.clone())
                })
                .await
                .unwrap();
        }

        let subscribed = client.subscribe("c", recorder(&log()));
        session.expect(&["subscribe", "c"]).await;
        session.ack("subscribe", "c", 1).await;
        subscribed.await.unwrap();

        session.publish("c", "payload").await;

        let removed = client.unsubscribe("c");
        session.expect(&["unsubscribe", "c"]).await;
        session.ack("unsubscribe", "c", 0).await;
        removed.await.unwrap();

        wait_until(|| events.lock().unwrap().len() == 3).await;
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                PubsubEvent::Subscribe {
                    channel: "c".to_owned(),
                    count: 1
                },
                PubsubEvent::Message {
                    channel: "c".to_owned(),
                    payload: b"payload".to_vec()
                },
                PubsubEvent::Unsubscribe {
                    channel: "c".to_owned(),
                    count: 0
                },
            ]
        );
    }

    #[tokio::test]
    async fn the_registry_is_replayed_onto_a_fresh_connection() {
        let mut server = TestServer::start().await;
        let (client, mut session) = connected_client(&mut server).await;
        let (one, two) = (log(), log());

        let subscribed = client.subscribe("c1", recorder(&one));
        session.expect(&["subscribe", "c1"]).await;
        session.ack("subscribe", "c1", 1).await;
        subscribed.await.unwrap();

        let subscribed = client.subscribe("c2", recorder(&two));
        session.expect(&["subscribe", "c2"]).await;
        session.ack("subscribe", "c2", 2).await;
        subscribed.await.unwrap();

        drop(session);

        // the replacement connection resubscribes both, in no fixed order
        let mut session = server.accept().await;
        let mut replayed = Vec::new();
        for count in 1..=2 {
            match session.recv().await {
                RespValue::Array(items) => {
                    assert_eq!(items[0], RespValue::BulkString(b"subscribe".to_vec()));
                    let RespValue::BulkString(name) = &items[1] else {
                        panic!("no channel name");
                    };
                    let name = String::from_utf8_lossy(name).into_owned();
                    session.ack("subscribe", &name, count).await;
                    replayed.push(name);
                }
                other => panic!("expected a subscribe command: {:?}", other),
            }
        }
        replayed.sort();
        assert_eq!(replayed, vec!["c1", "c2"]);

        session.publish("c1", "after").await;
        session.publish("c2", "after").await;
        wait_until(|| one.lock().unwrap().len() == 1 && two.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn offline_subscriptions_go_on_the_wire_at_connect() {
        let mut server = TestServer::start().await;
        let client = PubsubClient::new(server.endpoint());
        let seen = log();

        // no connection yet: registered locally, resolved immediately
        client.subscribe("early", recorder(&seen)).await.unwrap();

        let ready = client.connect();
        let mut session = server.accept().await;
        session.expect(&["subscribe", "early"]).await;
        session.ack("subscribe", "early", 1).await;
        ready.await.unwrap();

        session.publish("early", "hi").await;
        wait_until(|| seen.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn an_unacknowledged_subscription_fails_on_disconnect_and_is_not_replayed() {
        let mut server = TestServer::start().await;
        let (client, mut session) = connected_client(&mut server).await;

        let subscribed = client.subscribe("doomed", recorder(&log()));
        session.expect(&["subscribe", "doomed"]).await;
        drop(session);

        match subscribed.await {
            Err(Error::Connection(ConnectionReason::ConnectionDropped)) => (),
            other => panic!("expected a dropped-connection error: {:?}", other),
        }

        // the replacement connection has nothing to replay; the first frame
        // it sees is the barrier subscription
        let mut session = server.accept().await;
        let barrier = client.subscribe("barrier", recorder(&log()));
        session.expect(&["subscribe", "barrier"]).await;
        session.ack("subscribe", "barrier", 1).await;
        barrier.await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribing_while_offline_resolves_locally() {
        let mut server = TestServer::start().await;
        let client = PubsubClient::new(server.endpoint());

        client.subscribe("c", recorder(&log())).await.unwrap();
        assert_eq!(client.unsubscribe("c").await.unwrap(), 0);

        // nothing is replayed for the removed channel
        let ready = client.connect();
        let mut session = server.accept().await;
        let barrier = client.subscribe("barrier", recorder(&log()));
        session.expect(&["subscribe", "barrier"]).await;
        session.ack("subscribe", "barrier", 1).await;
        ready.await.unwrap();
        barrier.await.unwrap();
    }

    #[tokio::test]
    async fn acknowledged_probe_touches_surface_as_ordinary_events() {
        let mut server = TestServer::start().await;
        let endpoint = server
            .endpoint()
            .inactivity_check(Duration::from_millis(200), Duration::from_millis(500));
        let (client, session) =
            tokio::join!(PubsubClient::connect_to(endpoint), server.accept());
        let client = client.expect("connected");
        let mut session = session;

        let events = Arc::new(Mutex::new(Vec::new()));
        for name in ["subscribe", "unsubscribe"] {
            let sink = events.clone();
            client
                .on(name, move |event: &PubsubEvent| {
                    sink.lock().unwrap().push(event.clone())
                })
                .await
                .unwrap();
        }

        session.expect(&["subscribe", "__steward-ping"]).await;
        session.expect(&["unsubscribe", "__steward-ping"]).await;
        session.ack("subscribe", "__steward-ping", 1).await;
        session.ack("unsubscribe", "__steward-ping", 0).await;

        // acknowledgements are emitted for every name, the reserved probe
        // channel included
        wait_until(|| events.lock().unwrap().len() == 2).await;
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                PubsubEvent::Subscribe {
                    channel: "__steward-ping".to_owned(),
                    count: 1
                },
                PubsubEvent::Unsubscribe {
                    channel: "__steward-ping".to_owned(),
                    count: 0
                },
            ]
        );
    }

    #[tokio::test]
    async fn the_probe_touches_the_reserved_channel_and_expires_unanswered() {
        let mut server = TestServer::start().await;
        let endpoint = server
            .endpoint()
            .inactivity_check(Duration::from_millis(200), Duration::from_millis(150));
        let (client, session) =
            tokio::join!(PubsubClient::connect_to(endpoint), server.accept());
        let _client = client.expect("connected");
        let mut session = session;

        session.expect(&["subscribe", "__steward-ping"]).await;
        session.expect(&["unsubscribe", "__steward-ping"]).await;

        // never acknowledged: the probe expires and the client reconnects
        assert!(session.recv_eof().await);
        let mut session = server.accept().await;
        session.expect(&["subscribe", "__steward-ping"]).await;
    }
}
