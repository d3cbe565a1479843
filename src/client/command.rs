/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The request/response client persona.
//!
//! A `CommandClient` is a cheap handle onto an actor task that owns all
//! client state: the lifecycle supervisor, the queue of commands issued
//! while no connection is up, and the user event listeners.  Commands are
//! enqueued the moment they are issued; the returned future only observes
//! the outcome.  Commands therefore reach the server in issue order whether
//! or not their futures are awaited, and pipelining comes for free.
//!
//! Every new connection runs `auth` (when a password is set) and `select`
//! (when the database index is non-zero) before anything else, then drains
//! the queue in FIFO order.

use std::collections::VecDeque;
use std::future::Future;

use futures_channel::{mpsc, oneshot};
use futures_util::StreamExt;

use crate::error::{ConnectionReason, Error};
use crate::event::{EventBus, ListenerId};
use crate::protocol::{FromResp, RespValue};

use super::connect;
use super::endpoint::{Endpoint, MAX_DB_INDEX};
use super::request::{ConnectionNotice, RequestConnection};
use super::supervisor::{ClientEvent, Directive, LifecycleState, Supervisor};
use super::{client_gone, retry_timer, ReplySender};

/// The request/response client.  Cloning is cheap; clones address the same
/// underlying connection and queue.
#[derive(Clone)]
pub struct CommandClient {
    msg_tx: mpsc::UnboundedSender<Msg>,
}

enum Msg {
    Send {
        command: RespValue,
        reply: ReplySender,
    },
    Connect {
        ready: oneshot::Sender<Result<(), Error>>,
    },
    Reconnect {
        endpoint: Option<Endpoint>,
    },
    Auth {
        password: String,
        reply: ReplySender,
    },
    Select {
        db: u8,
        reply: ReplySender,
    },
    On {
        event: String,
        listener: Box<dyn FnMut(&ClientEvent) + Send>,
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

impl CommandClient {
    /// Creates a client for `endpoint` without connecting; commands issued
    /// now are queued until [`connect`](Self::connect) is called and
    /// succeeds.
    pub fn new(endpoint: Endpoint) -> CommandClient {
        let (msg_tx, msg_rx) = mpsc::unbounded();
        let (notice_tx, notice_rx) = mpsc::unbounded();
        let (factory_tx, factory_rx) = mpsc::unbounded();
        let supervisor = Supervisor::new(endpoint.reconnect_interval, endpoint.retry_budget);
        let task = ClientTask {
            endpoint,
            supervisor,
            queue: VecDeque::new(),
            bus: EventBus::new(),
            ready_waiters: Vec::new(),
            connection: None,
            msg_rx,
            notice_tx,
            notice_rx,
            factory_tx,
            factory_rx,
        };
        tokio::spawn(task.run());
        CommandClient { msg_tx }
    }

    /// Creates a client and resolves once the first connection is ready.
    pub async fn connect_to(endpoint: Endpoint) -> Result<CommandClient, Error> {
        let client = CommandClient::new(endpoint);
        client.connect().await?;
        Ok(client)
    }

    /// Starts connecting; the returned future tracks first-successful
    /// readiness.  It fails if the retry budget runs out first.
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
    /// optionally against a replacement endpoint.  Also the way out of the
    /// failed state.
    pub fn reconnect(&self, endpoint: Option<Endpoint>) {
        let _ = self.deliver(Msg::Reconnect { endpoint });
    }

    /// Sends a single command, given as a RESP array (see [`resp_array!`]).
    ///
    /// The command is enqueued synchronously; the future resolves with the
    /// reply converted to `T`.  Issue order is send order.
    pub fn send<T: FromResp>(&self, command: RespValue) -> impl Future<Output = Result<T, Error>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let early = self.deliver(Msg::Send {
            command,
            reply: reply_tx,
        });
        async move {
            early?;
            match reply_rx.await {
                Ok(result) => T::from_resp_int(result?),
                Err(_) => Err(client_gone()),
            }
        }
    }

    /// Fire-and-forget [`send`](Self::send); any reply or failure is
    /// discarded.
    pub fn send_and_forget(&self, command: RespValue) {
        let (reply_tx, _) = oneshot::channel();
        let _ = self.deliver(Msg::Send {
            command,
            reply: reply_tx,
        });
    }

    /// Generic dispatch: any verb, any arguments.  The verb and arguments
    /// are passed through untouched.
    pub fn call<T, A>(&self, verb: &str, args: A) -> impl Future<Output = Result<T, Error>>
    where
        T: FromResp,
        A: IntoIterator,
        A::Item: Into<RespValue>,
    {
        let mut command = vec![RespValue::from(verb)];
        command.extend(args.into_iter().map(Into::into));
        self.send(RespValue::Array(command))
    }

    /// Authenticates, and remembers the password so every future
    /// reconnection authenticates too.
    pub fn auth(&self, password: impl Into<String>) -> impl Future<Output = Result<(), Error>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let early = self.deliver(Msg::Auth {
            password: password.into(),
            reply: reply_tx,
        });
        async move {
            early?;
            match reply_rx.await {
                Ok(result) => <()>::from_resp_int(result?),
                Err(_) => Err(client_gone()),
            }
        }
    }

    /// Selects a database, and remembers the index so every future
    /// reconnection selects it again.
    pub fn select(&self, db: u8) -> impl Future<Output = Result<(), Error>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let early = if db > MAX_DB_INDEX {
            Err(Error::InvalidArgument(format!(
                "database index out of range: {}",
                db
            )))
        } else {
            self.deliver(Msg::Select { db, reply: reply_tx })
        };
        async move {
            early?;
            match reply_rx.await {
                Ok(result) => <()>::from_resp_int(result?),
                Err(_) => Err(client_gone()),
            }
        }
    }

    /// Registers a listener for a lifecycle event by its stable name:
    /// `connected`, `reconnected`, `disconnected`, `reconnect_failed` or
    /// `failed`.
    pub fn on(
        &self,
        event: impl Into<String>,
        listener: impl FnMut(&ClientEvent) + Send + 'static,
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

    /// Removes one previously registered listener.
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

struct FactoryDone {
    generation: u64,
    result: Result<RequestConnection, Error>,
}

struct ClientTask {
    endpoint: Endpoint,
    supervisor: Supervisor,
    queue: VecDeque<(RespValue, ReplySender)>,
    bus: EventBus<ClientEvent>,
    ready_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
    connection: Option<RequestConnection>,
    msg_rx: mpsc::UnboundedReceiver<Msg>,
    notice_tx: mpsc::UnboundedSender<ConnectionNotice>,
    notice_rx: mpsc::UnboundedReceiver<ConnectionNotice>,
    factory_tx: mpsc::UnboundedSender<FactoryDone>,
    factory_rx: mpsc::UnboundedReceiver<FactoryDone>,
}

enum Wake {
    Msg(Option<Msg>),
    Notice(ConnectionNotice),
    Factory(FactoryDone),
    RetryDue,
}

impl ClientTask {
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

    fn handle_msg(&mut self, msg: Msg) {
        match msg {
            Msg::Send { command, reply } => self.process(command, reply),
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
            Msg::Auth { password, reply } => {
                self.endpoint.password = Some(password.clone());
                self.process(resp_array!["auth", password], reply);
            }
            Msg::Select { db, reply } => {
                self.endpoint.db = db;
                self.process(resp_array!["select", db.to_string()], reply);
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

    fn process(&mut self, command: RespValue, reply: ReplySender) {
        match self.supervisor.state() {
            LifecycleState::Failed => {
                let _ = reply.send(Err(Error::Connection(ConnectionReason::InFailedState)));
            }
            LifecycleState::Connected => match &self.connection {
                Some(connection) => {
                    if let Err((command, reply)) = connection.send(command, reply) {
                        // the worker is gone but its notice has not landed
                        // yet; queue for the replacement connection
                        self.queue.push_back((command, reply));
                    }
                }
                None => self.queue.push_back((command, reply)),
            },
            _ => self.queue.push_back((command, reply)),
        }
    }

    fn handle_factory(&mut self, done: FactoryDone) {
        if !self.supervisor.is_current(done.generation) {
            // a condemned attempt; close the socket it may have opened
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

    fn handle_notice(&mut self, notice: ConnectionNotice) {
        if !self.supervisor.is_current(notice.generation) {
            return;
        }
        if notice.reason.is_desync() {
            log::error!("connection lost: {}", notice.reason);
        } else {
            log::debug!("connection lost: {}", notice.reason);
        }
        self.connection = None;
        let directives = self.supervisor.connection_lost(notice.generation);
        self.apply(directives);
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
                let endpoint = self.endpoint.clone();
                let notice_tx = self.notice_tx.clone();
                let factory_tx = self.factory_tx.clone();
                tokio::spawn(async move {
                    let result = build_connection(&endpoint, generation, notice_tx)
                        .await
                        .map_err(|e| {
                            log::warn!("connection attempt failed: {}", e);
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
            Directive::Emit(event) => {
                log::debug!("event: {:?}", event);
                self.bus.emit(event.name(), &event);
            }
            Directive::EnteredConnected => {
                for ready in self.ready_waiters.drain(..) {
                    let _ = ready.send(Ok(()));
                }
                self.drain_queue();
            }
            Directive::EnteredFailed => {
                let failed = Error::Connection(ConnectionReason::InFailedState);
                for (_, reply) in self.queue.drain(..) {
                    let _ = reply.send(Err(failed.clone()));
                }
                for ready in self.ready_waiters.drain(..) {
                    let _ = ready.send(Err(failed.clone()));
                }
                self.connection = None;
            }
        }
    }

    fn drain_queue(&mut self) {
        let Some(connection) = self.connection.clone() else {
            return;
        };
        while let Some((command, reply)) = self.queue.pop_front() {
            if let Err((command, reply)) = connection.send(command, reply) {
                self.queue.push_front((command, reply));
                break;
            }
        }
    }

    fn shutdown(mut self) {
        if let Some(connection) = &self.connection {
            connection.close();
        }
        // queued work never reached a connection, and now never will
        let gone = Error::Connection(ConnectionReason::NotConnected);
        for (_, reply) in self.queue.drain(..) {
            let _ = reply.send(Err(gone.clone()));
        }
        for ready in self.ready_waiters.drain(..) {
            let _ = ready.send(Err(gone.clone()));
        }
    }
}

/// The connection factory: open the socket, authenticate, select the
/// database, and only then hand the stream to a worker.  Failing any step
/// closes the socket and fails the attempt.
async fn build_connection(
    endpoint: &Endpoint,
    generation: u64,
    notice_tx: mpsc::UnboundedSender<ConnectionNotice>,
) -> Result<RequestConnection, Error> {
    let mut connection = connect::connect(endpoint).await?;
    if let Some(password) = endpoint.password.as_deref() {
        connect::exchange(&mut connection, resp_array!["auth", password]).await?;
    }
    if endpoint.db != 0 {
        connect::exchange(
            &mut connection,
            resp_array!["select", endpoint.db.to_string()],
        )
        .await?;
    }
    Ok(RequestConnection::start(
        connection,
        generation,
        endpoint.inactivity,
        notice_tx,
    ))
}
