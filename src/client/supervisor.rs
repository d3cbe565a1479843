/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The connection lifecycle supervisor.
//!
//! The supervisor is a synchronous transition core: the owning client actor
//! feeds it what happened (a connect request, a factory outcome, a lost
//! connection, a due retry) and interprets the returned [`Directive`]s,
//! e.g. spawning a factory or emitting an event to user listeners.
//! Keeping the core free of I/O makes the retry and event-ordering rules
//! testable without sockets or sleeps.
//!
//! Connections and factory attempts are tagged with a generation number;
//! results arriving for a superseded generation are discarded, so a
//! condemned connection cannot disturb its replacement.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::Error;
use crate::state::StateMachine;

/// Where a client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Never asked to connect
    Initial,
    /// A connection attempt is in flight
    Connecting,
    /// A connection is established and serving commands
    Connected,
    /// No connection; a retry is scheduled or running
    Disconnected,
    /// The retry budget is exhausted; only `reconnect` leaves this state
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LifecycleState::Initial => "initial",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Connected => "connected",
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

use LifecycleState::*;

const TRANSITIONS: [(LifecycleState, LifecycleState); 7] = [
    (Initial, Connecting),
    (Connecting, Connected),
    (Connecting, Disconnected),
    (Connected, Disconnected),
    (Disconnected, Connecting),
    (Disconnected, Failed),
    (Failed, Connecting),
];

/// Lifecycle events surfaced to listeners of either client persona.  The
/// names are stable strings, usable as `on(..)` event keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A connection is up; setup commands have run
    Connected,
    /// The connection that just came up replaces one that was lost
    Reconnected,
    /// An established connection was lost
    Disconnected,
    /// A connection attempt failed; carries the attempt number
    ReconnectFailed(u32),
    /// The retry budget is exhausted
    Failed,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Connected => "connected",
            ClientEvent::Reconnected => "reconnected",
            ClientEvent::Disconnected => "disconnected",
            ClientEvent::ReconnectFailed(_) => "reconnect_failed",
            ClientEvent::Failed => "failed",
        }
    }
}

/// What the owning client actor must do after feeding the supervisor.
/// Directives are interpreted in order.
#[derive(Debug)]
pub(crate) enum Directive {
    /// Spawn the connection factory for the given generation
    StartFactory { generation: u64 },
    /// Ask the current connection to close; a lost-connection notice will
    /// follow through the normal path
    CloseConnection,
    /// Fire the event to user listeners
    Emit(ClientEvent),
    /// Resolve connect waiters and hand queued work to the connection
    EnteredConnected,
    /// Fail queued work and connect waiters; no retry is scheduled
    EnteredFailed,
}

pub(crate) struct Supervisor {
    machine: StateMachine<LifecycleState>,
    reconnect_interval: Duration,
    retry_budget: u32,
    attempts: u32,
    recovering: bool,
    generation: u64,
    retry_at: Option<Instant>,
}

impl Supervisor {
    pub(crate) fn new(reconnect_interval: Duration, retry_budget: u32) -> Self {
        let machine = StateMachine::new(Initial, TRANSITIONS)
            .expect("lifecycle transition table is well-formed");
        Supervisor {
            machine,
            reconnect_interval,
            retry_budget,
            attempts: 0,
            recovering: false,
            generation: 0,
            retry_at: None,
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.machine.current()
    }

    /// Adopts the retry policy of a replacement endpoint; takes effect from
    /// the next scheduling decision.
    pub(crate) fn set_policy(&mut self, reconnect_interval: Duration, retry_budget: u32) {
        self.reconnect_interval = reconnect_interval;
        self.retry_budget = retry_budget;
    }

    /// The deadline of the scheduled retry, if one is pending.
    pub(crate) fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Starts connecting.  Legal only from `Initial` and `Failed`; the
    /// client resolves or parks connect requests in every other state.
    pub(crate) fn connect(&mut self) -> Result<Vec<Directive>, Error> {
        match self.state() {
            Initial | Failed => {
                self.attempts = 0;
                self.enter_connecting()
            }
            other => Err(crate::error::internal(format!(
                "connect is not legal from state {}",
                other
            ))),
        }
    }

    /// Forces a fresh connection, whatever the current state.
    pub(crate) fn reconnect(&mut self) -> Result<Vec<Directive>, Error> {
        match self.state() {
            Initial | Failed => {
                self.attempts = 0;
                self.enter_connecting()
            }
            Disconnected => self.enter_connecting(),
            Connecting => {
                // condemn the in-flight attempt, start another
                self.generation += 1;
                self.retry_at = None;
                Ok(vec![Directive::StartFactory {
                    generation: self.generation,
                }])
            }
            Connected => Ok(vec![Directive::CloseConnection]),
        }
    }

    pub(crate) fn factory_succeeded(&mut self, generation: u64) -> Result<Vec<Directive>, Error> {
        if !self.is_current(generation) {
            return Ok(Vec::new());
        }
        self.machine.update(Connected)?;
        let mut directives = vec![Directive::Emit(ClientEvent::Connected)];
        if self.attempts > 0 || self.recovering {
            directives.push(Directive::Emit(ClientEvent::Reconnected));
        }
        self.attempts = 0;
        self.recovering = false;
        directives.push(Directive::EnteredConnected);
        Ok(directives)
    }

    pub(crate) fn factory_failed(&mut self, generation: u64) -> Result<Vec<Directive>, Error> {
        if !self.is_current(generation) {
            return Ok(Vec::new());
        }
        self.machine.update(Disconnected)?;
        self.count_failed_attempt()
    }

    /// An established (or establishing) connection dropped.
    pub(crate) fn connection_lost(&mut self, generation: u64) -> Result<Vec<Directive>, Error> {
        if !self.is_current(generation) {
            return Ok(Vec::new());
        }
        match self.state() {
            Connected | Connecting => (),
            _ => return Ok(Vec::new()),
        }
        let previous = self.machine.update(Disconnected)?;
        if previous == Connected {
            self.recovering = true;
            let mut directives = vec![Directive::Emit(ClientEvent::Disconnected)];
            directives.extend(self.enter_connecting()?);
            Ok(directives)
        } else {
            // died between the socket coming up and the factory result
            // being seen; condemn that generation so the stale result is
            // discarded, and count the attempt as failed
            self.generation += 1;
            self.count_failed_attempt()
        }
    }

    /// The scheduled retry timer fired.
    pub(crate) fn retry_due(&mut self) -> Result<Vec<Directive>, Error> {
        self.retry_at = None;
        if self.state() == Disconnected {
            self.enter_connecting()
        } else {
            Ok(Vec::new())
        }
    }

    fn enter_connecting(&mut self) -> Result<Vec<Directive>, Error> {
        self.machine.update(Connecting)?;
        self.retry_at = None;
        self.generation += 1;
        Ok(vec![Directive::StartFactory {
            generation: self.generation,
        }])
    }

    fn count_failed_attempt(&mut self) -> Result<Vec<Directive>, Error> {
        self.attempts += 1;
        let mut directives = vec![Directive::Emit(ClientEvent::ReconnectFailed(self.attempts))];
        if self.attempts >= self.retry_budget {
            log::warn!(
                "giving up after {} failed connection attempts",
                self.attempts
            );
            self.machine.update(Failed)?;
            directives.push(Directive::Emit(ClientEvent::Failed));
            directives.push(Directive::EnteredFailed);
        } else {
            log::debug!(
                "connection attempt {} failed, retrying in {:?}",
                self.attempts,
                self.reconnect_interval
            );
            self.retry_at = Some(Instant::now() + self.reconnect_interval);
        }
        Ok(directives)
    }
}
