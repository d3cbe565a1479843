/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A declarative state machine.
//!
//! The caller names the permitted `(from, to)` transitions up front; any
//! update outside that set is a programmer error.  Every successful update
//! emits an enter-event named after the new state, carrying the previous
//! state, on the machine's own bus.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::mem;

use crate::error::{internal, Error};
use crate::event::{EventBus, ListenerId};

pub(crate) struct StateMachine<S> {
    current: S,
    edges: HashSet<(S, S)>,
    bus: EventBus<S>,
}

impl<S> StateMachine<S>
where
    S: Copy + Eq + Hash + fmt::Display,
{
    /// Builds a machine starting in `initial` with the given permitted
    /// transitions.  Declaring the same edge twice is rejected.
    pub(crate) fn new(
        initial: S,
        edges: impl IntoIterator<Item = (S, S)>,
    ) -> Result<Self, Error> {
        let mut set = HashSet::new();
        for edge in edges {
            if !set.insert(edge) {
                return Err(internal(format!(
                    "transition {} -> {} declared twice",
                    edge.0, edge.1
                )));
            }
        }
        Ok(StateMachine {
            current: initial,
            edges: set,
            bus: EventBus::new(),
        })
    }

    pub(crate) fn current(&self) -> S {
        self.current
    }

    /// Moves to `to` if the edge from the current state is permitted,
    /// emitting the enter-event and returning the previous state.
    pub(crate) fn update(&mut self, to: S) -> Result<S, Error> {
        if !self.edges.contains(&(self.current, to)) {
            return Err(internal(format!(
                "illegal transition {} -> {}",
                self.current, to
            )));
        }
        let previous = mem::replace(&mut self.current, to);
        log::debug!("state {} -> {}", previous, to);
        self.bus.emit(&to.to_string(), &previous);
        Ok(previous)
    }

    /// Registers a listener fired whenever `state` is entered; the payload
    /// is the state being left.
    #[allow(dead_code)]
    pub(crate) fn on_enter(
        &mut self,
        state: S,
        listener: impl FnMut(&S) + Send + 'static,
    ) -> ListenerId {
        self.bus.subscribe(state.to_string(), listener)
    }
}
