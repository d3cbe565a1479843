/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A minimal publish/subscribe bus for named events.
//!
//! The bus underpins the user-visible lifecycle events of both client
//! personas and doubles as the pub/sub subscription registry, where the
//! event name is the channel or pattern and the listeners are the
//! subscription callbacks.

use std::collections::HashMap;

/// A registered listener.  Listeners borrow the payload so a single emission
/// can fan out to any number of them.
pub type Listener<P> = Box<dyn FnMut(&P) + Send>;

/// Identity of a registered listener, used to remove exactly that listener
/// again.  Ids are never reused within one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Maps event names to ordered listener lists.
///
/// Listeners for a name fire in registration order.  Dispatch walks the ids
/// present when the emission started, so a listener registered while an
/// event is being emitted only takes part in later emissions.
pub struct EventBus<P> {
    listeners: HashMap<String, Vec<(ListenerId, Listener<P>)>>,
    next_id: u64,
}

impl<P> EventBus<P> {
    pub fn new() -> Self {
        EventBus {
            listeners: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registers `listener` for `event` and returns its identity.
    pub fn subscribe(
        &mut self,
        event: impl Into<String>,
        listener: impl FnMut(&P) + Send + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners
            .entry(event.into())
            .or_default()
            .push((id, Box::new(listener)));
        id
    }

    /// Fires every listener registered for `event`, in registration order,
    /// and returns how many fired.
    pub fn emit(&mut self, event: &str, payload: &P) -> usize {
        let Some(entries) = self.listeners.get_mut(event) else {
            return 0;
        };
        let snapshot: Vec<ListenerId> = entries.iter().map(|(id, _)| *id).collect();
        let mut fired = 0;
        for id in snapshot {
            if let Some((_, listener)) = entries.iter_mut().find(|(entry_id, _)| *entry_id == id) {
                listener(payload);
                fired += 1;
            }
        }
        fired
    }

    /// Removes the one listener with the given identity.  Returns whether it
    /// was registered for `event`.
    pub fn unsubscribe(&mut self, event: &str, id: ListenerId) -> bool {
        let Some(entries) = self.listeners.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() < before;
        if entries.is_empty() {
            self.listeners.remove(event);
        }
        removed
    }

    /// Removes every listener for `event` and returns how many there were.
    pub fn clear(&mut self, event: &str) -> usize {
        self.listeners.remove(event).map_or(0, |entries| entries.len())
    }

    /// Whether at least one listener is registered for `event`.
    pub fn contains(&self, event: &str) -> bool {
        self.listeners.contains_key(event)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, Vec::len)
    }

    /// The names that currently have listeners, in no particular order.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.listeners.keys().map(String::as_str)
    }
}

impl<P> Default for EventBus<P> {
    fn default() -> Self {
        EventBus::new()
    }
}
