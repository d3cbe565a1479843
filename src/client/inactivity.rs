/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The inactivity probe shared by both connection kinds.
//!
//! After `trigger` of inbound silence the connection should send its no-op
//! probe command; after `response_timeout` more without any inbound traffic
//! the socket is considered dead and must be torn down.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeEvent {
    /// `trigger` elapsed without inbound traffic; send the probe command
    SendPing,
    /// `response_timeout` elapsed after the probe; the connection is dead
    Expired,
}

pub(crate) struct InactivityProbe {
    trigger: Duration,
    response_timeout: Duration,
    deadline: Instant,
    ping_sent: bool,
}

impl InactivityProbe {
    pub(crate) fn new(trigger: Duration, response_timeout: Duration) -> Self {
        InactivityProbe {
            trigger,
            response_timeout,
            deadline: Instant::now() + trigger,
            ping_sent: false,
        }
    }

    /// Waits for the next deadline and says what it means.  Holds no
    /// mutable state, so it is safe to race against the connection's other
    /// work and drop when it loses; the caller reports back through
    /// [`note_ping_sent`](Self::note_ping_sent) and
    /// [`mark_activity`](Self::mark_activity).
    pub(crate) async fn tick(&self) -> ProbeEvent {
        sleep_until(self.deadline).await;
        if self.ping_sent {
            ProbeEvent::Expired
        } else {
            ProbeEvent::SendPing
        }
    }

    /// The probe command went out; arm the response deadline.
    pub(crate) fn note_ping_sent(&mut self) {
        self.ping_sent = true;
        self.deadline += self.response_timeout;
    }

    /// Inbound traffic arrived; restart the countdown from now.
    pub(crate) fn mark_activity(&mut self) {
        self.ping_sent = false;
        self.deadline = Instant::now() + self.trigger;
    }
}

/// Ticks the probe when one is configured, and otherwise never resolves;
/// raced against a connection worker's other work.
pub(crate) async fn tick_or_never(probe: &Option<InactivityProbe>) -> ProbeEvent {
    match probe {
        Some(probe) => probe.tick().await,
        None => futures_util::future::pending().await,
    }
}
