// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event correlation: per-type FIFO queues of undelivered events paired with
//! per-type FIFO queues of waiters.
//!
//! Only the event queues are durable. Waiters are oneshot senders and live for
//! one actor lifetime.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{EngineError, Result};
use crate::instance::Event;

/// KV prefix of the persisted event map.
pub const EVENT_MAP_PREFIX: &str = "EVENT_MAP\n";

/// Compound KV key for the `index`-th buffered event of `event_type`.
///
/// The index is zero-padded so ascending key order is arrival order.
pub fn event_map_key(event_type: &str, index: usize) -> String {
    format!("{}{}\n{:010}", EVENT_MAP_PREFIX, event_type, index)
}

/// Split a compound key back into (event type, index).
pub fn parse_event_map_key(key: &str) -> Option<(&str, usize)> {
    let rest = key.strip_prefix(EVENT_MAP_PREFIX)?;
    let (event_type, index) = rest.rsplit_once('\n')?;
    Some((event_type, index.parse().ok()?))
}

/// In-memory event map and waiter registry.
#[derive(Debug, Default)]
pub struct EventCorrelator {
    events: BTreeMap<String, VecDeque<Event>>,
    waiters: HashMap<String, VecDeque<oneshot::Sender<Event>>>,
    /// Set once the map was loaded from storage in this lifetime.
    restored: bool,
}

impl EventCorrelator {
    /// Empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to the queue of its type.
    pub fn buffer(&mut self, event: Event) {
        self.events
            .entry(event.event_type.clone())
            .or_default()
            .push_back(event);
    }

    /// Hand the oldest buffered event of `event_type` to the oldest live
    /// waiter. Both are removed together. Returns whether a delivery happened.
    pub fn try_deliver(&mut self, event_type: &str) -> bool {
        let Some(waiters) = self.waiters.get_mut(event_type) else {
            return false;
        };
        let Some(queue) = self.events.get_mut(event_type) else {
            return false;
        };

        let mut delivered = false;
        while let Some(event) = queue.pop_front() {
            let Some(waiter) = waiters.pop_front() else {
                queue.push_front(event);
                break;
            };
            match waiter.send(event) {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                // Receiver dropped; offer the event to the next waiter.
                Err(event) => queue.push_front(event),
            }
        }

        if queue.is_empty() {
            self.events.remove(event_type);
        }
        if waiters.is_empty() {
            self.waiters.remove(event_type);
        }
        delivered
    }

    /// Take the oldest buffered event of `event_type`, if any.
    pub fn take_buffered(&mut self, event_type: &str) -> Option<Event> {
        let queue = self.events.get_mut(event_type)?;
        let event = queue.pop_front();
        if queue.is_empty() {
            self.events.remove(event_type);
        }
        event
    }

    /// Register a waiter for the next event of `event_type`.
    pub fn register_waiter(&mut self, event_type: &str) -> oneshot::Receiver<Event> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .entry(event_type.to_string())
            .or_default()
            .push_back(tx);
        rx
    }

    /// Number of waiters registered for `event_type`, dropped ones included.
    pub fn waiter_count(&self, event_type: &str) -> usize {
        self.waiters.get(event_type).map_or(0, VecDeque::len)
    }

    /// Number of events buffered for `event_type`.
    pub fn buffered_count(&self, event_type: &str) -> usize {
        self.events.get(event_type).map_or(0, VecDeque::len)
    }

    /// Copy of the event map.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<Event>> {
        self.events
            .iter()
            .map(|(event_type, queue)| (event_type.clone(), queue.iter().cloned().collect()))
            .collect()
    }

    /// The event map as compound-keyed KV entries.
    pub fn to_entries(&self) -> Result<Vec<(String, Value)>> {
        let mut entries = Vec::new();
        for (event_type, queue) in &self.events {
            for (index, event) in queue.iter().enumerate() {
                entries.push((event_map_key(event_type, index), serde_json::to_value(event)?));
            }
        }
        Ok(entries)
    }

    /// Replace the event map with entries read back in ascending key order.
    /// Waiters are kept.
    pub fn replace_events(&mut self, entries: Vec<(String, Value)>) -> Result<()> {
        let mut events: BTreeMap<String, VecDeque<Event>> = BTreeMap::new();

        for (key, value) in entries {
            let (event_type, _) =
                parse_event_map_key(&key).ok_or_else(|| EngineError::SerializationError {
                    details: format!("malformed event map key {:?}", key),
                })?;
            let event: Event = serde_json::from_value(value)?;
            events
                .entry(event_type.to_string())
                .or_default()
                .push_back(event);
        }

        self.events = events;
        self.restored = true;
        Ok(())
    }

    /// Whether [`EventCorrelator::replace_events`] ran in this lifetime.
    /// Until it has, the in-memory map may lack events stored earlier.
    pub fn is_restored(&self) -> bool {
        self.restored
    }
}
