//! Subscription registry and consumer handles
//!
//! The registry is the replay set: whatever is registered here gets re-subscribed after
//! every reconnect. Registrations with identical channel and params share one wire
//! subscription, counted by reference.

use super::{
    codec::{Inbound, StreamCodec},
    manager::{Command, Shared},
};
use crate::{errors::ConnectionError, queue::BoundedQueue};
use futures_util::stream::Stream;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type DataCallback = Arc<dyn Fn(Value) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

/// Where routed payloads go.
#[derive(Clone)]
pub(crate) enum Sink {
    Queue(Arc<BoundedQueue<Value>>),
    Callback {
        on_data: DataCallback,
        on_error: ErrorCallback,
    },
}

impl Sink {
    pub(crate) fn close(&self) {
        if let Sink::Queue(queue) = self {
            queue.close();
        }
    }

    pub(crate) fn fail(&self, error: &ConnectionError) {
        match self {
            Sink::Queue(queue) => queue.fail(error.clone()),
            Sink::Callback { on_error, .. } => on_error(error),
        }
    }
}

pub(crate) struct Entry {
    pub(crate) channel: String,
    pub(crate) params: Value,
    pub(crate) sink: Sink,
}

type WireKey = (String, String);

fn wire_key(channel: &str, params: &Value) -> WireKey {
    (channel.to_owned(), params.to_string())
}

/// Live subscriptions plus the outbound command channel of the current session.
///
/// Both sit behind one lock so a reconnect can drain stale commands and snapshot the
/// replay set atomically with respect to concurrent subscribe calls.
#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    entries: BTreeMap<SubscriptionId, Entry>,
    wire: HashMap<WireKey, usize>,
    closed: bool,
    pub(crate) outbox: Option<mpsc::UnboundedSender<Command>>,
}

impl Registry {
    /// Returns the new id and whether this is the first registration for its wire key.
    pub(crate) fn insert(&mut self, channel: String, params: Value, sink: Sink) -> (SubscriptionId, bool) {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);

        let refs = self.wire.entry(wire_key(&channel, &params)).or_insert(0);
        *refs += 1;
        let first = *refs == 1;

        self.entries.insert(
            id,
            Entry {
                channel,
                params,
                sink,
            },
        );
        (id, first)
    }

    /// Returns the entry and whether it was the last registration for its wire key.
    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Option<(Entry, bool)> {
        let entry = self.entries.remove(&id)?;
        let key = wire_key(&entry.channel, &entry.params);
        let last = match self.wire.get_mut(&key) {
            Some(refs) if *refs > 1 => {
                *refs -= 1;
                false
            }
            Some(_) => {
                self.wire.remove(&key);
                true
            }
            None => true,
        };
        Some((entry, last))
    }

    /// Distinct channel/params pairs in registration order.
    pub(crate) fn replay_set(&self) -> Vec<(String, Value)> {
        let mut seen = HashSet::new();
        self.entries
            .values()
            .filter(|entry| seen.insert(wire_key(&entry.channel, &entry.params)))
            .map(|entry| (entry.channel.clone(), entry.params.clone()))
            .collect()
    }

    /// Sinks interested in `inbound`, cloned so delivery happens outside the lock.
    pub(crate) fn route(&self, codec: &dyn StreamCodec, inbound: &Inbound) -> Vec<(String, Sink)> {
        self.entries
            .values()
            .filter(|entry| codec.matches(&entry.channel, &entry.params, inbound))
            .map(|entry| (entry.channel.clone(), entry.sink.clone()))
            .collect()
    }

    /// Empty the registry for good. Later inserts are refused by the manager.
    pub(crate) fn drain(&mut self) -> Vec<Entry> {
        self.closed = true;
        self.outbox = None;
        self.wire.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Consumer side of a subscription.
///
/// A lazy, unbounded stream of payloads. It waits while the queue is empty, survives
/// reconnects silently, and ends with an error only when the connection gives up.
/// Dropping the handle unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    channel: String,
    params: Value,
    queue: Arc<BoundedQueue<Value>>,
    manager: Weak<Shared>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        channel: String,
        params: Value,
        queue: Arc<BoundedQueue<Value>>,
        manager: Weak<Shared>,
    ) -> Self {
        Self {
            id,
            channel,
            params,
            queue,
            manager,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Next payload, `None` once the connection is closed and the backlog drained.
    pub async fn recv(&mut self) -> Option<Result<Value, ConnectionError>> {
        self.queue.pop().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.queue.try_pop()
    }

    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Payloads discarded because this consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Same as dropping the handle.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Stream for Subscription {
    type Item = Result<Value, ConnectionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.queue.poll_pop(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.manager.upgrade() {
            shared.unsubscribe(self.id);
        }
        self.queue.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("params", &self.params)
            .field("backlog", &self.queue.len())
            .finish()
    }
}
