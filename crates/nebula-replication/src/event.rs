//! Discrete events: the application trait, per-peer send queues with
//! acknowledgement and resend, and receive-side duplicate filtering and
//! reordering.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::MessageError;
use crate::message::{EventBody, HEADER_SIZE, MAX_MESSAGE_SIZE};

/// Entries remembered per ordering class for duplicate detection.
const DUPLICATE_WINDOW: usize = 64;

/// How pending events are cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Cancelled and removed before the call returns.
    Immediate,
    /// Given one more first-send pass on the next update, then cancelled.
    Deferred,
}

/// An application event that can be replicated.
///
/// `KIND` routes the event to listeners registered for the same type on
/// the receiving side.
pub trait ReplicatedEvent: Serialize + DeserializeOwned + Send + 'static {
    const KIND: &'static str;

    /// Called when the event is cancelled while still pending.
    fn cancel(&mut self, mode: CancelMode) {
        let _ = mode;
    }
}

pub(crate) trait Cancellable: Send {
    fn cancel(&mut self, mode: CancelMode);
}

impl<E: ReplicatedEvent> Cancellable for E {
    fn cancel(&mut self, mode: CancelMode) {
        ReplicatedEvent::cancel(self, mode);
    }
}

pub(crate) type SharedEvent = Arc<Mutex<dyn Cancellable>>;

/// Cancel every distinct instance in `events` once.
pub(crate) fn cancel_instances<'a>(
    events: impl IntoIterator<Item = &'a SharedEvent>,
    mode: CancelMode,
) -> usize {
    let mut seen: Vec<*const ()> = Vec::new();
    for event in events {
        let key = Arc::as_ptr(event) as *const ();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        event
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel(mode);
    }
    seen.len()
}

/// Number of distinct instances in `events`.
pub(crate) fn count_instances<'a>(events: impl IntoIterator<Item = &'a SharedEvent>) -> usize {
    let mut seen: Vec<*const ()> = Vec::new();
    for event in events {
        let key = Arc::as_ptr(event) as *const ();
        if !seen.contains(&key) {
            seen.push(key);
        }
    }
    seen.len()
}

/// An event encoded once and shared by every peer queue it is sent to.
#[derive(Clone)]
pub(crate) struct PreparedEvent {
    pub kind: &'static str,
    pub payload: Arc<[u8]>,
    pub instance: SharedEvent,
}

impl PreparedEvent {
    /// Encode `event`, rejecting it when its datagram could never be sent.
    pub fn new<E: ReplicatedEvent>(event: E) -> Result<Self, MessageError> {
        // Sized with the widest sequence number it may be sent under.
        let body = EventBody {
            sequence: u16::MAX,
            in_order: true,
            kind: E::KIND.to_owned(),
            payload: postcard::to_allocvec(&event)?,
        };
        let size = HEADER_SIZE + postcard::to_allocvec(&body)?.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(MessageError::PayloadTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let payload = body.payload;
        let instance: SharedEvent = Arc::new(Mutex::new(event));
        Ok(Self {
            kind: E::KIND,
            payload: payload.into(),
            instance,
        })
    }
}

struct Outgoing {
    sequence: u16,
    in_order: bool,
    event: PreparedEvent,
    sends: u32,
    since_send: f64,
}

impl Outgoing {
    fn body(&self) -> EventBody {
        EventBody {
            sequence: self.sequence,
            in_order: self.in_order,
            kind: self.event.kind.to_owned(),
            payload: self.event.payload.to_vec(),
        }
    }
}

/// Result of one outbox pass.
#[derive(Default)]
pub(crate) struct OutboxPoll {
    /// Bodies to transmit, first sends ahead of resends.
    pub send: Vec<EventBody>,
    /// Kinds of unordered events given up on.
    pub discarded: Vec<&'static str>,
}

/// Unacknowledged events to one peer.
#[derive(Default)]
pub(crate) struct EventOutbox {
    next_unordered: u16,
    next_in_order: u16,
    queue: Vec<Outgoing>,
}

impl EventOutbox {
    pub fn push(&mut self, event: PreparedEvent, in_order: bool) {
        let counter = if in_order {
            &mut self.next_in_order
        } else {
            &mut self.next_unordered
        };
        let sequence = *counter;
        *counter = counter.wrapping_add(1);
        self.queue.push(Outgoing {
            sequence,
            in_order,
            event,
            sends: 0,
            since_send: 0.0,
        });
    }

    /// Drop the acknowledged event. Returns false for unknown or repeated acks.
    pub fn acknowledge(&mut self, sequence: u16, in_order: bool) -> bool {
        let before = self.queue.len();
        self.queue
            .retain(|entry| !(entry.sequence == sequence && entry.in_order == in_order));
        self.queue.len() != before
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn instances(&self) -> impl Iterator<Item = &SharedEvent> {
        self.queue.iter().map(|entry| &entry.event.instance)
    }

    /// Age entries by `dt` and collect what is due. With `first_only`, only
    /// never-sent events go out.
    pub fn poll(&mut self, dt: f64, interval: f64, limit: u32, first_only: bool) -> OutboxPoll {
        let mut poll = OutboxPoll::default();
        for entry in self.queue.iter_mut().filter(|entry| entry.sends > 0) {
            entry.since_send += dt;
        }

        for entry in self.queue.iter_mut().filter(|entry| entry.sends == 0) {
            poll.send.push(entry.body());
            entry.sends = 1;
            entry.since_send = 0.0;
        }
        if first_only {
            return poll;
        }

        let mut index = 0;
        while index < self.queue.len() {
            let entry = &mut self.queue[index];
            if entry.sends == 0 || entry.since_send < interval {
                index += 1;
                continue;
            }
            if !entry.in_order && entry.sends >= limit {
                poll.discarded.push(entry.event.kind);
                self.queue.remove(index);
                continue;
            }
            poll.send.push(entry.body());
            entry.sends += 1;
            entry.since_send = 0.0;
            index += 1;
        }
        poll
    }

    /// Forget every queued event.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[derive(Debug)]
struct SequenceRing {
    entries: [Option<u16>; DUPLICATE_WINDOW],
    next: usize,
}

impl Default for SequenceRing {
    fn default() -> Self {
        Self {
            entries: [None; DUPLICATE_WINDOW],
            next: 0,
        }
    }
}

impl SequenceRing {
    /// Record `sequence`; false if it was already present.
    fn insert(&mut self, sequence: u16) -> bool {
        if self.entries.contains(&Some(sequence)) {
            return false;
        }
        self.entries[self.next] = Some(sequence);
        self.next = (self.next + 1) % DUPLICATE_WINDOW;
        true
    }
}

/// Incoming events from one peer.
#[derive(Debug, Default)]
pub(crate) struct EventInbox {
    unordered: SequenceRing,
    expected: u16,
    held: BTreeMap<u16, EventBody>,
}

impl EventInbox {
    /// Events now deliverable, in delivery order. Duplicates yield nothing.
    pub fn receive(&mut self, body: EventBody) -> Vec<EventBody> {
        if !body.in_order {
            return if self.unordered.insert(body.sequence) {
                vec![body]
            } else {
                Vec::new()
            };
        }

        let ahead = body.sequence.wrapping_sub(self.expected) as i16;
        if ahead < 0 {
            return Vec::new();
        }
        if ahead > 0 {
            if (ahead as usize) < DUPLICATE_WINDOW {
                self.held.entry(body.sequence).or_insert(body);
            }
            return Vec::new();
        }

        let mut ready = vec![body];
        self.expected = self.expected.wrapping_add(1);
        while let Some(next) = self.held.remove(&self.expected) {
            ready.push(next);
            self.expected = self.expected.wrapping_add(1);
        }
        ready
    }
}
