//! Bounded FIFO buffer for messages awaiting delivery.
//!
//! Delivery uses a peek/confirm protocol: the flusher clones the head,
//! delivers it without holding the lock, then confirms by sequence id. The
//! message never leaves the queue while in flight, so the queue stays bounded
//! and an interrupted flush loses nothing.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::OverflowPolicy;
use crate::lock;
use crate::payload::Payload;

/// A message waiting for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    id: u64,
    topic: String,
    payload: Payload,
    retain: bool,
    enqueued_at: Instant,
    retry_count: u32,
}

impl QueuedMessage {
    /// Sequence number, unique and increasing per queue.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Topic relative to the namespace prefix.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Message body.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Whether the broker should retain the message.
    pub fn retain(&self) -> bool {
        self.retain
    }

    /// When the message entered the queue.
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Failed delivery attempts so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

/// Returned by [`MessageQueue::push`] when strict overflow refuses a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull {
    /// Capacity at the time of the refusal.
    pub capacity: usize,
}

/// Result of recording a failed delivery of the head message.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// The message stays at the head with the new retry count.
    Retained(u32),
    /// The retry limit was exceeded and the message was removed.
    Dropped(QueuedMessage),
    /// The message was no longer at the head (evicted or already handled).
    Gone,
}

struct Inner {
    items: VecDeque<QueuedMessage>,
    capacity: usize,
    overflow: OverflowPolicy,
    next_id: u64,
}

/// Bounded, ordered message buffer.
pub struct MessageQueue {
    inner: Mutex<Inner>,
}

impl MessageQueue {
    /// Creates an empty queue. A capacity of zero is raised to one.
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                capacity: capacity.max(1),
                overflow,
                next_id: 0,
            }),
        }
    }

    /// Appends a message.
    ///
    /// At capacity, [`OverflowPolicy::DropOldest`] evicts and returns the
    /// head; [`OverflowPolicy::Reject`] refuses the new message.
    pub fn push(
        &self,
        topic: impl Into<String>,
        payload: Payload,
        retain: bool,
    ) -> Result<Option<QueuedMessage>, QueueFull> {
        let mut inner = lock(&self.inner);
        let mut evicted = None;
        if inner.items.len() >= inner.capacity {
            match inner.overflow {
                OverflowPolicy::Reject => {
                    return Err(QueueFull {
                        capacity: inner.capacity,
                    })
                }
                OverflowPolicy::DropOldest => evicted = inner.items.pop_front(),
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.push_back(QueuedMessage {
            id,
            topic: topic.into(),
            payload,
            retain,
            enqueued_at: Instant::now(),
            retry_count: 0,
        });
        Ok(evicted)
    }

    /// A copy of the head message.
    pub fn front(&self) -> Option<QueuedMessage> {
        lock(&self.inner).items.front().cloned()
    }

    /// Removes the head if it is still message `id`. Returns whether it was.
    pub fn complete(&self, id: u64) -> bool {
        let mut inner = lock(&self.inner);
        if inner.items.front().is_some_and(|m| m.id == id) {
            inner.items.pop_front();
            true
        } else {
            false
        }
    }

    /// Removes message `id` from the head regardless of its retry count.
    pub fn discard(&self, id: u64) -> Option<QueuedMessage> {
        let mut inner = lock(&self.inner);
        if inner.items.front().is_some_and(|m| m.id == id) {
            inner.items.pop_front()
        } else {
            None
        }
    }

    /// Counts a failed delivery of head message `id`.
    ///
    /// The message is removed once its retry count would exceed `limit`.
    pub fn record_failure(&self, id: u64, limit: u32) -> RetryOutcome {
        let mut inner = lock(&self.inner);
        let Some(head) = inner.items.front_mut().filter(|m| m.id == id) else {
            return RetryOutcome::Gone;
        };
        if head.retry_count >= limit {
            return match inner.items.pop_front() {
                Some(message) => RetryOutcome::Dropped(message),
                None => RetryOutcome::Gone,
            };
        }
        head.retry_count += 1;
        RetryOutcome::Retained(head.retry_count)
    }

    /// Changes the capacity, evicting the oldest overflow. Returns the evicted
    /// messages, oldest first.
    pub fn resize(&self, capacity: usize) -> Vec<QueuedMessage> {
        let mut inner = lock(&self.inner);
        inner.capacity = capacity.max(1);
        let excess = inner.items.len().saturating_sub(inner.capacity);
        inner.items.drain(..excess).collect()
    }

    /// Changes the overflow behaviour.
    pub fn set_overflow(&self, overflow: OverflowPolicy) {
        lock(&self.inner).overflow = overflow;
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        lock(&self.inner).items.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).items.is_empty()
    }

    /// Maximum number of messages.
    pub fn capacity(&self) -> usize {
        lock(&self.inner).capacity
    }

    /// Copies of all queued messages, oldest first.
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        lock(&self.inner).items.iter().cloned().collect()
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("MessageQueue")
            .field("len", &inner.items.len())
            .field("capacity", &inner.capacity)
            .field("overflow", &inner.overflow)
            .finish()
    }
}
