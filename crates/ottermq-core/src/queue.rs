//! The queue data structure.
//!
//! A queue is a passive, mutex-protected FIFO: `push` appends at the tail,
//! `pop` takes the head, `requeue_front` reinserts ahead of the head. No
//! task runs per queue; delivery is driven by [`Queue::dispatch`], called
//! from whichever connection task just made a message or a consumer slot
//! available.
//!
//! Consumer rotation is a cursor over the consumer list: each delivery goes
//! to the next currently-eligible consumer (prefetch-capped consumers are
//! skipped), giving a stable round-robin among the eligible set.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use ottermq_proto::FieldTable;

use crate::{
    channel::ChannelLink,
    error::{AmqpException, ReplyCode},
    lock_unpoisoned,
    message::Message,
};

/// Declare-time queue attributes, compared on redeclare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAttrs {
    /// Survive broker restart (stored, not enforced here)
    pub durable: bool,
    /// Owned by one connection and deleted with it
    pub exclusive: bool,
    /// Deleted when the last consumer detaches
    pub auto_delete: bool,
    /// Declaration arguments (e.g. `x-message-ttl`, kept but not enforced)
    pub arguments: FieldTable,
}

/// A registered consumer, as the queue sees it.
#[derive(Debug, Clone)]
pub struct Consumer {
    /// Channel-scoped consumer tag
    pub tag: String,
    /// Deliveries need no acknowledgement
    pub no_ack: bool,
    /// This consumer demanded sole access to the queue
    pub exclusive: bool,
    /// Delivery link into the owning channel
    pub link: Arc<ChannelLink>,
}

#[derive(Debug, Default)]
struct QueueInner {
    fifo: std::collections::VecDeque<Message>,
    consumers: Vec<Consumer>,
    /// Round-robin cursor into `consumers`
    rotation: usize,
}

/// One queue: FIFO, consumers, and declare-time attributes.
#[derive(Debug)]
pub struct Queue {
    name: String,
    attrs: QueueAttrs,
    /// Connection that owns an exclusive queue
    owner: Option<u64>,
    inner: Mutex<QueueInner>,
}

impl Queue {
    /// Create a queue. `owner` is required for exclusive queues.
    #[must_use]
    pub fn new(name: impl Into<String>, attrs: QueueAttrs, owner: Option<u64>) -> Self {
        Self { name: name.into(), attrs, owner, inner: Mutex::new(QueueInner::default()) }
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare-time attributes.
    #[must_use]
    pub fn attrs(&self) -> &QueueAttrs {
        &self.attrs
    }

    /// Owning connection of an exclusive queue.
    #[must_use]
    pub fn owner(&self) -> Option<u64> {
        self.owner
    }

    /// 405 RESOURCE-LOCKED unless `connection_id` may touch this queue.
    pub fn check_access(&self, connection_id: u64) -> Result<(), AmqpException> {
        match self.owner {
            Some(owner) if owner != connection_id => Err(AmqpException::channel(
                ReplyCode::ResourceLocked,
                format!("queue '{}' is exclusive to another connection", self.name),
            )),
            _ => Ok(()),
        }
    }

    /// Messages currently ready for delivery.
    #[must_use]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.inner).fifo.len()
    }

    /// True when no messages are ready.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        lock_unpoisoned(&self.inner).consumers.len()
    }

    /// Append a message at the tail, then drive deliveries.
    pub fn publish(&self, message: Message, now: Instant) {
        {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.fifo.push_back(message);
        }
        self.dispatch(now);
    }

    /// Reinsert a message ahead of the current head.
    pub fn requeue_front(&self, mut message: Message) {
        message.redelivered = true;
        let mut inner = lock_unpoisoned(&self.inner);
        inner.fifo.push_front(message);
    }

    /// Pop the head for `basic.get`. Returns the message and how many
    /// remain.
    #[must_use]
    pub fn pop(&self) -> Option<(Message, u32)> {
        let mut inner = lock_unpoisoned(&self.inner);
        let message = inner.fifo.pop_front()?;
        Some((message, inner.fifo.len() as u32))
    }

    /// Drop all ready messages. Returns how many were removed.
    pub fn purge(&self) -> u32 {
        let mut inner = lock_unpoisoned(&self.inner);
        let count = inner.fifo.len() as u32;
        inner.fifo.clear();
        count
    }

    /// Register a consumer.
    ///
    /// # Errors
    ///
    /// 403 ACCESS-REFUSED if the queue already has an exclusive consumer,
    /// or if `consumer.exclusive` and any consumer exists.
    pub fn add_consumer(&self, consumer: Consumer, now: Instant) -> Result<(), AmqpException> {
        {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.consumers.iter().any(|c| c.exclusive) {
                return Err(AmqpException::channel(
                    ReplyCode::AccessRefused,
                    format!("queue '{}' has an exclusive consumer", self.name),
                ));
            }
            if consumer.exclusive && !inner.consumers.is_empty() {
                return Err(AmqpException::channel(
                    ReplyCode::AccessRefused,
                    format!("queue '{}' already has consumers", self.name),
                ));
            }
            inner.consumers.push(consumer);
        }
        // A new consumer may be able to take backlog immediately
        self.dispatch(now);
        Ok(())
    }

    /// Remove a consumer by tag (and owning link, so equal tags on
    /// different channels cannot cancel each other). Returns true if one
    /// was removed.
    pub fn remove_consumer(&self, tag: &str, link: &Arc<ChannelLink>) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        let before = inner.consumers.len();
        inner.consumers.retain(|c| !(c.tag == tag && Arc::ptr_eq(&c.link, link)));
        let removed = inner.consumers.len() != before;
        if removed && !inner.consumers.is_empty() {
            inner.rotation %= inner.consumers.len();
        }
        removed
    }

    /// Deliver as many ready messages as eligible consumers will take.
    ///
    /// Runs until the FIFO empties or every consumer is at its prefetch
    /// limit. A consumer whose connection has gone away is dropped and its
    /// message goes back to the head.
    pub fn dispatch(&self, now: Instant) {
        loop {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.fifo.is_empty() || inner.consumers.is_empty() {
                return;
            }

            let count = inner.consumers.len();
            let start = inner.rotation % count;
            let mut chosen = None;
            for step in 0..count {
                let index = (start + step) % count;
                let candidate = &inner.consumers[index];
                if candidate.no_ack || candidate.link.eligible(&candidate.tag) {
                    chosen = Some(index);
                    break;
                }
            }
            let Some(index) = chosen else { return };

            let Some(message) = inner.fifo.pop_front() else { return };
            inner.rotation = (index + 1) % count;
            let consumer = inner.consumers[index].clone();

            // The link's state mutex nests under the queue mutex here; links
            // never lock queues, so the order is acyclic.
            match consumer.link.deliver(&consumer.tag, consumer.no_ack, message, &self.name, now)
            {
                Ok(()) => {},
                Err(message) => {
                    tracing::debug!(
                        queue = self.name,
                        consumer = consumer.tag,
                        "dropping consumer with dead connection"
                    );
                    inner.fifo.push_front(message);
                    inner
                        .consumers
                        .retain(|c| !(c.tag == consumer.tag && Arc::ptr_eq(&c.link, &consumer.link)));
                    if !inner.consumers.is_empty() {
                        inner.rotation %= inner.consumers.len();
                    }
                },
            }
        }
    }
}
