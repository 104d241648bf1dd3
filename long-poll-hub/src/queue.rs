//! Bounded per-client delivery queue.
//!
//! The broadcaster pushes into it and Poll drains it. The buffer sits behind a
//! plain mutex that is never held across an `.await`; waiting is done on
//! [`Notify`] so a parked Poll costs nothing until a message shows up.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::sync::Notify;

use crate::{config::OverflowPolicy, message::ChatMessage};

/// What happened to a single pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// Delivered, but the oldest buffered message was evicted for it.
    Displaced,
    /// The queue was full and the message was discarded.
    Dropped,
    /// The owning client left; nothing was queued.
    Closed,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("delivery queue closed")]
pub struct QueueClosed;

pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    readable: Notify,
    writable: Notify,
}

#[derive(Default)]
struct QueueState {
    buffer: VecDeque<ChatMessage>,
    closed: bool,
}

impl DeliveryQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            policy,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Queues a message according to the overflow policy.
    ///
    /// Only [`OverflowPolicy::Block`] ever suspends here, and only while the
    /// queue is full and still open.
    pub async fn push(&self, message: ChatMessage) -> PushOutcome {
        let mut pending = message;
        loop {
            let space = self.writable.notified();
            tokio::pin!(space);
            // Register before checking so a drain between the check and the
            // await cannot be missed.
            space.as_mut().enable();

            match self.try_push(pending) {
                Ok(outcome) => return outcome,
                Err(message) => pending = message,
            }

            space.await;
        }
    }

    /// Non-blocking push. Hands the message back only when the policy is
    /// `Block` and there is no room.
    pub fn try_push(&self, message: ChatMessage) -> Result<PushOutcome, ChatMessage> {
        let mut state = self.lock();
        if state.closed {
            return Ok(PushOutcome::Closed);
        }

        let outcome = if state.buffer.len() < self.capacity {
            state.buffer.push_back(message);
            PushOutcome::Delivered
        } else {
            match self.policy {
                OverflowPolicy::DropNewest => return Ok(PushOutcome::Dropped),
                OverflowPolicy::DropOldest => {
                    state.buffer.pop_front();
                    state.buffer.push_back(message);
                    PushOutcome::Displaced
                }
                OverflowPolicy::Block => return Err(message),
            }
        };
        drop(state);

        self.readable.notify_one();
        Ok(outcome)
    }

    /// Waits until at least one message is buffered, then takes up to `max`
    /// of them in FIFO order without waiting for more.
    pub async fn recv_batch(&self, max: usize) -> Result<Vec<ChatMessage>, QueueClosed> {
        loop {
            let ready = self.readable.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if let Some(batch) = self.try_drain(max)? {
                return Ok(batch);
            }

            ready.await;
        }
    }

    pub fn try_drain(&self, max: usize) -> Result<Option<Vec<ChatMessage>>, QueueClosed> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueClosed);
        }
        if state.buffer.is_empty() {
            return Ok(None);
        }

        let take = max.min(state.buffer.len());
        let batch: Vec<ChatMessage> = state.buffer.drain(..take).collect();
        let has_more = !state.buffer.is_empty();
        drop(state);

        self.writable.notify_waiters();
        if has_more {
            // Hand the leftovers to any other Poll parked on this queue.
            self.readable.notify_one();
        }
        Ok(Some(batch))
    }

    /// Discards buffered messages and wakes every waiter on both sides.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.buffer.clear();
        drop(state);

        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
