//! Blocking FIFO of messages with an explicit shutdown signal.
//!
//! Any number of producers (connection I/O tasks, timers, other workers) may
//! enqueue concurrently; one worker thread consumes. Shutting the queue down
//! appends a close marker, so everything enqueued before the shutdown is
//! still delivered, after which [`MessageQueue::dequeue`] reports closure
//! instead of blocking.

use crate::error::QueueClosed;
use crate::message::Message;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

enum Envelope {
    Message(Message),
    Close,
}

pub struct MessageQueue {
    sender: Sender<Envelope>,
    receiver: Receiver<Envelope>,
    shut_down: AtomicBool,
    drained: AtomicBool,
}

impl MessageQueue {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender,
            receiver,
            shut_down: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        }
    }

    /// Appends a message. Never blocks; fails only after [`MessageQueue::shutdown`].
    pub fn enqueue(&self, message: Message) -> Result<(), QueueClosed> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(QueueClosed);
        }
        // The queue owns its receiver, so the channel cannot be disconnected.
        self.sender
            .send(Envelope::Message(message))
            .map_err(|_| QueueClosed)
    }

    /// Blocks until a message arrives. Returns `None` once the queue has been
    /// shut down and every earlier message has been handed out.
    pub fn dequeue(&self) -> Option<Message> {
        if self.drained.load(Ordering::Acquire) {
            return None;
        }
        match self.receiver.recv() {
            Ok(envelope) => self.open(envelope),
            Err(_) => None,
        }
    }

    /// Like [`MessageQueue::dequeue`] but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Message> {
        if self.drained.load(Ordering::Acquire) {
            return None;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(envelope) => self.open(envelope),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_dequeue(&self) -> Option<Message> {
        if self.drained.load(Ordering::Acquire) {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(envelope) => self.open(envelope),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocks for the first message, then takes everything else already queued.
    pub fn dequeue_all(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        if let Some(first) = self.dequeue() {
            messages.push(first);
            while let Some(next) = self.try_dequeue() {
                messages.push(next);
            }
        }
        messages
    }

    /// Stops accepting messages and wakes the consumer once the backlog is drained.
    ///
    /// Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(Envelope::Close);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Number of envelopes waiting, including a pending close marker.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    fn open(&self, envelope: Envelope) -> Option<Message> {
        match envelope {
            Envelope::Message(message) => Some(message),
            Envelope::Close => {
                self.drained.store(true, Ordering::Release);
                None
            }
        }
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
