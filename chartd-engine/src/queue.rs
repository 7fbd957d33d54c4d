//! Inbound event queue of one session.
//!
//! Many writers, one reader. The reader can wait for the queue to become
//! readable without taking an event, which the session controller needs to
//! decide whether a self-suspended session should resume.

use crate::error::EngineError;
use chartd_core::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct QueueInner {
    events: Mutex<VecDeque<Event>>,
    closed: AtomicBool,
    notify: Notify,
}

#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                events: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Appends an event. Fails once the writer side is closed.
    pub fn send(&self, event: Event) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::QueueClosed);
        }
        self.inner.events.lock().push_back(event);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Puts events back at the head of the queue, keeping their order.
    pub(crate) fn requeue_front(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut queue = self.inner.events.lock();
        for event in events.into_iter().rev() {
            queue.push_front(event);
        }
        drop(queue);
        self.inner.notify.notify_one();
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.inner.events.lock().pop_front()
    }

    /// Removes every queued event.
    pub fn drain(&self) -> Vec<Event> {
        self.inner.events.lock().drain(..).collect()
    }

    /// Closes the writer side. Queued events can still be read.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until an event is available (`true`) or the queue is closed
    /// and empty (`false`). Does not consume anything.
    pub async fn wait_readable(&self) -> bool {
        loop {
            if !self.is_empty() {
                return true;
            }
            if self.is_closed() {
                return false;
            }
            self.inner.notify.notified().await;
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
