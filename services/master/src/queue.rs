//! Unbounded FIFO queue with discardable one-shot gets.
//!
//! Event streams handed to subscribers are backed by a [`Queue`]. A consumer
//! calls [`Queue::get`] and awaits the returned [`Deferred`]; waiters are
//! served in registration order.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed or dropped before an item arrived.
    #[error("queue closed")]
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    waiters: VecDeque<(u64, oneshot::Sender<T>)>,
    next_waiter: u64,
    closed: bool,
}

/// Multi-producer queue; clones share the same buffer.
pub struct Queue<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("Queue")
            .field("items", &inner.items.len())
            .field("waiters", &inner.waiters.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
                next_waiter: 0,
                closed: false,
            })),
        }
    }

    /// Hands the item to the oldest live waiter, or buffers it.
    ///
    /// Returns false if the queue is closed and the item was dropped.
    pub fn put(&self, item: T) -> bool {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return false;
        }
        let mut item = item;
        while let Some((_, waiter)) = inner.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return true,
                // Receiver dropped without discarding; try the next waiter.
                Err(returned) => item = returned,
            }
        }
        inner.items.push_back(item);
        true
    }

    /// Registers interest in the next item.
    pub fn get(&self) -> Deferred<T> {
        let (tx, rx) = oneshot::channel();
        let mut inner = lock(&self.inner);
        let id = inner.next_waiter;
        inner.next_waiter += 1;

        if let Some(item) = inner.items.pop_front() {
            let _ = tx.send(item);
        } else if !inner.closed {
            inner.waiters.push_back((id, tx));
        }

        Deferred {
            id,
            rx,
            queue: Arc::downgrade(&self.inner),
        }
    }

    /// Fails every pending get and rejects future puts. Buffered items stay
    /// readable.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        inner.waiters.clear();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pending result of [`Queue::get`].
pub struct Deferred<T> {
    id: u64,
    rx: oneshot::Receiver<T>,
    queue: Weak<Mutex<Inner<T>>>,
}

impl<T> Deferred<T> {
    /// Retracts interest. No-op if the get already resolved or the queue is
    /// gone.
    pub fn discard(self) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let mut inner = lock(&queue);
        inner.waiters.retain(|(id, _)| *id != self.id);
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| QueueError::Closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let queue = Queue::new();
        queue.put(1);
        queue.put(2);
        assert_eq!(queue.get().await, Ok(1));
        assert_eq!(queue.get().await, Ok(2));
    }

    #[tokio::test]
    async fn test_waiters_served_fifo() {
        let queue = Queue::new();
        let first = queue.get();
        let second = queue.get();
        queue.put("a");
        queue.put("b");
        assert_eq!(second.await, Ok("b"));
        assert_eq!(first.await, Ok("a"));
    }

    #[tokio::test]
    async fn test_discard_pending_get() {
        let queue = Queue::new();
        let discarded = queue.get();
        let kept = queue.get();
        discarded.discard();
        queue.put(7);
        assert_eq!(kept.await, Ok(7));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_discard_after_resolution_is_noop() {
        let queue = Queue::new();
        let get = queue.get();
        queue.put(1);
        get.discard();
        queue.put(2);
        assert_eq!(queue.get().await, Ok(2));
    }

    #[tokio::test]
    async fn test_discard_after_queue_dropped_is_noop() {
        let queue: Queue<u8> = Queue::new();
        let get = queue.get();
        drop(queue);
        get.discard();
    }

    #[tokio::test]
    async fn test_dropped_waiter_skipped() {
        let queue = Queue::new();
        drop(queue.get());
        let live = queue.get();
        queue.put(3);
        assert_eq!(live.await, Ok(3));
    }

    #[tokio::test]
    async fn test_close_fails_pending_gets() {
        let queue: Queue<u8> = Queue::new();
        let pending = queue.get();
        queue.close();
        assert_eq!(pending.await, Err(QueueError::Closed));
        assert!(!queue.put(1));
        assert_eq!(queue.get().await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_dropping_queue_fails_pending_get() {
        let queue: Queue<u8> = Queue::new();
        let pending = queue.get();
        drop(queue);
        assert_eq!(pending.await, Err(QueueError::Closed));
    }
}
