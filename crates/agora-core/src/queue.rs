//! The synchronised inbox between the transport and the worker pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::message::Message;

/// Default bound on queued messages.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// A bounded multi-producer / multi-consumer FIFO of [`Message`]s.
///
/// Producers block (asynchronously) when the queue is full; consumers block
/// when it is empty. After [`terminate`](Inbox::terminate) producers are
/// refused and consumers drain whatever is left, then receive `None`.
///
/// FIFO order is preserved per producer; no ordering is guaranteed across
/// producers.
pub struct Inbox {
    queue: Mutex<VecDeque<Message>>,
    /// Counts filled slots; closed on terminate.
    items: Semaphore,
    /// Counts free capacity; closed on terminate.
    slots: Semaphore,
    terminated: AtomicBool,
}

impl Inbox {
    /// Creates an inbox bounded at `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            items: Semaphore::new(0),
            slots: Semaphore::new(capacity),
            terminated: AtomicBool::new(false),
        }
    }

    /// Enqueues a message, waiting for a free slot if the inbox is full.
    ///
    /// Returns `false` if the inbox has been terminated and the message was
    /// refused.
    pub async fn enqueue(&self, message: Message) -> bool {
        match self.slots.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.queue.lock().push_back(message);
                self.items.add_permits(1);
                true
            }
            Err(_) => false,
        }
    }

    /// Dequeues the next message, waiting until one is available.
    ///
    /// Returns `None` only once the inbox has been terminated and drained.
    pub async fn dequeue(&self) -> Option<Message> {
        match self.items.acquire().await {
            Ok(permit) => {
                permit.forget();
                let message = self.queue.lock().pop_front();
                if message.is_some() {
                    self.slots.add_permits(1);
                }
                message
            }
            // Terminated: drain the leftovers, then report exhaustion.
            Err(_) => self.queue.lock().pop_front(),
        }
    }

    /// Signals termination. Idempotent; wakes every blocked producer and
    /// consumer.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.items.close();
        self.slots.close();
    }

    /// Whether [`terminate`](Inbox::terminate) has been called.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new(DEFAULT_INBOX_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn msg(n: usize) -> Message {
        Message::new(format!("margot/t{n}"), format!("payload {n}"))
    }

    #[tokio::test]
    async fn preserves_fifo_order_for_a_single_producer() {
        let inbox = Inbox::new(8);
        for n in 0..5 {
            assert!(inbox.enqueue(msg(n)).await);
        }
        for n in 0..5 {
            assert_eq!(inbox.dequeue().await, Some(msg(n)));
        }
    }

    #[tokio::test]
    async fn terminate_drains_then_reports_exhaustion() {
        let inbox = Inbox::new(8);
        assert!(inbox.enqueue(msg(0)).await);
        assert!(inbox.enqueue(msg(1)).await);

        inbox.terminate();
        inbox.terminate(); // idempotent

        assert!(!inbox.enqueue(msg(2)).await);
        assert_eq!(inbox.dequeue().await, Some(msg(0)));
        assert_eq!(inbox.dequeue().await, Some(msg(1)));
        assert_eq!(inbox.dequeue().await, None);
    }

    #[tokio::test]
    async fn terminate_wakes_blocked_consumers() {
        let inbox = Arc::new(Inbox::new(4));
        let consumer = {
            let inbox = Arc::clone(&inbox);
            tokio::spawn(async move { inbox.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        inbox.terminate();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn producers_block_on_a_full_queue() {
        let inbox = Arc::new(Inbox::new(1));
        assert!(inbox.enqueue(msg(0)).await);

        let producer = {
            let inbox = Arc::clone(&inbox);
            tokio::spawn(async move { inbox.enqueue(msg(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(inbox.dequeue().await, Some(msg(0)));
        assert!(producer.await.unwrap());
        assert_eq!(inbox.dequeue().await, Some(msg(1)));
    }

    #[tokio::test]
    async fn many_producers_many_consumers_lose_nothing() {
        let inbox = Arc::new(Inbox::new(16));
        let mut producers = Vec::new();
        for p in 0..4 {
            let inbox = Arc::clone(&inbox);
            producers.push(tokio::spawn(async move {
                for n in 0..50 {
                    assert!(inbox.enqueue(msg(p * 1000 + n)).await);
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let inbox = Arc::clone(&inbox);
            consumers.push(tokio::spawn(async move {
                let mut seen = 0usize;
                while inbox.dequeue().await.is_some() {
                    seen += 1;
                }
                seen
            }));
        }

        for p in producers {
            p.await.unwrap();
        }
        // Give consumers a chance to drain before termination.
        while !inbox.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        inbox.terminate();

        let mut total = 0;
        for c in consumers {
            total += c.await.unwrap();
        }
        assert_eq!(total, 200);
    }
}
