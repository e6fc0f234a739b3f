//! Bounded live-event channel with drop-oldest overflow.
//!
//! Sending never blocks. When the buffer is full, the oldest buffered
//! evictable item makes room for a new evictable item. Items that are not
//! evictable are always enqueued, even past capacity, so they are never lost.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tokio::sync::Notify;

/// Default number of pending items per subscriber.
pub const DEFAULT_CAPACITY: usize = 64;

/// Items that may be discarded under sustained overflow
pub trait Evictable {
    fn is_evictable(&self) -> bool;
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    senders: AtomicUsize,
    receiver_alive: AtomicBool,
    dropped: AtomicU64,
}

impl<T> Shared<T> {
    fn queue(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a bounded channel holding at most `capacity` evictable items.
pub fn channel<T: Evictable>(capacity: usize) -> (EventSender<T>, EventReceiver<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::new()),
        capacity: capacity.max(1),
        notify: Notify::new(),
        senders: AtomicUsize::new(1),
        receiver_alive: AtomicBool::new(true),
        dropped: AtomicU64::new(0),
    });

    (
        EventSender {
            shared: shared.clone(),
        },
        EventReceiver { shared },
    )
}

/// Returned by [`EventSender::send`] when the receiver has gone away
#[derive(Debug, PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event receiver dropped")
    }
}

impl<T: fmt::Debug> std::error::Error for SendError<T> {}

/// Sending half of a live-event channel
pub struct EventSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Evictable> EventSender<T> {
    /// Enqueue an item without blocking.
    ///
    /// Fails only when the receiver has been dropped.
    pub fn send(&self, item: T) -> Result<(), SendError<T>> {
        {
            let mut queue = self.shared.queue();
            // Checked under the lock so a racing receiver drop cannot strand the item.
            if !self.shared.receiver_alive.load(Ordering::Acquire) {
                return Err(SendError(item));
            }
            if item.is_evictable() && queue.len() >= self.shared.capacity {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                match queue.iter().position(|queued| queued.is_evictable()) {
                    Some(oldest) => {
                        queue.remove(oldest);
                    }
                    // Nothing evictable buffered: the incoming item loses.
                    None => return Ok(()),
                }
            }
            queue.push_back(item);
        }

        self.shared.notify.notify_one();
        Ok(())
    }
}

impl<T> EventSender<T> {
    pub fn is_closed(&self) -> bool {
        !self.shared.receiver_alive.load(Ordering::Acquire)
    }

    /// Number of items discarded by the overflow policy so far
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for EventSender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last sender gone; wake the receiver so it can observe closure.
            self.shared.notify.notify_one();
        }
    }
}

/// Receiving half of a live-event channel
pub struct EventReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> EventReceiver<T> {
    /// Wait for the next item.
    ///
    /// Returns `None` once every sender is gone and the buffer is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.shared.queue().pop_front() {
                return Some(item);
            }
            if self.shared.senders.load(Ordering::Acquire) == 0 {
                return self.shared.queue().pop_front();
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the next buffered item, if any, without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        self.shared.queue().pop_front()
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<T> {
        self.shared.queue().drain(..).collect()
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> impl Stream<Item = T> {
        futures::stream::unfold(self, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
    }
}

impl<T> Drop for EventReceiver<T> {
    fn drop(&mut self) {
        let mut queue = self.shared.queue();
        self.shared.receiver_alive.store(false, Ordering::Release);
        queue.clear();
    }
}

/// One bounded channel per subscriber; closed subscribers are pruned on publish.
pub struct EventFanout<T> {
    subscribers: Vec<EventSender<T>>,
    capacity: usize,
    /// Drops counted by subscribers that have since gone away
    retired_drops: u64,
}

impl<T: Evictable + Clone> EventFanout<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            capacity,
            retired_drops: 0,
        }
    }

    /// Add a subscriber.
    ///
    /// Only evictable items are bounded by the capacity. Boundary items are
    /// kept until read, so a subscriber that stays alive without reading
    /// grows by a few items per phase; drop the receiver when done.
    pub fn subscribe(&mut self) -> EventReceiver<T> {
        let (tx, rx) = channel(self.capacity);
        self.subscribers.push(tx);
        rx
    }

    /// Deliver a copy of `item` to every live subscriber
    pub fn publish(&mut self, item: &T) {
        let retired = &mut self.retired_drops;
        self.subscribers.retain(|tx| match tx.send(item.clone()) {
            Ok(()) => true,
            Err(_) => {
                *retired += tx.dropped();
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Total items evicted across all subscribers, past and present
    pub fn dropped(&self) -> u64 {
        self.retired_drops + self.subscribers.iter().map(|tx| tx.dropped()).sum::<u64>()
    }

    /// Disconnect every subscriber; their receivers drain and then end.
    pub fn close(&mut self) {
        for tx in self.subscribers.drain(..) {
            self.retired_drops += tx.dropped();
        }
    }
}
