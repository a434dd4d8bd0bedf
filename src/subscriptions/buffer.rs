//! Bounded multicast replay buffer of recent updates.
//!
//! Every committed write is published here while the writer still holds the
//! repository lock. The buffer keeps the last N events for replay and fans
//! live events out to bounded per-subscriber channels. A subscriber whose
//! channel fills up is severed on the spot; the producer never blocks.

use crate::types::Update;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Multicast queue of the most recent updates.
pub(crate) struct RecentUpdates {
    /// Max events retained for replay.
    capacity: usize,
    inner: Mutex<Inner>,
    /// Counter for generating subscriber IDs.
    next_id: AtomicU64,
}

struct Inner {
    /// The last `capacity` published events, oldest first.
    ring: VecDeque<Update>,
    /// Live delivery channels by subscriber ID.
    subscribers: HashMap<u64, Outbound>,
}

struct Outbound {
    sender: Sender<Update>,
    severed: Arc<AtomicBool>,
}

impl RecentUpdates {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                subscribers: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish one event: append it to the replay ring and deliver it to
    /// every attached subscriber. Subscribers with a full channel are
    /// severed and flagged so their stream terminates with `SlowConsumer`.
    pub(crate) fn publish(&self, update: Update) {
        let mut inner = self.inner.lock();

        if inner.ring.len() == self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(update.clone());

        let mut dead = Vec::new();
        for (id, out) in inner.subscribers.iter() {
            match out.sender.try_send(update.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    out.severed.store(true, Ordering::SeqCst);
                    log::warn!("severing subscriber {id}: outbound buffer full");
                    dead.push(*id);
                }
                Err(TrySendError::Disconnected(_)) => {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            inner.subscribers.remove(&id);
        }
    }

    /// Attach a new subscriber with a delivery channel of the given
    /// capacity.
    ///
    /// The returned cursor carries an owned snapshot of the replay ring.
    /// Callers attach while holding the repository's shared lock, which
    /// makes the split exact: everything published before the attach is in
    /// the replay, everything after arrives on the channel.
    pub(crate) fn attach(&self, channel_capacity: usize) -> BufferCursor {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(channel_capacity);
        let severed = Arc::new(AtomicBool::new(false));

        let mut inner = self.inner.lock();
        let replay: VecDeque<Update> = inner.ring.iter().cloned().collect();
        inner.subscribers.insert(
            id,
            Outbound {
                sender,
                severed: Arc::clone(&severed),
            },
        );

        BufferCursor {
            id,
            replay,
            receiver,
            severed,
        }
    }

    /// Remove a subscriber. Dropping the cursor's receiver has the same
    /// effect lazily (the next publish notices the disconnect); this makes
    /// it immediate.
    pub(crate) fn detach(&self, id: u64) {
        self.inner.lock().subscribers.remove(&id);
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// A subscriber's view of the buffer: the replayed tail plus the live
/// channel.
pub(crate) struct BufferCursor {
    pub(crate) id: u64,
    pub(crate) replay: VecDeque<Update>,
    pub(crate) receiver: Receiver<Update>,
    severed: Arc<AtomicBool>,
}

impl BufferCursor {
    /// Whether the publisher severed this subscriber for falling behind.
    pub(crate) fn is_severed(&self) -> bool {
        self.severed.load(Ordering::SeqCst)
    }
}
