//! Pull-driven subscription: historical catch-up spliced into the live feed.
//!
//! A subscription moves through three phases, all driven lazily from
//! `recv`:
//!
//! 1. **History** — batches of persisted blocks are read under the shared
//!    lock, which is released between batches so the writer keeps making
//!    progress.
//! 2. **Splice** — once the cursor is within one batch of the tip, a single
//!    critical section emits the remaining persisted blocks plus the liquid
//!    key block and its micro-blocks, and attaches to the recent-updates
//!    buffer before the lock is released.
//! 3. **Live** — replayed buffer events are discarded until the id of the
//!    last event the subscriber already saw; everything after flows
//!    through the bounded delivery channel.
//!
//! Because every write publishes to the buffer while holding the lock
//! exclusively, the attach point splits the event stream exactly: nothing
//! is duplicated, nothing is skipped.

use crate::error::{Result, UpdatesError};
use crate::repository::Shared;
use crate::subscriptions::buffer::BufferCursor;
use crate::types::{BlockId, Height, Update};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

enum Phase {
    Start {
        from: Height,
    },
    History {
        cursor: Height,
        /// Id of the last event emitted so far; the live hand-off syncs
        /// against it when a rollback empties the splice snapshot.
        last_id: Option<BlockId>,
    },
    Live {
        cursor: BufferCursor,
    },
    Closed,
}

enum LiveOutcome {
    Event(Option<Update>),
    Cancelled,
    TimedOut,
}

/// An ordered, cancellable stream of updates for one consumer.
///
/// Returned by `UpdatesRepository::stream`. Pull events with [`recv`] or
/// [`recv_timeout`], or treat the subscription as an iterator. `Ok(None)`
/// means the stream ended cleanly (cancellation); terminal failures such as
/// `SlowConsumer` or `OutOfRange` are returned once as `Err`.
///
/// [`recv`]: Subscription::recv
/// [`recv_timeout`]: Subscription::recv_timeout
pub struct Subscription {
    shared: Arc<Shared>,
    phase: Phase,
    /// Events produced by a history batch or the splice, not yet pulled.
    pending: VecDeque<Update>,
    /// Capacity of this subscriber's live delivery channel.
    buffer_size: usize,
    cancelled: Arc<AtomicBool>,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
}

/// Cancels a [`Subscription`] from any thread, waking a blocked `recv`.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    tx: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.tx.try_send(());
    }
}

impl Subscription {
    pub(crate) fn new(shared: Arc<Shared>, from: Height, buffer_size: usize) -> Self {
        let (cancel_tx, cancel_rx) = bounded(1);
        Self {
            shared,
            phase: Phase::Start { from },
            pending: VecDeque::new(),
            buffer_size,
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_tx,
            cancel_rx,
        }
    }

    /// Pull the next update, blocking while the stream is live and idle.
    ///
    /// `Ok(None)` after cancellation; `Err` is terminal.
    pub fn recv(&mut self) -> Result<Option<Update>> {
        self.drive(None)
    }

    /// Like [`recv`](Subscription::recv), but gives up with
    /// `UpdatesError::Timeout` when nothing arrives in time. The
    /// subscription stays usable after a timeout.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Update>> {
        self.drive(Some(Instant::now() + timeout))
    }

    /// A handle for cancelling this subscription from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: Arc::clone(&self.cancelled),
            tx: self.cancel_tx.clone(),
        }
    }

    fn drive(&mut self, deadline: Option<Instant>) -> Result<Option<Update>> {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                self.close();
                return Ok(None);
            }
            if let Some(update) = self.pending.pop_front() {
                return Ok(Some(update));
            }

            match std::mem::replace(&mut self.phase, Phase::Closed) {
                Phase::Start { from } => {
                    // stream(0) is stream(1); past the tip + 1 is an error.
                    let from = Height(from.0.max(1));
                    let liquid = self.shared.liquid.read();
                    let height = self.shared.height_locked(&liquid)?;
                    if from > height.next() {
                        return Err(UpdatesError::OutOfRange { from, height });
                    }
                    drop(liquid);
                    self.phase = Phase::History {
                        cursor: from,
                        last_id: None,
                    };
                }
                Phase::History { cursor, last_id } => {
                    self.phase = self.read_history(cursor, last_id)?;
                }
                Phase::Live { mut cursor } => {
                    if let Some(update) = cursor.replay.pop_front() {
                        self.phase = Phase::Live { cursor };
                        return Ok(Some(update));
                    }
                    match self.wait_live(&cursor, deadline) {
                        LiveOutcome::Event(Some(update)) => {
                            self.phase = Phase::Live { cursor };
                            return Ok(Some(update));
                        }
                        LiveOutcome::Event(None) => {
                            // Publisher dropped the channel: either this
                            // subscriber was severed, or the feed closed.
                            if cursor.is_severed() {
                                return Err(UpdatesError::SlowConsumer);
                            }
                            return Ok(None);
                        }
                        LiveOutcome::Cancelled => {
                            self.shared.buffer.detach(cursor.id);
                            return Ok(None);
                        }
                        LiveOutcome::TimedOut => {
                            self.phase = Phase::Live { cursor };
                            return Err(UpdatesError::Timeout);
                        }
                    }
                }
                Phase::Closed => return Ok(None),
            }
        }
    }

    /// One history step: a plain batch while the cursor is far from the
    /// tip, otherwise the splice into the live feed.
    fn read_history(&mut self, cursor: Height, last_id: Option<BlockId>) -> Result<Phase> {
        let config = &self.shared.config;
        let guard = self.shared.liquid.read();
        let liquid = guard.as_ref();
        let height = self.shared.height_locked(&guard)?;

        let remaining = height.0 as i64 - cursor.0 as i64;
        if remaining > config.batch_size as i64 {
            // More than a batch of persisted history left; read one batch
            // and release the lock so the writer can advance.
            let mut last = cursor;
            let mut batch = Vec::with_capacity(config.batch_size);
            for item in self.shared.storage.scan_from(cursor).take(config.batch_size) {
                let (h, bytes) = item?;
                batch.push(Update::Block(self.shared.codec.decode(&bytes)?));
                last = h;
            }
            drop(guard);
            let last_id = batch.last().map(|u| u.id()).or(last_id);
            self.pending.extend(batch);
            return Ok(Phase::History {
                cursor: last.next(),
                last_id,
            });
        }

        // Splice: remaining persisted blocks + the liquid tail, as one
        // atomic snapshot, with the buffer attached under the same lock.
        let mut events: Vec<Update> = Vec::new();
        let persisted_end = match liquid {
            Some(l) => Height(l.height().0 - 1),
            None => height,
        };
        if cursor <= persisted_end {
            for item in self.shared.storage.scan_from(cursor) {
                let (h, bytes) = item?;
                if h > persisted_end {
                    break;
                }
                events.push(Update::Block(self.shared.codec.decode(&bytes)?));
            }
        }
        if let Some(l) = liquid {
            if l.height() >= cursor {
                events.push(Update::Block(l.key_block.clone()));
                events.extend(l.micro_blocks.iter().cloned().map(Update::MicroBlock));
            }
        }

        // The id the replay is synced against: the last event this
        // subscriber has seen. Usually the snapshot tail; after a rollback
        // raced past the cursor the snapshot can be empty and the last
        // batch event takes over, so the truncated suffix and the rollback
        // event itself still reach the subscriber through the replay.
        let sync_id = events.last().map(|u| u.id()).or(last_id);

        let mut cursor_handle = self.shared.buffer.attach(self.buffer_size);
        drop(guard);

        // Drop everything replayed through the newest occurrence of the
        // sync id; only what comes after is news to this subscriber. Ids
        // recur in the buffer (a rollback's target id is by definition
        // one an earlier block or micro-block already used), so matching
        // an older occurrence would redeliver the rolled-back span. No
        // sync id means nothing was emitted at all (empty repository, or
        // a stream from height + 1), in which case the whole replay
        // predates the snapshot and only live events matter.
        match sync_id.and_then(|id| cursor_handle.replay.iter().rposition(|u| u.id() == id)) {
            Some(pos) => {
                cursor_handle.replay.drain(..=pos);
            }
            None => cursor_handle.replay.clear(),
        }

        self.pending.extend(events);
        Ok(Phase::Live {
            cursor: cursor_handle,
        })
    }

    fn wait_live(&self, cursor: &BufferCursor, deadline: Option<Instant>) -> LiveOutcome {
        match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                select! {
                    recv(cursor.receiver) -> msg => LiveOutcome::Event(msg.ok()),
                    recv(self.cancel_rx) -> _ => LiveOutcome::Cancelled,
                    default(remaining) => LiveOutcome::TimedOut,
                }
            }
            None => {
                select! {
                    recv(cursor.receiver) -> msg => LiveOutcome::Event(msg.ok()),
                    recv(self.cancel_rx) -> _ => LiveOutcome::Cancelled,
                }
            }
        }
    }

    fn close(&mut self) {
        if let Phase::Live { cursor } = &self.phase {
            self.shared.buffer.detach(cursor.id);
        }
        self.phase = Phase::Closed;
        self.pending.clear();
    }
}

impl Iterator for Subscription {
    type Item = Result<Update>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv().transpose()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
