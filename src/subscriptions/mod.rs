//! Live subscriptions over the updates repository.
//!
//! The subscription protocol splices three sources without duplicates,
//! gaps, or reordering while the writer keeps advancing:
//! - persisted history, read in batches under the shared lock,
//! - the in-memory liquid tail, snapshotted atomically,
//! - the recent-updates buffer carrying the live feed.
//!
//! Subscribers are isolated from each other and from the producer: a slow
//! consumer is severed with `SlowConsumer`, never blocking anyone else.
//!
//! # Example
//!
//! ```ignore
//! let mut subscription = repo.stream(Height(1));
//!
//! loop {
//!     match subscription.recv() {
//!         Ok(Some(Update::Block(block))) => println!("block {}", block.height),
//!         Ok(Some(update)) => println!("{update:?}"),
//!         Ok(None) => break, // cancelled
//!         Err(e) => return Err(e),
//!     }
//! }
//! ```

mod buffer;
mod stream;

pub(crate) use buffer::RecentUpdates;
pub use stream::{CancelHandle, Subscription};
