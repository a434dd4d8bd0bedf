//! # Blockchain Updates
//!
//! A durable, replayable feed of blockchain update events.
//!
//! ## Core Concepts
//!
//! - **Key blocks**: finalized blocks persisted at gap-free heights
//! - **Liquid state**: the in-memory tip key block plus its micro-blocks,
//!   solidified into storage when the next key block arrives
//! - **Rollbacks**: truncation of persisted history or of the liquid
//!   micro-block suffix
//! - **Subscriptions**: resumable catch-up from any height, spliced into
//!   the live feed without duplicates or gaps
//!
//! ## Example
//!
//! ```ignore
//! use blockchain_updates::{
//!     BlockAppended, Height, RepositoryConfig, UpdatesRepository,
//! };
//!
//! let repo = UpdatesRepository::open(RepositoryConfig {
//!     path: "./updates".into(),
//!     ..Default::default()
//! })?;
//!
//! // Write path: a single producer appends in chain order.
//! repo.append_block(BlockAppended { height: Height(1), id, payload })?;
//!
//! // Read path.
//! let tip = repo.height()?;
//! let genesis = repo.update_for_height(Height(1))?;
//!
//! // Subscribe from the beginning and follow the live feed.
//! let mut subscription = repo.stream(Height(1));
//! while let Some(update) = subscription.recv()? {
//!     println!("{update:?}");
//! }
//! ```

pub mod codec;
pub mod error;
pub mod liquid;
pub mod repository;
pub mod storage;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use codec::{MessagePackCodec, UpdateCodec};
pub use error::{Result, UpdatesError};
pub use liquid::LiquidState;
pub use repository::{RepositoryConfig, UpdatesRepository};
pub use storage::UpdatesLog;
pub use subscriptions::{CancelHandle, Subscription};
pub use types::{
    BlockAppended, BlockId, Height, MicroBlockAppended, MicroBlockRollbackCompleted,
    RollbackCompleted, Update,
};
