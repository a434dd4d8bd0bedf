//! The updates repository: write path, read path, and subscriptions.

use crate::codec::{MessagePackCodec, UpdateCodec};
use crate::error::{Result, UpdatesError};
use crate::liquid::LiquidState;
use crate::storage::UpdatesLog;
use crate::subscriptions::{RecentUpdates, Subscription};
use crate::types::{
    BlockAppended, Height, MicroBlockAppended, MicroBlockRollbackCompleted, RollbackCompleted,
    Update,
};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

/// Repository configuration.
#[derive(Clone, Debug)]
pub struct RepositoryConfig {
    /// Base path for the persistent log.
    pub path: PathBuf,

    /// Replay capacity of the recent-updates buffer.
    /// Default: 1024
    pub recent_updates_buffer_size: usize,

    /// Persisted blocks read per catch-up batch.
    /// Default: 10
    pub batch_size: usize,

    /// Max in-flight events per subscriber before severance.
    /// Default: 1000
    pub back_pressure_buffer_size: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./updates"),
            recent_updates_buffer_size: 1024,
            batch_size: 10,
            back_pressure_buffer_size: 1000,
        }
    }
}

/// State shared between the repository handle and its subscriptions.
///
/// The `liquid` lock is the writer/reader serialization point: writers hold
/// it exclusively across the whole of (state mutation, durable log write,
/// buffer publish); readers and catch-up scans hold it shared. The log and
/// buffer are only touched while the lock is held in the appropriate mode.
pub(crate) struct Shared {
    pub(crate) config: RepositoryConfig,
    pub(crate) storage: UpdatesLog,
    pub(crate) codec: Box<dyn UpdateCodec>,
    pub(crate) liquid: RwLock<Option<LiquidState>>,
    pub(crate) buffer: RecentUpdates,
}

impl Shared {
    /// Current chain height under an already-held lock: the liquid key
    /// block's height, else the greatest persisted height, else 0.
    pub(crate) fn height_locked(&self, liquid: &Option<LiquidState>) -> Result<Height> {
        match liquid {
            Some(l) => Ok(l.height()),
            None => Ok(self.storage.max_height()?.unwrap_or(Height(0))),
        }
    }
}

/// Durable, replayable repository of blockchain update events.
///
/// A single producer feeds the four write operations; any number of
/// readers and subscribers consume concurrently. The handle is cheap to
/// clone and shares one underlying repository.
#[derive(Clone)]
pub struct UpdatesRepository {
    shared: Arc<Shared>,
}

impl UpdatesRepository {
    /// Open or create a repository with the default MessagePack codec.
    pub fn open(config: RepositoryConfig) -> Result<Self> {
        Self::with_codec(config, Box::new(MessagePackCodec))
    }

    /// Open or create a repository with an injected codec.
    pub fn with_codec(config: RepositoryConfig, codec: Box<dyn UpdateCodec>) -> Result<Self> {
        let storage = UpdatesLog::open(&config.path)?;
        let buffer = RecentUpdates::new(config.recent_updates_buffer_size);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                storage,
                codec,
                liquid: RwLock::new(None),
                buffer,
            }),
        })
    }

    // --- Write path ---

    /// Append the next key block.
    ///
    /// Solidifies the current liquid state into the log, then installs
    /// `block` as the new liquid key block. The expected height is the
    /// liquid height + 1 (or the persisted tip + 1, or 1 on an empty
    /// repository); anything else is `OutOfOrder`. On a storage or codec
    /// failure the in-memory state is not advanced.
    pub fn append_block(&self, block: BlockAppended) -> Result<()> {
        let shared = &self.shared;
        let mut liquid = shared.liquid.write();

        let expected = match liquid.as_ref() {
            Some(l) => l.height().next(),
            None => shared
                .storage
                .max_height()?
                .map(Height::next)
                .unwrap_or(Height(1)),
        };
        if block.height != expected {
            return Err(UpdatesError::OutOfOrder {
                expected,
                got: block.height,
            });
        }

        if let Some(l) = liquid.as_ref() {
            let solid = l.solidify();
            let bytes = shared.codec.encode(&solid)?;
            shared.storage.put(solid.height, &bytes)?;
        }

        log::debug!("appended key block {} at height {}", block.id, block.height);
        *liquid = Some(LiquidState::new(block.clone()));
        shared.buffer.publish(Update::Block(block));
        Ok(())
    }

    /// Append a micro-block on top of the current liquid key block.
    pub fn append_micro_block(&self, micro: MicroBlockAppended) -> Result<()> {
        let shared = &self.shared;
        let mut liquid = shared.liquid.write();

        let state = liquid.as_mut().ok_or(UpdatesError::NoLiquidKeyBlock)?;
        if micro.parent_block_height != state.height() {
            return Err(UpdatesError::OutOfOrder {
                expected: state.height(),
                got: micro.parent_block_height,
            });
        }

        state.append_micro(micro.clone());
        shared.buffer.publish(Update::MicroBlock(micro));
        Ok(())
    }

    /// Historical rollback: truncate the chain so that
    /// `rollback.to_height` becomes the tip key block.
    ///
    /// The persisted record at the target height is verified against
    /// `rollback.to_id` before anything is mutated; a missing record or a
    /// mismatched id is `InconsistentRollback` with the repository left
    /// untouched. The target block stays in the log and is installed as
    /// the liquid key block, which makes the operation idempotent.
    pub fn rollback(&self, rollback: RollbackCompleted) -> Result<()> {
        let shared = &self.shared;
        let mut liquid = shared.liquid.write();

        let height = shared.height_locked(&liquid)?;
        if rollback.to_height == Height(0) || rollback.to_height > height {
            return Err(UpdatesError::OutOfOrder {
                expected: height,
                got: rollback.to_height,
            });
        }

        let bytes = shared.storage.get(rollback.to_height)?.ok_or(
            UpdatesError::InconsistentRollback {
                height: rollback.to_height,
                target: rollback.to_id,
            },
        )?;
        let block = shared.codec.decode(&bytes)?;
        if block.id != rollback.to_id {
            return Err(UpdatesError::InconsistentRollback {
                height: rollback.to_height,
                target: rollback.to_id,
            });
        }

        shared.storage.delete_from(rollback.to_height.next())?;
        log::warn!(
            "rolled back from height {} to height {} ({})",
            height,
            rollback.to_height,
            rollback.to_id
        );
        *liquid = Some(LiquidState::new(block));
        shared.buffer.publish(Update::Rollback(rollback));
        Ok(())
    }

    /// Micro-block rollback: truncate the liquid micro-block suffix so
    /// that the block with `rollback.to_id` becomes the tip.
    pub fn rollback_micro_block(&self, rollback: MicroBlockRollbackCompleted) -> Result<()> {
        let shared = &self.shared;
        let mut liquid = shared.liquid.write();

        let state = liquid.as_mut().ok_or(UpdatesError::NoLiquidKeyBlock)?;
        if !state.truncate_to(rollback.to_id) {
            return Err(UpdatesError::InconsistentRollback {
                height: state.height(),
                target: rollback.to_id,
            });
        }

        log::debug!("rolled back micro-blocks to {}", rollback.to_id);
        shared.buffer.publish(Update::MicroBlockRollback(rollback));
        Ok(())
    }

    // --- Read path ---

    /// Current chain height; `Height(0)` for an empty repository.
    pub fn height(&self) -> Result<Height> {
        let liquid = self.shared.liquid.read();
        self.shared.height_locked(&liquid)
    }

    /// The solidified block at `height`: the solidified liquid state at
    /// its own height, a decoded log record below it, `None` above it.
    pub fn update_for_height(&self, height: Height) -> Result<Option<BlockAppended>> {
        let liquid = self.shared.liquid.read();

        if let Some(l) = liquid.as_ref() {
            if height == l.height() {
                return Ok(Some(l.solidify()));
            }
            if height > l.height() {
                return Ok(None);
            }
        }

        match self.shared.storage.get(height)? {
            Some(bytes) => Ok(Some(self.shared.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The inclusive sequence of solidified blocks in `[from, to]`.
    ///
    /// Equivalent to draining `stream(from)` for the `BlockAppended` items
    /// and ignoring micro-blocks and rollbacks, except that a range past
    /// the current tip fails synchronously with `OutOfRange` instead of
    /// waiting for blocks that do not exist yet.
    pub fn updates_range(&self, from: Height, to: Height) -> Result<Vec<BlockAppended>> {
        let from = Height(from.0.max(1));
        let liquid = self.shared.liquid.read();

        let height = self.shared.height_locked(&liquid)?;
        if from > to || to > height {
            return Err(UpdatesError::OutOfRange { from, height });
        }

        let mut blocks = Vec::with_capacity((to.0 - from.0 + 1) as usize);
        for item in self.shared.storage.scan_from(from) {
            let (h, bytes) = item?;
            if h > to {
                break;
            }
            blocks.push(self.shared.codec.decode(&bytes)?);
        }
        if let Some(l) = liquid.as_ref() {
            // The stream emits the liquid tip as a bare key block (micro
            // events travel separately), so the range does too.
            if l.height() >= from && l.height() <= to {
                blocks.push(l.key_block.clone());
            }
        }
        Ok(blocks)
    }

    /// Subscribe from `from` onwards: persisted history, then the liquid
    /// tail, then the live feed, in order and without duplicates.
    ///
    /// Validation is lazy: an out-of-range start surfaces as a terminal
    /// error on the first `recv`. `stream(Height(0))` is normalized to
    /// `stream(Height(1))`.
    pub fn stream(&self, from: Height) -> Subscription {
        self.stream_with_buffer(from, self.shared.config.back_pressure_buffer_size)
    }

    /// Like [`stream`](Self::stream), with a per-subscriber override of
    /// the back-pressure buffer size.
    pub fn stream_with_buffer(&self, from: Height, buffer_size: usize) -> Subscription {
        Subscription::new(Arc::clone(&self.shared), from, buffer_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockId;
    use tempfile::TempDir;

    fn test_repo(dir: &TempDir) -> UpdatesRepository {
        UpdatesRepository::open(RepositoryConfig {
            path: dir.path().join("updates"),
            ..Default::default()
        })
        .unwrap()
    }

    fn block(height: u32, seed: u8) -> BlockAppended {
        BlockAppended {
            height: Height(height),
            id: BlockId([seed; 32]),
            payload: vec![seed],
        }
    }

    fn micro(parent: u32, seed: u8) -> MicroBlockAppended {
        MicroBlockAppended {
            parent_block_height: Height(parent),
            id: BlockId([seed; 32]),
            payload: vec![seed],
        }
    }

    #[test]
    fn test_append_first_block() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        assert_eq!(repo.height().unwrap(), Height(0));
        repo.append_block(block(1, 0xA1)).unwrap();
        assert_eq!(repo.height().unwrap(), Height(1));
    }

    #[test]
    fn test_append_block_out_of_order() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        let err = repo.append_block(block(3, 0xA1)).unwrap_err();
        assert!(matches!(
            err,
            UpdatesError::OutOfOrder {
                expected: Height(1),
                got: Height(3)
            }
        ));

        repo.append_block(block(1, 0xA1)).unwrap();
        let err = repo.append_block(block(1, 0xA2)).unwrap_err();
        assert!(matches!(err, UpdatesError::OutOfOrder { .. }));
        assert_eq!(repo.height().unwrap(), Height(1));
    }

    #[test]
    fn test_micro_block_requires_liquid_state() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        let err = repo.append_micro_block(micro(1, 0xB1)).unwrap_err();
        assert!(matches!(err, UpdatesError::NoLiquidKeyBlock));
    }

    #[test]
    fn test_micro_block_wrong_parent() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        repo.append_block(block(1, 0xA1)).unwrap();
        let err = repo.append_micro_block(micro(2, 0xB1)).unwrap_err();
        assert!(matches!(
            err,
            UpdatesError::OutOfOrder {
                expected: Height(1),
                got: Height(2)
            }
        ));
    }

    #[test]
    fn test_solidification_on_next_key_block() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        repo.append_block(block(1, 0xA1)).unwrap();
        repo.append_micro_block(micro(1, 0xB1)).unwrap();
        repo.append_micro_block(micro(1, 0xB2)).unwrap();
        repo.append_block(block(2, 0xA2)).unwrap();

        // Height 1 is now persisted with the micro payloads folded in and
        // the key block's id preserved.
        let solid = repo.update_for_height(Height(1)).unwrap().unwrap();
        assert_eq!(solid.id, BlockId([0xA1; 32]));
        assert_eq!(solid.payload, vec![0xA1, 0xB1, 0xB2]);

        // Height 2 is the liquid state.
        let tip = repo.update_for_height(Height(2)).unwrap().unwrap();
        assert_eq!(tip, block(2, 0xA2));

        assert!(repo.update_for_height(Height(3)).unwrap().is_none());
    }

    #[test]
    fn test_update_for_height_matches_liquid_solidify() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        repo.append_block(block(1, 0xA1)).unwrap();
        let bare = repo.update_for_height(Height(1)).unwrap().unwrap();
        assert_eq!(bare, block(1, 0xA1));

        repo.append_micro_block(micro(1, 0xB1)).unwrap();
        let with_micro = repo.update_for_height(Height(1)).unwrap().unwrap();
        assert_eq!(with_micro.payload, vec![0xA1, 0xB1]);
    }

    #[test]
    fn test_rollback_to_persisted_height() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        repo.append_block(block(1, 0xA1)).unwrap();
        repo.append_block(block(2, 0xA2)).unwrap();
        repo.append_block(block(3, 0xA3)).unwrap();

        repo.rollback(RollbackCompleted {
            to_height: Height(1),
            to_id: BlockId([0xA1; 32]),
        })
        .unwrap();

        assert_eq!(repo.height().unwrap(), Height(1));
        assert!(repo.update_for_height(Height(2)).unwrap().is_none());

        // The target block became the liquid key block; micro-blocks and
        // further key blocks stack on it as usual.
        repo.append_micro_block(micro(1, 0xB1)).unwrap();
        repo.append_block(block(2, 0xC2)).unwrap();
        assert_eq!(repo.height().unwrap(), Height(2));
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        repo.append_block(block(1, 0xA1)).unwrap();
        repo.append_block(block(2, 0xA2)).unwrap();
        repo.append_block(block(3, 0xA3)).unwrap();

        let rollback = RollbackCompleted {
            to_height: Height(1),
            to_id: BlockId([0xA1; 32]),
        };
        repo.rollback(rollback.clone()).unwrap();
        let first = repo.update_for_height(Height(1)).unwrap();

        repo.rollback(rollback).unwrap();
        assert_eq!(repo.height().unwrap(), Height(1));
        assert_eq!(repo.update_for_height(Height(1)).unwrap(), first);
    }

    #[test]
    fn test_rollback_id_mismatch_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        repo.append_block(block(1, 0xA1)).unwrap();
        repo.append_block(block(2, 0xA2)).unwrap();

        let err = repo
            .rollback(RollbackCompleted {
                to_height: Height(1),
                to_id: BlockId([0xEE; 32]),
            })
            .unwrap_err();
        assert!(matches!(err, UpdatesError::InconsistentRollback { .. }));

        assert_eq!(repo.height().unwrap(), Height(2));
        assert!(repo.update_for_height(Height(1)).unwrap().is_some());
    }

    #[test]
    fn test_rollback_past_tip_is_out_of_order() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        repo.append_block(block(1, 0xA1)).unwrap();
        let err = repo
            .rollback(RollbackCompleted {
                to_height: Height(5),
                to_id: BlockId([0xA1; 32]),
            })
            .unwrap_err();
        assert!(matches!(err, UpdatesError::OutOfOrder { .. }));
    }

    #[test]
    fn test_micro_rollback_truncates_suffix() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        repo.append_block(block(1, 0xA1)).unwrap();
        repo.append_micro_block(micro(1, 0xB1)).unwrap();
        repo.append_micro_block(micro(1, 0xB2)).unwrap();

        repo.rollback_micro_block(MicroBlockRollbackCompleted {
            to_id: BlockId([0xB1; 32]),
        })
        .unwrap();

        let solid = repo.update_for_height(Height(1)).unwrap().unwrap();
        assert_eq!(solid.payload, vec![0xA1, 0xB1]);

        // Rolling back to the key block itself drops the whole suffix.
        repo.rollback_micro_block(MicroBlockRollbackCompleted {
            to_id: BlockId([0xA1; 32]),
        })
        .unwrap();
        let solid = repo.update_for_height(Height(1)).unwrap().unwrap();
        assert_eq!(solid.payload, vec![0xA1]);
    }

    #[test]
    fn test_micro_rollback_unknown_id() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        repo.append_block(block(1, 0xA1)).unwrap();
        repo.append_micro_block(micro(1, 0xB1)).unwrap();

        let err = repo
            .rollback_micro_block(MicroBlockRollbackCompleted {
                to_id: BlockId([0xEE; 32]),
            })
            .unwrap_err();
        assert!(matches!(err, UpdatesError::InconsistentRollback { .. }));

        // Suffix intact.
        let solid = repo.update_for_height(Height(1)).unwrap().unwrap();
        assert_eq!(solid.payload, vec![0xA1, 0xB1]);
    }

    #[test]
    fn test_updates_range() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        for h in 1..=5 {
            repo.append_block(block(h, h as u8)).unwrap();
        }

        let blocks = repo.updates_range(Height(2), Height(4)).unwrap();
        let heights: Vec<Height> = blocks.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![Height(2), Height(3), Height(4)]);

        // The range may include the liquid tip.
        let blocks = repo.updates_range(Height(0), Height(5)).unwrap();
        assert_eq!(blocks.len(), 5);
        assert_eq!(blocks.last().unwrap().height, Height(5));
    }

    #[test]
    fn test_updates_range_past_tip() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        repo.append_block(block(1, 0xA1)).unwrap();
        let err = repo.updates_range(Height(1), Height(3)).unwrap_err();
        assert!(matches!(err, UpdatesError::OutOfRange { .. }));

        let err = repo.updates_range(Height(3), Height(1)).unwrap_err();
        assert!(matches!(err, UpdatesError::OutOfRange { .. }));
    }

    #[test]
    fn test_reopen_resumes_at_persisted_height() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("updates");
        let config = RepositoryConfig {
            path: path.clone(),
            ..Default::default()
        };

        {
            let repo = UpdatesRepository::open(config.clone()).unwrap();
            repo.append_block(block(1, 0xA1)).unwrap();
            repo.append_block(block(2, 0xA2)).unwrap();
            repo.append_block(block(3, 0xA3)).unwrap();
        }

        let repo = UpdatesRepository::open(config).unwrap();
        // Heights 1 and 2 were solidified; the liquid tip at 3 was not.
        assert_eq!(repo.height().unwrap(), Height(2));
        assert!(repo.update_for_height(Height(2)).unwrap().is_some());

        // Appends continue from the persisted tip.
        let err = repo.append_block(block(5, 0xA5)).unwrap_err();
        assert!(matches!(
            err,
            UpdatesError::OutOfOrder {
                expected: Height(3),
                got: Height(5)
            }
        ));
        repo.append_block(block(3, 0xA3)).unwrap();
        assert_eq!(repo.height().unwrap(), Height(3));
    }
}
