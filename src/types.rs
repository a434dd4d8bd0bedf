//! Core types for the updates repository.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height on the main chain.
///
/// Heights are positive and gap-free from 1; `Height(0)` stands for an
/// empty repository.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Height(pub u32);

impl fmt::Debug for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Height({})", self.0)
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Height {
    pub fn next(self) -> Self {
        Height(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Height(self.0 - 1))
        } else {
            None
        }
    }
}

/// Opaque 32-byte block identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(BlockId(arr))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A finalized key block advancing the chain by one height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAppended {
    pub height: Height,
    pub id: BlockId,
    pub payload: Vec<u8>,
}

/// A micro-block appended on top of the current tip key block.
///
/// Micro-blocks never advance the height; they extend the key block at
/// `parent_block_height` until the next key block folds them in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroBlockAppended {
    pub parent_block_height: Height,
    pub id: BlockId,
    pub payload: Vec<u8>,
}

/// Historical rollback: truncate the chain so that `to_height`/`to_id`
/// becomes the new tip key block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackCompleted {
    pub to_height: Height,
    pub to_id: BlockId,
}

/// Micro-block rollback: truncate the micro-block suffix of the liquid
/// state so that the block with `to_id` becomes the new tip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroBlockRollbackCompleted {
    pub to_id: BlockId,
}

/// Events delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    Block(BlockAppended),
    MicroBlock(MicroBlockAppended),
    Rollback(RollbackCompleted),
    MicroBlockRollback(MicroBlockRollbackCompleted),
}

impl Update {
    /// The block id this event refers to: the appended block or
    /// micro-block's own id, or the rollback target id.
    pub fn id(&self) -> BlockId {
        match self {
            Update::Block(b) => b.id,
            Update::MicroBlock(m) => m.id,
            Update::Rollback(r) => r.to_id,
            Update::MicroBlockRollback(mr) => mr.to_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_hex_roundtrip() {
        let id = BlockId([0xAB; 32]);
        let hex = id.to_hex();
        let parsed = BlockId::from_hex(&hex).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_block_id_rejects_short_hex() {
        assert!(BlockId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_height_navigation() {
        let h = Height(5);
        assert_eq!(h.next(), Height(6));
        assert_eq!(h.prev(), Some(Height(4)));
        assert_eq!(Height(0).prev(), None);
    }

    #[test]
    fn test_update_id_follows_variant() {
        let id = BlockId([1; 32]);
        let block = Update::Block(BlockAppended {
            height: Height(1),
            id,
            payload: vec![],
        });
        assert_eq!(block.id(), id);

        let rollback = Update::Rollback(RollbackCompleted {
            to_height: Height(1),
            to_id: id,
        });
        assert_eq!(rollback.id(), id);
    }
}
