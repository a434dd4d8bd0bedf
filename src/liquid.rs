//! In-memory liquid tip: the current key block plus its micro-block suffix.
//!
//! The liquid state is the only part of the chain that is not yet durable.
//! Appending the next key block solidifies it: the micro-block suffix is
//! folded into the key block and the result is persisted at the key block's
//! height. Solidification is a pure function so the write path is testable
//! without the codec or the log.

use crate::types::{BlockAppended, BlockId, Height, MicroBlockAppended};

/// The unsolidified chain tip.
///
/// Absent before the first block is appended; a present value with an empty
/// micro-block list is a bare key block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiquidState {
    pub key_block: BlockAppended,
    pub micro_blocks: Vec<MicroBlockAppended>,
}

impl LiquidState {
    /// A fresh liquid state holding only `key_block`.
    pub fn new(key_block: BlockAppended) -> Self {
        Self {
            key_block,
            micro_blocks: Vec::new(),
        }
    }

    /// Height of the liquid key block.
    pub fn height(&self) -> Height {
        self.key_block.height
    }

    /// Id of the newest element: the last micro-block, or the key block
    /// when no micro-blocks have been appended.
    pub fn tip_id(&self) -> BlockId {
        self.micro_blocks
            .last()
            .map(|m| m.id)
            .unwrap_or(self.key_block.id)
    }

    /// Append a micro-block to the suffix.
    pub fn append_micro(&mut self, micro: MicroBlockAppended) {
        self.micro_blocks.push(micro);
    }

    /// Truncate the micro-block suffix so that the element with `id`
    /// becomes the tip. Returns `false` when `id` matches neither the key
    /// block nor any micro-block; the state is left unchanged in that case.
    pub fn truncate_to(&mut self, id: BlockId) -> bool {
        if id == self.key_block.id {
            self.micro_blocks.clear();
            return true;
        }
        if let Some(pos) = self.micro_blocks.iter().position(|m| m.id == id) {
            self.micro_blocks.truncate(pos + 1);
            return true;
        }
        false
    }

    /// Fold the micro-block suffix into the key block.
    ///
    /// The result keeps the key block's height and id; micro-block payloads
    /// are appended to the key block payload in order. Deterministic, and
    /// the identity function for a micro-less state.
    pub fn solidify(&self) -> BlockAppended {
        if self.micro_blocks.is_empty() {
            return self.key_block.clone();
        }

        let extra: usize = self.micro_blocks.iter().map(|m| m.payload.len()).sum();
        let mut payload = Vec::with_capacity(self.key_block.payload.len() + extra);
        payload.extend_from_slice(&self.key_block.payload);
        for micro in &self.micro_blocks {
            payload.extend_from_slice(&micro.payload);
        }

        BlockAppended {
            height: self.key_block.height,
            id: self.key_block.id,
            payload,
        }
    }
}
