//! Codec boundary for persisted blocks.
//!
//! The repository treats persisted values as opaque bytes; how a solidified
//! block maps to and from those bytes is the codec's business. The default
//! codec uses MessagePack, but anything stable can be injected through
//! [`UpdateCodec`].

use crate::error::Result;
use crate::types::BlockAppended;

/// Encoding and decoding of solidified blocks.
///
/// Implementations must be deterministic: the bytes written at a height are
/// compared against later reads (rollback target verification relies on
/// this).
pub trait UpdateCodec: Send + Sync {
    fn encode(&self, block: &BlockAppended) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<BlockAppended>;
}

/// Default MessagePack codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessagePackCodec;

impl UpdateCodec for MessagePackCodec {
    fn encode(&self, block: &BlockAppended) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(block)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<BlockAppended> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
