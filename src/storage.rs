//! Height-keyed persistent log of solidified blocks.
//!
//! A thin wrapper over a RocksDB database. Keys are fixed-width 4-byte
//! big-endian heights, so lexicographic key order equals numeric order and
//! forward iteration walks the chain in ascending height. Values are the
//! codec-encoded solidified blocks; micro-blocks never reach the log.

use crate::error::{Result, UpdatesError};
use crate::types::Height;
use rocksdb::{DBIteratorWithThreadMode, Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;

/// Upper bound for range deletes. Longer than any height key, so it
/// compares greater than every key the log can contain.
const KEY_SPACE_END: [u8; 5] = [0xFF; 5];

/// Persistent log of solidified blocks, ordered by height.
pub struct UpdatesLog {
    db: DB,
}

impl UpdatesLog {
    /// Open or create the log at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())?;
        Ok(Self { db })
    }

    /// Point lookup of the encoded block at `height`.
    pub fn get(&self, height: Height) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(Self::key(height))?)
    }

    /// Insert or overwrite the encoded block at `height`.
    pub fn put(&self, height: Height, bytes: &[u8]) -> Result<()> {
        Ok(self.db.put(Self::key(height), bytes)?)
    }

    /// Forward scan starting at `from`, in ascending height.
    ///
    /// The scan holds a RocksDB iterator; drop it as soon as the batch is
    /// read so it never pins resources across writer turns.
    pub fn scan_from(&self, from: Height) -> LogScan<'_> {
        let key = Self::key(from);
        LogScan {
            inner: self
                .db
                .iterator(IteratorMode::From(&key, Direction::Forward)),
        }
    }

    /// Delete every record at `from` and above.
    pub fn delete_from(&self, from: Height) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.delete_range(Self::key(from).as_slice(), KEY_SPACE_END.as_slice());
        Ok(self.db.write(batch)?)
    }

    /// The greatest persisted height, if any.
    pub fn max_height(&self) -> Result<Option<Height>> {
        match self.db.iterator(IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(Some(Self::decode_key(&key)?))
            }
            None => Ok(None),
        }
    }

    fn key(height: Height) -> [u8; 4] {
        height.0.to_be_bytes()
    }

    fn decode_key(key: &[u8]) -> Result<Height> {
        let arr: [u8; 4] = key
            .try_into()
            .map_err(|_| UpdatesError::CorruptRecord(format!("bad key length {}", key.len())))?;
        Ok(Height(u32::from_be_bytes(arr)))
    }
}

/// Forward iterator over `(height, encoded block)` pairs.
pub struct LogScan<'a> {
    inner: DBIteratorWithThreadMode<'a, DB>,
}

impl Iterator for LogScan<'_> {
    type Item = Result<(Height, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        Some(item.map_err(UpdatesError::from).and_then(|(key, value)| {
            let height = UpdatesLog::decode_key(&key)?;
            Ok((height, value.into_vec()))
        }))
    }
}
