//! Storage state: the fixed block length, the append watermark (`nextblk`),
//! and the operations the dispatcher's workers drive against the KV
//! backend and the deletion controller.
//!
//! The distilled spec treats storage as a thin collaborator of the
//! dispatcher rather than detailing it as its own component; this module's
//! shape (a small struct constructed once at startup, loading its recovery
//! state from the backend before serving any request) follows the
//! teacher's small state-holding structs such as `PageServerConf`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::deletion::DeletionHandle;
use crate::error::StorageError;
use crate::kv::KvQueueHandle;
use crate::objmap::{objmap, LAST_BLK_KEY};

/// Priority for ordinary client-driven KV traffic, higher (numerically
/// lower) than the deletion controller's background housekeeping.
const CLIENT_PRIO: i32 = 0;

pub struct StorageState {
    kv: KvQueueHandle,
    deletion: DeletionHandle,
    blocklen: u32,
    /// Blocks in `[0, nextblk)` exist. Only the writer worker advances
    /// this; readers only ever load it.
    nextblk: AtomicU64,
}

impl StorageState {
    /// Recover `nextblk` from the `LastBlk` hint left by the previous run,
    /// defaulting to an empty store if none is present.
    pub async fn load(
        kv: KvQueueHandle,
        deletion: DeletionHandle,
        blocklen: u32,
    ) -> Result<Self, StorageError> {
        let nextblk = match kv.get(LAST_BLK_KEY, CLIENT_PRIO).await? {
            Some(bytes) if bytes.len() == 8 => u64::from_be_bytes(bytes.try_into().unwrap()),
            Some(_) | None => 0,
        };

        Ok(StorageState {
            kv,
            deletion,
            blocklen,
            nextblk: AtomicU64::new(nextblk),
        })
    }

    pub fn blocklen(&self) -> u32 {
        self.blocklen
    }

    /// The current `(blocklen, nextblk)` pair returned for a PARAMS
    /// request; computed fresh each call rather than cached, since
    /// `nextblk` moves with every successful append.
    pub fn params(&self) -> (u32, u64) {
        (self.blocklen, self.nextblk.load(Ordering::Acquire))
    }

    /// Fetch block `blknum`. Returns `Ok(None)` both for a block number at
    /// or beyond `nextblk` and for one that has since been freed and
    /// deleted from the backend — the wire protocol does not distinguish
    /// the two.
    pub async fn get(&self, blknum: u64) -> Result<Option<Vec<u8>>, StorageError> {
        if blknum >= self.nextblk.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(self.kv.get(objmap(blknum), CLIENT_PRIO).await?)
    }

    /// Append `count` blocks of `data` (already validated by the wire codec
    /// to be exactly `count * blocklen` bytes) starting at the current
    /// `nextblk`, persist the new `LastBlk` hint, and return the new
    /// `nextblk`.
    ///
    /// Only ever called from the dispatcher's single writer worker, so no
    /// additional synchronization is needed around the read-then-advance
    /// of `nextblk`.
    pub async fn append(&self, count: u64, data: &[u8]) -> Result<u64, StorageError> {
        let start = self.nextblk.load(Ordering::Acquire);
        let blocklen = self.blocklen as usize;

        for i in 0..count {
            let blk = start + i;
            let offset = i as usize * blocklen;
            let chunk = &data[offset..offset + blocklen];
            self.kv.put(objmap(blk), chunk.to_vec(), CLIENT_PRIO).await?;
        }

        let new_nextblk = start + count;
        self.kv
            .put(LAST_BLK_KEY, new_nextblk.to_be_bytes().to_vec(), CLIENT_PRIO)
            .await?;
        self.nextblk.store(new_nextblk, Ordering::Release);
        Ok(new_nextblk)
    }

    /// Declare blocks `[0, n)` free; the deletion controller catches up
    /// asynchronously.
    pub fn free(&self, n: u64) {
        self.deletion.update_deleted_to(n);
    }
}
