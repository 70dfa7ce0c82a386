//! The deletion controller: advances a durable watermark (`DeletedTo`) over
//! blocks that the dispatcher has declared free, issuing one `DELETE`
//! against the KV backend at a time and persisting the watermark every 256
//! completed deletions.
//!
//! Grounded directly on `lbs-dynamodb/deleteto.c`: the `N`/`M`/`npending`
//! fields, the `poke()` reentrant scheduler, and the rule that `DeletedTo`
//! is only ever written *after* the deletes it covers have completed
//! (crashing between a delete and the next watermark write just redoes up
//! to 256 deletes against an already-deleted key, which DynamoDB's
//! `DeleteItem` treats as a no-op). The split between a cloneable
//! `DeletionHandle` and a single actor task owning all mutable state
//! mirrors `deletion_queue.rs`'s `DeletionQueueClient`/
//! `FrontendQueueWorker` pair.

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::KvError;
use crate::kv::KvQueueHandle;
use crate::metrics;
use crate::objmap::{objmap, DELETED_TO_KEY};

/// Batch size between `DeletedTo` watermark writes, unchanged from the
/// original: up to 256 redundant deletes may be replayed after a crash,
/// bounding recovery cost without fsyncing the watermark on every delete.
const DELETE_BATCH: u64 = 256;

enum Command {
    /// Advance the deletion target: everything below `n` may now be
    /// deleted from the KV backend.
    UpdateDeletedTo(u64),
    Stop(oneshot::Sender<()>),
}

enum Internal {
    DeleteDone(Result<(), KvError>),
    PersistDone(Result<(), KvError>),
}

/// A cloneable handle to the running deletion controller.
#[derive(Clone)]
pub struct DeletionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl DeletionHandle {
    /// Declare that blocks below `n` are free and may be deleted from the
    /// KV backend once durable. Non-blocking; the controller catches up
    /// asynchronously.
    pub fn update_deleted_to(&self, n: u64) {
        let _ = self.tx.send(Command::UpdateDeletedTo(n));
    }

    /// Stop the controller, waiting for any in-flight delete and a final
    /// watermark persist to complete first.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct DeletionController {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    kv: KvQueueHandle,

    /// Target: blocks in `[0, n)` may be deleted.
    n: u64,
    /// Progress: blocks in `[0, m)` have been deleted and acknowledged.
    m: u64,
    /// Deletes completed since the last `DeletedTo` persist.
    since_persist: u64,
    deleting: bool,
    persisting: bool,
    shuttingdown: bool,
    stop_ack: Option<oneshot::Sender<()>>,
}

/// Priority used for deletion-controller KV requests: lower than ordinary
/// GET/APPEND traffic, since freeing space is never on a client's latency
/// path.
const DELETE_PRIO: i32 = 10;

impl DeletionController {
    /// Spawn the controller, loading its initial `DeletedTo` watermark from
    /// the KV backend before accepting any `update_deleted_to` calls.
    pub async fn spawn(kv: KvQueueHandle) -> DeletionHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let initial_m = match kv.get(DELETED_TO_KEY, DELETE_PRIO).await {
            Ok(Some(bytes)) if bytes.len() == 8 => {
                u64::from_be_bytes(bytes.try_into().unwrap())
            }
            Ok(Some(_)) | Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "failed to load DeletedTo watermark, starting from 0");
                0
            }
        };

        let controller = DeletionController {
            cmd_rx,
            internal_tx,
            internal_rx,
            kv,
            n: initial_m,
            m: initial_m,
            since_persist: 0,
            deleting: false,
            persisting: false,
            shuttingdown: false,
            stop_ack: None,
        };
        tokio::spawn(controller.run());
        DeletionHandle { tx: cmd_tx }
    }

    async fn run(mut self) {
        loop {
            if self.shuttingdown && !self.deleting && !self.persisting && self.since_persist == 0
            {
                if let Some(tx) = self.stop_ack.take() {
                    let _ = tx.send(());
                }
                return;
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::UpdateDeletedTo(n)) => {
                            if n > self.n {
                                self.n = n;
                            }
                        }
                        Some(Command::Stop(ack)) => {
                            self.shuttingdown = true;
                            self.stop_ack = Some(ack);
                        }
                        None => return,
                    }
                }
                internal = self.internal_rx.recv() => {
                    match internal {
                        Some(Internal::DeleteDone(result)) => self.handle_delete_done(result),
                        Some(Internal::PersistDone(result)) => self.handle_persist_done(result),
                        None => {}
                    }
                }
            }

            self.poke();
        }
    }

    /// Reentrant scheduler: issue the next delete if nothing is currently
    /// in flight, or persist the watermark once a batch has completed.
    fn poke(&mut self) {
        if self.deleting || self.persisting {
            return;
        }

        if self.m < self.n {
            self.start_delete();
            return;
        }

        if self.since_persist > 0 {
            self.start_persist();
        }
    }

    fn start_delete(&mut self) {
        self.deleting = true;
        let blk = self.m;
        let key = objmap(blk);
        let kv = self.kv.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = kv.delete(key, DELETE_PRIO).await;
            let _ = internal_tx.send(Internal::DeleteDone(result));
        });
    }

    fn handle_delete_done(&mut self, result: Result<(), KvError>) {
        self.deleting = false;
        match result {
            Ok(_) => {
                self.m += 1;
                self.since_persist += 1;
                metrics::DELETES_ISSUED.inc();
                if self.since_persist >= DELETE_BATCH {
                    self.start_persist();
                }
            }
            Err(e) => {
                warn!(error = %e, blk = self.m, "delete failed, retrying");
            }
        }
    }

    fn start_persist(&mut self) {
        self.persisting = true;
        let target = self.m;
        let kv = self.kv.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = kv
                .put(DELETED_TO_KEY, target.to_be_bytes().to_vec(), DELETE_PRIO)
                .await;
            let _ = internal_tx.send(Internal::PersistDone(result));
        });
    }

    fn handle_persist_done(&mut self, result: Result<(), KvError>) {
        self.persisting = false;
        match result {
            Ok(_) => {
                info!(deleted_to = self.m, "persisted DeletedTo watermark");
                self.since_persist = 0;
                metrics::DELETED_TO_WRITES.inc();
            }
            Err(e) => {
                warn!(error = %e, "failed to persist DeletedTo watermark, retrying");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvBackend, KvCallError, KvOp, KvOutcome, KvQueue};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    struct MockBackend {
        items: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl KvBackend for MockBackend {
        async fn call(
            &self,
            op: &KvOp,
            _cancel: &CancellationToken,
        ) -> Result<KvOutcome, KvCallError> {
            let mut items = self.items.lock().unwrap();
            match op {
                KvOp::Get(key) => match items.get(key) {
                    Some(v) => Ok(KvOutcome::Value(v.clone())),
                    None => Ok(KvOutcome::Absent),
                },
                KvOp::Put(key, value) => {
                    items.insert(key.clone(), value.clone());
                    Ok(KvOutcome::Done)
                }
                KvOp::Delete(key) => {
                    items.remove(key);
                    Ok(KvOutcome::Done)
                }
            }
        }
    }

    #[tokio::test]
    async fn advances_watermark_and_deletes_blocks() {
        let backend = Arc::new(MockBackend {
            items: Mutex::new(HashMap::new()),
        });
        // Pre-populate a few blocks so we can observe them disappearing.
        for blk in 0..5u64 {
            backend
                .items
                .lock()
                .unwrap()
                .insert(objmap(blk), vec![blk as u8]);
        }
        let kv = KvQueue::spawn(backend.clone(), 10);
        let controller = DeletionController::spawn(kv).await;

        controller.update_deleted_to(5);
        controller.stop().await;

        let items = backend.items.lock().unwrap();
        for blk in 0..5u64 {
            assert!(!items.contains_key(&objmap(blk)));
        }
        let watermark = items.get(DELETED_TO_KEY).expect("watermark persisted");
        assert_eq!(u64::from_be_bytes(watermark.clone().try_into().unwrap()), 5);
    }

    #[tokio::test]
    async fn resumes_from_persisted_watermark() {
        let backend = Arc::new(MockBackend {
            items: Mutex::new(HashMap::new()),
        });
        backend
            .items
            .lock()
            .unwrap()
            .insert(DELETED_TO_KEY.to_string(), 3u64.to_be_bytes().to_vec());
        for blk in 0..6u64 {
            backend
                .items
                .lock()
                .unwrap()
                .insert(objmap(blk), vec![1]);
        }

        let kv = KvQueue::spawn(backend.clone(), 10);
        let controller = DeletionController::spawn(kv).await;
        controller.update_deleted_to(6);
        controller.stop().await;

        let items = backend.items.lock().unwrap();
        // Blocks below the initial watermark were never targeted for
        // deletion by this run, but blocks [3, 6) should be gone.
        for blk in 3..6u64 {
            assert!(!items.contains_key(&objmap(blk)));
        }
    }
}
