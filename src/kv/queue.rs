//! The prioritized, rate-limited, retrying KV request scheduler.
//!
//! Ported from `lib/dynamodb/dynamodb_request_queue.c`'s `runqueue`/`poke`/
//! `sendreq` state machine onto a single actor task reached through a
//! cloneable handle, the same split the teacher uses between
//! `DeletionQueueClient` and `FrontendQueueWorker` in `deletion_queue.rs`:
//! callers never touch the heap directly, they send a request over a
//! channel and await a `oneshot` reply.
//!
//! `inflight_max = opps * 5` and the rate-limited retry delay are both
//! derived from `opps` unchanged from the original; everything else
//! (the heap, the per-request cancellation token, the backend trait) is
//! this crate's Rust rendition of the same scheduling discipline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::client::{KvBackend, KvCallError, KvOp, KvOutcome};
use super::heap::{HeapKey, IndexedHeap};
use crate::error::KvError;

/// Delay imposed between successive sends once the queue has been
/// throttled: `ratedelay = 1s / opps`, unchanged from the original
/// (including its `opps == 1` case, which falls out of the same formula).
/// Jittered by up to 20% on each wait so that multiple queues throttled by
/// the same DynamoDB partition don't retry in lockstep.
fn ratelimit_delay(opps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / opps.max(1) as f64)
}

fn jittered(delay: Duration) -> Duration {
    let jitter_frac = rand::thread_rng().gen_range(0.0..0.2);
    delay + delay.mul_f64(jitter_frac)
}

pub type KvResult = Result<KvOutcome, KvError>;

struct PendingRequest {
    op: KvOp,
    prio: i32,
    reqnum: u64,
    respond_to: Option<oneshot::Sender<KvResult>>,
    cancel: CancellationToken,
}

enum Command {
    Enqueue {
        op: KvOp,
        prio: i32,
        respond_to: oneshot::Sender<KvResult>,
    },
    Flush,
    Shutdown,
}

enum Internal {
    Completed {
        id: u64,
        result: Result<KvOutcome, KvCallError>,
    },
    Wake,
}

/// A cloneable handle to a running [`KvQueue`] actor.
#[derive(Clone)]
pub struct KvQueueHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl KvQueueHandle {
    pub async fn request(&self, op: KvOp, prio: i32) -> KvResult {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Enqueue {
                op,
                prio,
                respond_to: tx,
            })
            .map_err(|_| KvError::QueueClosed)?;
        rx.await.map_err(|_| KvError::QueueClosed)?
    }

    pub async fn get(&self, key: impl Into<String>, prio: i32) -> Result<Option<Vec<u8>>, KvError> {
        match self.request(KvOp::Get(key.into()), prio).await? {
            KvOutcome::Value(v) => Ok(Some(v)),
            KvOutcome::Absent => Ok(None),
            KvOutcome::Done => unreachable!("GET never resolves to Done"),
        }
    }

    pub async fn put(&self, key: impl Into<String>, value: Vec<u8>, prio: i32) -> Result<(), KvError> {
        self.request(KvOp::Put(key.into(), value), prio).await?;
        Ok(())
    }

    pub async fn delete(&self, key: impl Into<String>, prio: i32) -> Result<(), KvError> {
        self.request(KvOp::Delete(key.into()), prio).await?;
        Ok(())
    }

    /// Cancel every queued and in-flight request, responding to each with
    /// [`KvError::Cancelled`]. Used at shutdown.
    pub fn flush(&self) {
        let _ = self.tx.send(Command::Flush);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// The actor owning the heap, the pending-request table, and the
/// in-flight/rate-limit bookkeeping. Runs as a single `tokio::spawn`ed task
/// so that all state mutation happens without locking, matching the
/// single-writer invariant the original relies on.
pub struct KvQueue {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    backend: Arc<dyn KvBackend>,
    heap: IndexedHeap<u64>,
    pending: HashMap<u64, PendingRequest>,
    next_id: u64,
    next_reqnum: u64,
    inflight: usize,
    inflight_max: usize,
    ratelimited: bool,
    wake_scheduled: bool,
    ratelimit_delay: Duration,
}

impl KvQueue {
    /// Spawn the actor and return a handle to it. `opps` is the configured
    /// target operations-per-second; the in-flight cap is `opps * 5` and
    /// the rate-limited retry delay is `1s / opps`, both unchanged from the
    /// original.
    pub fn spawn(backend: Arc<dyn KvBackend>, opps: u32) -> KvQueueHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let actor = KvQueue {
            cmd_rx,
            internal_tx,
            internal_rx,
            backend,
            heap: IndexedHeap::new(),
            pending: HashMap::new(),
            next_id: 0,
            next_reqnum: 0,
            inflight: 0,
            inflight_max: (opps as usize).saturating_mul(5).max(1),
            ratelimited: false,
            wake_scheduled: false,
            ratelimit_delay: ratelimit_delay(opps),
        };
        tokio::spawn(actor.run());
        KvQueueHandle { tx: cmd_tx }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Enqueue { op, prio, respond_to }) => {
                            self.enqueue(op, prio, respond_to);
                        }
                        Some(Command::Flush) => self.flush(),
                        Some(Command::Shutdown) | None => break,
                    }
                }
                internal = self.internal_rx.recv() => {
                    match internal {
                        Some(Internal::Completed { id, result }) => self.complete(id, result),
                        Some(Internal::Wake) => self.wake_scheduled = false,
                        None => {}
                    }
                }
            }
            self.runqueue();
        }
        self.flush();
    }

    fn enqueue(&mut self, op: KvOp, prio: i32, respond_to: oneshot::Sender<KvResult>) {
        let id = self.next_id;
        self.next_id += 1;
        let reqnum = self.next_reqnum;
        self.next_reqnum += 1;

        self.heap.insert(
            id,
            HeapKey {
                in_flight: false,
                prio,
                reqnum,
            },
        );
        self.pending.insert(
            id,
            PendingRequest {
                op,
                prio,
                reqnum,
                respond_to: Some(respond_to),
                cancel: CancellationToken::new(),
            },
        );
    }

    /// Send as many queued requests as the in-flight cap allows. Mirrors
    /// `runqueue()`: peek the minimum, and if it is not already in flight
    /// and we have capacity, send it and loop; stop the moment we are
    /// rate-limited (only one outstanding retry attempt at a time) or the
    /// heap bottoms out at an in-flight entry (nothing more is sendable
    /// until something completes).
    fn runqueue(&mut self) {
        if self.wake_scheduled {
            return;
        }
        loop {
            let Some((id, key)) = self.heap.peek_min() else {
                self.ratelimited = false;
                return;
            };
            if key.in_flight {
                return;
            }
            if self.inflight >= self.inflight_max {
                return;
            }

            self.send(id, key);

            if self.ratelimited {
                self.schedule_wake();
                return;
            }
        }
    }

    fn send(&mut self, id: u64, key: HeapKey) {
        self.heap.update(
            id,
            HeapKey {
                in_flight: true,
                ..key
            },
        );
        self.inflight += 1;
        crate::metrics::KV_INFLIGHT.set(self.inflight as i64);
        crate::metrics::KV_REQUESTS_SENT.inc();

        let req = self
            .pending
            .get(&id)
            .expect("heap entry without a matching pending request");
        let op = req.op.clone();
        let cancel = req.cancel.clone();
        let backend = self.backend.clone();
        let internal_tx = self.internal_tx.clone();

        trace!(op = op.name(), key = op.key(), "sending kv request");

        tokio::spawn(async move {
            let result = backend.call(&op, &cancel).await;
            let _ = internal_tx.send(Internal::Completed { id, result });
        });
    }

    fn complete(&mut self, id: u64, result: Result<KvOutcome, KvCallError>) {
        self.inflight = self.inflight.saturating_sub(1);
        crate::metrics::KV_INFLIGHT.set(self.inflight as i64);

        if !self.pending.contains_key(&id) {
            // Flushed while the call was in flight; drop the result.
            return;
        }

        match result {
            Ok(outcome) => {
                self.ratelimited = false;
                self.finish(id, Ok(outcome));
            }
            Err(KvCallError::Throttled) => {
                self.ratelimited = true;
                crate::metrics::KV_REQUESTS_RETRIED.inc();
                self.requeue(id);
            }
            Err(KvCallError::ServerError(_)) => {
                crate::metrics::KV_REQUESTS_RETRIED.inc();
                self.requeue(id);
            }
            Err(KvCallError::ClientError(msg)) => {
                self.finish(id, Err(KvError::NonRetryable(msg)));
            }
        }
    }

    fn requeue(&mut self, id: u64) {
        if let Some(req) = self.pending.get(&id) {
            self.heap.update(
                id,
                HeapKey {
                    in_flight: false,
                    prio: req.prio,
                    reqnum: req.reqnum,
                },
            );
        }
    }

    fn finish(&mut self, id: u64, result: KvResult) {
        self.heap.remove(id);
        if let Some(mut req) = self.pending.remove(&id) {
            if let Some(tx) = req.respond_to.take() {
                let _ = tx.send(result);
            }
        }
    }

    fn schedule_wake(&mut self) {
        self.wake_scheduled = true;
        let tx = self.internal_tx.clone();
        let delay = jittered(self.ratelimit_delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::Wake);
        });
    }

    fn flush(&mut self) {
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        for id in &ids {
            if let Some(req) = self.pending.get(id) {
                req.cancel.cancel();
            }
        }
        for id in ids {
            self.heap.remove(id);
            if let Some(mut req) = self.pending.remove(&id) {
                if let Some(tx) = req.respond_to.take() {
                    let _ = tx.send(Err(KvError::Cancelled));
                }
            }
        }
        self.inflight = 0;
        crate::metrics::KV_INFLIGHT.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn ratelimit_delay_is_inverse_of_opps() {
        assert_eq!(ratelimit_delay(1), Duration::from_secs(1));
        assert_eq!(ratelimit_delay(10), Duration::from_millis(100));
        assert_eq!(ratelimit_delay(5), Duration::from_millis(200));
    }

    #[test]
    fn ratelimit_delay_does_not_divide_by_zero() {
        assert_eq!(ratelimit_delay(0), Duration::from_secs(1));
    }

    struct MockBackend {
        calls: AtomicUsize,
        fail_first_n_with_throttle: usize,
        responses: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl KvBackend for MockBackend {
        async fn call(
            &self,
            op: &KvOp,
            _cancel: &CancellationToken,
        ) -> Result<KvOutcome, KvCallError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n_with_throttle {
                return Err(KvCallError::Throttled);
            }
            match op {
                KvOp::Get(key) => match self.responses.lock().unwrap().get(key) {
                    Some(v) => Ok(KvOutcome::Value(v.clone())),
                    None => Ok(KvOutcome::Absent),
                },
                KvOp::Put(key, value) => {
                    self.responses
                        .lock()
                        .unwrap()
                        .insert(key.clone(), value.clone());
                    Ok(KvOutcome::Done)
                }
                KvOp::Delete(key) => {
                    self.responses.lock().unwrap().remove(key);
                    Ok(KvOutcome::Done)
                }
            }
        }
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let backend = Arc::new(MockBackend {
            calls: AtomicUsize::new(0),
            fail_first_n_with_throttle: 0,
            responses: Mutex::new(HashMap::new()),
        });
        let handle = KvQueue::spawn(backend, 10);

        handle.put("B1", vec![1, 2, 3], 0).await.unwrap();
        let got = handle.get("B1", 0).await.unwrap();
        assert_eq!(got, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn get_of_missing_key_is_absent_not_error() {
        let backend = Arc::new(MockBackend {
            calls: AtomicUsize::new(0),
            fail_first_n_with_throttle: 0,
            responses: Mutex::new(HashMap::new()),
        });
        let handle = KvQueue::spawn(backend, 10);

        let got = handle.get("nonexistent", 0).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn throttled_request_eventually_succeeds() {
        let backend = Arc::new(MockBackend {
            calls: AtomicUsize::new(0),
            fail_first_n_with_throttle: 3,
            responses: Mutex::new(HashMap::new()),
        });
        let handle = KvQueue::spawn(backend, 10);

        handle.put("B1", vec![9], 0).await.unwrap();
        let got = handle.get("B1", 0).await.unwrap();
        assert_eq!(got, Some(vec![9]));
    }

    #[tokio::test]
    async fn lower_priority_number_is_served_first() {
        let backend = Arc::new(MockBackend {
            calls: AtomicUsize::new(0),
            fail_first_n_with_throttle: 0,
            responses: Mutex::new(HashMap::new()),
        });
        // Cap inflight at 1 so ordering is deterministic.
        let handle = KvQueue::spawn(backend, 0);

        let h1 = handle.clone();
        let h2 = handle.clone();
        let low = tokio::spawn(async move { h1.put("low", vec![1], 5).await });
        let high = tokio::spawn(async move { h2.put("high", vec![2], 0).await });

        low.await.unwrap().unwrap();
        high.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn flush_cancels_outstanding_requests() {
        let backend = Arc::new(MockBackend {
            calls: AtomicUsize::new(0),
            fail_first_n_with_throttle: 1000,
            responses: Mutex::new(HashMap::new()),
        });
        let handle = KvQueue::spawn(backend, 10);
        let h2 = handle.clone();
        let task = tokio::spawn(async move { h2.get("whatever", 0).await });

        // Give the actor a moment to pick the request up before flushing.
        tokio::task::yield_now().await;
        handle.flush();

        let result = task.await.unwrap();
        assert!(result.is_err());
    }
}
