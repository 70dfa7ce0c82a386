//! The connection dispatcher: accepts one client connection at a time,
//! multiplexes its requests across a fixed worker pool (N readers, one
//! writer, one deleter), and serializes responses back onto the
//! connection as workers complete.
//!
//! Grounded directly on `lbs/dispatch.c`: the worker index layout
//! (`0..nreaders` are readers, `nreaders` is the writer, `nreaders + 1` is
//! the deleter), the `readq` FIFO of GETs waiting on an idle reader, the
//! single-writer/single-deleter-in-flight-per-connection busy flags, and
//! the wakeup protocol
//! (workers signal completion by writing their index to a socket pair;
//! the dispatcher's loop reads it back and reconciles worker state).
//! `tokio::net::UnixStream::pair()` stands in for the original's
//! `socketpair(2)`, observed by the same reactor that drives the rest of
//! the connection's I/O rather than a second, hand-rolled event loop.
//!
//! As the distilled spec states explicitly, this dispatcher handles
//! exactly one concurrent client: `run()` accepts a connection, serves it
//! to completion, then accepts the next one. PARAMS is the one request
//! type that never touches the KV backend, so it is answered synchronously
//! without occupying a worker slot.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::proto::{LbsCodec, LbsRequest, LbsResponse};
use crate::storage::StorageState;

/// What a worker leaves behind for the dispatcher to pick up once it
/// signals completion.
enum WorkerResult {
    Get { cookie: u64, data: Option<Vec<u8>> },
    Append { cookie: u64, nextblk: Option<u64> },
    Free { cookie: u64 },
}

type ResultSlot = Arc<AsyncMutex<Option<WorkerResult>>>;

/// Outcome of handing a freshly-decoded request to the worker pool.
enum Dispatched {
    /// Nothing more to do right now; a worker was assigned or the request
    /// was queued on `readq`.
    Async,
    /// Answer immediately, without a worker (PARAMS).
    Immediate(LbsResponse),
    /// Protocol violation: a second APPEND arrived while one was already
    /// in flight on this connection. The connection must be dropped.
    SecondAppend,
    /// Protocol violation: a second FREE arrived while one was already in
    /// flight on this connection. The connection must be dropped, for the
    /// same reason as `SecondAppend`: both the writer and the deleter are
    /// single-slot workers, so a second concurrent request would overwrite
    /// the first's result before the dispatcher picks it up.
    SecondFree,
}

pub struct Dispatcher {
    storage: Arc<StorageState>,
    nreaders: usize,
}

/// Mutable per-connection state threaded through request/completion
/// handling. Grouped into one struct so the two code paths that touch it
/// (a freshly-read request, a worker wakeup) stay in sync.
struct ConnState {
    idle_readers: Vec<usize>,
    readq: VecDeque<(u64, u64)>,
    writer_busy: bool,
    deleter_busy: bool,
    npending: usize,
}

impl Dispatcher {
    pub fn new(storage: Arc<StorageState>, nreaders: usize) -> Self {
        Dispatcher { storage, nreaders }
    }

    /// Accept connections forever, serving each to completion before
    /// accepting the next.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept().await.context("accepting connection")?;
            info!(%peer, "accepted connection");
            match self.serve_connection(socket, peer).await {
                Ok(()) => debug!(%peer, "connection closed"),
                Err(e) => warn!(%peer, error = %e, "connection ended with an error"),
            }
        }
    }

    async fn serve_connection(&self, socket: TcpStream, peer: SocketAddr) -> Result<()> {
        let blocklen = self.storage.blocklen() as u64;
        let framed = Framed::new(socket, LbsCodec::new(blocklen));
        let (mut sink, mut stream) = framed.split();

        let (wake_dispatcher_end, wake_worker_end) =
            UnixStream::pair().context("creating wakeup socket pair")?;
        let (mut wake_read, _unused_write) = wake_dispatcher_end.into_split();
        let (_unused_read, wake_write) = wake_worker_end.into_split();
        let wake_write: Arc<AsyncMutex<OwnedWriteHalf>> = Arc::new(AsyncMutex::new(wake_write));

        // Slot `nreaders` is the writer, `nreaders + 1` the deleter.
        let slot_count = self.nreaders + 2;
        let results: Vec<ResultSlot> = (0..slot_count)
            .map(|_| Arc::new(AsyncMutex::new(None)))
            .collect();

        let mut conn = ConnState {
            idle_readers: (0..self.nreaders).collect(),
            readq: VecDeque::new(),
            writer_busy: false,
            deleter_busy: false,
            npending: 0,
        };
        let mut accepting = true;
        let mut dead = false;

        loop {
            if !accepting && conn.npending == 0 {
                break;
            }

            tokio::select! {
                maybe_req = stream.next(), if accepting => {
                    match maybe_req {
                        Some(Ok(req)) => {
                            match self.handle_request(req, &mut conn, &results, &wake_write) {
                                Dispatched::Async => {}
                                Dispatched::Immediate(resp) => {
                                    if let Err(e) = sink.send(resp).await {
                                        warn!(%peer, error = %e, "failed writing response, dropping connection");
                                        accepting = false;
                                        dead = true;
                                        conn.npending -= drain_readq(&mut conn.readq);
                                    }
                                }
                                Dispatched::SecondAppend => {
                                    warn!(%peer, "second concurrent append on one connection, dropping");
                                    accepting = false;
                                    dead = true;
                                    conn.npending -= drain_readq(&mut conn.readq);
                                }
                                Dispatched::SecondFree => {
                                    warn!(%peer, "second concurrent free on one connection, dropping");
                                    accepting = false;
                                    dead = true;
                                    conn.npending -= drain_readq(&mut conn.readq);
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(%peer, error = %e, "protocol error, dropping connection");
                            accepting = false;
                            dead = true;
                            conn.npending -= drain_readq(&mut conn.readq);
                        }
                        None => {
                            accepting = false;
                        }
                    }
                }
                idx = read_wakeup_index(&mut wake_read) => {
                    let idx = idx.context("reading worker wakeup")?;
                    conn.npending -= 1;
                    let result = results[idx].lock().await.take();
                    if dead {
                        // The writer side is already torn down; drop the
                        // result rather than trying to send it.
                        continue;
                    }
                    if let Some(result) = result {
                        if let Err(e) = self.complete_worker(
                            idx, result, &mut conn, &results, &wake_write, &mut sink,
                        ).await {
                            warn!(%peer, error = %e, "failed writing response, dropping connection");
                            accepting = false;
                            dead = true;
                            conn.npending -= drain_readq(&mut conn.readq);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_request(
        &self,
        req: LbsRequest,
        conn: &mut ConnState,
        results: &[ResultSlot],
        wake_write: &Arc<AsyncMutex<OwnedWriteHalf>>,
    ) -> Dispatched {
        match req {
            LbsRequest::Params { cookie } => {
                let (blocklen, nextblk) = self.storage.params();
                Dispatched::Immediate(LbsResponse::Params {
                    cookie,
                    blocklen,
                    nextblk,
                })
            }
            LbsRequest::Get { cookie, blknum } => {
                if let Some(idx) = conn.idle_readers.pop() {
                    self.dispatch_get(idx, cookie, blknum, conn, results, wake_write);
                } else {
                    conn.readq.push_back((cookie, blknum));
                }
                Dispatched::Async
            }
            LbsRequest::Append {
                cookie,
                count,
                data,
            } => {
                if conn.writer_busy {
                    return Dispatched::SecondAppend;
                }
                conn.writer_busy = true;
                conn.npending += 1;
                let storage = self.storage.clone();
                let slot = results[self.nreaders].clone();
                let wake_write = wake_write.clone();
                let idx = self.nreaders;
                tokio::spawn(async move {
                    let result = storage.append(count, &data).await;
                    *slot.lock().await = Some(WorkerResult::Append {
                        cookie,
                        nextblk: result.ok(),
                    });
                    signal_done(&wake_write, idx).await;
                });
                Dispatched::Async
            }
            LbsRequest::Free { cookie, n } => {
                if conn.deleter_busy {
                    return Dispatched::SecondFree;
                }
                conn.deleter_busy = true;
                self.storage.free(n);
                conn.npending += 1;
                let slot = results[self.nreaders + 1].clone();
                let wake_write = wake_write.clone();
                let idx = self.nreaders + 1;
                tokio::spawn(async move {
                    *slot.lock().await = Some(WorkerResult::Free { cookie });
                    signal_done(&wake_write, idx).await;
                });
                Dispatched::Async
            }
        }
    }

    fn dispatch_get(
        &self,
        idx: usize,
        cookie: u64,
        blknum: u64,
        conn: &mut ConnState,
        results: &[ResultSlot],
        wake_write: &Arc<AsyncMutex<OwnedWriteHalf>>,
    ) {
        conn.npending += 1;
        let storage = self.storage.clone();
        let slot = results[idx].clone();
        let wake_write = wake_write.clone();
        tokio::spawn(async move {
            let data = storage.get(blknum).await.unwrap_or(None);
            *slot.lock().await = Some(WorkerResult::Get { cookie, data });
            signal_done(&wake_write, idx).await;
        });
    }

    /// Handles a worker's wakeup: emits its response, and if it was a
    /// reader, either reassigns it to a queued GET or returns it to the
    /// idle stack.
    async fn complete_worker(
        &self,
        idx: usize,
        result: WorkerResult,
        conn: &mut ConnState,
        results: &[ResultSlot],
        wake_write: &Arc<AsyncMutex<OwnedWriteHalf>>,
        sink: &mut (impl futures::Sink<LbsResponse, Error = crate::error::ProtoError> + Unpin),
    ) -> Result<()> {
        match result {
            WorkerResult::Get { cookie, data } => {
                sink.send(LbsResponse::Get { cookie, data }).await?;
                if idx < self.nreaders {
                    if let Some((cookie, blknum)) = conn.readq.pop_front() {
                        self.dispatch_get(idx, cookie, blknum, conn, results, wake_write);
                    } else {
                        conn.idle_readers.push(idx);
                    }
                }
            }
            WorkerResult::Append { cookie, nextblk } => {
                sink.send(LbsResponse::Append { cookie, nextblk }).await?;
                conn.writer_busy = false;
            }
            WorkerResult::Free { cookie } => {
                sink.send(LbsResponse::Free { cookie }).await?;
                conn.deleter_busy = false;
            }
        }
        Ok(())
    }
}

/// Removes every queued GET from `readq`, returning how many there were so
/// the caller can correct `npending`.
fn drain_readq(readq: &mut VecDeque<(u64, u64)>) -> usize {
    let n = readq.len();
    readq.clear();
    n
}

async fn signal_done(wake_write: &Arc<AsyncMutex<OwnedWriteHalf>>, idx: usize) {
    use tokio::io::AsyncWriteExt;
    let bytes = idx.to_ne_bytes();
    let mut w = wake_write.lock().await;
    let _ = w.write_all(&bytes).await;
}

async fn read_wakeup_index(read_half: &mut OwnedReadHalf) -> std::io::Result<usize> {
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; std::mem::size_of::<usize>()];
    read_half.read_exact(&mut buf).await?;
    Ok(usize::from_ne_bytes(buf))
}
