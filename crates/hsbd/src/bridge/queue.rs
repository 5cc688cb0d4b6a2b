//! FIFO correlation of worker replies to requests.
//!
//! The worker protocol carries no request ids. The worker handles commands
//! one at a time, in the order it reads them, and writes exactly one reply
//! line per command. So the Nth decoded reply answers the Nth command ever
//! written, and correlation is a queue:
//!
//! ```text
//!  request()                   writer task          reader task
//!     │ lock state                 │                    │ decode line
//!     │ push_back(slot) ──┐        │ write + flush      │
//!     │ send(frame) ──────┼──────▶ │ whole frames only  │
//!     │ unlock            │ pending               ┌─ pop_front(slot)
//!     │                   └───────────────────────┘  send(reply)
//!     ▼ await slot (with deadline)
//! ```
//!
//! Frames are queued for the writer task under the same lock that appends
//! the slot, so queue order always equals wire order even with many
//! concurrent callers. Only the writer task touches the worker's stdin, so
//! a caller that stops waiting (timeout, `select!`, dropped future) can
//! never leave half a line on the wire.
//!
//! A request whose deadline passes stops waiting but its slot stays in the
//! queue: the worker still owes a reply for it, and that reply must consume
//! the slot rather than be handed to the next caller. The late reply is
//! dropped with a debug log. If the worker never sends that reply, every
//! later reply lands one slot early and every later request times out.
//! After [`MAX_CONSECUTIVE_TIMEOUTS`] timeouts with no reply delivered in
//! between, the queue closes with `ProtocolError::Desynchronized`.
//!
//! Once closed (worker exit, stderr output, I/O failure, desync, shutdown)
//! every pending and future request fails with the close reason.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hsb_protocol::{Command, DecodedLine, JsonLineCodec};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::error::{BridgeError, ProtocolError};

/// Initial capacity of the reader's line buffer.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How much of an unsolicited reply is logged.
const PREVIEW_LEN: usize = 200;

/// Longest wait a single request can ask for.
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Timeouts in a row, with no reply reaching a waiting caller, after which
/// the stream is treated as out of sync and the queue closes.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

type Reply = Result<Value, BridgeError>;

/// One request awaiting its reply.
struct PendingRequest {
    seq: u64,
    command: &'static str,
    created_at: Instant,
    respond_to: oneshot::Sender<Reply>,
}

/// Messages for the writer task.
enum Outgoing {
    /// One complete encoded line
    Frame {
        seq: u64,
        command: &'static str,
        frame: Bytes,
        deadline: Instant,
    },
    /// Shut down the worker's stdin, then acknowledge
    Close { done: oneshot::Sender<()> },
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingRequest>,
    next_seq: u64,
    consecutive_timeouts: u32,
    outbox: Option<mpsc::UnboundedSender<Outgoing>>,
    closed: Option<BridgeError>,
}

struct Shared {
    state: Mutex<QueueState>,
    closed_token: CancellationToken,
}

impl Shared {
    /// Marks the queue closed and fails everything pending.
    ///
    /// Returns false if it was already closed; the first reason wins.
    async fn close(&self, reason: BridgeError) -> bool {
        let drained = {
            let mut state = self.state.lock().await;
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason.clone());
            std::mem::take(&mut state.pending)
        };
        self.closed_token.cancel();

        if !drained.is_empty() {
            debug!(count = drained.len(), reason = %reason, "Failing pending requests");
        }
        for request in drained {
            let _ = request.respond_to.send(Err(reason.clone()));
        }
        true
    }

    /// Routes one decoded line to the oldest pending request.
    async fn dispatch(&self, line: DecodedLine) {
        let value = match line {
            DecodedLine::Value(value) => value,
            DecodedLine::Malformed(err) => {
                // Does not consume a slot
                warn!(error = %ProtocolError::Decode(err), "Skipping undecodable worker output");
                return;
            }
        };

        let mut state = self.state.lock().await;
        let Some(request) = state.pending.pop_front() else {
            drop(state);
            let preview: String = value.to_string().chars().take(PREVIEW_LEN).collect();
            warn!(error = %ProtocolError::Unsolicited(preview), "Discarding worker reply");
            return;
        };

        let waited_ms = request.created_at.elapsed().as_millis() as u64;
        if request.respond_to.send(Ok(value)).is_err() {
            debug!(
                seq = request.seq,
                command = request.command,
                waited_ms,
                "Discarding late reply for timed-out request"
            );
        } else {
            state.consecutive_timeouts = 0;
            trace!(seq = request.seq, command = request.command, waited_ms, "Reply matched");
        }
    }

    /// Counts a timed-out request and closes the queue once too many have
    /// timed out in a row.
    async fn record_timeout(&self) {
        let timeouts = {
            let mut state = self.state.lock().await;
            if state.closed.is_some() {
                return;
            }
            state.consecutive_timeouts += 1;
            state.consecutive_timeouts
        };

        if timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
            let reason = BridgeError::Protocol(ProtocolError::Desynchronized { timeouts });
            error!(timeouts, "Worker replies no longer line up with requests");
            self.close(reason).await;
        }
    }
}

/// FIFO request/reply correlator over a worker's stdin/stdout.
///
/// Cheap to clone; all clones share the same queue.
#[derive(Clone)]
pub struct CorrelationQueue {
    shared: Arc<Shared>,
    reader_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CorrelationQueue {
    /// Starts correlating over the given streams.
    ///
    /// Spawns the writer and reader tasks, so this must be called from
    /// within a Tokio runtime.
    pub fn new<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                outbox: Some(outbox),
                ..Default::default()
            }),
            closed_token: CancellationToken::new(),
        });

        tokio::spawn(write_loop(writer, inbox, Arc::clone(&shared)));
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        Self {
            shared,
            reader_task: Arc::new(Mutex::new(Some(reader_task))),
        }
    }

    /// Sends one command and waits for its reply.
    ///
    /// Cancel-safe: dropping the returned future leaves the command fully
    /// written and its slot queued, so the worker's reply still lines up.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Timeout` if no reply arrives within `timeout`
    /// - The close reason if the queue is, or becomes, closed
    /// - `BridgeError::Io` if the command could not be written (this also
    ///   closes the queue, since the stream position is unknown)
    pub async fn request(&self, command: &Command, timeout: Duration) -> Reply {
        let mut frame = BytesMut::new();
        JsonLineCodec::new()
            .encode(command, &mut frame)
            .map_err(|e| BridgeError::Io(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let name = command.name();
        let now = Instant::now();
        let deadline = now + timeout.min(MAX_WAIT);

        let seq = {
            let mut state = self.shared.state.lock().await;
            if let Some(reason) = &state.closed {
                return Err(reason.clone());
            }

            let seq = state.next_seq;
            let queued = state.outbox.as_ref().is_some_and(|outbox| {
                outbox
                    .send(Outgoing::Frame {
                        seq,
                        command: name,
                        frame: frame.freeze(),
                        deadline,
                    })
                    .is_ok()
            });
            if !queued {
                drop(state);
                let reason = BridgeError::Io("worker stdin is closed".to_string());
                self.shared.close(reason.clone()).await;
                return Err(reason);
            }

            state.next_seq += 1;
            state.pending.push_back(PendingRequest {
                seq,
                command: name,
                created_at: now,
                respond_to: tx,
            });
            seq
        };

        trace!(seq, command = name, "Queued command for worker");

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            // Sender dropped without a reply: only happens once closed
            Ok(Err(_)) => Err(self.close_reason().await.unwrap_or(BridgeError::ShutDown)),
            Err(_) => {
                warn!(
                    seq,
                    command = name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker reply timed out"
                );
                self.shared.record_timeout().await;
                Err(BridgeError::Timeout(timeout))
            }
        }
    }

    /// Closes the queue, failing every pending request with `reason`.
    ///
    /// Returns false if it was already closed.
    pub async fn close(&self, reason: BridgeError) -> bool {
        self.shared.close(reason).await
    }

    /// Shuts down the write half so the worker sees end of input.
    ///
    /// Frames already handed to the writer are flushed first.
    pub async fn close_writer(&self) {
        let outbox = self.shared.state.lock().await.outbox.take();
        let Some(outbox) = outbox else {
            return;
        };
        let (done, acked) = oneshot::channel();
        if outbox.send(Outgoing::Close { done }).is_ok() {
            // Err means the writer already stopped after a failure
            let _ = acked.await;
        }
    }

    /// Stops the reader task.
    pub async fn stop_reader(&self) {
        let task = self.reader_task.lock().await.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    /// The reason the queue closed, if it has.
    pub async fn close_reason(&self) -> Option<BridgeError> {
        self.shared.state.lock().await.closed.clone()
    }

    /// Completes once the queue is closed, yielding the reason.
    pub async fn closed(&self) -> BridgeError {
        self.shared.closed_token.cancelled().await;
        self.close_reason().await.unwrap_or(BridgeError::ShutDown)
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed_token.is_cancelled()
    }

    /// Number of slots still owed a reply, including timed-out ones.
    pub async fn pending_len(&self) -> usize {
        self.shared.state.lock().await.pending.len()
    }
}

/// Owns the worker's stdin and writes queued frames in order.
///
/// A write error or a write still stuck at its request's deadline closes
/// the queue with `BridgeError::Io`.
async fn write_loop<W>(
    mut writer: W,
    mut inbox: mpsc::UnboundedReceiver<Outgoing>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut close_ack = None;

    while let Some(message) = inbox.recv().await {
        match message {
            Outgoing::Frame {
                seq,
                command,
                frame,
                deadline,
            } => {
                let write = async {
                    writer.write_all(&frame).await?;
                    writer.flush().await
                };
                let failure = match tokio::time::timeout_at(deadline, write).await {
                    Ok(Ok(())) => {
                        debug!(seq, command, "Sent command to worker");
                        continue;
                    }
                    Ok(Err(e)) => BridgeError::Io(e.to_string()),
                    Err(_) => BridgeError::Io("write to worker timed out".to_string()),
                };
                warn!(seq, command, error = %failure, "Failed to send command to worker");
                shared.close(failure).await;
                break;
            }
            Outgoing::Close { done } => {
                close_ack = Some(done);
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Closing worker stdin failed");
    }
    if let Some(done) = close_ack {
        let _ = done.send(());
    }
}

/// Decodes worker output and dispatches each reply in arrival order.
async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut codec = JsonLineCodec::new();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(line)) => shared.dispatch(line).await,
                Ok(None) => break,
                Err(e) => {
                    shared.close(BridgeError::Io(e.to_string())).await;
                    return;
                }
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                while let Ok(Some(line)) = codec.decode_eof(&mut buf) {
                    shared.dispatch(line).await;
                }
                debug!("Worker stdout closed");
                shared
                    .close(BridgeError::WorkerTerminated(
                        "worker closed its output".to_string(),
                    ))
                    .await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Reading worker stdout failed");
                shared.close(BridgeError::Io(e.to_string())).await;
                return;
            }
        }
    }
}
