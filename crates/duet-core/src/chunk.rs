use futures::Stream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::agent::Agent;
use crate::errors::DuetError;

/// Classification of a streamed chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Standard output of the process.
    Text,
    /// Standard error output or a synthetic diagnostic.
    Error,
    /// Reserved for clients; never produced by the runner.
    Thinking,
    /// Reserved for clients; never produced by the runner.
    Code,
}

/// One unit of streamed output from a run.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub source: Agent,
    pub content: String,
    /// Unix milliseconds at which the fragment was observed.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: ChunkKind,
}

impl Chunk {
    pub fn text(source: Agent, content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            source,
            content: content.into(),
            timestamp,
            kind: ChunkKind::Text,
        }
    }

    pub fn error(source: Agent, content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            source,
            content: content.into(),
            timestamp,
            kind: ChunkKind::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ChunkKind::Error
    }
}

/// Creates the hand-off point between one producer task and one consumer.
///
/// The chunk queue is bounded: producers wait for capacity instead of
/// dropping or coalescing chunks. The terminal result travels on a separate
/// one-shot channel, so it is delivered exactly once and only after every
/// queued chunk.
pub fn chunk_channel(capacity: usize) -> (ChunkSender, ChunkStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (final_tx, final_rx) = oneshot::channel();
    let (abort_tx, abort_rx) = watch::channel(false);
    (
        ChunkSender {
            tx,
            final_tx,
            abort_rx,
        },
        ChunkStream {
            rx,
            final_rx,
            abort_handle: AbortHandle { tx: abort_tx },
        },
    )
}

/// Handle used to request cancellation of a running stream.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// Cancellation is best-effort: the producer terminates its process and
    /// the stream ends with `RunFailure::Cancelled`.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Producer side of a chunk stream.
pub struct ChunkSender {
    tx: mpsc::Sender<Chunk>,
    final_tx: oneshot::Sender<Result<(), DuetError>>,
    abort_rx: watch::Receiver<bool>,
}

impl ChunkSender {
    /// Queues a chunk, waiting for capacity. Returns `false` once the
    /// consumer has gone away.
    pub async fn send(&self, chunk: Chunk) -> bool {
        self.tx.send(chunk).await.is_ok()
    }

    /// Delivers the terminal result and closes the stream.
    pub fn finish(self, result: Result<(), DuetError>) {
        let _ = self.final_tx.send(result);
    }

    /// Returns `true` once the consumer has dropped its stream.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the consumer has dropped its stream.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    /// Returns `true` if an abort was requested.
    pub fn is_aborted(&self) -> bool {
        *self.abort_rx.borrow()
    }

    /// Resolves once an abort is requested; never resolves if the abort
    /// handle is gone without having been used.
    pub async fn aborted(&self) {
        let mut rx = self.abort_rx.clone();
        let requested = rx.wait_for(|aborted| *aborted).await.map(|_| ());
        if requested.is_err() {
            futures::future::pending::<()>().await;
        }
    }

    pub(crate) fn raw_sender(&self) -> mpsc::Sender<Chunk> {
        self.tx.clone()
    }
}

/// Consumer side of a chunk stream.
///
/// Use `next_chunk()` to consume chunks as they arrive and `finish()` to
/// obtain the terminal result, or `into_stream()` to get both as one
/// `futures::Stream`.
pub struct ChunkStream {
    rx: mpsc::Receiver<Chunk>,
    final_rx: oneshot::Receiver<Result<(), DuetError>>,
    abort_handle: AbortHandle,
}

impl ChunkStream {
    /// Returns a handle that can cancel the run.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Waits for and returns the next chunk.
    ///
    /// Returns `None` after the producer has finished and every chunk has
    /// been taken.
    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// Drains the stream (if needed) and returns the terminal result.
    ///
    /// This is safe to call after consuming chunks manually with `next_chunk()`.
    pub async fn finish(mut self) -> Result<(), DuetError> {
        while self.rx.recv().await.is_some() {}
        match self.final_rx.await {
            Ok(result) => result,
            Err(_) => Err(DuetError::protocol_msg(
                "stream producer ended without a terminal result",
            )),
        }
    }

    /// Drains the stream and returns every chunk together with the terminal result.
    pub async fn collect(mut self) -> (Vec<Chunk>, Result<(), DuetError>) {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            chunks.push(chunk);
        }
        let result = self.finish().await;
        (chunks, result)
    }

    /// Converts into a stream that yields every chunk, then a single `Err`
    /// if the run failed, then ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<Chunk, DuetError>> + Send + 'static {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.next_chunk().await {
                Some(chunk) => Some((Ok(chunk), Some(stream))),
                None => match stream.finish().await {
                    Ok(()) => None,
                    Err(err) => Some((Err(err), None)),
                },
            }
        })
    }
}
