//! Concurrency-bounded chunk dispatch.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chunkflow_protocol::ChunkIndex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::UploadError;

/// Future transferring one chunk.
pub type WorkerFuture = Pin<Box<dyn Future<Output = Result<(), UploadError>> + Send>>;

/// Produces the transfer future for a chunk index.
pub type ChunkWorker = Arc<dyn Fn(ChunkIndex) -> WorkerFuture + Send + Sync>;

/// Receives every finished transfer, successful or not.
pub type CompletionHandler = Arc<dyn Fn(ChunkIndex, Result<(), UploadError>) + Send + Sync>;

/// Runs queued chunk transfers with at most `concurrency` in flight.
///
/// Each finished transfer is reported to the completion handler and the next
/// queued index is dispatched immediately. Items are taken in FIFO order but
/// may complete in any order.
///
/// Must be used from within a tokio runtime.
pub struct UploadPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    concurrency: usize,
    worker: ChunkWorker,
    on_complete: CompletionHandler,
    cancel: CancellationToken,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<ChunkIndex>,
    running: bool,
    active: usize,
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UploadPool {
    /// Creates a stopped pool. A `concurrency` of 0 is treated as 1.
    pub fn new(
        concurrency: usize,
        worker: ChunkWorker,
        on_complete: CompletionHandler,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                concurrency: concurrency.max(1),
                worker,
                on_complete,
                cancel,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Begins dispatching queued items.
    pub fn start(&self) {
        self.shared.state().running = true;
        pump(&self.shared);
    }

    /// Stops dispatching. In-flight transfers finish normally and queued
    /// items stay queued.
    pub fn stop(&self) {
        self.shared.state().running = false;
    }

    /// Queues an index; dispatched right away if the pool is running and has
    /// a free slot.
    pub fn enqueue(&self, index: ChunkIndex) {
        self.shared.state().queue.push_back(index);
        pump(&self.shared);
    }

    pub fn enqueue_all(&self, indices: impl IntoIterator<Item = ChunkIndex>) {
        self.shared.state().queue.extend(indices);
        pump(&self.shared);
    }

    /// Removes and returns every queued, not yet dispatched index.
    pub fn clear(&self) -> Vec<ChunkIndex> {
        self.shared.state().queue.drain(..).collect()
    }

    /// Stops the pool, drops the queue and cancels in-flight transfers.
    /// Cancelled transfers are not reported.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state();
            state.running = false;
            state.queue.clear();
        }
        self.shared.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    /// Transfers currently in flight.
    pub fn active(&self) -> usize {
        self.shared.state().active
    }

    pub fn queued(&self) -> Vec<ChunkIndex> {
        self.shared.state().queue.iter().copied().collect()
    }

    /// Returns `true` when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state();
        state.active == 0 && state.queue.is_empty()
    }

    pub fn concurrency(&self) -> usize {
        self.shared.concurrency
    }
}

/// Dispatches queued items until the pool is stopped, full or drained.
fn pump(shared: &Arc<PoolShared>) {
    loop {
        let index = {
            let mut state = shared.state();
            if !state.running || state.active >= shared.concurrency || shared.cancel.is_cancelled()
            {
                return;
            }
            let Some(index) = state.queue.pop_front() else {
                return;
            };
            state.active += 1;
            index
        };

        debug!(chunk = index, "dispatching chunk");
        let transfer = (shared.worker)(index);
        let task_shared = Arc::clone(shared);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = task_shared.cancel.cancelled() => Err(UploadError::Cancelled),
                result = transfer => result,
            };
            task_shared.state().active -= 1;
            if !task_shared.cancel.is_cancelled() {
                (task_shared.on_complete)(index, result);
                pump(&task_shared);
            }
        });
    }
}
