//! Upload session state machine.
//!
//! An [`UploadOrchestrator`] is a handle to a driver task that owns one
//! session. Operations reach the driver as commands and are applied one at a
//! time, so state transitions are strictly sequential. Background work
//! (hashing, resume probing, chunk transfers, merge) reports back as events
//! tagged with the run that started it; events from a superseded run are
//! dropped.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chunkflow_protocol::{ChunkIndex, FileHash, SessionError, SessionSnapshot, UploadState};
use chunkflow_transfer::{ChunkReader, hash_file};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::UploadBackend;
use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::pool::{ChunkWorker, CompletionHandler, UploadPool, WorkerFuture};
use crate::retry::{RetryPolicy, with_retry};

type Listener = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;
type Listeners = Arc<Mutex<Vec<Listener>>>;

#[derive(Debug, Clone, Copy)]
enum Operation {
    Start,
    Play,
    Pause,
    Restart,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Play => "play",
            Operation::Pause => "pause",
            Operation::Restart => "restart",
        }
    }
}

struct Command {
    op: Operation,
    reply: oneshot::Sender<Result<(), UploadError>>,
}

enum Event {
    Prepared {
        run: u64,
        result: Result<Prepared, UploadError>,
    },
    ChunkDone {
        run: u64,
        index: ChunkIndex,
        result: Result<(), UploadError>,
    },
    Merged {
        run: u64,
        result: Result<(), UploadError>,
    },
}

/// Outcome of hashing and probing the store.
enum Prepared {
    Exists {
        file_hash: FileHash,
    },
    Pending {
        file_hash: FileHash,
        reader: Arc<ChunkReader>,
        pending: Vec<ChunkIndex>,
    },
}

/// Uploads one file, resuming from whatever the backend already holds.
///
/// Observers read state through [`snapshot`](Self::snapshot) or register
/// [`on_change`](Self::on_change) listeners; the only mutations are
/// [`start`](Self::start), [`play`](Self::play), [`pause`](Self::pause),
/// [`restart`](Self::restart) and [`remove`](Self::remove).
///
/// Dropping the orchestrator has the same effect as `remove`.
pub struct UploadOrchestrator {
    path: PathBuf,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    listeners: Listeners,
    cancel: CancellationToken,
}

impl UploadOrchestrator {
    /// Creates an idle session in [`UploadState::Default`] and spawns its
    /// driver. Must be called from within a tokio runtime.
    pub fn new(
        path: impl Into<PathBuf>,
        backend: Arc<dyn UploadBackend>,
        config: UploadConfig,
    ) -> Result<Self, UploadError> {
        config.validate()?;
        let path = path.into();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let listeners = Listeners::default();
        let cancel = CancellationToken::new();

        let driver = Driver {
            path: path.clone(),
            backend,
            config,
            events: events_tx,
            snapshot_tx,
            listeners: Arc::clone(&listeners),
            cancel: cancel.clone(),
            state: UploadState::Default,
            progress: 0.0,
            error: None,
            run: 0,
            session: None,
        };
        tokio::spawn(driver.run(commands_rx, events_rx));

        Ok(Self {
            path,
            commands: commands_tx,
            snapshot: snapshot_rx,
            listeners,
            cancel,
        })
    }

    /// `Default → CalculatingHash`.
    pub async fn start(&self) -> Result<(), UploadError> {
        self.send(Operation::Start).await
    }

    /// Starts or resumes transfers from `WaitForUpload` or `UploadStopped`.
    pub async fn play(&self) -> Result<(), UploadError> {
        self.send(Operation::Play).await
    }

    /// Stops dispatching new chunks. In-flight transfers still complete.
    pub async fn pause(&self) -> Result<(), UploadError> {
        self.send(Operation::Pause).await
    }

    /// Starts over from `Error`, discarding the previous session.
    pub async fn restart(&self) -> Result<(), UploadError> {
        self.send(Operation::Restart).await
    }

    /// Tears the session down: stops the pool, cancels in-flight work and
    /// releases the source file. The last snapshot stays readable.
    pub fn remove(&self) {
        self.cancel.cancel();
    }

    /// Registers a listener called with every changed snapshot.
    ///
    /// Listeners run on the driver task and must not block; a listener that
    /// needs to throttle should wrap its sink with a
    /// [`ProgressThrottle`](chunkflow_transfer::ProgressThrottle). A listener
    /// added from inside another listener first sees the next change.
    pub fn on_change(&self, listener: impl Fn(&SessionSnapshot) + Send + Sync + 'static) {
        add_listener(&self.listeners, Arc::new(listener));
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> UploadState {
        self.snapshot.borrow().state
    }

    pub fn progress(&self) -> f64 {
        self.snapshot.borrow().progress
    }

    pub fn error(&self) -> Option<SessionError> {
        self.snapshot.borrow().error.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Waits until a snapshot satisfies `predicate`, checking the current
    /// one first.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, UploadError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| UploadError::Cancelled)?
            .clone();
        Ok(snapshot)
    }

    /// Waits for `FastUploaded`, `UploadSuccessfully` or `Error`.
    pub async fn wait_terminal(&self) -> Result<SessionSnapshot, UploadError> {
        self.wait_for(|s| s.state.is_terminal()).await
    }

    async fn send(&self, op: Operation) -> Result<(), UploadError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command { op, reply })
            .map_err(|_| UploadError::Cancelled)?;
        rx.await.map_err(|_| UploadError::Cancelled)?
    }
}

impl Drop for UploadOrchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver {
    path: PathBuf,
    backend: Arc<dyn UploadBackend>,
    config: UploadConfig,
    events: mpsc::UnboundedSender<Event>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    listeners: Listeners,
    cancel: CancellationToken,
    state: UploadState,
    progress: f64,
    error: Option<SessionError>,
    run: u64,
    session: Option<Session>,
}

/// Resources of one run, from hashing to a terminal state.
struct Session {
    cancel: CancellationToken,
    file_hash: Option<FileHash>,
    reader: Option<Arc<ChunkReader>>,
    pool: Option<UploadPool>,
    chunk_count: u64,
    /// Indices not yet confirmed by the backend.
    pending: BTreeSet<ChunkIndex>,
    merging: bool,
}

impl Session {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            file_hash: None,
            reader: None,
            pool: None,
            chunk_count: 0,
            pending: BTreeSet::new(),
            merging: false,
        }
    }

    fn completed(&self) -> u64 {
        self.chunk_count - self.pending.len() as u64
    }

    /// Stops dispatch and drops the pool and reader handles. In-flight
    /// transfers keep their own reader reference until they finish.
    fn release(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.stop();
            pool.clear();
        }
        self.reader = None;
    }

    /// Like [`release`](Self::release), but also cancels in-flight work.
    fn shutdown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        self.reader = None;
        self.cancel.cancel();
    }
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command { op, reply }) => {
                        let result = self.handle_command(op);
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        if let Some(session) = self.session.as_mut() {
            session.shutdown();
        }
        debug!(path = %self.path.display(), "upload session removed");
    }

    fn handle_command(&mut self, op: Operation) -> Result<(), UploadError> {
        let merging = self.session.as_ref().is_some_and(|s| s.merging);
        match (op, self.state) {
            (Operation::Start, UploadState::Default) | (Operation::Restart, UploadState::Error) => {
                self.begin_run();
                Ok(())
            }
            (Operation::Play, UploadState::WaitForUpload | UploadState::UploadStopped) => {
                self.resume_uploading();
                Ok(())
            }
            (Operation::Pause, UploadState::Uploading) if !merging => {
                self.pause_uploading();
                Ok(())
            }
            (op, state) => {
                warn!(
                    path = %self.path.display(),
                    operation = op.name(),
                    %state,
                    merging,
                    "operation rejected"
                );
                Err(UploadError::SessionState {
                    operation: op.name(),
                    state,
                })
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Prepared { run, result } if run == self.run => self.on_prepared(result),
            Event::ChunkDone { run, index, result } if run == self.run => {
                self.on_chunk_done(index, result)
            }
            Event::Merged { run, result } if run == self.run => self.on_merged(result),
            _ => debug!(path = %self.path.display(), "stale event ignored"),
        }
    }

    // -- transitions --------------------------------------------------------

    fn begin_run(&mut self) {
        if let Some(mut previous) = self.session.take() {
            previous.shutdown();
        }
        self.run += 1;
        let cancel = self.cancel.child_token();
        self.session = Some(Session::new(cancel.clone()));
        self.error = None;
        self.progress = 0.0;
        info!(path = %self.path.display(), run = self.run, "calculating hash");
        self.set_state(UploadState::CalculatingHash);

        let run = self.run;
        let events = self.events.clone();
        let task = prepare(
            self.path.clone(),
            self.config.chunk_size,
            Arc::clone(&self.backend),
            self.config.retry.clone(),
            cancel.clone(),
        );
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = task => result,
            };
            let _ = events.send(Event::Prepared { run, result });
        });
    }

    fn on_prepared(&mut self, result: Result<Prepared, UploadError>) {
        if self.state != UploadState::CalculatingHash {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match result {
            Err(e) => self.fail(e),
            Ok(Prepared::Exists { file_hash }) => {
                info!(file_hash = %file_hash.short(), "content already stored, fast upload");
                session.file_hash = Some(file_hash);
                self.progress = 100.0;
                self.finish(UploadState::FastUploaded);
            }
            Ok(Prepared::Pending {
                file_hash,
                reader,
                pending,
            }) => {
                let chunk_count = reader.chunk_count();
                info!(
                    file_hash = %file_hash.short(),
                    chunk_count,
                    pending = pending.len(),
                    "resume point probed"
                );

                let pool = UploadPool::new(
                    self.config.concurrency,
                    chunk_worker(
                        Arc::clone(&self.backend),
                        Arc::clone(&reader),
                        file_hash.clone(),
                        self.config.retry.clone(),
                        session.cancel.clone(),
                    ),
                    completion_handler(self.events.clone(), self.run),
                    session.cancel.child_token(),
                );
                pool.enqueue_all(pending.iter().copied());

                session.file_hash = Some(file_hash);
                session.reader = Some(reader);
                session.pool = Some(pool);
                session.chunk_count = chunk_count;
                session.pending = pending.into_iter().collect();
                self.progress = SessionSnapshot::percentage(session.completed(), chunk_count);
                self.set_state(UploadState::WaitForUpload);

                if self.config.auto_start {
                    self.resume_uploading();
                }
            }
        }
    }

    fn resume_uploading(&mut self) {
        info!(path = %self.path.display(), from = %self.state, "uploading");
        self.set_state(UploadState::Uploading);
        if let Some(pool) = self.session.as_ref().and_then(|s| s.pool.as_ref()) {
            pool.start();
        }
        self.maybe_merge();
    }

    fn pause_uploading(&mut self) {
        if let Some(pool) = self.session.as_ref().and_then(|s| s.pool.as_ref()) {
            pool.stop();
        }
        info!(path = %self.path.display(), "upload paused");
        self.set_state(UploadState::UploadStopped);
    }

    fn on_chunk_done(&mut self, index: ChunkIndex, result: Result<(), UploadError>) {
        if !self.state.is_active() {
            return;
        }
        match result {
            Ok(()) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if session.pending.remove(&index) {
                    let completed = session.completed();
                    let chunk_count = session.chunk_count;
                    debug!(chunk = index, completed, chunk_count, "chunk confirmed");
                    self.progress = self
                        .progress
                        .max(SessionSnapshot::percentage(completed, chunk_count));
                    self.publish();
                }
                self.maybe_merge();
            }
            Err(UploadError::Cancelled) => {}
            Err(e) => {
                warn!(chunk = index, error = %e, "chunk failed, retries exhausted");
                self.fail(e);
            }
        }
    }

    /// Starts the merge once every chunk is confirmed while uploading.
    fn maybe_merge(&mut self) {
        if self.state != UploadState::Uploading {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.merging || !session.pending.is_empty() {
            return;
        }
        let Some(file_hash) = session.file_hash.clone() else {
            return;
        };
        session.merging = true;
        let chunk_count = session.chunk_count;
        info!(file_hash = %file_hash.short(), chunk_count, "all chunks stored, merging");

        let run = self.run;
        let events = self.events.clone();
        let backend = Arc::clone(&self.backend);
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = backend.merge(&file_hash, chunk_count) => result,
            };
            let _ = events.send(Event::Merged { run, result });
        });
    }

    fn on_merged(&mut self, result: Result<(), UploadError>) {
        if self.state != UploadState::Uploading {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.merging = false;
        }
        match result {
            Ok(()) => {
                info!(path = %self.path.display(), "upload completed");
                self.progress = 100.0;
                self.finish(UploadState::UploadSuccessfully);
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: UploadError) {
        error!(path = %self.path.display(), state = %self.state, error = %e, "upload failed");
        self.error = Some(e.to_session_error());
        self.finish(UploadState::Error);
    }

    fn finish(&mut self, state: UploadState) {
        if let Some(session) = self.session.as_mut() {
            session.release();
        }
        self.set_state(state);
    }

    // -- observation ----------------------------------------------------------

    fn set_state(&mut self, state: UploadState) {
        self.state = state;
        self.publish();
    }

    fn publish(&mut self) {
        let snapshot = self.build_snapshot();
        let changed = self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot.clone();
                true
            }
        });
        if changed {
            // Called outside the lock so a listener may register another.
            let listeners: Vec<Listener> = self
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for listener in &listeners {
                listener(&snapshot);
            }
        }
    }

    fn build_snapshot(&self) -> SessionSnapshot {
        let session = self.session.as_ref();
        SessionSnapshot {
            state: self.state,
            progress: self.progress,
            error: self.error.clone(),
            file_hash: session.and_then(|s| s.file_hash.clone()),
            chunk_count: session.map_or(0, |s| s.chunk_count),
            completed_chunks: session.map_or(0, Session::completed),
            pending_chunks: session
                .map(|s| s.pending.iter().copied().collect())
                .unwrap_or_default(),
        }
    }
}

fn add_listener(listeners: &Listeners, listener: Listener) {
    listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(listener);
}

// ---------------------------------------------------------------------------
// Background work
// ---------------------------------------------------------------------------

/// Hashes the source, checks for a fast upload and probes the resume point.
async fn prepare(
    path: PathBuf,
    chunk_size: u64,
    backend: Arc<dyn UploadBackend>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Result<Prepared, UploadError> {
    let (file_hash, reader) = tokio::task::spawn_blocking(
        move || -> Result<(FileHash, ChunkReader), UploadError> {
            let file_hash = hash_file(&path)?;
            let reader = ChunkReader::open(&path, chunk_size)?;
            Ok((file_hash, reader))
        },
    )
    .await
    .map_err(|e| UploadError::HashComputation(e.to_string()))??;
    let chunk_count = reader.chunk_count();
    info!(
        file_hash = %file_hash.short(),
        file_size = reader.file_size(),
        chunk_count,
        "hash computed"
    );

    if with_retry(&retry, &cancel, "file_exists", || {
        backend.file_exists(&file_hash)
    })
    .await?
    {
        return Ok(Prepared::Exists { file_hash });
    }

    // Chunks up to the contiguous prefix are known present; the rest are
    // checked one by one since later chunks may exist past a gap.
    let resume_from = with_retry(&retry, &cancel, "last_existed_chunk_index", || {
        backend.last_existed_chunk_index(&file_hash)
    })
    .await?
    .map_or(0, |last| last + 1);

    let mut pending = Vec::new();
    for index in resume_from.min(chunk_count)..chunk_count {
        let exists = with_retry(&retry, &cancel, "chunk_exists", || {
            backend.chunk_exists(&file_hash, index)
        })
        .await?;
        if !exists {
            pending.push(index);
        }
    }
    debug!(file_hash = %file_hash.short(), resume_from, pending = ?pending, "resume probe done");

    Ok(Prepared::Pending {
        file_hash,
        reader: Arc::new(reader),
        pending,
    })
}

fn chunk_worker(
    backend: Arc<dyn UploadBackend>,
    reader: Arc<ChunkReader>,
    file_hash: FileHash,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> ChunkWorker {
    Arc::new(move |index: ChunkIndex| -> WorkerFuture {
        Box::pin(transfer_chunk(
            Arc::clone(&backend),
            Arc::clone(&reader),
            file_hash.clone(),
            index,
            retry.clone(),
            cancel.clone(),
        ))
    })
}

fn completion_handler(events: mpsc::UnboundedSender<Event>, run: u64) -> CompletionHandler {
    Arc::new(move |index: ChunkIndex, result: Result<(), UploadError>| {
        let _ = events.send(Event::ChunkDone { run, index, result });
    })
}

/// Reads one chunk and uploads it, retrying transient failures.
async fn transfer_chunk(
    backend: Arc<dyn UploadBackend>,
    reader: Arc<ChunkReader>,
    file_hash: FileHash,
    index: ChunkIndex,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Result<(), UploadError> {
    let chunk = tokio::task::spawn_blocking(move || reader.read_chunk(index))
        .await
        .map_err(|e| UploadError::HashComputation(e.to_string()))??;

    with_retry(&retry, &cancel, "upload_chunk", || {
        backend.upload_chunk(&file_hash, index, &chunk.data, &chunk.checksum)
    })
    .await?;
    debug!(
        file_hash = %file_hash.short(),
        chunk = index,
        bytes = chunk.data.len(),
        "chunk transferred"
    );
    Ok(())
}
