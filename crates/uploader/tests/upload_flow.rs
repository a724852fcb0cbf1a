//! End-to-end upload scenarios against an in-process store.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chunkflow_chunk_store::{ChunkStore, FsChunkStore, MemoryChunkStore, UploadService};
use chunkflow_protocol::{ChunkIndex, ErrorKind, FileHash, UploadState};
use chunkflow_transfer::{ChunkReader, hash_file};
use chunkflow_uploader::{
    BackendFuture, LocalBackend, RetryPolicy, UploadBackend, UploadConfig, UploadError,
    UploadOrchestrator,
};
use tempfile::TempDir;
use tokio::sync::Semaphore;

const MIB: u64 = 1024 * 1024;

/// Backend wrapper recording calls and injecting failures.
struct RecordingBackend {
    inner: LocalBackend,
    uploads: Mutex<Vec<ChunkIndex>>,
    merges: AtomicUsize,
    entered: AtomicUsize,
    failing: Mutex<HashSet<ChunkIndex>>,
    dropping: Mutex<HashSet<ChunkIndex>>,
    merge_fails: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingBackend {
    fn new(service: Arc<UploadService>) -> Self {
        Self {
            inner: LocalBackend::new(service),
            uploads: Mutex::new(Vec::new()),
            merges: AtomicUsize::new(0),
            entered: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
            dropping: Mutex::new(HashSet::new()),
            merge_fails: AtomicBool::new(false),
            gate: None,
        }
    }

    fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn fail_chunk(&self, index: ChunkIndex) {
        self.failing.lock().unwrap().insert(index);
    }

    /// Acknowledges uploads of `index` without storing them.
    fn drop_chunk(&self, index: ChunkIndex) {
        self.dropping.lock().unwrap().insert(index);
    }

    fn fail_merges(&self, fail: bool) {
        self.merge_fails.store(fail, Ordering::SeqCst);
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.dropping.lock().unwrap().clear();
        self.fail_merges(false);
    }

    fn uploads(&self) -> Vec<ChunkIndex> {
        self.uploads.lock().unwrap().clone()
    }

    fn sorted_uploads(&self) -> Vec<ChunkIndex> {
        let mut uploads = self.uploads();
        uploads.sort_unstable();
        uploads
    }

    fn merges(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }
}

impl UploadBackend for RecordingBackend {
    fn upload_chunk<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
        data: &'a [u8],
        checksum: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.entered.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.map_err(|_| UploadError::Cancelled)?;
            }
            if self.failing.lock().unwrap().contains(&index) {
                return Err(UploadError::Transfer(format!("chunk {index} lost")));
            }
            if self.dropping.lock().unwrap().contains(&index) {
                self.uploads.lock().unwrap().push(index);
                return Ok(());
            }
            self.inner
                .upload_chunk(file_hash, index, data, checksum)
                .await?;
            self.uploads.lock().unwrap().push(index);
            Ok(())
        })
    }

    fn file_exists<'a>(&'a self, file_hash: &'a FileHash) -> BackendFuture<'a, bool> {
        self.inner.file_exists(file_hash)
    }

    fn chunk_exists<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
    ) -> BackendFuture<'a, bool> {
        self.inner.chunk_exists(file_hash, index)
    }

    fn merge<'a>(&'a self, file_hash: &'a FileHash, chunk_count: u64) -> BackendFuture<'a, ()> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        if self.merge_fails.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err::<(), _>(UploadError::StorageWrite("artifact volume full".into()))
            });
        }
        self.inner.merge(file_hash, chunk_count)
    }

    fn last_existed_chunk_index<'a>(
        &'a self,
        file_hash: &'a FileHash,
    ) -> BackendFuture<'a, Option<ChunkIndex>> {
        self.inner.last_existed_chunk_index(file_hash)
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

fn write_source(dir: &TempDir, data: &[u8]) -> PathBuf {
    let path = dir.path().join("source.bin");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(data).unwrap();
    path
}

fn memory_service() -> (MemoryChunkStore, Arc<UploadService>) {
    let store = MemoryChunkStore::new();
    let service = Arc::new(UploadService::new(Arc::new(store.clone())));
    (store, service)
}

fn config(chunk_size: u64, concurrency: usize) -> UploadConfig {
    UploadConfig {
        chunk_size,
        concurrency,
        auto_start: true,
        retry: RetryPolicy {
            max_retries: 2,
            initial_delay_ms: 50,
            max_delay_ms: 100,
            backoff_factor: 2.0,
        },
    }
}

/// Stores chunks of `path` directly, bypassing the orchestrator.
async fn preload(store: &dyn ChunkStore, path: &Path, chunk_size: u64, indices: &[ChunkIndex]) {
    let hash = hash_file(path).unwrap();
    let reader = ChunkReader::open(path, chunk_size).unwrap();
    for &index in indices {
        let chunk = reader.read_chunk(index).unwrap();
        store.write_chunk(&hash, index, &chunk.data).await.unwrap();
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn ten_megabytes_in_two_megabyte_chunks() {
    let dir = TempDir::new().unwrap();
    let data = pattern(10 * MIB as usize);
    let path = write_source(&dir, &data);
    let (store, service) = memory_service();
    let backend = Arc::new(RecordingBackend::new(service));

    let orchestrator =
        UploadOrchestrator::new(&path, backend.clone(), config(2 * MIB, 2)).unwrap();
    let progress = Arc::new(Mutex::new(Vec::new()));
    {
        let progress = Arc::clone(&progress);
        orchestrator.on_change(move |s| progress.lock().unwrap().push(s.progress));
    }
    orchestrator.start().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();

    assert_eq!(done.state, UploadState::UploadSuccessfully);
    assert_eq!(done.chunk_count, 5);
    assert_eq!(done.completed_chunks, 5);
    assert!(done.pending_chunks.is_empty());
    assert_eq!(backend.sorted_uploads(), vec![0, 1, 2, 3, 4]);
    assert_eq!(backend.merges(), 1);

    let progress = progress.lock().unwrap().clone();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last().copied(), Some(100.0));

    let hash = hash_file(&path).unwrap();
    assert_eq!(done.file_hash.as_ref(), Some(&hash));
    assert_eq!(store.artifact(&hash).unwrap(), data);
}

#[tokio::test]
async fn identical_upload_is_fast() {
    let dir = TempDir::new().unwrap();
    let path = write_source(&dir, &pattern(300_000));
    let (_store, service) = memory_service();

    let first = Arc::new(RecordingBackend::new(Arc::clone(&service)));
    let orchestrator = UploadOrchestrator::new(&path, first.clone(), config(64 * 1024, 2)).unwrap();
    orchestrator.start().await.unwrap();
    assert_eq!(
        orchestrator.wait_terminal().await.unwrap().state,
        UploadState::UploadSuccessfully
    );

    let second = Arc::new(RecordingBackend::new(service));
    let orchestrator =
        UploadOrchestrator::new(&path, second.clone(), config(64 * 1024, 2)).unwrap();
    orchestrator.start().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();

    assert_eq!(done.state, UploadState::FastUploaded);
    assert_eq!(done.progress, 100.0);
    assert!(second.uploads().is_empty());
    assert_eq!(second.entered.load(Ordering::SeqCst), 0);
    assert_eq!(second.merges(), 0);
}

#[tokio::test]
async fn permanent_chunk_failure_escalates() {
    let dir = TempDir::new().unwrap();
    let path = write_source(&dir, &pattern(50));
    let (store, service) = memory_service();
    let backend = Arc::new(RecordingBackend::new(service));
    backend.fail_chunk(3);

    let orchestrator = UploadOrchestrator::new(&path, backend.clone(), config(10, 2)).unwrap();
    orchestrator.start().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();

    assert_eq!(done.state, UploadState::Error);
    let error = done.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Transfer);
    assert!(error.message.contains("chunk 3"));
    assert!(done.pending_chunks.contains(&3));
    assert!(done.progress < 100.0);

    let hash = hash_file(&path).unwrap();
    assert_eq!(store.chunk_indices(&hash), vec![0, 1, 2, 4]);
    assert_eq!(backend.merges(), 0);
    assert!(store.artifact(&hash).is_none());
}

#[tokio::test]
async fn resume_uploads_only_missing_suffix() {
    let dir = TempDir::new().unwrap();
    let path = write_source(&dir, &pattern(50));
    let (store, service) = memory_service();
    preload(&store, &path, 10, &[0, 1, 2]).await;
    let backend = Arc::new(RecordingBackend::new(service));

    let mut cfg = config(10, 2);
    cfg.auto_start = false;
    let orchestrator = UploadOrchestrator::new(&path, backend.clone(), cfg).unwrap();
    orchestrator.start().await.unwrap();
    let waiting = orchestrator
        .wait_for(|s| s.state == UploadState::WaitForUpload)
        .await
        .unwrap();
    assert_eq!(waiting.pending_chunks, vec![3, 4]);
    assert_eq!(waiting.completed_chunks, 3);
    assert_eq!(waiting.progress, 60.0);

    orchestrator.play().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();
    assert_eq!(done.state, UploadState::UploadSuccessfully);
    assert_eq!(backend.sorted_uploads(), vec![3, 4]);
    assert_eq!(backend.merges(), 1);
}

#[tokio::test]
async fn resume_checks_chunks_past_a_gap() {
    let dir = TempDir::new().unwrap();
    let path = write_source(&dir, &pattern(50));
    let (store, service) = memory_service();
    preload(&store, &path, 10, &[0, 1, 3]).await;
    let backend = Arc::new(RecordingBackend::new(service));

    let orchestrator = UploadOrchestrator::new(&path, backend.clone(), config(10, 2)).unwrap();
    orchestrator.start().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();
    assert_eq!(done.state, UploadState::UploadSuccessfully);
    assert_eq!(backend.sorted_uploads(), vec![2, 4]);
}

#[tokio::test]
async fn pause_keeps_pending_and_resume_finishes() {
    let dir = TempDir::new().unwrap();
    let path = write_source(&dir, &pattern(50));
    let (_store, service) = memory_service();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(RecordingBackend::new(service).with_gate(Arc::clone(&gate)));

    let orchestrator = UploadOrchestrator::new(&path, backend.clone(), config(10, 1)).unwrap();
    orchestrator.start().await.unwrap();
    wait_until(|| backend.entered.load(Ordering::SeqCst) >= 1).await;

    orchestrator.pause().await.unwrap();
    let paused = orchestrator.snapshot();
    assert_eq!(paused.state, UploadState::UploadStopped);
    assert_eq!(paused.pending_chunks, vec![0, 1, 2, 3, 4]);

    // The in-flight chunk completes; nothing new is dispatched.
    gate.add_permits(100);
    orchestrator
        .wait_for(|s| s.completed_chunks == 1)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.uploads(), vec![0]);
    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.state, UploadState::UploadStopped);
    assert_eq!(snapshot.pending_chunks, vec![1, 2, 3, 4]);
    assert_eq!(snapshot.progress, 20.0);

    orchestrator.play().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();
    assert_eq!(done.state, UploadState::UploadSuccessfully);
    assert_eq!(backend.sorted_uploads(), vec![0, 1, 2, 3, 4]);
    assert_eq!(backend.merges(), 1);
}

#[tokio::test]
async fn restart_after_error_resumes() {
    let dir = TempDir::new().unwrap();
    let path = write_source(&dir, &pattern(50));
    let (store, service) = memory_service();
    let backend = Arc::new(RecordingBackend::new(service));
    backend.fail_chunk(3);

    let orchestrator = UploadOrchestrator::new(&path, backend.clone(), config(10, 2)).unwrap();
    orchestrator.start().await.unwrap();
    assert_eq!(
        orchestrator.wait_terminal().await.unwrap().state,
        UploadState::Error
    );
    assert!(matches!(
        orchestrator.play().await,
        Err(UploadError::SessionState {
            state: UploadState::Error,
            ..
        })
    ));

    backend.heal();
    orchestrator.restart().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();
    assert_eq!(done.state, UploadState::UploadSuccessfully);
    assert!(done.error.is_none());
    assert_eq!(backend.sorted_uploads(), vec![0, 1, 2, 3, 4]);
    assert_eq!(backend.merges(), 1);

    let hash = hash_file(&path).unwrap();
    assert_eq!(store.artifact(&hash).unwrap(), pattern(50));
}

#[tokio::test]
async fn merge_write_failure_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let path = write_source(&dir, &pattern(50));
    let (store, service) = memory_service();
    let backend = Arc::new(RecordingBackend::new(service));
    backend.fail_merges(true);

    let orchestrator = UploadOrchestrator::new(&path, backend.clone(), config(10, 2)).unwrap();
    orchestrator.start().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();
    assert_eq!(done.state, UploadState::Error);
    assert_eq!(done.error.unwrap().kind, ErrorKind::StorageWrite);
    assert_eq!(backend.merges(), 1);

    // Still failed later; nothing retries a merge on its own.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(orchestrator.state(), UploadState::Error);
    assert_eq!(backend.merges(), 1);
    let hash = hash_file(&path).unwrap();
    assert_eq!(store.chunk_indices(&hash), vec![0, 1, 2, 3, 4]);

    backend.heal();
    orchestrator.restart().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();
    assert_eq!(done.state, UploadState::UploadSuccessfully);
    assert!(done.error.is_none());
    assert_eq!(backend.merges(), 2);
    // Stored chunks are reused by the restarted run.
    assert_eq!(backend.sorted_uploads(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn incomplete_merge_escalates_and_restart_fills_gap() {
    let dir = TempDir::new().unwrap();
    let path = write_source(&dir, &pattern(50));
    let (store, service) = memory_service();
    let backend = Arc::new(RecordingBackend::new(service));
    backend.drop_chunk(2);

    let orchestrator = UploadOrchestrator::new(&path, backend.clone(), config(10, 2)).unwrap();
    orchestrator.start().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();
    assert_eq!(done.state, UploadState::Error);
    let error = done.error.unwrap();
    assert_eq!(error.kind, ErrorKind::IncompleteUpload);
    assert!(error.message.contains('2'), "{}", error.message);
    assert_eq!(backend.merges(), 1);

    let hash = hash_file(&path).unwrap();
    assert_eq!(store.chunk_indices(&hash), vec![0, 1, 3, 4]);

    backend.heal();
    orchestrator.restart().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();
    assert_eq!(done.state, UploadState::UploadSuccessfully);
    assert_eq!(backend.merges(), 2);
    assert_eq!(backend.sorted_uploads(), vec![0, 1, 2, 2, 3, 4]);
    assert_eq!(store.artifact(&hash).unwrap(), pattern(50));
}

#[tokio::test]
async fn chunks_from_another_chunk_size_recover_on_restart() {
    let dir = TempDir::new().unwrap();
    let data = pattern(100);
    let path = write_source(&dir, &data);
    let (store, service) = memory_service();
    // An earlier session left 10-byte chunks 0 and 1.
    preload(&store, &path, 10, &[0, 1]).await;
    let backend = Arc::new(RecordingBackend::new(service));

    let orchestrator = UploadOrchestrator::new(&path, backend.clone(), config(25, 2)).unwrap();
    orchestrator.start().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();
    assert_eq!(done.state, UploadState::Error);
    assert_eq!(done.error.unwrap().kind, ErrorKind::HashMismatch);
    assert_eq!(backend.sorted_uploads(), vec![2, 3]);

    let hash = hash_file(&path).unwrap();
    assert!(store.chunk_indices(&hash).is_empty());

    orchestrator.restart().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();
    assert_eq!(done.state, UploadState::UploadSuccessfully);
    assert_eq!(done.chunk_count, 4);
    assert_eq!(backend.merges(), 2);
    assert_eq!(store.artifact(&hash).unwrap(), data);
}

#[tokio::test]
async fn filesystem_store_end_to_end() {
    let dir = TempDir::new().unwrap();
    let data = pattern(200_000);
    let path = write_source(&dir, &data);
    let store = FsChunkStore::open(dir.path().join("store")).await.unwrap();
    let service = Arc::new(UploadService::new(Arc::new(store.clone())));
    let backend = Arc::new(LocalBackend::new(service));

    let orchestrator = UploadOrchestrator::new(&path, backend, config(32 * 1024, 3)).unwrap();
    orchestrator.start().await.unwrap();
    let done = orchestrator.wait_terminal().await.unwrap();
    assert_eq!(done.state, UploadState::UploadSuccessfully);
    assert_eq!(done.chunk_count, 7);

    let hash = hash_file(&path).unwrap();
    assert_eq!(std::fs::read(store.artifact_path(&hash)).unwrap(), data);
}
