//! Bounded-latency Write Worker
//!
//! Writes go through an owned `WriteJob` record (payload bytes, destination
//! path and, for pool-backed payloads, the buffer id to hand back once the
//! bytes are down). A dedicated worker thread drains the bounded write
//! buffer; per-write latency is measured against a budget and exceeding it
//! is an observation, never an error.
//!
//! `emergency_flush` drains whatever is still queued straight to the
//! emergency directory with best-effort naming and never fails.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::layout::SessionLayout;

/// Returns pool-backed payload buffers to their owner once a write settles.
///
/// Implemented by the coordination layer; the storage crate only knows the
/// buffer id and the backing bytes it was lent.
pub trait BufferReleaser: Send + Sync {
    fn release(&self, buffer_id: u64, data: Vec<u8>);
}

/// One queued write with explicit payload ownership
#[derive(Debug)]
pub struct WriteJob {
    pub path: PathBuf,
    pub data: Vec<u8>,
    /// Valid prefix of `data`; pool buffers are tier-sized
    pub payload_len: usize,
    /// Pool buffer to release after the write settles, if any
    pub buffer_id: Option<u64>,
}

impl WriteJob {
    /// Job whose payload is plainly owned (no pool buffer involved)
    pub fn owned(path: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        let payload_len = data.len();
        Self {
            path: path.into(),
            data,
            payload_len,
            buffer_id: None,
        }
    }

    /// Job carrying a pool buffer's backing storage
    pub fn pooled(
        path: impl Into<PathBuf>,
        data: Vec<u8>,
        payload_len: usize,
        buffer_id: u64,
    ) -> Self {
        Self {
            path: path.into(),
            data,
            payload_len,
            buffer_id: Some(buffer_id),
        }
    }

    fn payload(&self) -> &[u8] {
        &self.data[..self.payload_len.min(self.data.len())]
    }
}

/// Storage manager tuning
#[derive(Debug, Clone, Copy)]
pub struct StorageConfig {
    /// Maximum queued jobs before `write` reports the buffer full
    pub max_pending_writes: usize,
    /// Per-write latency budget
    pub latency_budget: Duration,
    /// Whether to fsync after each write
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_pending_writes: 256,
            latency_budget: Duration::from_millis(500),
            sync_writes: false,
        }
    }
}

/// Latency histogram bucket upper bounds, milliseconds
const LATENCY_BUCKETS_MS: [u64; 6] = [1, 5, 10, 50, 100, 500];

/// Snapshot of write metrics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WriteMetrics {
    pub total_writes: u64,
    pub total_bytes: u64,
    pub failed_writes: u64,
    pub budget_exceeded: u64,
    pub rejected_writes: u64,
    pub pending: usize,
    pub last_latency_ms: f64,
    /// Write counts by latency: <1, <5, <10, <50, <100, <500, >=500 ms
    pub latency_histogram: [u64; 7],
}

#[derive(Default)]
struct MetricsInner {
    total_writes: u64,
    total_bytes: u64,
    failed_writes: u64,
    budget_exceeded: u64,
    rejected_writes: u64,
    last_latency_ms: f64,
    latency_histogram: [u64; 7],
}

impl MetricsInner {
    fn record_latency(&mut self, latency_ms: f64) {
        self.last_latency_ms = latency_ms;
        let slot = LATENCY_BUCKETS_MS
            .iter()
            .position(|&b| latency_ms < b as f64)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_histogram[slot] += 1;
    }
}

/// Report from an emergency flush; flushing never fails as a whole
#[derive(Debug, Default)]
pub struct FlushReport {
    pub written: Vec<PathBuf>,
    pub failed: usize,
}

struct Shared {
    queue: Mutex<VecDeque<WriteJob>>,
    available: Condvar,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    emergency_seq: AtomicU64,
    metrics: Mutex<MetricsInner>,
    releaser: Mutex<Option<Arc<dyn BufferReleaser>>>,
}

impl Shared {
    fn release_job_buffer(&self, buffer_id: Option<u64>, data: Vec<u8>) {
        if let Some(id) = buffer_id {
            if let Some(releaser) = self.releaser.lock().clone() {
                releaser.release(id, data);
            }
        }
    }
}

/// Asynchronous storage front-end with a dedicated writer thread
pub struct StorageManager {
    layout: SessionLayout,
    config: StorageConfig,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StorageManager {
    pub fn new(layout: SessionLayout, config: StorageConfig) -> Self {
        Self {
            layout,
            config,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                emergency_seq: AtomicU64::new(0),
                metrics: Mutex::new(MetricsInner::default()),
                releaser: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    /// Install the pool hand-back used for jobs that carry a buffer id.
    pub fn set_releaser(&self, releaser: Arc<dyn BufferReleaser>) {
        *self.shared.releaser.lock() = Some(releaser);
    }

    /// Spawn the writer thread. Idempotent.
    pub fn start(&self) {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let config = self.config;
        let handle = thread::Builder::new()
            .name("lyrebird-storage".into())
            .spawn(move || worker_main(shared, config))
            .expect("failed to spawn storage worker");
        *slot = Some(handle);
        info!("storage writer started");
    }

    /// Queue a write. Returns immediately; the worker performs the I/O.
    pub fn write(&self, job: WriteJob) -> StorageResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            self.shared.release_job_buffer(job.buffer_id, job.data);
            return Err(StorageError::Closed);
        }
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.config.max_pending_writes {
            drop(queue);
            self.shared.metrics.lock().rejected_writes += 1;
            self.shared.release_job_buffer(job.buffer_id, job.data);
            return Err(StorageError::WriteBufferFull {
                capacity: self.config.max_pending_writes,
            });
        }
        queue.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Jobs queued plus the one the worker may currently be writing.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len() + self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Block until the write buffer drains or the timeout elapses.
    ///
    /// Returns true when fully drained.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Drain every queued job to the emergency directory.
    ///
    /// Best effort by contract: individual failures are logged and counted,
    /// never raised. Pool buffers are handed back either way.
    pub fn emergency_flush(&self) -> FlushReport {
        let drained: Vec<WriteJob> = {
            let mut queue = self.shared.queue.lock();
            queue.drain(..).collect()
        };

        let mut report = FlushReport::default();
        let unix_ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        for job in drained {
            let n = self.shared.emergency_seq.fetch_add(1, Ordering::SeqCst);
            let path = self
                .layout
                .emergency_dir()
                .join(format!("emergency_{unix_ts}_{n}.tmp"));
            match std::fs::write(&path, job.payload()) {
                Ok(()) => {
                    debug!(path = %path.display(), bytes = job.payload_len, "emergency write");
                    report.written.push(path);
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "emergency write failed");
                    report.failed += 1;
                }
            }
            self.shared.release_job_buffer(job.buffer_id, job.data);
        }

        if report.failed > 0 {
            warn!(
                written = report.written.len(),
                failed = report.failed,
                "emergency flush finished with failures"
            );
        } else {
            info!(written = report.written.len(), "emergency flush complete");
        }
        report
    }

    pub fn metrics(&self) -> WriteMetrics {
        let inner = self.shared.metrics.lock();
        WriteMetrics {
            total_writes: inner.total_writes,
            total_bytes: inner.total_bytes,
            failed_writes: inner.failed_writes,
            budget_exceeded: inner.budget_exceeded,
            rejected_writes: inner.rejected_writes,
            pending: self.shared.queue.lock().len()
                + self.shared.in_flight.load(Ordering::SeqCst),
            last_latency_ms: inner.last_latency_ms,
            latency_histogram: inner.latency_histogram,
        }
    }

    /// Stop accepting writes and join the worker once the queue drains.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_main(shared: Arc<Shared>, config: StorageConfig) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    shared.in_flight.store(1, Ordering::SeqCst);
                    break Some(job);
                }
                if shared.closed.load(Ordering::SeqCst) {
                    break None;
                }
                shared
                    .available
                    .wait_for(&mut queue, Duration::from_millis(100));
            }
        };

        let Some(job) = job else {
            break;
        };

        let start = Instant::now();
        let result = perform_write(&job, config.sync_writes);
        let latency = start.elapsed();
        let latency_ms = latency.as_secs_f64() * 1000.0;

        {
            let mut metrics = shared.metrics.lock();
            metrics.record_latency(latency_ms);
            match &result {
                Ok(bytes) => {
                    metrics.total_writes += 1;
                    metrics.total_bytes += *bytes as u64;
                }
                Err(_) => metrics.failed_writes += 1,
            }
            if latency > config.latency_budget {
                metrics.budget_exceeded += 1;
            }
        }

        if latency > config.latency_budget {
            warn!(
                path = %job.path.display(),
                latency_ms,
                budget_ms = config.latency_budget.as_millis() as u64,
                "write exceeded latency budget"
            );
        }
        if let Err(e) = &result {
            error!(path = %job.path.display(), error = %e, "write failed");
        }

        let WriteJob {
            buffer_id, data, ..
        } = job;
        shared.release_job_buffer(buffer_id, data);
        shared.in_flight.store(0, Ordering::SeqCst);
    }
}

fn perform_write(job: &WriteJob, sync: bool) -> StorageResult<usize> {
    if let Some(parent) = job.path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StorageError::from_io(parent, e))?;
    }
    let mut file = File::create(&job.path).map_err(|e| StorageError::from_io(&job.path, e))?;
    let payload = job.payload();
    file.write_all(payload)
        .map_err(|e| StorageError::from_io(&job.path, e))?;
    if sync {
        file.sync_all()
            .map_err(|e| StorageError::from_io(&job.path, e))?;
    }
    Ok(payload.len())
}
