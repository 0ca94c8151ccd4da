//! Transcriber Pipeline Engine
//!
//! Wires the coordination substrate into a running pipeline:
//!
//! ```text
//! CaptureSource ──► capture worker ──► capture/none queue
//!                                          │
//!                       processing worker: split + sync + quality
//!                                          │
//!                  processing/{left,right} ─► storage worker ─► storage/{left,right}
//!                                          │                        │
//!                         segment copies   │                 StorageManager ─► disk
//!                                          ▼
//!                         transcription worker ─► transcripts + events
//! ```
//!
//! Each worker is a named OS thread registered with the monitoring
//! coordinator; all of them poll the shared shutdown flag so teardown is
//! cooperative. Shutdown itself always flows through the cleanup
//! coordinator's phased steps.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use lyrebird_dsp::{fallback_split, SignalProcessor};
use lyrebird_platform::{
    submit_with_retry, CaptureError, CaptureSource, RetryPolicy, TokenBucket, TranscriptionClient,
    TranscriptionRequest,
};
use lyrebird_storage::{
    BackupManager, PerformanceLog, SessionArchiver, SessionLayout, StorageManager,
    TranscriptRecord, TranscriptWriter, WriteJob, WriteMetrics,
};

use crate::cleanup::{CleanupCoordinator, CleanupOutcome, CleanupPhase, CleanupStatus};
use crate::components::{ComponentKind, ComponentSpec, ComponentState, RecoveryStep};
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::message::{PipelineEvent, SegmentAssembler, SpeakerSegment};
use crate::monitoring::{
    ChannelPatch, CoordinatorReleaser, MetricsPatch, MonitoringCoordinator, MonitoringMetrics,
    ScopedResource,
};
use crate::pool::{ChannelSide, PoolStats};
use crate::queues::{BufferQueues, PipelineStage, QueueItem, QueueStats};
use crate::steps::{CancelToken, Step};

/// Estimated transcription cost per minute of audio
const COST_PER_MINUTE: f64 = 0.006;

/// Shared context handed to the worker threads
struct WorkerCtx {
    coordinator: Arc<MonitoringCoordinator>,
    queues: Arc<BufferQueues>,
    storage: Arc<StorageManager>,
    layout: SessionLayout,
    events_tx: Sender<PipelineEvent>,
    segments_tx: Sender<SpeakerSegment>,
    shutdown: Arc<AtomicBool>,
    capture_active: Arc<AtomicBool>,
    capture_stop: Arc<AtomicBool>,
    config: EngineConfig,
    started_at: Instant,
    chunk_seq: [AtomicU64; 2],
}

impl WorkerCtx {
    fn send_event(&self, event: PipelineEvent) {
        // Events are advisory; a full channel drops them rather than
        // blocking the pipeline
        let _ = self.events_tx.try_send(event);
    }

    /// Record a worker error. When the component's failure streak crosses
    /// the configured threshold its declared recovery runs before the
    /// component is allowed to reach FAILED; persistent recovery failure
    /// flips stream health (inside the coordinator) and hands the system
    /// to orderly shutdown.
    fn report_error(&self, err: &(dyn std::error::Error + 'static), component: &str) {
        let streak = self.coordinator.handle_error(err, component);
        let threshold = self.config.monitoring.consecutive_error_threshold;
        if streak != threshold || self.coordinator.is_shutdown_requested() {
            return;
        }

        self.send_event(PipelineEvent::RecoveryStarted);
        match self.coordinator.attempt_recovery(component) {
            Ok(_) => {
                self.send_event(PipelineEvent::RecoveryCompleted { success: true });
            }
            Err(CoreError::Shutdown) => {}
            Err(e) => {
                warn!(component, error = %e, "recovery failed; initiating shutdown");
                self.send_event(PipelineEvent::RecoveryCompleted { success: false });
                self.send_event(PipelineEvent::Error {
                    component: component.to_string(),
                    message: e.to_string(),
                });
                self.coordinator.request_shutdown();
            }
        }
    }

    fn now_ms(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64() * 1000.0
    }

    fn chunk_path(&self, channel: ChannelSide) -> PathBuf {
        let slot = if channel == ChannelSide::Left { 0 } else { 1 };
        let seq = self.chunk_seq[slot].fetch_add(1, Ordering::SeqCst);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.layout.recording_path(channel.as_str(), seq, ts)
    }
}

/// Point-in-time view of the whole engine
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub components: BTreeMap<String, ComponentState>,
    pub metrics: Arc<MonitoringMetrics>,
    pub queues: Vec<QueueStats>,
    pub storage: WriteMetrics,
    pub pool: PoolStats,
    pub cleanup: CleanupStatus,
}

/// The assembled stereo capture / processing / transcription pipeline
pub struct TranscriberEngine {
    config: EngineConfig,
    coordinator: Arc<MonitoringCoordinator>,
    queues: Arc<BufferQueues>,
    storage: Arc<StorageManager>,
    backups: Arc<Mutex<BackupManager>>,
    transcripts: Arc<Mutex<TranscriptWriter>>,
    perf_log: Arc<Mutex<PerformanceLog>>,
    layout: SessionLayout,
    events_rx: Receiver<PipelineEvent>,
    segments_rx: Receiver<SpeakerSegment>,
    ctx: Arc<WorkerCtx>,
    client: Arc<dyn TranscriptionClient>,
    bucket: Arc<TokenBucket>,
    retry: RetryPolicy,
    source: Mutex<Option<Box<dyn CaptureSource>>>,
    cleanup: Mutex<CleanupCoordinator>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    log_closer: Arc<Mutex<Option<Box<dyn FnMut() + Send>>>>,
    started: AtomicBool,
}

impl TranscriberEngine {
    pub fn new(
        config: EngineConfig,
        source: Box<dyn CaptureSource>,
        client: Arc<dyn TranscriptionClient>,
    ) -> CoreResult<Self> {
        config.validate().map_err(CoreError::Config)?;

        let layout = SessionLayout::new(&config.base_dir);
        layout.ensure()?;

        let coordinator = Arc::new(MonitoringCoordinator::new(config.monitoring, config.pool));
        let storage = Arc::new(StorageManager::new(layout.clone(), config.storage));
        storage.set_releaser(Arc::new(CoordinatorReleaser::new(Arc::clone(&coordinator))));
        let queues = Arc::new(BufferQueues::new(config.queue_capacity, config.optimizer));
        let backups = Arc::new(Mutex::new(BackupManager::new(
            layout.clone(),
            config.rotation,
        )));
        let transcripts = Arc::new(Mutex::new(TranscriptWriter::new(
            &layout,
            &config.session_id,
        )));
        let perf_log = Arc::new(Mutex::new(PerformanceLog::new(layout.clone())));
        let bucket = Arc::new(TokenBucket::per_minute(config.transcriptions_per_minute));

        let (events_tx, events_rx) = bounded(256);
        let (segments_tx, segments_rx) = bounded(32);

        let capture_active = Arc::new(AtomicBool::new(false));
        let capture_stop = Arc::new(AtomicBool::new(false));

        let ctx = Arc::new(WorkerCtx {
            coordinator: Arc::clone(&coordinator),
            queues: Arc::clone(&queues),
            storage: Arc::clone(&storage),
            layout: layout.clone(),
            events_tx,
            segments_tx,
            shutdown: coordinator.shutdown_flag(),
            capture_active: Arc::clone(&capture_active),
            capture_stop: Arc::clone(&capture_stop),
            config: config.clone(),
            started_at: Instant::now(),
            chunk_seq: [AtomicU64::new(0), AtomicU64::new(0)],
        });

        let engine = Self {
            retry: config.retry,
            config,
            coordinator,
            queues,
            storage,
            backups,
            transcripts,
            perf_log,
            layout,
            events_rx,
            segments_rx,
            ctx,
            client,
            bucket,
            source: Mutex::new(Some(source)),
            cleanup: Mutex::new(CleanupCoordinator::new()),
            workers: Mutex::new(Vec::new()),
            log_closer: Arc::new(Mutex::new(None)),
            started: AtomicBool::new(false),
        };

        engine.register_components()?;
        engine.register_cleanup_steps()?;
        Ok(engine)
    }

    fn register_components(&self) -> CoreResult<()> {
        let capture_active = Arc::clone(&self.ctx.capture_active);
        let health_queues = Arc::clone(&self.queues);
        let capture_queues = Arc::clone(&self.queues);
        let processing_queues = Arc::clone(&self.queues);
        let max_depth = self.config.processor.max_queue_depth;
        let storage = Arc::clone(&self.storage);
        let storage_drain = Arc::clone(&self.storage);
        let max_pending = self.config.storage.max_pending_writes;
        let bucket = Arc::clone(&self.bucket);

        // Recovery hooks are cooperative waits: the verification polls a
        // leaf condition (queue backlog, write buffer, rate tokens) until
        // the pressure behind the error streak has cleared.
        self.coordinator.with_components(|components| {
            components.register(
                ComponentSpec::new("capture", ComponentKind::Input)
                    .with_health_check(Arc::new(move || capture_active.load(Ordering::Relaxed)))
                    .with_recovery_step(
                        RecoveryStep::new(
                            "drain_capture_backlog",
                            Arc::new(|_| Ok(())),
                            Arc::new(move || capture_queues.total_depth() < max_depth / 2),
                        )
                        .with_timeout(Duration::from_secs(2)),
                    ),
            )?;
            components.register(
                ComponentSpec::new("processor", ComponentKind::Transform)
                    .depends_on(["capture"])
                    .with_health_check(Arc::new(move || health_queues.total_depth() < max_depth))
                    .with_recovery_step(
                        RecoveryStep::new(
                            "drain_processing_queues",
                            Arc::new(|_| Ok(())),
                            Arc::new(move || {
                                let left = processing_queues
                                    .queue(PipelineStage::Processing, ChannelSide::Left)
                                    .depth();
                                let right = processing_queues
                                    .queue(PipelineStage::Processing, ChannelSide::Right)
                                    .depth();
                                left + right == 0
                            }),
                        )
                        .with_timeout(Duration::from_secs(2)),
                    ),
            )?;
            components.register(
                ComponentSpec::new("storage", ComponentKind::Output)
                    .depends_on(["processor"])
                    .with_health_check(Arc::new(move || storage.pending() < max_pending))
                    .with_recovery_step(
                        RecoveryStep::new(
                            "drain_write_buffer",
                            Arc::new(|_| Ok(())),
                            Arc::new(move || storage_drain.pending() == 0),
                        )
                        .with_timeout(Duration::from_secs(5)),
                    ),
            )?;
            components.register(
                ComponentSpec::new("transcription", ComponentKind::Service)
                    .depends_on(["processor"])
                    .with_recovery_step(
                        RecoveryStep::new(
                            "await_rate_limit",
                            Arc::new(|_| Ok(())),
                            Arc::new(move || bucket.available() >= 1.0),
                        )
                        // One refill interval at the default 10/min limit
                        .with_timeout(Duration::from_secs(7)),
                    ),
            )
        })?
    }

    fn register_cleanup_steps(&self) -> CoreResult<()> {
        let mut cleanup = self.cleanup.lock();

        let coordinator = Arc::clone(&self.coordinator);
        let verify_coord = Arc::clone(&self.coordinator);
        cleanup.register_step(
            CleanupPhase::Initiating,
            vec![],
            Step::new(
                "request_shutdown",
                Box::new(move |_| {
                    coordinator.request_shutdown();
                    Ok(())
                }),
                Box::new(move || verify_coord.is_shutdown_requested()),
            ),
        )?;

        let coordinator = Arc::clone(&self.coordinator);
        let verify_coord = Arc::clone(&self.coordinator);
        cleanup.register_step(
            CleanupPhase::Initiating,
            vec!["request_shutdown".into()],
            Step::new(
                "stop_monitoring",
                Box::new(move |_| coordinator.stop_monitoring().map_err(|e| e.to_string())),
                Box::new(move || !verify_coord.is_monitoring_active()),
            ),
        )?;

        let capture_stop = Arc::clone(&self.ctx.capture_stop);
        let capture_active = Arc::clone(&self.ctx.capture_active);
        cleanup.register_step(
            CleanupPhase::StoppingCapture,
            vec!["stop_monitoring".into()],
            Step::new(
                "stop_capture",
                Box::new(move |_| {
                    capture_stop.store(true, Ordering::SeqCst);
                    Ok(())
                }),
                Box::new(move || !capture_active.load(Ordering::SeqCst)),
            ),
        )?;

        let queues = Arc::clone(&self.queues);
        let storage = Arc::clone(&self.storage);
        let coordinator = Arc::clone(&self.coordinator);
        let verify_storage = Arc::clone(&self.storage);
        let ctx = Arc::clone(&self.ctx);
        cleanup.register_step(
            CleanupPhase::FlushingStorage,
            vec!["stop_capture".into()],
            Step::new(
                "flush_storage",
                Box::new(move |_| {
                    // Whatever is still sitting in the pipeline queues
                    // becomes a write job; leftovers go to the emergency
                    // directory rather than being lost.
                    for stage in PipelineStage::ALL {
                        queues.begin_drain(stage);
                    }
                    for item in queues.drain_all() {
                        let channel = item.buffer.tag().channel;
                        let payload_len = item.payload_len;
                        let (id, data) = item.buffer.into_parts();
                        if channel == ChannelSide::None {
                            // Raw interleaved frames have no recording
                            // destination; hand the buffer straight back
                            let _ = coordinator.release_resource_parts(id, data);
                            continue;
                        }
                        let path = ctx.chunk_path(channel);
                        if let Err(e) =
                            storage.write(WriteJob::pooled(path, data, payload_len, id))
                        {
                            warn!(error = %e, "drain write rejected");
                        }
                    }
                    if !storage.flush(Duration::from_secs(5)) {
                        let report = storage.emergency_flush();
                        info!(
                            written = report.written.len(),
                            failed = report.failed,
                            "emergency flush during cleanup"
                        );
                    }
                    storage.close();
                    Ok(())
                }),
                Box::new(move || verify_storage.pending() == 0),
            )
            .with_timeout(Duration::from_secs(10)),
        )?;

        let coordinator = Arc::clone(&self.coordinator);
        let verify_coord = Arc::clone(&self.coordinator);
        cleanup.register_step(
            CleanupPhase::ReleasingResources,
            vec!["flush_storage".into()],
            Step::new(
                "release_pool_buffers",
                Box::new(move |_| {
                    let leaked = coordinator.pool().shutdown();
                    if leaked > 0 {
                        warn!(leaked, "buffers still checked out at cleanup");
                    }
                    Ok(())
                }),
                Box::new(move || verify_coord.pool_stats().total_in_use() == 0),
            )
            .optional(),
        )?;

        let backups = Arc::clone(&self.backups);
        let verify_backups = Arc::clone(&self.backups);
        cleanup.register_step(
            CleanupPhase::ReleasingResources,
            vec!["flush_storage".into()],
            Step::new(
                "cleanup_backups",
                Box::new(move |_| {
                    let manager = backups.lock();
                    manager.prune_orphans().map_err(|e| e.to_string())?;
                    manager.rotate(None).map_err(|e| e.to_string())?;
                    Ok(())
                }),
                Box::new(move || verify_backups.lock().within_limits()),
            ),
        )?;

        let closer = Arc::clone(&self.log_closer);
        let verify_closer = Arc::clone(&self.log_closer);
        cleanup.register_step(
            CleanupPhase::ClosingLogs,
            vec!["release_pool_buffers".into(), "cleanup_backups".into()],
            Step::new(
                "close_log_handlers",
                Box::new(move |_| {
                    if let Some(mut close) = closer.lock().take() {
                        close();
                    }
                    Ok(())
                }),
                Box::new(move || verify_closer.lock().is_none()),
            ),
        )?;

        Ok(())
    }

    /// Install the closure that tears down file logging; invoked by the
    /// CLOSING_LOGS cleanup step.
    pub fn set_log_closer(&self, closer: Box<dyn FnMut() + Send>) {
        *self.log_closer.lock() = Some(closer);
    }

    /// Initialize components in dependency order (with rollback), spawn
    /// the workers and start monitoring.
    pub fn start(&self) -> CoreResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(session = %self.config.session_id, "engine starting");

        let mut source = self
            .source
            .lock()
            .take()
            .ok_or_else(|| CoreError::Config("engine already consumed its source".into()))?;

        let order = self.coordinator.with_components(|c| c.resolve_init_order())?;
        let mut started: Vec<String> = Vec::new();
        for id in &order {
            self.coordinator
                .with_components(|c| c.transition(id, ComponentState::Initializing))??;

            let init_result: CoreResult<()> = match id.as_str() {
                "capture" => source.start().map_err(CoreError::from),
                "storage" => {
                    self.storage.start();
                    Ok(())
                }
                _ => Ok(()),
            };

            if let Err(e) = init_result {
                warn!(component = %id, error = %e, "initialization failed, rolling back");
                self.coordinator
                    .with_components(|c| {
                        let _ = c.transition(id, ComponentState::Failed);
                        for prev in started.iter().rev() {
                            let _ = c.transition(prev, ComponentState::Stopping);
                            let _ = c.transition(prev, ComponentState::Stopped);
                        }
                    })?;
                if started.iter().any(|s| s == "capture") {
                    source.stop();
                }
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }

            self.coordinator
                .with_components(|c| c.transition(id, ComponentState::Running))??;
            started.push(id.clone());
        }

        let mut workers = self.workers.lock();

        let ctx = Arc::clone(&self.ctx);
        workers.push(spawn_worker("lyrebird-capture", move || {
            capture_worker(ctx, source)
        }));

        let ctx = Arc::clone(&self.ctx);
        workers.push(spawn_worker("lyrebird-processing", move || {
            processing_worker(ctx)
        }));

        let ctx = Arc::clone(&self.ctx);
        workers.push(spawn_worker("lyrebird-storage-route", move || {
            storage_worker(ctx)
        }));

        let ctx = Arc::clone(&self.ctx);
        let segments_rx = self.segments_rx.clone();
        let client = Arc::clone(&self.client);
        let bucket = Arc::clone(&self.bucket);
        let retry = self.retry;
        let transcripts = Arc::clone(&self.transcripts);
        workers.push(spawn_worker("lyrebird-transcribe", move || {
            transcription_worker(ctx, segments_rx, client, bucket, retry, transcripts)
        }));

        let ctx = Arc::clone(&self.ctx);
        let perf_log = Arc::clone(&self.perf_log);
        workers.push(spawn_worker("lyrebird-telemetry", move || {
            telemetry_worker(ctx, perf_log)
        }));
        drop(workers);

        self.coordinator.start_monitoring()?;
        self.ctx.send_event(PipelineEvent::Started);
        info!("engine started");
        Ok(())
    }

    /// Orderly shutdown through the cleanup coordinator. Idempotent.
    pub fn shutdown(&self) -> CoreResult<CleanupOutcome> {
        info!("engine shutting down");
        self.coordinator.request_shutdown();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        // Best-effort lifecycle transitions in reverse dependency order
        let order = self
            .coordinator
            .with_components(|c| c.resolve_shutdown_order())?;
        self.coordinator.with_components(|c| {
            for id in &order {
                let _ = c.transition(id, ComponentState::Stopping);
                let _ = c.transition(id, ComponentState::Stopped);
            }
        })?;

        let outcome = self.cleanup.lock().execute(&CancelToken::new());
        let _ = self.transcripts.lock().flush();
        self.ctx.send_event(PipelineEvent::Stopped);
        info!("engine shut down");
        Ok(outcome)
    }

    /// Non-blocking event poll.
    pub fn poll_event(&self) -> Option<PipelineEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Blocking event wait with timeout.
    pub fn wait_event(&self, timeout: Duration) -> Option<PipelineEvent> {
        self.events_rx.recv_timeout(timeout).ok()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.coordinator.is_shutdown_requested()
    }

    pub fn is_capture_active(&self) -> bool {
        self.ctx.capture_active.load(Ordering::SeqCst)
    }

    /// Block until capture winds down or the timeout passes.
    pub fn wait_for_capture_end(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_capture_active() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        true
    }

    pub fn coordinator(&self) -> &Arc<MonitoringCoordinator> {
        &self.coordinator
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    pub fn status(&self) -> CoreResult<EngineStatus> {
        Ok(EngineStatus {
            components: self.coordinator.with_components(|c| c.states())?,
            metrics: self.coordinator.get_metrics()?,
            queues: self.queues.stats(),
            storage: self.storage.metrics(),
            pool: self.coordinator.pool_stats(),
            cleanup: self.cleanup.lock().status(),
        })
    }

    /// Snapshot the session into a new backup.
    pub fn create_backup(&self, incremental: bool) -> CoreResult<String> {
        Ok(self.backups.lock().create_backup(incremental)?)
    }

    pub fn verify_backup(&self, id: &str) -> CoreResult<()> {
        Ok(self.backups.lock().verify_backup(id)?)
    }

    /// Pack the finished session into `archives/session_<id>.tar.gz`.
    pub fn archive_session(&self) -> CoreResult<PathBuf> {
        let archiver = SessionArchiver::new(self.layout.clone());
        Ok(archiver.archive_session(&self.config.session_id)?)
    }
}

fn spawn_worker(name: &str, body: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("failed to spawn pipeline worker")
}

// ----------------------------------------------------------------------
// Workers
// ----------------------------------------------------------------------

fn capture_worker(ctx: Arc<WorkerCtx>, mut source: Box<dyn CaptureSource>) {
    let handle = ctx.coordinator.register_thread("capture").ok();
    ctx.capture_active.store(true, Ordering::SeqCst);
    let device_events = source.events();
    debug!("capture worker running");

    while !ctx.shutdown.load(Ordering::SeqCst) && !ctx.capture_stop.load(Ordering::SeqCst) {
        while let Ok(event) = device_events.try_recv() {
            ctx.send_event(PipelineEvent::Device(event));
        }

        match source.read_frame(ctx.config.read_timeout) {
            Ok(frame) => {
                let len = frame.bytes.len();
                match ctx
                    .coordinator
                    .allocate_resource("capture", ChannelSide::None, len)
                {
                    Ok(mut buf) => {
                        buf.data[..len].copy_from_slice(&frame.bytes);
                        match ctx.queues.put(
                            PipelineStage::Capture,
                            ChannelSide::None,
                            QueueItem::new(buf, len),
                            ctx.config.read_timeout,
                        ) {
                            Ok(()) => ctx.coordinator.note_success("capture"),
                            Err((item, e)) => {
                                match &e {
                                    CoreError::QueueFull(queue) => ctx.send_event(
                                        PipelineEvent::QueueOverflow {
                                            queue: queue.clone(),
                                        },
                                    ),
                                    _ => ctx.send_event(PipelineEvent::FrameDropped {
                                        reason: e.to_string(),
                                    }),
                                }
                                let closed = matches!(e, CoreError::QueueClosed(_));
                                let _ =
                                    ctx.coordinator.release_resource(item.buffer, "capture");
                                if closed {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        // Pool exhausted is an ordinary, recoverable error:
                        // drop the frame and keep capturing
                        ctx.send_event(PipelineEvent::FrameDropped {
                            reason: e.to_string(),
                        });
                        ctx.report_error(&e, "capture");
                    }
                }
            }
            Err(CaptureError::TimedOut) => continue,
            Err(CaptureError::Eos) => {
                info!("capture source reached end of stream");
                ctx.send_event(PipelineEvent::CaptureEnded);
                break;
            }
            Err(e @ CaptureError::DeviceLost(_)) => {
                ctx.report_error(&e, "capture");
                let _ = ctx
                    .coordinator
                    .update_metrics(MetricsPatch::new().stream_health(false));
                ctx.send_event(PipelineEvent::Error {
                    component: "capture".into(),
                    message: e.to_string(),
                });
                break;
            }
            Err(CaptureError::NotActive) => break,
        }
    }

    source.stop();
    ctx.capture_active.store(false, Ordering::SeqCst);
    if let Some(h) = handle {
        let _ = ctx.coordinator.unregister_thread(h);
    }
    debug!("capture worker exited");
}

fn processing_worker(ctx: Arc<WorkerCtx>) {
    let handle = ctx.coordinator.register_thread("processor").ok();
    let mut processor = SignalProcessor::new(ctx.config.processor);
    let min_ms = ctx.config.min_segment_ms;
    let rate = ctx.config.sample_rate;
    let mut left_assembler = SegmentAssembler::new(ChannelSide::Left, rate, min_ms);
    let mut right_assembler = SegmentAssembler::new(ChannelSide::Right, rate, min_ms);
    debug!("processing worker running");

    while !ctx.shutdown.load(Ordering::SeqCst) {
        let raw = match ctx.queues.get(
            PipelineStage::Capture,
            ChannelSide::None,
            ctx.config.read_timeout,
        ) {
            Ok(item) => item,
            Err(CoreError::QueueEmpty(_)) => continue,
            Err(CoreError::QueueClosed(_)) => break,
            Err(e) => {
                ctx.report_error(&e, "processor");
                continue;
            }
        };

        let payload = raw.payload_len;
        let channel_len = payload / 2;
        let depth = ctx.queues.total_depth();

        let left = ctx
            .coordinator
            .allocate_resource("processor", ChannelSide::Left, channel_len);
        let right = ctx
            .coordinator
            .allocate_resource("processor", ChannelSide::Right, channel_len);

        match (left, right) {
            (Ok(lbuf), Ok(rbuf)) => {
                // Scoped release: the guards settle pool accounting on
                // every exit path, including a panic in the frame math
                let raw_guard = ScopedResource::new(&ctx.coordinator, "capture", raw.buffer);
                let mut lguard = ScopedResource::new(&ctx.coordinator, "processor", lbuf);
                let mut rguard = ScopedResource::new(&ctx.coordinator, "processor", rbuf);

                let result = processor.process_frame(
                    &raw_guard.buffer().data[..payload],
                    depth,
                    lguard.data_mut(),
                    rguard.data_mut(),
                );
                drop(raw_guard);

                match result {
                    Ok(report) => {
                        let now_ms = ctx.now_ms();
                        if report.degraded {
                            ctx.send_event(PipelineEvent::DegradedFallback {
                                reason: "processing load shedding".into(),
                            });
                        }
                        if let Some(sync) = report.sync {
                            ctx.send_event(PipelineEvent::SyncApplied {
                                offset: sync.offset,
                                correlation: sync.correlation,
                            });
                        }
                        if let Some((left_stats, right_stats)) = &report.stats {
                            for (side, stats) in [
                                (ChannelSide::Left, left_stats),
                                (ChannelSide::Right, right_stats),
                            ] {
                                let mut values = BTreeMap::new();
                                values.insert("quality".to_string(), stats.quality as f64);
                                values.insert("peak".to_string(), stats.peak as f64);
                                values.insert("rms".to_string(), stats.rms as f64);
                                values.insert(
                                    "processing_ms".to_string(),
                                    report.processing_ms,
                                );
                                let _ = ctx
                                    .coordinator
                                    .update_channel_performance_stats("processor", side, values);
                                let _ = ctx.coordinator.update_channel_metrics(
                                    side,
                                    ChannelPatch::new().latency_ms(report.processing_ms),
                                );
                            }
                        }

                        if let Some(segment) =
                            left_assembler.push(&lguard.buffer().data[..report.left_len], now_ms)
                        {
                            let _ = ctx.segments_tx.try_send(segment);
                        }
                        if let Some(segment) =
                            right_assembler.push(&rguard.buffer().data[..report.right_len], now_ms)
                        {
                            let _ = ctx.segments_tx.try_send(segment);
                        }

                        enqueue_or_release(&ctx, ChannelSide::Left, lguard.take(), report.left_len);
                        enqueue_or_release(&ctx, ChannelSide::Right, rguard.take(), report.right_len);
                        ctx.coordinator.note_success("processor");
                    }
                    Err(e) => {
                        // lguard / rguard release on drop
                        ctx.report_error(&e, "processor");
                    }
                }
            }
            (left, right) => {
                // Pool pressure: minimal in-place split with owned halves,
                // persisted directly so no audio is lost
                for buf in [left, right].into_iter().flatten() {
                    let _ = ctx.coordinator.release_resource(buf, "processor");
                }
                let (left_bytes, right_bytes) = fallback_split(&raw.buffer.data[..payload]);
                let _ = ctx.coordinator.release_resource(raw.buffer, "capture");
                ctx.send_event(PipelineEvent::DegradedFallback {
                    reason: "buffer pool exhausted".into(),
                });

                for (channel, bytes) in [
                    (ChannelSide::Left, left_bytes),
                    (ChannelSide::Right, right_bytes),
                ] {
                    let path = ctx.chunk_path(channel);
                    if let Err(e) = ctx.storage.write(WriteJob::owned(path, bytes)) {
                        ctx.report_error(&e, "storage");
                    }
                }
            }
        }

        // Adaptive queue tuning rides on the latest metrics snapshot;
        // the optimizer enforces its own cooldown
        if let Ok(metrics) = ctx.coordinator.get_metrics() {
            let _ = ctx
                .queues
                .optimize(metrics.cpu_usage_pct, metrics.memory_usage_pct);
        }
    }

    for assembler in [&mut left_assembler, &mut right_assembler] {
        if let Some(segment) = assembler.flush() {
            let _ = ctx.segments_tx.try_send(segment);
        }
    }
    if let Some(h) = handle {
        let _ = ctx.coordinator.unregister_thread(h);
    }
    debug!("processing worker exited");
}

fn enqueue_or_release(ctx: &WorkerCtx, channel: ChannelSide, buf: crate::pool::PooledBuffer, len: usize) {
    match ctx.queues.put(
        PipelineStage::Processing,
        channel,
        QueueItem::new(buf, len),
        ctx.config.read_timeout,
    ) {
        Ok(()) => {}
        Err((item, e)) => {
            if let CoreError::QueueFull(queue) = &e {
                ctx.send_event(PipelineEvent::QueueOverflow {
                    queue: queue.clone(),
                });
            }
            let _ = ctx.coordinator.release_resource(item.buffer, "processor");
        }
    }
}

fn storage_worker(ctx: Arc<WorkerCtx>) {
    let handle = ctx.coordinator.register_thread("storage").ok();
    let hop_timeout = Duration::from_millis(20);
    debug!("storage worker running");

    loop {
        let mut moved = false;
        for channel in [ChannelSide::Left, ChannelSide::Right] {
            // Stage hop: processing output becomes storage-owned
            if let Ok(item) = ctx
                .queues
                .get(PipelineStage::Processing, channel, hop_timeout)
            {
                moved = true;
                match ctx
                    .queues
                    .put(PipelineStage::Storage, channel, item, hop_timeout)
                {
                    Ok(()) => {}
                    // Storage queue under pressure or closed: write directly
                    Err((item, _)) => write_chunk(&ctx, channel, item),
                }
            }

            if let Ok(item) = ctx
                .queues
                .get(PipelineStage::Storage, channel, hop_timeout)
            {
                moved = true;
                write_chunk(&ctx, channel, item);
            }
        }

        if ctx.shutdown.load(Ordering::SeqCst) && !moved {
            break;
        }
    }

    if let Some(h) = handle {
        let _ = ctx.coordinator.unregister_thread(h);
    }
    debug!("storage worker exited");
}

fn write_chunk(ctx: &WorkerCtx, channel: ChannelSide, item: QueueItem) {
    let path = ctx.chunk_path(channel);
    let payload_len = item.payload_len;
    let (id, data) = item.buffer.into_parts();
    match ctx.storage.write(WriteJob::pooled(path, data, payload_len, id)) {
        Ok(()) => ctx.coordinator.note_success("storage"),
        Err(e) => {
            // The manager hands the buffer back through the releaser on
            // every failure path; only the error needs recording here
            ctx.report_error(&e, "storage");
        }
    }
}

fn transcription_worker(
    ctx: Arc<WorkerCtx>,
    segments_rx: Receiver<SpeakerSegment>,
    client: Arc<dyn TranscriptionClient>,
    bucket: Arc<TokenBucket>,
    retry: RetryPolicy,
    transcripts: Arc<Mutex<TranscriptWriter>>,
) {
    let handle = ctx.coordinator.register_thread("transcription").ok();
    debug!("transcription worker running");

    loop {
        let segment = match segments_rx.recv_timeout(ctx.config.read_timeout) {
            Ok(segment) => segment,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if ctx.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };

        let request = TranscriptionRequest {
            audio: segment.audio.clone(),
            sample_rate: ctx.config.sample_rate,
            channel: segment.channel.as_str().to_string(),
        };

        match submit_with_retry(client.as_ref(), &bucket, &retry, request, &ctx.shutdown) {
            Ok(result) => {
                let duration_ms = segment.duration_ms();
                let record = TranscriptRecord {
                    timestamp: chrono::Utc::now(),
                    speaker_id: segment.speaker_id.clone(),
                    text: result.text.clone(),
                    confidence: result.confidence,
                    channel: segment.channel.as_str().to_string(),
                    duration_ms,
                    cost: duration_ms / 60_000.0 * COST_PER_MINUTE,
                };
                {
                    let mut writer = transcripts.lock();
                    writer.append(record);
                    if let Err(e) = writer.flush() {
                        ctx.report_error(&e, "transcription");
                    }
                }
                ctx.send_event(PipelineEvent::TranscriptionReady {
                    channel: segment.channel,
                    text: result.text,
                    confidence: result.confidence,
                });
                ctx.coordinator.note_success("transcription");
            }
            Err(lyrebird_platform::TranscribeError::Shutdown) => break,
            Err(e) => {
                ctx.report_error(&e, "transcription");
                ctx.send_event(PipelineEvent::Error {
                    component: "transcription".into(),
                    message: e.to_string(),
                });
            }
        }
    }

    if let Some(h) = handle {
        let _ = ctx.coordinator.unregister_thread(h);
    }
    debug!("transcription worker exited");
}

fn telemetry_worker(ctx: Arc<WorkerCtx>, perf_log: Arc<Mutex<PerformanceLog>>) {
    let handle = ctx.coordinator.register_thread("telemetry").ok();
    let interval = ctx.config.monitoring.health_interval;
    debug!("telemetry worker running");

    while !ctx.shutdown.load(Ordering::SeqCst) {
        // Sleep in slices so shutdown stays responsive
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if ctx.shutdown.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }

        match ctx.coordinator.snapshot() {
            Ok(snapshot) => {
                if let Err(e) = perf_log.lock().append(&snapshot) {
                    warn!(error = %e, "performance log append failed");
                }
            }
            Err(e) => warn!(error = %e, "snapshot failed"),
        }
    }

    // One final snapshot on the way out
    if let Ok(snapshot) = ctx.coordinator.snapshot() {
        let _ = perf_log.lock().append(&snapshot);
    }
    if let Some(h) = handle {
        let _ = ctx.coordinator.unregister_thread(h);
    }
    debug!("telemetry worker exited");
}
