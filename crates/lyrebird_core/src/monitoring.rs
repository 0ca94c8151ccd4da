//! Monitoring Coordinator
//!
//! The single gateway to shared state, metrics, the resource pool, the
//! component registry and the thread registry. All five long-lived locks
//! are ranked (`state < metrics < perf < component < update`); nested
//! acquisition is strictly ascending and every guard releases on every
//! exit path.
//!
//! Metrics are copy-on-write: writers clone-patch-swap an `Arc` snapshot,
//! readers clone the `Arc` out and never hold a lock while reading. A
//! background timer drives periodic health checks; a panicking health
//! callback is caught and converted into an error event.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::components::{ComponentCoordinator, ComponentState, HealthReport, HealthState};
use crate::error::{CoreError, CoreResult};
use crate::locks::{LockRank, RankedLock};
use crate::pool::{BufferTag, BufferTier, ChannelSide, PoolLimits, PoolStats, PooledBuffer, ResourcePool};
use crate::steps::{CancelToken, PlanReport};

/// Monitoring tuning parameters
#[derive(Debug, Clone, Copy)]
pub struct MonitoringConfig {
    /// Interval between background health passes
    pub health_interval: Duration,
    /// Per-component health hook timeout
    pub health_check_timeout: Duration,
    /// Consecutive errors before a component is marked DEGRADED and its
    /// declared recovery is attempted; twice this marks it FAILED
    pub consecutive_error_threshold: u32,
    /// Recovery plan attempts before a component is declared failed
    pub recovery_max_attempts: u32,
    /// How long `stop_monitoring` waits for registered worker threads
    pub thread_join_timeout: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(1),
            health_check_timeout: Duration::from_secs(1),
            consecutive_error_threshold: 3,
            recovery_max_attempts: 3,
            thread_join_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-channel metrics sub-snapshot
///
/// Units: `_pct` fields are 0..100, `_ms` fields are milliseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelMetrics {
    pub cpu_usage_pct: f64,
    pub memory_usage_pct: f64,
    pub buffer_usage_pct: f64,
    pub latency_ms: f64,
    pub in_use_buffers: u64,
    pub errors: u64,
}

/// Process-wide metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringMetrics {
    pub cpu_usage_pct: f64,
    pub memory_usage_pct: f64,
    pub disk_usage_pct: f64,
    pub temperature_c: Option<f64>,
    pub stream_health: bool,
    pub error_count: u64,
    pub recovery_attempts: u64,
    pub last_health_check_ms: Option<u64>,
    pub shutdown_requested: bool,
    pub channels: BTreeMap<String, ChannelMetrics>,
}

impl Default for MonitoringMetrics {
    fn default() -> Self {
        let mut channels = BTreeMap::new();
        channels.insert("left".to_string(), ChannelMetrics::default());
        channels.insert("right".to_string(), ChannelMetrics::default());
        Self {
            cpu_usage_pct: 0.0,
            memory_usage_pct: 0.0,
            disk_usage_pct: 0.0,
            temperature_c: None,
            stream_health: true,
            error_count: 0,
            recovery_attempts: 0,
            last_health_check_ms: None,
            shutdown_requested: false,
            channels,
        }
    }
}

/// Typed patch applied to the metrics snapshot
#[derive(Debug, Clone, Default)]
pub struct MetricsPatch {
    cpu_usage_pct: Option<f64>,
    memory_usage_pct: Option<f64>,
    disk_usage_pct: Option<f64>,
    temperature_c: Option<Option<f64>>,
    stream_health: Option<bool>,
    last_health_check_ms: Option<u64>,
    shutdown_requested: Option<bool>,
}

impl MetricsPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpu_usage_pct(mut self, v: f64) -> Self {
        self.cpu_usage_pct = Some(v);
        self
    }

    pub fn memory_usage_pct(mut self, v: f64) -> Self {
        self.memory_usage_pct = Some(v);
        self
    }

    pub fn disk_usage_pct(mut self, v: f64) -> Self {
        self.disk_usage_pct = Some(v);
        self
    }

    pub fn temperature_c(mut self, v: Option<f64>) -> Self {
        self.temperature_c = Some(v);
        self
    }

    pub fn stream_health(mut self, v: bool) -> Self {
        self.stream_health = Some(v);
        self
    }

    pub fn last_health_check_ms(mut self, v: u64) -> Self {
        self.last_health_check_ms = Some(v);
        self
    }

    pub fn shutdown_requested(mut self, v: bool) -> Self {
        self.shutdown_requested = Some(v);
        self
    }

    fn apply(&self, metrics: &mut MonitoringMetrics) {
        if let Some(v) = self.cpu_usage_pct {
            metrics.cpu_usage_pct = v;
        }
        if let Some(v) = self.memory_usage_pct {
            metrics.memory_usage_pct = v;
        }
        if let Some(v) = self.disk_usage_pct {
            metrics.disk_usage_pct = v;
        }
        if let Some(v) = self.temperature_c {
            metrics.temperature_c = v;
        }
        if let Some(v) = self.stream_health {
            metrics.stream_health = v;
        }
        if let Some(v) = self.last_health_check_ms {
            metrics.last_health_check_ms = Some(v);
        }
        if let Some(v) = self.shutdown_requested {
            metrics.shutdown_requested = v;
        }
    }
}

/// Typed patch for one channel's sub-snapshot
#[derive(Debug, Clone, Default)]
pub struct ChannelPatch {
    cpu_usage_pct: Option<f64>,
    memory_usage_pct: Option<f64>,
    buffer_usage_pct: Option<f64>,
    latency_ms: Option<f64>,
}

impl ChannelPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpu_usage_pct(mut self, v: f64) -> Self {
        self.cpu_usage_pct = Some(v);
        self
    }

    pub fn memory_usage_pct(mut self, v: f64) -> Self {
        self.memory_usage_pct = Some(v);
        self
    }

    pub fn buffer_usage_pct(mut self, v: f64) -> Self {
        self.buffer_usage_pct = Some(v);
        self
    }

    pub fn latency_ms(mut self, v: f64) -> Self {
        self.latency_ms = Some(v);
        self
    }

    fn apply(&self, channel: &mut ChannelMetrics) {
        if let Some(v) = self.cpu_usage_pct {
            channel.cpu_usage_pct = v;
        }
        if let Some(v) = self.memory_usage_pct {
            channel.memory_usage_pct = v;
        }
        if let Some(v) = self.buffer_usage_pct {
            channel.buffer_usage_pct = v;
        }
        if let Some(v) = self.latency_ms {
            channel.latency_ms = v;
        }
    }
}

/// Context bundle recorded when an error crosses a component boundary
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    pub timestamp: DateTime<Utc>,
    pub thread: String,
    pub component: String,
    pub component_state: Option<ComponentState>,
    pub pool: PoolStats,
    /// Rendered cause chain, outermost first
    pub chain: Vec<String>,
}

/// Handle returned by `register_thread`
#[derive(Debug)]
pub struct ThreadHandle {
    id: u64,
    pub name: String,
}

/// Per-component performance stats with optional channel breakdowns
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComponentPerf {
    pub values: BTreeMap<String, f64>,
    pub channels: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Snapshot persisted to the performance JSONL log
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_ms: u64,
    pub metrics: MonitoringMetrics,
    pub performance: BTreeMap<String, ComponentPerf>,
    pub pool: PoolStats,
    pub components: BTreeMap<String, ComponentState>,
}

struct StateInner {
    monitoring_active: bool,
    last_error: Option<ErrorContext>,
}

struct UpdateInner {
    threads: BTreeMap<u64, String>,
    next_thread_id: u64,
    snapshot_version: u64,
}

/// Owner of shared state, metrics, the pool and the lock hierarchy
pub struct MonitoringCoordinator {
    config: MonitoringConfig,
    state: RankedLock<StateInner>,
    metrics: RankedLock<Arc<MonitoringMetrics>>,
    perf: RankedLock<BTreeMap<String, ComponentPerf>>,
    components: RankedLock<ComponentCoordinator>,
    update: RankedLock<UpdateInner>,
    pool: ResourcePool,
    shutdown: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
    timer_stop: Arc<(Mutex<bool>, Condvar)>,
    started_at: Instant,
}

impl MonitoringCoordinator {
    pub fn new(config: MonitoringConfig, pool_limits: PoolLimits) -> Self {
        Self {
            state: RankedLock::new(
                LockRank::State,
                StateInner {
                    monitoring_active: false,
                    last_error: None,
                },
            ),
            metrics: RankedLock::new(LockRank::Metrics, Arc::new(MonitoringMetrics::default())),
            perf: RankedLock::new(LockRank::Perf, BTreeMap::new()),
            components: RankedLock::new(
                LockRank::Component,
                ComponentCoordinator::new(config.health_check_timeout),
            ),
            update: RankedLock::new(
                LockRank::Update,
                UpdateInner {
                    threads: BTreeMap::new(),
                    next_thread_id: 0,
                    snapshot_version: 0,
                },
            ),
            pool: ResourcePool::new(pool_limits),
            shutdown: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
            timer_stop: Arc::new((Mutex::new(false), Condvar::new())),
            config,
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Shared shutdown flag, polled by workers and blocking primitives
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    // ------------------------------------------------------------------
    // Monitoring lifecycle
    // ------------------------------------------------------------------

    /// Start the periodic health-check timer. Idempotent: a second call
    /// while active does not create another timer.
    pub fn start_monitoring(self: &Arc<Self>) -> CoreResult<()> {
        {
            let mut state = self.state.guard()?;
            if state.monitoring_active {
                return Ok(());
            }
            state.monitoring_active = true;
        }

        *self.timer_stop.0.lock() = false;
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("lyrebird-monitor".into())
            .spawn(move || monitor_main(this))
            .expect("failed to spawn monitoring timer");
        *self.timer.lock() = Some(handle);
        info!("monitoring started");
        Ok(())
    }

    /// Stop the timer and wait for registered worker threads to check out.
    /// Idempotent.
    pub fn stop_monitoring(&self) -> CoreResult<()> {
        {
            let (lock, condvar) = &*self.timer_stop;
            *lock.lock() = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.timer.lock().take() {
            let _ = handle.join();
        }
        {
            let mut state = self.state.guard()?;
            state.monitoring_active = false;
        }

        // Give registered workers a bounded window to unregister
        let deadline = Instant::now() + self.config.thread_join_timeout;
        loop {
            let remaining = self.update.guard()?.threads.len();
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "stopped monitoring with threads still registered");
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        info!("monitoring stopped");
        Ok(())
    }

    pub fn is_monitoring_active(&self) -> bool {
        self.state
            .try_guard()
            .map(|s| s.monitoring_active)
            .unwrap_or(false)
    }

    /// One health pass: run component checks, refresh stream health.
    /// Called by the timer and directly by tests.
    pub fn check_health_now(&self) -> CoreResult<HealthReport> {
        let report = {
            let components = self.components.guard()?;
            components.check_health()
        };

        let stream_health = report.overall != HealthState::Failed;
        let uptime = self.started_at.elapsed().as_millis() as u64;
        self.update_metrics(
            MetricsPatch::new()
                .stream_health(stream_health)
                .last_health_check_ms(uptime),
        )?;
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Thread registry
    // ------------------------------------------------------------------

    pub fn register_thread(&self, name: &str) -> CoreResult<ThreadHandle> {
        let mut update = self.update.guard()?;
        let id = update.next_thread_id;
        update.next_thread_id += 1;
        update.threads.insert(id, name.to_string());
        debug!(id, name, "thread registered");
        Ok(ThreadHandle {
            id,
            name: name.to_string(),
        })
    }

    pub fn unregister_thread(&self, handle: ThreadHandle) -> CoreResult<()> {
        let mut update = self.update.guard()?;
        update.threads.remove(&handle.id);
        debug!(id = handle.id, name = %handle.name, "thread unregistered");
        Ok(())
    }

    pub fn registered_threads(&self) -> CoreResult<Vec<String>> {
        Ok(self.update.guard()?.threads.values().cloned().collect())
    }

    // ------------------------------------------------------------------
    // Resource operations (the only path to the pool)
    // ------------------------------------------------------------------

    /// Allocate the smallest buffer fitting `len` for `owner`.
    pub fn allocate_resource(
        &self,
        owner: &str,
        channel: ChannelSide,
        len: usize,
    ) -> CoreResult<PooledBuffer> {
        let buffer = self
            .pool
            .allocate_for_len(len, BufferTag::new(owner, channel))?;
        self.note_allocation(owner, channel, buffer.id())?;
        Ok(buffer)
    }

    /// Allocate a buffer of a specific tier for `owner`.
    pub fn allocate_tier(
        &self,
        owner: &str,
        channel: ChannelSide,
        tier: BufferTier,
    ) -> CoreResult<PooledBuffer> {
        let buffer = self.pool.allocate(tier, BufferTag::new(owner, channel))?;
        self.note_allocation(owner, channel, buffer.id())?;
        Ok(buffer)
    }

    fn note_allocation(&self, owner: &str, channel: ChannelSide, buffer_id: u64) -> CoreResult<()> {
        {
            let mut components = self.components.guard()?;
            components.record_resource(owner, channel, buffer_id);
        }
        self.refresh_channel_buffer_counts()
    }

    /// Return a buffer on behalf of `owner`; ownership is verified.
    pub fn release_resource(&self, buffer: PooledBuffer, owner: &str) -> CoreResult<()> {
        let channel = buffer.tag().channel;
        let buffer_id = buffer.id();
        self.pool
            .release(buffer, &BufferTag::new(owner, channel))?;
        {
            let mut components = self.components.guard()?;
            components.forget_resource(owner, channel, buffer_id);
        }
        self.refresh_channel_buffer_counts()
    }

    /// Settle a buffer that traveled as `(id, bytes)` across a seam.
    pub fn release_resource_parts(&self, buffer_id: u64, data: Vec<u8>) -> CoreResult<()> {
        let tag = self.pool.release_parts(buffer_id, data)?;
        {
            let mut components = self.components.guard()?;
            components.forget_resource(&tag.owner, tag.channel, buffer_id);
        }
        self.refresh_channel_buffer_counts()
    }

    fn refresh_channel_buffer_counts(&self) -> CoreResult<()> {
        let stats = self.pool.stats();
        let mut metrics = self.metrics.guard()?;
        let mut next = (**metrics).clone();
        for (name, side) in [("left", ChannelSide::Left), ("right", ChannelSide::Right)] {
            next.channels.entry(name.to_string()).or_default().in_use_buffers =
                stats.channel_in_use(side) as u64;
        }
        *metrics = Arc::new(next);
        drop(metrics);
        self.bump_version()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn reconfigure_pool(&self, limits: PoolLimits) -> CoreResult<()> {
        self.pool.reconfigure(limits)
    }

    pub(crate) fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Metrics (copy-on-write)
    // ------------------------------------------------------------------

    /// Apply a typed patch to the shared metrics snapshot.
    pub fn update_metrics(&self, patch: MetricsPatch) -> CoreResult<()> {
        let mut metrics = self.metrics.guard()?;
        let mut next = (**metrics).clone();
        patch.apply(&mut next);
        *metrics = Arc::new(next);
        drop(metrics);
        self.bump_version()
    }

    /// Apply a typed patch to one channel's sub-snapshot.
    pub fn update_channel_metrics(
        &self,
        channel: ChannelSide,
        patch: ChannelPatch,
    ) -> CoreResult<()> {
        let mut metrics = self.metrics.guard()?;
        let mut next = (**metrics).clone();
        patch.apply(next.channels.entry(channel.as_str().to_string()).or_default());
        *metrics = Arc::new(next);
        drop(metrics);
        self.bump_version()
    }

    /// Cheap snapshot: clones the `Arc`, never blocks writers afterwards.
    pub fn get_metrics(&self) -> CoreResult<Arc<MonitoringMetrics>> {
        Ok(Arc::clone(&*self.metrics.guard()?))
    }

    fn bump_version(&self) -> CoreResult<()> {
        let mut update = self.update.guard()?;
        update.snapshot_version += 1;
        Ok(())
    }

    pub fn snapshot_version(&self) -> CoreResult<u64> {
        Ok(self.update.guard()?.snapshot_version)
    }

    // ------------------------------------------------------------------
    // Performance stats
    // ------------------------------------------------------------------

    pub fn update_performance_stats(
        &self,
        component: &str,
        values: BTreeMap<String, f64>,
    ) -> CoreResult<()> {
        let mut perf = self.perf.guard()?;
        perf.entry(component.to_string()).or_default().values = values;
        Ok(())
    }

    pub fn update_channel_performance_stats(
        &self,
        component: &str,
        channel: ChannelSide,
        values: BTreeMap<String, f64>,
    ) -> CoreResult<()> {
        let mut perf = self.perf.guard()?;
        perf.entry(component.to_string())
            .or_default()
            .channels
            .insert(channel.as_str().to_string(), values);
        Ok(())
    }

    pub fn get_performance_stats(&self) -> CoreResult<BTreeMap<String, ComponentPerf>> {
        Ok(self.perf.guard()?.clone())
    }

    /// Full snapshot for the performance JSONL log.
    pub fn snapshot(&self) -> CoreResult<MonitoringSnapshot> {
        let metrics = (*self.get_metrics()?).clone();
        let performance = self.get_performance_stats()?;
        let components = self.components.guard()?.states();
        Ok(MonitoringSnapshot {
            timestamp: Utc::now(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            metrics,
            performance,
            pool: self.pool.stats(),
            components,
        })
    }

    // ------------------------------------------------------------------
    // Component registry access
    // ------------------------------------------------------------------

    /// Run a closure against the component registry under its lock.
    pub fn with_components<R>(
        &self,
        f: impl FnOnce(&mut ComponentCoordinator) -> R,
    ) -> CoreResult<R> {
        let mut components = self.components.guard()?;
        Ok(f(&mut components))
    }

    // ------------------------------------------------------------------
    // Error handling
    // ------------------------------------------------------------------

    /// Record an error with full context, bump counters and drive the
    /// owning component toward DEGRADED / FAILED on repeated failures.
    ///
    /// Returns the component's consecutive failure streak.
    pub fn handle_error(&self, err: &(dyn std::error::Error + 'static), component: &str) -> u32 {
        let mut chain = Vec::new();
        chain.push(err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        let context = ErrorContext {
            timestamp: Utc::now(),
            thread: std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string(),
            component: component.to_string(),
            component_state: None,
            pool: self.pool.stats(),
            chain,
        };
        warn!(component, error = %err, "error recorded");

        // Canonical ascending acquisition: state -> metrics -> component,
        // released in reverse on every path.
        let Ok(mut state) = self.state.guard() else {
            return 0;
        };
        let Ok(mut metrics) = self.metrics.guard() else {
            return 0;
        };
        let Ok(mut components) = self.components.guard() else {
            return 0;
        };

        let streak = components.note_failure(component);
        let component_state = components.state(component).ok();

        let threshold = self.config.consecutive_error_threshold;
        if streak == threshold {
            if component_state == Some(ComponentState::Running) {
                let _ = components.transition(component, ComponentState::Degraded);
                warn!(component, streak, "component degraded after repeated errors");
            }
        } else if streak >= threshold * 2 {
            if !matches!(component_state, Some(ComponentState::Failed) | None) {
                let _ = components.transition(component, ComponentState::Failed);
                error!(component, streak, "component failed after repeated errors");
            }
        }
        let final_state = components.state(component).ok();
        drop(components);

        let mut next = (**metrics).clone();
        next.error_count += 1;
        *metrics = Arc::new(next);
        drop(metrics);

        state.last_error = Some(ErrorContext {
            component_state: final_state,
            ..context
        });

        streak
    }

    /// Clear a component's failure streak after successful work.
    pub fn note_success(&self, component: &str) {
        if let Ok(mut components) = self.components.guard() {
            components.clear_failures(component);
        }
    }

    pub fn last_error(&self) -> CoreResult<Option<ErrorContext>> {
        Ok(self.state.guard()?.last_error.clone())
    }

    pub fn error_count(&self) -> u64 {
        self.get_metrics().map(|m| m.error_count).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Drive a component's declared recovery steps (bounded retries with
    /// backoff, honoring the shutdown flag) and apply the persistence
    /// policy around the outcome.
    ///
    /// On persistent failure the stream is marked unhealthy and the
    /// component transitions FAILED, so the caller can hand the system to
    /// orderly shutdown. A shutdown-aborted attempt leaves the component
    /// untouched for cleanup to settle.
    pub fn attempt_recovery(&self, component: &str) -> CoreResult<PlanReport> {
        {
            let mut metrics = self.metrics.guard()?;
            let mut next = (**metrics).clone();
            next.recovery_attempts += 1;
            *metrics = Arc::new(next);
        }

        let token = CancelToken::from_flag(self.shutdown_flag());
        let result = {
            let mut components = self.components.guard()?;
            components.attempt_recovery(component, self.config.recovery_max_attempts, &token)
        };

        match result {
            Ok(report) => {
                info!(component, "component recovered");
                Ok(report)
            }
            Err(CoreError::Shutdown) => Err(CoreError::Shutdown),
            Err(e) => {
                error!(component, error = %e, "recovery failed; failing component");
                let _ = self.update_metrics(MetricsPatch::new().stream_health(false));
                if let Ok(mut components) = self.components.guard() {
                    let _ = components.transition(component, ComponentState::Failed);
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Set the shutdown flag and wake any pollers.
    pub fn request_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown requested");
        let (_, condvar) = &*self.timer_stop;
        condvar.notify_all();
        let _ = self.update_metrics(MetricsPatch::new().shutdown_requested(true));
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Timer loop: condvar-interruptible sleep, panic-isolated health passes.
fn monitor_main(this: Arc<MonitoringCoordinator>) {
    loop {
        {
            let (lock, condvar) = &*this.timer_stop;
            let mut stop = lock.lock();
            if *stop {
                break;
            }
            condvar.wait_for(&mut stop, this.config.health_interval);
            if *stop {
                break;
            }
        }
        if this.is_shutdown_requested() {
            break;
        }

        match catch_unwind(AssertUnwindSafe(|| this.check_health_now())) {
            Ok(Ok(report)) => {
                debug!(overall = ?report.overall, "health pass");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "health pass failed");
                this.handle_error(&e, "monitoring");
            }
            Err(_) => {
                // A panicking callback must not kill the timer
                error!("health pass panicked; converted to error event");
                let panic_err = CoreError::HealthCheckFailed("monitoring".into());
                this.handle_error(&panic_err, "monitoring");
            }
        }
    }
    debug!("monitoring timer exited");
}

/// A checked-out buffer that returns itself through the coordinator when
/// dropped, unless it is `take`n for handoff.
///
/// Worker code wraps its allocations in this so every exit path, panics
/// included, settles the pool accounting.
pub struct ScopedResource<'a> {
    coordinator: &'a MonitoringCoordinator,
    owner: &'a str,
    buffer: Option<PooledBuffer>,
}

impl<'a> ScopedResource<'a> {
    pub fn new(
        coordinator: &'a MonitoringCoordinator,
        owner: &'a str,
        buffer: PooledBuffer,
    ) -> Self {
        Self {
            coordinator,
            owner,
            buffer: Some(buffer),
        }
    }

    pub fn buffer(&self) -> &PooledBuffer {
        self.buffer.as_ref().expect("scoped buffer already taken")
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut().expect("scoped buffer already taken").data
    }

    /// Move the buffer out, defusing the drop release.
    pub fn take(mut self) -> PooledBuffer {
        self.buffer.take().expect("scoped buffer already taken")
    }
}

impl Drop for ScopedResource<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Err(e) = self.coordinator.release_resource(buffer, self.owner) {
                warn!(owner = self.owner, error = %e, "scoped release failed");
            }
        }
    }
}

/// Adapter letting the storage writer hand pool buffers back through the
/// coordinator.
pub struct CoordinatorReleaser {
    coordinator: Arc<MonitoringCoordinator>,
}

impl CoordinatorReleaser {
    pub fn new(coordinator: Arc<MonitoringCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl lyrebird_storage::BufferReleaser for CoordinatorReleaser {
    fn release(&self, buffer_id: u64, data: Vec<u8>) {
        if let Err(e) = self.coordinator.release_resource_parts(buffer_id, data) {
            warn!(buffer_id, error = %e, "buffer release after write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{ComponentKind, ComponentSpec, RecoveryStep};

    fn coordinator() -> Arc<MonitoringCoordinator> {
        Arc::new(MonitoringCoordinator::new(
            MonitoringConfig {
                health_interval: Duration::from_millis(50),
                ..Default::default()
            },
            PoolLimits::default(),
        ))
    }

    #[test]
    fn test_metrics_patch_roundtrip() {
        let c = coordinator();
        c.update_metrics(
            MetricsPatch::new()
                .cpu_usage_pct(50.0)
                .memory_usage_pct(80.0)
                .disk_usage_pct(60.0),
        )
        .unwrap();

        let m = c.get_metrics().unwrap();
        assert_eq!(m.cpu_usage_pct, 50.0);
        assert_eq!(m.memory_usage_pct, 80.0);
        assert_eq!(m.disk_usage_pct, 60.0);
        assert!(m.stream_health);
        assert_eq!(m.error_count, 0);
    }

    #[test]
    fn test_metrics_snapshots_are_immutable() {
        let c = coordinator();
        let before = c.get_metrics().unwrap();
        c.update_metrics(MetricsPatch::new().cpu_usage_pct(99.0))
            .unwrap();
        // The old snapshot is untouched; readers never see tearing
        assert_eq!(before.cpu_usage_pct, 0.0);
        assert_eq!(c.get_metrics().unwrap().cpu_usage_pct, 99.0);
    }

    #[test]
    fn test_snapshot_version_monotonic() {
        let c = coordinator();
        let v0 = c.snapshot_version().unwrap();
        c.update_metrics(MetricsPatch::new().cpu_usage_pct(1.0))
            .unwrap();
        let v1 = c.snapshot_version().unwrap();
        c.update_channel_metrics(ChannelSide::Left, ChannelPatch::new().latency_ms(2.0))
            .unwrap();
        let v2 = c.snapshot_version().unwrap();
        assert!(v0 < v1 && v1 < v2);
    }

    #[test]
    fn test_channel_metrics() {
        let c = coordinator();
        c.update_channel_metrics(
            ChannelSide::Left,
            ChannelPatch::new()
                .cpu_usage_pct(40.0)
                .buffer_usage_pct(50.0)
                .latency_ms(0.1),
        )
        .unwrap();

        let m = c.get_metrics().unwrap();
        let left = &m.channels["left"];
        assert_eq!(left.cpu_usage_pct, 40.0);
        assert_eq!(left.buffer_usage_pct, 50.0);
        assert_eq!(left.latency_ms, 0.1);
        // Right channel untouched
        assert_eq!(m.channels["right"].cpu_usage_pct, 0.0);
    }

    #[test]
    fn test_thread_registry_roundtrip() {
        let c = coordinator();
        let before = c.registered_threads().unwrap();

        let handle = c.register_thread("worker-1").unwrap();
        assert_eq!(c.registered_threads().unwrap(), vec!["worker-1"]);

        c.unregister_thread(handle).unwrap();
        assert_eq!(c.registered_threads().unwrap(), before);
    }

    #[test]
    fn test_resource_ops_update_channel_counts() {
        let c = coordinator();
        c.with_components(|comps| {
            comps.register(ComponentSpec::new("processor", ComponentKind::Transform))
        })
        .unwrap()
        .unwrap();

        let buf = c
            .allocate_resource("processor", ChannelSide::Left, 1000)
            .unwrap();
        assert_eq!(c.get_metrics().unwrap().channels["left"].in_use_buffers, 1);
        assert_eq!(
            c.with_components(|comps| comps.owned_resources("processor", ChannelSide::Left))
                .unwrap(),
            1
        );

        c.release_resource(buf, "processor").unwrap();
        assert_eq!(c.get_metrics().unwrap().channels["left"].in_use_buffers, 0);
        assert_eq!(c.pool_stats().total_in_use(), 0);
    }

    #[test]
    fn test_allocate_release_restores_pool_stats() {
        let c = coordinator();
        let before = c.pool_stats();
        let buf = c
            .allocate_resource("anyone", ChannelSide::None, 4096)
            .unwrap();
        c.release_resource(buf, "anyone").unwrap();
        let after = c.pool_stats();

        assert_eq!(
            before.tier(BufferTier::Small).in_use,
            after.tier(BufferTier::Small).in_use
        );
        assert_eq!(after.total_in_use(), 0);
    }

    #[test]
    fn test_scoped_resource_releases_on_drop() {
        let c = coordinator();
        let buf = c
            .allocate_resource("worker", ChannelSide::Left, 100)
            .unwrap();
        {
            let _guard = ScopedResource::new(&c, "worker", buf);
            assert_eq!(c.pool_stats().total_in_use(), 1);
        }
        assert_eq!(c.pool_stats().total_in_use(), 0);
    }

    #[test]
    fn test_scoped_resource_take_defuses_release() {
        let c = coordinator();
        let buf = c
            .allocate_resource("worker", ChannelSide::Left, 100)
            .unwrap();
        let guard = ScopedResource::new(&c, "worker", buf);
        let buf = guard.take();
        assert_eq!(c.pool_stats().total_in_use(), 1, "still checked out");
        c.release_resource(buf, "worker").unwrap();
        assert_eq!(c.pool_stats().total_in_use(), 0);
    }

    #[test]
    fn test_release_parts_by_seam() {
        let c = coordinator();
        let buf = c
            .allocate_resource("storage", ChannelSide::Right, 100)
            .unwrap();
        let (id, data) = buf.into_parts();
        c.release_resource_parts(id, data).unwrap();
        assert_eq!(c.pool_stats().total_in_use(), 0);
    }

    #[test]
    fn test_handle_error_records_context_and_chain() {
        let c = coordinator();
        c.with_components(|comps| {
            comps.register(ComponentSpec::new("capture", ComponentKind::Input))
        })
        .unwrap()
        .unwrap();

        let io = std::io::Error::new(std::io::ErrorKind::Other, "device gone");
        let err = lyrebird_storage::StorageError::from_io(std::path::Path::new("/dev/audio"), io);
        let streak = c.handle_error(&err, "capture");
        assert_eq!(streak, 1);

        let context = c.last_error().unwrap().expect("context recorded");
        assert_eq!(context.component, "capture");
        assert!(context.chain.len() >= 2, "chain: {:?}", context.chain);
        assert!(context.chain[1].contains("device gone"));
        assert_eq!(c.error_count(), 1);
    }

    #[test]
    fn test_consecutive_errors_degrade_then_fail() {
        let c = coordinator();
        c.with_components(|comps| {
            comps
                .register(ComponentSpec::new("proc", ComponentKind::Transform))
                .unwrap();
            comps.transition("proc", ComponentState::Initializing).unwrap();
            comps.transition("proc", ComponentState::Running).unwrap();
        })
        .unwrap();

        let err = CoreError::HealthCheckFailed("proc".into());
        c.handle_error(&err, "proc");
        c.handle_error(&err, "proc");
        assert_eq!(
            c.with_components(|comps| comps.state("proc").unwrap()).unwrap(),
            ComponentState::Running
        );

        // Third consecutive error crosses the threshold
        c.handle_error(&err, "proc");
        assert_eq!(
            c.with_components(|comps| comps.state("proc").unwrap()).unwrap(),
            ComponentState::Degraded
        );

        // Twice the threshold fails the component
        for _ in 0..3 {
            c.handle_error(&err, "proc");
        }
        assert_eq!(
            c.with_components(|comps| comps.state("proc").unwrap()).unwrap(),
            ComponentState::Failed
        );
    }

    #[test]
    fn test_success_clears_streak() {
        let c = coordinator();
        c.with_components(|comps| {
            comps.register(ComponentSpec::new("x", ComponentKind::Service))
        })
        .unwrap()
        .unwrap();

        let err = CoreError::HealthCheckFailed("x".into());
        c.handle_error(&err, "x");
        c.handle_error(&err, "x");
        c.note_success("x");
        assert_eq!(c.handle_error(&err, "x"), 1, "streak restarted");
    }

    #[test]
    fn test_monitoring_lifecycle_idempotent() {
        let c = coordinator();
        assert!(!c.is_monitoring_active());

        c.start_monitoring().unwrap();
        assert!(c.is_monitoring_active());
        // Second start does not spawn another timer
        c.start_monitoring().unwrap();

        std::thread::sleep(Duration::from_millis(150));
        c.stop_monitoring().unwrap();
        assert!(!c.is_monitoring_active());
        c.stop_monitoring().unwrap();
    }

    #[test]
    fn test_health_pass_updates_stream_health() {
        let c = coordinator();
        c.with_components(|comps| {
            comps.register(ComponentSpec::new("dead", ComponentKind::Output))
        })
        .unwrap()
        .unwrap();
        c.with_components(|comps| comps.transition("dead", ComponentState::Failed))
            .unwrap()
            .unwrap();

        let report = c.check_health_now().unwrap();
        assert_eq!(report.overall, HealthState::Failed);
        let m = c.get_metrics().unwrap();
        assert!(!m.stream_health);
        assert!(m.last_health_check_ms.is_some());
    }

    #[test]
    fn test_monitoring_survives_panicking_health_hook() {
        let c = coordinator();
        c.with_components(|comps| {
            comps.register(
                ComponentSpec::new("bomb", ComponentKind::Service)
                    .with_health_check(Arc::new(|| panic!("kaboom"))),
            )
        })
        .unwrap()
        .unwrap();

        c.start_monitoring().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        // Timer still alive and stoppable after the panicking hook
        assert!(c.is_monitoring_active());
        c.stop_monitoring().unwrap();
    }

    #[test]
    fn test_request_shutdown_sets_flag_and_metric() {
        let c = coordinator();
        assert!(!c.is_shutdown_requested());
        c.request_shutdown();
        assert!(c.is_shutdown_requested());
        assert!(c.get_metrics().unwrap().shutdown_requested);
        // Idempotent
        c.request_shutdown();
    }

    #[test]
    fn test_performance_stats() {
        let c = coordinator();
        let mut values = BTreeMap::new();
        values.insert("latency_ms".to_string(), 12.0);
        values.insert("cpu_usage_pct".to_string(), 30.0);
        c.update_performance_stats("storage", values).unwrap();

        let mut channel_values = BTreeMap::new();
        channel_values.insert("queue_depth".to_string(), 4.0);
        c.update_channel_performance_stats("storage", ChannelSide::Left, channel_values)
            .unwrap();

        let perf = c.get_performance_stats().unwrap();
        assert_eq!(perf["storage"].values["latency_ms"], 12.0);
        assert_eq!(perf["storage"].channels["left"]["queue_depth"], 4.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let c = coordinator();
        c.update_metrics(MetricsPatch::new().cpu_usage_pct(10.0))
            .unwrap();
        let snapshot = c.snapshot().unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("cpu_usage_pct"));
        assert!(json.contains("stream_health"));
    }

    #[test]
    fn test_recovery_runs_declared_steps_and_restores() {
        use std::sync::atomic::AtomicU32;
        let c = coordinator();
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);

        c.with_components(|comps| {
            comps
                .register(
                    ComponentSpec::new("proc", ComponentKind::Transform).with_recovery_step(
                        RecoveryStep::new(
                            "flaky",
                            Arc::new(move |_| {
                                // Fails twice, then succeeds
                                if a.fetch_add(1, Ordering::SeqCst) < 2 {
                                    Err("not yet".into())
                                } else {
                                    Ok(())
                                }
                            }),
                            Arc::new(|| true),
                        ),
                    ),
                )
                .unwrap();
            comps.transition("proc", ComponentState::Initializing).unwrap();
            comps.transition("proc", ComponentState::Running).unwrap();
            comps.transition("proc", ComponentState::Degraded).unwrap();
        })
        .unwrap();

        let report = c.attempt_recovery("proc").unwrap();
        assert!(report.succeeded());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(c.get_metrics().unwrap().recovery_attempts, 1);
        assert_eq!(
            c.with_components(|comps| comps.state("proc").unwrap()).unwrap(),
            ComponentState::Running
        );
    }

    #[test]
    fn test_failed_recovery_fails_component_and_stream() {
        let c = coordinator();
        c.with_components(|comps| {
            comps.register(
                ComponentSpec::new("proc", ComponentKind::Transform).with_recovery_step(
                    RecoveryStep::new(
                        "hopeless",
                        Arc::new(|_| Err("never".into())),
                        Arc::new(|| true),
                    ),
                ),
            )
        })
        .unwrap()
        .unwrap();

        let err = c.attempt_recovery("proc").unwrap_err();
        assert!(matches!(err, CoreError::RecoveryFailed(name) if name == "hopeless"));
        assert_eq!(
            c.with_components(|comps| comps.state("proc").unwrap()).unwrap(),
            ComponentState::Failed
        );
        assert!(!c.get_metrics().unwrap().stream_health);
    }

    #[test]
    fn test_recovery_without_declared_steps_fails_component() {
        let c = coordinator();
        c.with_components(|comps| {
            comps.register(ComponentSpec::new("bare", ComponentKind::Output))
        })
        .unwrap()
        .unwrap();

        assert!(c.attempt_recovery("bare").is_err());
        assert_eq!(
            c.with_components(|comps| comps.state("bare").unwrap()).unwrap(),
            ComponentState::Failed
        );
    }

    #[test]
    fn test_recovery_aborted_by_shutdown_leaves_component() {
        let c = coordinator();
        c.with_components(|comps| {
            comps.register(
                ComponentSpec::new("proc", ComponentKind::Transform).with_recovery_step(
                    RecoveryStep::new("noop", Arc::new(|_| Ok(())), Arc::new(|| true)),
                ),
            )
        })
        .unwrap()
        .unwrap();

        c.request_shutdown();
        assert!(matches!(c.attempt_recovery("proc"), Err(CoreError::Shutdown)));
        // Not failed: cleanup owns teardown once shutdown is requested
        assert_eq!(
            c.with_components(|comps| comps.state("proc").unwrap()).unwrap(),
            ComponentState::Registered
        );
    }
}
