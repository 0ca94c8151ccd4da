//! Pipeline Buffer Queues
//!
//! Nine bounded FIFO queues indexed by (stage x channel) carry pooled
//! buffers between the capture, processing and storage workers. A queue
//! owns the buffers referenced by its elements until they are dequeued;
//! `get` transfers ownership to the consumer.
//!
//! Draining for cleanup is staged: `begin_drain` closes a stage to new
//! `put`s while in-flight items stay deliverable, and `take_remaining`
//! hands back whatever was never consumed so the pool can reclaim it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info};

use lyrebird_dsp::History;

use crate::error::{CoreError, CoreResult};
use crate::pool::{BufferTier, ChannelSide, PooledBuffer};

/// Pipeline stages owning queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineStage {
    Capture,
    Processing,
    Storage,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 3] = [
        PipelineStage::Capture,
        PipelineStage::Processing,
        PipelineStage::Storage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Capture => "capture",
            PipelineStage::Processing => "processing",
            PipelineStage::Storage => "storage",
        }
    }

    const fn index(self) -> usize {
        match self {
            PipelineStage::Capture => 0,
            PipelineStage::Processing => 1,
            PipelineStage::Storage => 2,
        }
    }
}

/// One queued element: the pooled buffer plus transfer bookkeeping
#[derive(Debug)]
pub struct QueueItem {
    pub buffer: PooledBuffer,
    pub payload_len: usize,
    pub enqueued_at: Instant,
}

impl QueueItem {
    pub fn new(buffer: PooledBuffer, payload_len: usize) -> Self {
        Self {
            buffer,
            payload_len,
            enqueued_at: Instant::now(),
        }
    }
}

/// Per-queue observability snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub depth: usize,
    pub capacity: usize,
    pub processed: u64,
    pub overflows: u64,
    pub closed: bool,
    pub avg_latency_ms: f64,
}

struct QueueInner {
    items: VecDeque<QueueItem>,
    capacity: usize,
    closed: bool,
    processed: u64,
    overflows: u64,
    latency_ms: History,
}

/// Bounded FIFO with timeouts, close semantics and latency tracking
pub struct BoundedBufferQueue {
    name: String,
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl BoundedBufferQueue {
    pub fn new(name: String, capacity: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
                processed: 0,
                overflows: 0,
                latency_ms: History::default(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue, waiting up to `timeout` for room.
    ///
    /// On failure the item comes back with the error so the caller can
    /// release its buffer; nothing is ever silently dropped.
    pub fn put(&self, item: QueueItem, timeout: Duration) -> Result<(), (QueueItem, CoreError)> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err((item, CoreError::QueueClosed(self.name.clone())));
            }
            if inner.items.len() < inner.capacity {
                inner.items.push_back(item);
                drop(inner);
                self.not_empty.notify_one();
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                inner.overflows += 1;
                return Err((item, CoreError::QueueFull(self.name.clone())));
            }
            self.not_full.wait_for(&mut inner, deadline - now);
        }
    }

    /// Dequeue, waiting up to `timeout` for an element. Ownership of the
    /// buffer transfers to the caller.
    pub fn get(&self, timeout: Duration) -> CoreResult<QueueItem> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                inner.processed += 1;
                let waited = item.enqueued_at.elapsed().as_secs_f64() * 1000.0;
                inner.latency_ms.push(waited);
                drop(inner);
                self.not_full.notify_one();
                return Ok(item);
            }
            if inner.closed {
                return Err(CoreError::QueueClosed(self.name.clone()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CoreError::QueueEmpty(self.name.clone()));
            }
            self.not_empty.wait_for(&mut inner, deadline - now);
        }
    }

    /// Close to new `put`s; queued items remain deliverable via `get`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Drain whatever is still queued (for releasing buffers on teardown).
    pub fn take_remaining(&self) -> Vec<QueueItem> {
        let mut inner = self.inner.lock();
        let drained = inner.items.drain(..).collect();
        drop(inner);
        self.not_full.notify_all();
        drained
    }

    /// Resize, never below the current occupancy.
    fn set_capacity(&self, capacity: usize) -> usize {
        let mut inner = self.inner.lock();
        let applied = capacity.max(inner.items.len()).max(1);
        inner.capacity = applied;
        drop(inner);
        self.not_full.notify_all();
        applied
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            name: self.name.clone(),
            depth: inner.items.len(),
            capacity: inner.capacity,
            processed: inner.processed,
            overflows: inner.overflows,
            closed: inner.closed,
            avg_latency_ms: inner.latency_ms.mean(),
        }
    }
}

/// Decision record from one `optimize` pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizeDecision {
    pub preferred_tier: BufferTier,
    pub capacity: usize,
}

struct OptimizerState {
    last_run: Option<Instant>,
    preferred_tier: BufferTier,
    capacity: usize,
}

/// Thresholds and cooldown for the adaptive pass
#[derive(Debug, Clone, Copy)]
pub struct OptimizerConfig {
    pub cooldown: Duration,
    pub cpu_high_pct: f64,
    pub memory_high_pct: f64,
    pub min_capacity: usize,
    pub max_capacity: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            cpu_high_pct: 80.0,
            memory_high_pct: 75.0,
            min_capacity: 4,
            max_capacity: 256,
        }
    }
}

/// The full (stage x channel) queue set with adaptive tuning
pub struct BufferQueues {
    queues: [[BoundedBufferQueue; 3]; 3],
    optimizer: Mutex<OptimizerState>,
    config: OptimizerConfig,
}

impl BufferQueues {
    pub fn new(capacity: usize, config: OptimizerConfig) -> Self {
        let build = |stage: PipelineStage, channel: ChannelSide| {
            BoundedBufferQueue::new(
                format!("{}/{}", stage.as_str(), channel.as_str()),
                capacity,
            )
        };
        let row = |stage: PipelineStage| {
            [
                build(stage, ChannelSide::Left),
                build(stage, ChannelSide::Right),
                build(stage, ChannelSide::None),
            ]
        };
        Self {
            queues: [
                row(PipelineStage::Capture),
                row(PipelineStage::Processing),
                row(PipelineStage::Storage),
            ],
            optimizer: Mutex::new(OptimizerState {
                last_run: None,
                preferred_tier: BufferTier::Small,
                capacity,
            }),
            config,
        }
    }

    pub fn queue(&self, stage: PipelineStage, channel: ChannelSide) -> &BoundedBufferQueue {
        &self.queues[stage.index()][channel_index(channel)]
    }

    pub fn put(
        &self,
        stage: PipelineStage,
        channel: ChannelSide,
        item: QueueItem,
        timeout: Duration,
    ) -> Result<(), (QueueItem, CoreError)> {
        self.queue(stage, channel).put(item, timeout)
    }

    pub fn get(
        &self,
        stage: PipelineStage,
        channel: ChannelSide,
        timeout: Duration,
    ) -> CoreResult<QueueItem> {
        self.queue(stage, channel).get(timeout)
    }

    /// Mark one stage cleanup-pending: its queues refuse new `put`s while
    /// queued items remain deliverable.
    pub fn begin_drain(&self, stage: PipelineStage) {
        info!(stage = stage.as_str(), "queue stage draining");
        for channel in ChannelSide::ALL {
            self.queue(stage, channel).close();
        }
    }

    pub fn is_draining(&self, stage: PipelineStage) -> bool {
        ChannelSide::ALL
            .iter()
            .all(|&c| self.queue(stage, c).is_closed())
    }

    /// Close everything and hand back every unconsumed item.
    pub fn drain_all(&self) -> Vec<QueueItem> {
        let mut remaining = Vec::new();
        for stage in PipelineStage::ALL {
            for channel in ChannelSide::ALL {
                let queue = self.queue(stage, channel);
                queue.close();
                remaining.extend(queue.take_remaining());
            }
        }
        remaining
    }

    /// Tier preferred for newly captured frames
    pub fn preferred_tier(&self) -> BufferTier {
        self.optimizer.lock().preferred_tier
    }

    /// Adapt buffer tier and queue capacity to observed load, at most once
    /// per cooldown window.
    ///
    /// High CPU favors fewer, larger transfers (step the tier up); memory
    /// pressure favors smaller buffers (step down; memory wins when both
    /// fire). Capacity moves opposite to tier size and never drops below
    /// the current occupancy of any queue.
    pub fn optimize(&self, cpu_pct: f64, memory_pct: f64) -> Option<OptimizeDecision> {
        let mut state = self.optimizer.lock();

        if let Some(last) = state.last_run {
            if last.elapsed() < self.config.cooldown {
                return None;
            }
        }
        state.last_run = Some(Instant::now());

        let (tier, capacity) = if memory_pct > self.config.memory_high_pct {
            (
                step_down(state.preferred_tier),
                (state.capacity * 2).min(self.config.max_capacity),
            )
        } else if cpu_pct > self.config.cpu_high_pct {
            (
                step_up(state.preferred_tier),
                (state.capacity / 2).max(self.config.min_capacity),
            )
        } else {
            return None;
        };

        if tier == state.preferred_tier && capacity == state.capacity {
            return None;
        }
        state.preferred_tier = tier;
        state.capacity = capacity;
        drop(state);

        let mut applied = capacity;
        for stage in PipelineStage::ALL {
            for channel in ChannelSide::ALL {
                applied = applied.max(self.queue(stage, channel).set_capacity(capacity));
            }
        }

        debug!(?tier, capacity = applied, cpu_pct, memory_pct, "queues optimized");
        Some(OptimizeDecision {
            preferred_tier: tier,
            capacity: applied,
        })
    }

    /// Stats for all nine queues, stage-major order.
    pub fn stats(&self) -> Vec<QueueStats> {
        let mut out = Vec::with_capacity(9);
        for stage in PipelineStage::ALL {
            for channel in ChannelSide::ALL {
                out.push(self.queue(stage, channel).stats());
            }
        }
        out
    }

    /// Total queued elements across all queues
    pub fn total_depth(&self) -> usize {
        PipelineStage::ALL
            .iter()
            .flat_map(|&s| ChannelSide::ALL.iter().map(move |&c| (s, c)))
            .map(|(s, c)| self.queue(s, c).depth())
            .sum()
    }
}

const fn channel_index(channel: ChannelSide) -> usize {
    match channel {
        ChannelSide::Left => 0,
        ChannelSide::Right => 1,
        ChannelSide::None => 2,
    }
}

fn step_up(tier: BufferTier) -> BufferTier {
    match tier {
        BufferTier::Small => BufferTier::Medium,
        BufferTier::Medium | BufferTier::Large => BufferTier::Large,
    }
}

fn step_down(tier: BufferTier) -> BufferTier {
    match tier {
        BufferTier::Large => BufferTier::Medium,
        BufferTier::Medium | BufferTier::Small => BufferTier::Small,
    }
}
