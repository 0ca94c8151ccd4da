//! Lyrebird Core - Runtime Coordination Substrate
//!
//! Everything that makes the capture/processing/transcription pipeline
//! safe and responsive lives here:
//!
//! - A tiered [`ResourcePool`] of bounded, reusable byte buffers
//! - The [`MonitoringCoordinator`]: shared state, copy-on-write metrics,
//!   a strict ranked lock hierarchy and the periodic health timer
//! - The [`ComponentCoordinator`]: registry, lifecycle state machine and
//!   dependency-ordered startup/shutdown
//! - The [`CleanupCoordinator`]: phased, verified, dependency-aware
//!   teardown
//! - The (stage x channel) [`BufferQueues`] with latency stats and
//!   adaptive tuning
//! - The [`TranscriberEngine`] wiring workers, storage and the external
//!   capture/transcription interfaces together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Shell (CLI / tests)                     │
//! │        engine API ◀──events── TranscriberEngine             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ crossbeam-channel
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  capture ──queues──▶ processing ──queues──▶ storage ──▶ disk│
//! │      │                   │                                  │
//! │      └──── MonitoringCoordinator (pool, locks, health) ─────┘
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod cleanup;
mod components;
mod config;
mod engine;
mod error;
mod locks;
mod message;
mod monitoring;
mod pool;
mod queues;
mod steps;

pub use cleanup::{
    CleanupCoordinator, CleanupOutcome, CleanupPhase, CleanupReport, CleanupStatus,
    CleanupStatusHandle, StepOutcome,
};
pub use components::{
    ComponentCoordinator, ComponentHealth, ComponentKind, ComponentSpec, ComponentState,
    HealthCheckFn, HealthReport, HealthState, RecoveryActionFn, RecoveryStep, RecoveryVerifyFn,
};
pub use config::EngineConfig;
pub use engine::{EngineStatus, TranscriberEngine};
pub use error::{CoreError, CoreResult};
pub use locks::{held_ranks, LockError, LockRank, RankedGuard, RankedLock, DEFAULT_LOCK_TIMEOUT};
pub use message::{PipelineEvent, SegmentAssembler, SpeakerSegment};
pub use monitoring::{
    ChannelMetrics, ChannelPatch, CoordinatorReleaser, ErrorContext, MetricsPatch,
    MonitoringConfig, MonitoringCoordinator, MonitoringMetrics, MonitoringSnapshot,
    ScopedResource, ThreadHandle,
};
pub use pool::{
    BufferTag, BufferTier, ChannelSide, PoolLimits, PoolStats, PooledBuffer, ResourcePool,
    TierStats,
};
pub use queues::{
    BoundedBufferQueue, BufferQueues, OptimizeDecision, OptimizerConfig, PipelineStage, QueueItem,
    QueueStats,
};
pub use steps::{
    run_plan, run_step, CancelToken, PlanReport, Step, StepReport, DEFAULT_STEP_TIMEOUT,
};
