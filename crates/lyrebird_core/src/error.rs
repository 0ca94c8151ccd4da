//! Coordination Core Error Types
//!
//! Recoverable kinds (pool exhaustion, lock timeouts, queue pressure) are
//! handled close to where they occur and surfaced as metrics; structural
//! kinds (cycles, duplicates, ownership violations) propagate to the
//! caller. Cross-crate causes are wrapped transparently so the full chain
//! survives.

use thiserror::Error;

use crate::components::ComponentState;
use crate::locks::LockError;
use crate::pool::BufferTier;

/// Errors produced by the coordination core
#[derive(Error, Debug)]
pub enum CoreError {
    // Resource pool
    #[error("resource pool exhausted for the {tier:?} tier")]
    Exhausted { tier: BufferTier },

    #[error("unknown buffer id {0}")]
    UnknownBuffer(u64),

    #[error("buffer {id} is held by {held}, release attempted by {caller}")]
    TagMismatch {
        id: u64,
        held: String,
        caller: String,
    },

    #[error("zero-length allocations are not pooled")]
    ZeroAllocation,

    #[error("{0} bytes exceeds the largest buffer tier")]
    OversizedAllocation(usize),

    #[error("pool limits refused: {tier:?} limit {requested} is below {in_use} buffers in use")]
    ReconfigureRefused {
        tier: BufferTier,
        requested: usize,
        in_use: usize,
    },

    // Locks
    #[error(transparent)]
    Lock(#[from] LockError),

    // Component registry
    #[error("component {0} is already registered")]
    DuplicateId(String),

    #[error("registering {0} would create a dependency cycle")]
    DependencyCycle(String),

    #[error("unknown component {0}")]
    UnknownComponent(String),

    #[error("component {id} depends on unregistered component {dependency}")]
    UnknownDependency { id: String, dependency: String },

    #[error("invalid transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: ComponentState,
        to: ComponentState,
    },

    #[error("component {id} cannot run: dependency {dependency} is {state:?}")]
    DependencyNotRunning {
        id: String,
        dependency: String,
        state: ComponentState,
    },

    #[error("health check failed for {0}")]
    HealthCheckFailed(String),

    // Queues
    #[error("queue {0} is full")]
    QueueFull(String),

    #[error("queue {0} is empty")]
    QueueEmpty(String),

    #[error("queue {0} is closed")]
    QueueClosed(String),

    // Cleanup and recovery
    #[error("cleanup step {0} is already registered")]
    DuplicateStep(String),

    #[error("cleanup step {step} depends on unregistered step {dependency}")]
    UnknownStepDependency { step: String, dependency: String },

    #[error("cleanup step {step} in phase {phase} cannot depend on {dependency} in later phase {dependency_phase}")]
    PhaseOrderViolation {
        step: String,
        phase: String,
        dependency: String,
        dependency_phase: String,
    },

    #[error("recovery failed at required step {0}")]
    RecoveryFailed(String),

    // Configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    // Shutdown
    #[error("operation aborted: shutdown requested")]
    Shutdown,

    // Collaborator crates; chains preserved
    #[error(transparent)]
    Dsp(#[from] lyrebird_dsp::DspError),

    #[error(transparent)]
    Storage(#[from] lyrebird_storage::StorageError),

    #[error(transparent)]
    Platform(#[from] lyrebird_platform::PlatformError),
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Recoverable kinds are handled locally and reported as metrics; the
    /// rest propagate to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::Exhausted { .. }
                | CoreError::Lock(LockError::Timeout(..))
                | CoreError::QueueFull(_)
                | CoreError::QueueEmpty(_)
                | CoreError::HealthCheckFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_recoverable_classification() {
        assert!(CoreError::Exhausted {
            tier: BufferTier::Small
        }
        .is_recoverable());
        assert!(CoreError::QueueFull("storage/left".into()).is_recoverable());
        assert!(!CoreError::DuplicateId("capture".into()).is_recoverable());
        assert!(!CoreError::Shutdown.is_recoverable());
    }

    #[test]
    fn test_storage_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked down");
        let storage = lyrebird_storage::StorageError::from_io(std::path::Path::new("/x"), io);
        let core: CoreError = storage.into();

        // Transparent wrapping: the storage error is the displayed error,
        // and the io cause is still reachable through source()
        assert!(core.to_string().contains("permission denied"));
        let source = core.source().expect("chain must be preserved");
        assert!(source.to_string().contains("locked down"));
    }

    #[test]
    fn test_lock_error_conversion() {
        let err: CoreError = LockError::Timeout("state", std::time::Duration::from_secs(5)).into();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("state"));
    }
}
