//! Phased Cleanup Coordination
//!
//! Teardown runs as a DAG of verified steps grouped into ordered phases.
//! No step in a later phase starts until every step in earlier phases has
//! either succeeded or failed out; a required step's failure aborts the
//! rest of its own phase but later phases still run, so critical resources
//! (storage, handles, logs) are always released. A second execution on a
//! completed coordinator is a no-op.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::steps::{run_step, CancelToken, Step};

/// Ordered teardown phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CleanupPhase {
    NotStarted,
    Initiating,
    StoppingCapture,
    FlushingStorage,
    ReleasingResources,
    ClosingLogs,
    Completed,
}

impl CleanupPhase {
    /// Phases that can hold steps, in execution order
    pub const EXECUTABLE: [CleanupPhase; 5] = [
        CleanupPhase::Initiating,
        CleanupPhase::StoppingCapture,
        CleanupPhase::FlushingStorage,
        CleanupPhase::ReleasingResources,
        CleanupPhase::ClosingLogs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CleanupPhase::NotStarted => "not_started",
            CleanupPhase::Initiating => "initiating",
            CleanupPhase::StoppingCapture => "stopping_capture",
            CleanupPhase::FlushingStorage => "flushing_storage",
            CleanupPhase::ReleasingResources => "releasing_resources",
            CleanupPhase::ClosingLogs => "closing_logs",
            CleanupPhase::Completed => "completed",
        }
    }
}

/// Per-step outcome as tracked by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepOutcome {
    Pending,
    Succeeded,
    Failed,
    /// Not run because a required step earlier in its phase failed
    Skipped,
}

/// Queryable progress snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CleanupStatus {
    pub phase: CleanupPhase,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub pending: Vec<String>,
}

/// Final report of one execution
#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub outcomes: BTreeMap<String, StepOutcome>,
    pub failed: Vec<String>,
}

impl CleanupReport {
    pub fn fully_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of `execute`: cleanup always reaches COMPLETED, but may carry
/// failed steps.
#[derive(Debug)]
pub enum CleanupOutcome {
    Clean,
    PartialFailure(CleanupReport),
}

struct RegisteredStep {
    phase: CleanupPhase,
    dependencies: Vec<String>,
    step: Step,
    outcome: StepOutcome,
}

#[derive(Default)]
struct StatusInner {
    phase: Option<CleanupPhase>,
    outcomes: BTreeMap<String, StepOutcome>,
}

/// Dependency-aware, phase-ordered teardown executor
pub struct CleanupCoordinator {
    steps: Vec<RegisteredStep>,
    index: HashMap<String, usize>,
    status: Arc<Mutex<StatusInner>>,
    completed: bool,
}

impl CleanupCoordinator {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            index: HashMap::new(),
            status: Arc::new(Mutex::new(StatusInner::default())),
            completed: false,
        }
    }

    /// Register one step. Dependencies must already be registered and must
    /// live in the same or an earlier phase.
    pub fn register_step(
        &mut self,
        phase: CleanupPhase,
        dependencies: Vec<String>,
        step: Step,
    ) -> CoreResult<()> {
        let name = step.name.clone();
        if self.index.contains_key(&name) {
            return Err(CoreError::DuplicateStep(name));
        }
        for dep in &dependencies {
            let Some(&dep_idx) = self.index.get(dep) else {
                return Err(CoreError::UnknownStepDependency {
                    step: name,
                    dependency: dep.clone(),
                });
            };
            let dep_phase = self.steps[dep_idx].phase;
            if dep_phase > phase {
                return Err(CoreError::PhaseOrderViolation {
                    step: name,
                    phase: phase.name().to_string(),
                    dependency: dep.clone(),
                    dependency_phase: dep_phase.name().to_string(),
                });
            }
        }

        self.status
            .lock()
            .outcomes
            .insert(name.clone(), StepOutcome::Pending);
        self.index.insert(name, self.steps.len());
        self.steps.push(RegisteredStep {
            phase,
            dependencies,
            step,
            outcome: StepOutcome::Pending,
        });
        Ok(())
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// A handle for querying progress while `execute` runs on another
    /// thread.
    pub fn status_handle(&self) -> CleanupStatusHandle {
        CleanupStatusHandle {
            status: Arc::clone(&self.status),
        }
    }

    /// Current progress snapshot.
    pub fn status(&self) -> CleanupStatus {
        self.status_handle().snapshot()
    }

    pub fn current_phase(&self) -> CleanupPhase {
        self.status
            .lock()
            .phase
            .unwrap_or(CleanupPhase::NotStarted)
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Execute all registered steps in phase order.
    ///
    /// Idempotent: a second call on a completed coordinator does nothing
    /// and reports success.
    pub fn execute(&mut self, token: &CancelToken) -> CleanupOutcome {
        if self.completed {
            info!("cleanup already completed; execute is a no-op");
            return CleanupOutcome::Clean;
        }

        for phase in CleanupPhase::EXECUTABLE {
            self.status.lock().phase = Some(phase);
            self.run_phase(phase, token);
        }

        self.status.lock().phase = Some(CleanupPhase::Completed);
        self.completed = true;

        let outcomes: BTreeMap<String, StepOutcome> = self
            .steps
            .iter()
            .map(|s| (s.step.name.clone(), s.outcome))
            .collect();
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|(_, &o)| matches!(o, StepOutcome::Failed | StepOutcome::Skipped))
            .map(|(name, _)| name.clone())
            .collect();

        if failed.is_empty() {
            info!("cleanup completed");
            CleanupOutcome::Clean
        } else {
            warn!(?failed, "cleanup completed with failures");
            CleanupOutcome::PartialFailure(CleanupReport { outcomes, failed })
        }
    }

    fn run_phase(&mut self, phase: CleanupPhase, token: &CancelToken) {
        let mut abort_phase = false;
        loop {
            let Some((next, skip)) = self.next_actionable_step(phase, abort_phase) else {
                break;
            };

            if skip {
                self.steps[next].outcome = StepOutcome::Skipped;
                self.publish(next, StepOutcome::Skipped);
                continue;
            }

            let report = run_step(&mut self.steps[next].step, token);
            let outcome = if report.succeeded {
                StepOutcome::Succeeded
            } else {
                StepOutcome::Failed
            };
            self.steps[next].outcome = outcome;
            self.publish(next, outcome);

            if !report.succeeded && self.steps[next].step.required {
                // Required failure: remaining steps of this phase are
                // skipped, later phases still run
                abort_phase = true;
            }
        }
    }

    /// Pick the next pending step of `phase`: `(index, false)` when its
    /// dependencies have all succeeded, `(index, true)` when it can never
    /// run (the phase is aborting or a dependency failed).
    fn next_actionable_step(
        &self,
        phase: CleanupPhase,
        aborting: bool,
    ) -> Option<(usize, bool)> {
        for (i, registered) in self.steps.iter().enumerate() {
            if registered.phase != phase || registered.outcome != StepOutcome::Pending {
                continue;
            }
            if aborting {
                return Some((i, true));
            }
            let blocked = registered.dependencies.iter().any(|dep| {
                self.index
                    .get(dep)
                    .map(|&idx| {
                        matches!(
                            self.steps[idx].outcome,
                            StepOutcome::Failed | StepOutcome::Skipped
                        )
                    })
                    .unwrap_or(false)
            });
            if blocked {
                return Some((i, true));
            }
            let ready = registered.dependencies.iter().all(|dep| {
                self.index
                    .get(dep)
                    .map(|&idx| self.steps[idx].outcome == StepOutcome::Succeeded)
                    .unwrap_or(false)
            });
            if ready {
                return Some((i, false));
            }
        }
        None
    }

    fn publish(&self, idx: usize, outcome: StepOutcome) {
        self.status
            .lock()
            .outcomes
            .insert(self.steps[idx].step.name.clone(), outcome);
    }
}

impl Default for CleanupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap cloneable view into a running cleanup's progress
#[derive(Clone)]
pub struct CleanupStatusHandle {
    status: Arc<Mutex<StatusInner>>,
}

impl CleanupStatusHandle {
    pub fn snapshot(&self) -> CleanupStatus {
        let inner = self.status.lock();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut pending = Vec::new();
        for (name, outcome) in &inner.outcomes {
            match outcome {
                StepOutcome::Succeeded => completed.push(name.clone()),
                StepOutcome::Failed | StepOutcome::Skipped => failed.push(name.clone()),
                StepOutcome::Pending => pending.push(name.clone()),
            }
        }
        CleanupStatus {
            phase: inner.phase.unwrap_or(CleanupPhase::NotStarted),
            completed,
            failed,
            pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn noop_step(name: &str) -> Step {
        Step::new(name, Box::new(|_| Ok(())), Box::new(|| true))
    }

    /// Step that appends its name to a shared log when run
    fn logged_step(name: &str, log: Arc<Mutex<Vec<String>>>) -> Step {
        let n = name.to_string();
        Step::new(
            name,
            Box::new(move |_| {
                log.lock().push(n.clone());
                Ok(())
            }),
            Box::new(|| true),
        )
    }

    #[test]
    fn test_phase_ordering_is_total() {
        assert!(CleanupPhase::NotStarted < CleanupPhase::Initiating);
        assert!(CleanupPhase::Initiating < CleanupPhase::StoppingCapture);
        assert!(CleanupPhase::StoppingCapture < CleanupPhase::FlushingStorage);
        assert!(CleanupPhase::FlushingStorage < CleanupPhase::ReleasingResources);
        assert!(CleanupPhase::ReleasingResources < CleanupPhase::ClosingLogs);
        assert!(CleanupPhase::ClosingLogs < CleanupPhase::Completed);
    }

    #[test]
    fn test_canonical_execution_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut c = CleanupCoordinator::new();

        c.register_step(
            CleanupPhase::Initiating,
            vec![],
            logged_step("request_shutdown", Arc::clone(&log)),
        )
        .unwrap();
        c.register_step(
            CleanupPhase::Initiating,
            vec!["request_shutdown".into()],
            logged_step("stop_monitoring", Arc::clone(&log)),
        )
        .unwrap();
        c.register_step(
            CleanupPhase::StoppingCapture,
            vec!["stop_monitoring".into()],
            logged_step("stop_capture", Arc::clone(&log)),
        )
        .unwrap();
        c.register_step(
            CleanupPhase::FlushingStorage,
            vec!["stop_capture".into()],
            logged_step("flush_storage", Arc::clone(&log)),
        )
        .unwrap();
        c.register_step(
            CleanupPhase::ReleasingResources,
            vec!["flush_storage".into()],
            logged_step("cleanup_backups", Arc::clone(&log)),
        )
        .unwrap();
        c.register_step(
            CleanupPhase::ClosingLogs,
            vec!["cleanup_backups".into()],
            logged_step("close_logs", Arc::clone(&log)),
        )
        .unwrap();
        assert_eq!(c.step_count(), 6);

        let outcome = c.execute(&CancelToken::new());
        assert!(matches!(outcome, CleanupOutcome::Clean));
        assert_eq!(c.current_phase(), CleanupPhase::Completed);
        assert_eq!(
            *log.lock(),
            vec![
                "request_shutdown",
                "stop_monitoring",
                "stop_capture",
                "flush_storage",
                "cleanup_backups",
                "close_logs"
            ]
        );
    }

    #[test]
    fn test_dependency_must_exist() {
        let mut c = CleanupCoordinator::new();
        let err = c
            .register_step(
                CleanupPhase::Initiating,
                vec!["ghost".into()],
                noop_step("x"),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownStepDependency { .. }));
    }

    #[test]
    fn test_dependency_phase_ordering_enforced() {
        let mut c = CleanupCoordinator::new();
        c.register_step(CleanupPhase::FlushingStorage, vec![], noop_step("late"))
            .unwrap();
        let err = c
            .register_step(
                CleanupPhase::Initiating,
                vec!["late".into()],
                noop_step("early"),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::PhaseOrderViolation { .. }));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let mut c = CleanupCoordinator::new();
        c.register_step(CleanupPhase::Initiating, vec![], noop_step("a"))
            .unwrap();
        assert!(matches!(
            c.register_step(CleanupPhase::Initiating, vec![], noop_step("a")),
            Err(CoreError::DuplicateStep(_))
        ));
    }

    #[test]
    fn test_optional_timeout_still_completes() {
        // Five steps across all phases; the optional one in
        // RELEASING_RESOURCES never verifies and times out.
        let mut c = CleanupCoordinator::new();
        c.register_step(CleanupPhase::Initiating, vec![], noop_step("shutdown"))
            .unwrap();
        c.register_step(CleanupPhase::StoppingCapture, vec![], noop_step("capture"))
            .unwrap();
        c.register_step(CleanupPhase::FlushingStorage, vec![], noop_step("flush"))
            .unwrap();
        c.register_step(
            CleanupPhase::ReleasingResources,
            vec![],
            Step::new("flaky_release", Box::new(|_| Ok(())), Box::new(|| false))
                .with_timeout(Duration::from_millis(100))
                .optional(),
        )
        .unwrap();
        c.register_step(CleanupPhase::ClosingLogs, vec![], noop_step("logs"))
            .unwrap();

        let outcome = c.execute(&CancelToken::new());
        assert_eq!(c.current_phase(), CleanupPhase::Completed);
        match outcome {
            CleanupOutcome::PartialFailure(report) => {
                assert_eq!(report.failed, vec!["flaky_release".to_string()]);
                assert_eq!(
                    report.outcomes["logs"],
                    StepOutcome::Succeeded,
                    "later phases must still run"
                );
            }
            CleanupOutcome::Clean => panic!("expected a recorded failure"),
        }
    }

    #[test]
    fn test_required_failure_skips_rest_of_phase_only() {
        let ran = Arc::new(AtomicUsize::new(0));
        let count_step = |name: &str, ran: &Arc<AtomicUsize>| {
            let r = Arc::clone(ran);
            Step::new(
                name,
                Box::new(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                Box::new(|| true),
            )
        };

        let mut c = CleanupCoordinator::new();
        c.register_step(
            CleanupPhase::FlushingStorage,
            vec![],
            Step::new("bad_flush", Box::new(|_| Err("disk gone".into())), Box::new(|| true)),
        )
        .unwrap();
        c.register_step(
            CleanupPhase::FlushingStorage,
            vec![],
            count_step("same_phase_sibling", &ran),
        )
        .unwrap();
        c.register_step(
            CleanupPhase::ReleasingResources,
            vec![],
            count_step("later_phase", &ran),
        )
        .unwrap();

        let outcome = c.execute(&CancelToken::new());
        assert_eq!(c.current_phase(), CleanupPhase::Completed);
        // The sibling was skipped, the later phase ran
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        match outcome {
            CleanupOutcome::PartialFailure(report) => {
                assert_eq!(report.outcomes["bad_flush"], StepOutcome::Failed);
                assert_eq!(report.outcomes["same_phase_sibling"], StepOutcome::Skipped);
                assert_eq!(report.outcomes["later_phase"], StepOutcome::Succeeded);
            }
            CleanupOutcome::Clean => panic!("expected partial failure"),
        }
    }

    #[test]
    fn test_execute_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&counter);
        let mut c = CleanupCoordinator::new();
        c.register_step(
            CleanupPhase::Initiating,
            vec![],
            Step::new(
                "once",
                Box::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                Box::new(|| true),
            ),
        )
        .unwrap();

        assert!(matches!(c.execute(&CancelToken::new()), CleanupOutcome::Clean));
        assert!(matches!(c.execute(&CancelToken::new()), CleanupOutcome::Clean));
        assert_eq!(counter.load(Ordering::SeqCst), 1, "steps must run once");
    }

    #[test]
    fn test_status_reflects_progress() {
        let mut c = CleanupCoordinator::new();
        c.register_step(CleanupPhase::Initiating, vec![], noop_step("a"))
            .unwrap();
        c.register_step(CleanupPhase::ClosingLogs, vec![], noop_step("b"))
            .unwrap();

        let before = c.status();
        assert_eq!(before.phase, CleanupPhase::NotStarted);
        assert_eq!(before.pending.len(), 2);

        c.execute(&CancelToken::new());
        let after = c.status();
        assert_eq!(after.phase, CleanupPhase::Completed);
        assert_eq!(after.completed.len(), 2);
        assert!(after.pending.is_empty());
    }

    #[test]
    fn test_dependency_failure_skips_dependent() {
        let mut c = CleanupCoordinator::new();
        c.register_step(
            CleanupPhase::Initiating,
            vec![],
            Step::new("broken", Box::new(|_| Err("no".into())), Box::new(|| true)).optional(),
        )
        .unwrap();
        c.register_step(
            CleanupPhase::Initiating,
            vec!["broken".into()],
            noop_step("dependent"),
        )
        .unwrap();

        match c.execute(&CancelToken::new()) {
            CleanupOutcome::PartialFailure(report) => {
                assert_eq!(report.outcomes["broken"], StepOutcome::Failed);
                assert_eq!(report.outcomes["dependent"], StepOutcome::Skipped);
            }
            CleanupOutcome::Clean => panic!("expected failures"),
        }
    }
}
