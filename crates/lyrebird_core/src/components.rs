//! Component Registry and Lifecycle
//!
//! Pipeline components register with an id, a kind, their dependencies and
//! the lifecycle hooks they actually support; dispatch happens only on
//! declared hooks. The dependency graph must stay acyclic, startup order
//! is a deterministic topological sort (registration order breaks ties),
//! and shutdown is its exact reverse.
//!
//! State machine:
//!
//! ```text
//! (register) -> REGISTERED -> INITIALIZING -> RUNNING <-> DEGRADED
//!               RUNNING | DEGRADED -> STOPPING -> STOPPED
//!               any -> FAILED   (terminal unless re-registered)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::pool::ChannelSide;
use crate::steps::{run_plan, CancelToken, PlanReport, Step, DEFAULT_STEP_TIMEOUT};

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ComponentState {
    Registered,
    Initializing,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

/// What role a component plays in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComponentKind {
    Input,
    Transform,
    Output,
    Service,
}

/// Aggregated system health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthState {
    Healthy,
    Degraded,
    Failed,
}

/// Effectful health predicate; must return promptly, the coordinator
/// enforces a per-call timeout around it
pub type HealthCheckFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Effectful recovery action; receives the cancellation token
pub type RecoveryActionFn = Arc<dyn Fn(&CancelToken) -> Result<(), String> + Send + Sync>;

/// Recovery verification predicate, polled until its step's timeout
pub type RecoveryVerifyFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// One declared recovery step: name, action, verification, timeout and
/// whether its failure aborts the plan
#[derive(Clone)]
pub struct RecoveryStep {
    pub name: String,
    pub action: RecoveryActionFn,
    pub verify: RecoveryVerifyFn,
    pub timeout: Duration,
    pub required: bool,
}

impl RecoveryStep {
    pub fn new(
        name: impl Into<String>,
        action: RecoveryActionFn,
        verify: RecoveryVerifyFn,
    ) -> Self {
        Self {
            name: name.into(),
            action,
            verify,
            timeout: DEFAULT_STEP_TIMEOUT,
            required: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Registration-time description of a component
///
/// Lifecycle hooks are capabilities: the coordinator only dispatches the
/// hooks a component actually declared.
#[derive(Clone)]
pub struct ComponentSpec {
    pub id: String,
    pub kind: ComponentKind,
    pub dependencies: Vec<String>,
    pub health_check: Option<HealthCheckFn>,
    pub recovery: Vec<RecoveryStep>,
}

impl ComponentSpec {
    pub fn new(id: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            id: id.into(),
            kind,
            dependencies: Vec::new(),
            health_check: None,
            recovery: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_health_check(mut self, check: HealthCheckFn) -> Self {
        self.health_check = Some(check);
        self
    }

    pub fn with_recovery_step(mut self, step: RecoveryStep) -> Self {
        self.recovery.push(step);
        self
    }
}

struct ComponentRecord {
    spec: ComponentSpec,
    state: ComponentState,
    seq: usize,
    consecutive_failures: u32,
    owned: [HashSet<u64>; 3],
    metrics: BTreeMap<String, f64>,
}

/// One component's slice of a health report
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub state: ComponentState,
    /// Hook outcome; `None` when the component declares no health hook or
    /// the hook timed out
    pub healthy: Option<bool>,
    pub check_duration_ms: f64,
}

/// Result of one health pass
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthState,
    pub per_component: BTreeMap<String, ComponentHealth>,
}

/// Registry, lifecycle enforcement and health aggregation
pub struct ComponentCoordinator {
    records: HashMap<String, ComponentRecord>,
    next_seq: usize,
    health_timeout: Duration,
}

impl ComponentCoordinator {
    pub fn new(health_timeout: Duration) -> Self {
        Self {
            records: HashMap::new(),
            next_seq: 0,
            health_timeout,
        }
    }

    /// Register a component, or re-register a FAILED one.
    pub fn register(&mut self, spec: ComponentSpec) -> CoreResult<()> {
        let replacing_failed = self
            .records
            .get(&spec.id)
            .map(|r| r.state == ComponentState::Failed);
        if replacing_failed == Some(false) {
            return Err(CoreError::DuplicateId(spec.id));
        }

        for dep in &spec.dependencies {
            if *dep == spec.id {
                return Err(CoreError::DependencyCycle(spec.id.clone()));
            }
            if !self.records.contains_key(dep) {
                return Err(CoreError::UnknownDependency {
                    id: spec.id.clone(),
                    dependency: dep.clone(),
                });
            }
            // Re-registration can introduce back-edges into the existing
            // graph; reject any path from a dependency back to this id.
            if self.has_path(dep, &spec.id) {
                return Err(CoreError::DependencyCycle(spec.id.clone()));
            }
        }

        let seq = match self.records.get(&spec.id) {
            Some(existing) => existing.seq, // keep ordering stable across re-registration
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            }
        };

        info!(id = %spec.id, kind = ?spec.kind, deps = ?spec.dependencies, "component registered");
        self.records.insert(
            spec.id.clone(),
            ComponentRecord {
                spec,
                state: ComponentState::Registered,
                seq,
                consecutive_failures: 0,
                owned: Default::default(),
                metrics: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn has_path(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(record) = self.records.get(&current) {
                stack.extend(record.spec.dependencies.iter().cloned());
            }
        }
        false
    }

    /// Topological startup order; registration order breaks ties.
    pub fn resolve_init_order(&self) -> Vec<String> {
        let mut indegree: HashMap<&str, usize> = self
            .records
            .iter()
            .map(|(id, r)| (id.as_str(), r.spec.dependencies.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, record) in &self.records {
            for dep in &record.spec.dependencies {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut order = Vec::with_capacity(self.records.len());
        loop {
            // Deterministic tie-break: lowest registration sequence first
            let next = indegree
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(&id, _)| id)
                .min_by_key(|id| self.records[*id].seq);
            let Some(id) = next else { break };
            indegree.remove(id);
            order.push(id.to_string());
            if let Some(children) = dependents.get(id) {
                for child in children {
                    if let Some(deg) = indegree.get_mut(child) {
                        *deg -= 1;
                    }
                }
            }
        }
        order
    }

    /// Reverse of the startup order.
    pub fn resolve_shutdown_order(&self) -> Vec<String> {
        let mut order = self.resolve_init_order();
        order.reverse();
        order
    }

    /// Apply a lifecycle transition, validating the edge and (for RUNNING)
    /// the dependency states. Returns the previous state.
    pub fn transition(&mut self, id: &str, target: ComponentState) -> CoreResult<ComponentState> {
        let from = self
            .records
            .get(id)
            .map(|r| r.state)
            .ok_or_else(|| CoreError::UnknownComponent(id.to_string()))?;

        let allowed = matches!(
            (from, target),
            (ComponentState::Registered, ComponentState::Initializing)
                | (ComponentState::Initializing, ComponentState::Running)
                | (ComponentState::Running, ComponentState::Degraded)
                | (ComponentState::Degraded, ComponentState::Running)
                | (ComponentState::Running, ComponentState::Stopping)
                | (ComponentState::Degraded, ComponentState::Stopping)
                | (ComponentState::Stopping, ComponentState::Stopped)
        ) || (target == ComponentState::Failed && from != ComponentState::Failed);

        if !allowed {
            return Err(CoreError::InvalidTransition {
                id: id.to_string(),
                from,
                to: target,
            });
        }

        if target == ComponentState::Running {
            // Fresh starts require running dependencies; recovery from
            // DEGRADED tolerates degraded ones.
            let tolerated: &[ComponentState] = if from == ComponentState::Initializing {
                &[ComponentState::Running]
            } else {
                &[ComponentState::Running, ComponentState::Degraded]
            };
            let deps = self.records[id].spec.dependencies.clone();
            for dep in deps {
                let dep_state = self
                    .records
                    .get(&dep)
                    .map(|r| r.state)
                    .ok_or_else(|| CoreError::UnknownComponent(dep.clone()))?;
                if !tolerated.contains(&dep_state) {
                    return Err(CoreError::DependencyNotRunning {
                        id: id.to_string(),
                        dependency: dep,
                        state: dep_state,
                    });
                }
            }
        }

        let record = self.records.get_mut(id).expect("checked above");
        record.state = target;
        debug!(id, ?from, ?target, "component transition");
        Ok(from)
    }

    pub fn state(&self, id: &str) -> CoreResult<ComponentState> {
        self.records
            .get(id)
            .map(|r| r.state)
            .ok_or_else(|| CoreError::UnknownComponent(id.to_string()))
    }

    /// Immutable snapshot of every component's state
    pub fn states(&self) -> BTreeMap<String, ComponentState> {
        self.records
            .iter()
            .map(|(id, r)| (id.clone(), r.state))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Run every declared health hook with the per-call timeout and
    /// aggregate: any FAILED wins, else any DEGRADED, else healthy. A hook
    /// returning false or timing out degrades the aggregate even when the
    /// recorded state is still RUNNING.
    pub fn check_health(&self) -> HealthReport {
        let mut per_component = BTreeMap::new();
        let mut overall = HealthState::Healthy;

        let mut ordered: Vec<(&String, &ComponentRecord)> = self.records.iter().collect();
        ordered.sort_by_key(|(_, r)| r.seq);

        for (id, record) in ordered {
            let (healthy, duration_ms) = match &record.spec.health_check {
                Some(hook) => {
                    let start = Instant::now();
                    let outcome = run_hook_with_timeout(Arc::clone(hook), self.health_timeout);
                    (outcome, start.elapsed().as_secs_f64() * 1000.0)
                }
                None => (None, 0.0),
            };

            let severity = match record.state {
                ComponentState::Failed => HealthState::Failed,
                ComponentState::Degraded => HealthState::Degraded,
                _ if healthy == Some(false) || (record.spec.health_check.is_some() && healthy.is_none()) => {
                    HealthState::Degraded
                }
                _ => HealthState::Healthy,
            };
            overall = worst(overall, severity);

            per_component.insert(
                id.clone(),
                ComponentHealth {
                    state: record.state,
                    healthy,
                    check_duration_ms: duration_ms,
                },
            );
        }

        HealthReport {
            overall,
            per_component,
        }
    }

    /// Run a component's declared recovery steps through the shared step
    /// runner, retrying with exponential backoff (base 100 ms, doubling).
    ///
    /// Dispatch is capability-based: a component that declares no
    /// recovery steps fails immediately. The registry stays locked by the
    /// caller while hooks run, so hooks must only observe leaf state
    /// (queues, storage, atomics) and never call back into the
    /// coordinator stack.
    ///
    /// Success clears the failure streak and lifts a DEGRADED component
    /// back to RUNNING.
    pub fn attempt_recovery(
        &mut self,
        id: &str,
        max_attempts: u32,
        token: &CancelToken,
    ) -> CoreResult<PlanReport> {
        let recovery = self
            .records
            .get(id)
            .map(|r| r.spec.recovery.clone())
            .ok_or_else(|| CoreError::UnknownComponent(id.to_string()))?;
        if recovery.is_empty() {
            return Err(CoreError::RecoveryFailed(format!(
                "{id} declares no recovery steps"
            )));
        }

        let mut plan: Vec<Step> = recovery
            .iter()
            .map(|declared| {
                let action = Arc::clone(&declared.action);
                let verify = Arc::clone(&declared.verify);
                let mut step = Step::new(
                    declared.name.clone(),
                    Box::new(move |t: &CancelToken| action(t)),
                    Box::new(move || verify()),
                )
                .with_timeout(declared.timeout);
                if !declared.required {
                    step = step.optional();
                }
                step
            })
            .collect();

        let mut backoff = Duration::from_millis(100);
        let mut last_failed = recovery[0].name.clone();
        for attempt in 0..max_attempts.max(1) {
            if token.is_cancelled() {
                return Err(CoreError::Shutdown);
            }
            info!(id, attempt, "recovery attempt");
            let report = run_plan(&mut plan, token);
            if report.succeeded() {
                self.clear_failures(id);
                if self.state(id)? == ComponentState::Degraded {
                    let _ = self.transition(id, ComponentState::Running);
                }
                info!(id, attempt, "recovery succeeded");
                return Ok(report);
            }
            if let Some(name) = &report.aborted_at {
                last_failed = name.clone();
            } else if let Some(name) = report.failed_steps().first() {
                last_failed = name.to_string();
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }

        warn!(id, step = %last_failed, "recovery attempts exhausted");
        Err(CoreError::RecoveryFailed(last_failed))
    }

    /// Record a failure for the component; returns the new streak length.
    pub fn note_failure(&mut self, id: &str) -> u32 {
        match self.records.get_mut(id) {
            Some(record) => {
                record.consecutive_failures += 1;
                record.consecutive_failures
            }
            None => {
                warn!(id, "failure noted for unknown component");
                0
            }
        }
    }

    pub fn clear_failures(&mut self, id: &str) {
        if let Some(record) = self.records.get_mut(id) {
            record.consecutive_failures = 0;
        }
    }

    /// Track a pool buffer owned by a component.
    pub fn record_resource(&mut self, id: &str, channel: ChannelSide, buffer_id: u64) {
        if let Some(record) = self.records.get_mut(id) {
            record.owned[channel_slot(channel)].insert(buffer_id);
        }
    }

    pub fn forget_resource(&mut self, id: &str, channel: ChannelSide, buffer_id: u64) {
        if let Some(record) = self.records.get_mut(id) {
            record.owned[channel_slot(channel)].remove(&buffer_id);
        }
    }

    /// Buffers a component currently owns on one channel
    pub fn owned_resources(&self, id: &str, channel: ChannelSide) -> usize {
        self.records
            .get(id)
            .map(|r| r.owned[channel_slot(channel)].len())
            .unwrap_or(0)
    }

    pub fn set_metric(&mut self, id: &str, key: &str, value: f64) {
        if let Some(record) = self.records.get_mut(id) {
            record.metrics.insert(key.to_string(), value);
        }
    }

    pub fn metrics(&self, id: &str) -> BTreeMap<String, f64> {
        self.records
            .get(id)
            .map(|r| r.metrics.clone())
            .unwrap_or_default()
    }
}

fn channel_slot(channel: ChannelSide) -> usize {
    match channel {
        ChannelSide::Left => 0,
        ChannelSide::Right => 1,
        ChannelSide::None => 2,
    }
}

fn worst(a: HealthState, b: HealthState) -> HealthState {
    use HealthState::*;
    match (a, b) {
        (Failed, _) | (_, Failed) => Failed,
        (Degraded, _) | (_, Degraded) => Degraded,
        _ => Healthy,
    }
}

/// Run a health hook on a watchdog thread; `None` means it timed out.
fn run_hook_with_timeout(hook: HealthCheckFn, timeout: Duration) -> Option<bool> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name("lyrebird-health".into())
        .spawn(move || {
            let _ = tx.send(hook());
        })
        .ok()?;
    rx.recv_timeout(timeout).ok()
}
