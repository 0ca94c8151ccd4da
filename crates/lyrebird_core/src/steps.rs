//! Verified Step Execution
//!
//! Cleanup and recovery share one execution shape: a named action with a
//! cancellation token, a verification predicate polled until a deadline,
//! and a required/optional flag. The runner here is the single place that
//! drives them; the cleanup coordinator layers phases and dependencies on
//! top, recovery layers retries and backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

/// Cooperative cancellation handle passed to every step action
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token backed by an existing flag (e.g. the engine shutdown flag)
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Default per-step timeout
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// How often verification predicates are re-polled
pub const VERIFY_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type StepAction = Box<dyn FnMut(&CancelToken) -> Result<(), String> + Send>;
pub type StepVerify = Box<dyn FnMut() -> bool + Send>;

/// One verified unit of teardown or recovery work
pub struct Step {
    pub name: String,
    pub action: StepAction,
    pub verify: StepVerify,
    pub timeout: Duration,
    pub required: bool,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction, verify: StepVerify) -> Self {
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

/// Outcome of one step
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub succeeded: bool,
    pub required: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Run a step: invoke the action, then poll `verify` until it passes or
/// the step's timeout elapses. The timeout covers action and verification
/// together.
pub fn run_step(step: &mut Step, token: &CancelToken) -> StepReport {
    let start = Instant::now();
    let deadline = start + step.timeout;
    debug!(step = %step.name, "step starting");

    let action_result = (step.action)(token);

    let mut verified = false;
    let mut error = action_result.err();
    if error.is_none() {
        loop {
            if (step.verify)() {
                verified = true;
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                error = Some(format!(
                    "verification did not pass within {:?}",
                    step.timeout
                ));
                break;
            }
            std::thread::sleep(VERIFY_POLL_INTERVAL.min(deadline - now));
        }
    }

    let duration = start.elapsed();
    if verified {
        debug!(step = %step.name, ?duration, "step succeeded");
    } else if step.required {
        error!(step = %step.name, error = ?error, "required step failed");
    } else {
        warn!(step = %step.name, error = ?error, "optional step failed");
    }

    StepReport {
        name: step.name.clone(),
        succeeded: verified,
        required: step.required,
        duration,
        error,
    }
}

/// Outcome of a sequential plan
#[derive(Debug, Clone, Default)]
pub struct PlanReport {
    pub steps: Vec<StepReport>,
    /// Name of the required step that aborted the plan, if any
    pub aborted_at: Option<String>,
}

impl PlanReport {
    pub fn succeeded(&self) -> bool {
        self.aborted_at.is_none() && self.steps.iter().all(|s| s.succeeded || !s.required)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| !s.succeeded)
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// Run steps in order. A required step's failure aborts the remainder;
/// optional failures are recorded and execution continues.
pub fn run_plan(steps: &mut [Step], token: &CancelToken) -> PlanReport {
    let mut report = PlanReport::default();
    for step in steps.iter_mut() {
        if token.is_cancelled() {
            info!(step = %step.name, "plan cancelled before step");
            report.aborted_at = Some(step.name.clone());
            break;
        }
        let step_report = run_step(step, token);
        let failed_required = !step_report.succeeded && step_report.required;
        let name = step_report.name.clone();
        report.steps.push(step_report);
        if failed_required {
            report.aborted_at = Some(name);
            break;
        }
    }
    report
}
