//! Ranked Lock Hierarchy
//!
//! Every long-lived lock in the coordination core carries a rank in the
//! fixed order `state < metrics < perf < component < update`. A thread may
//! only acquire locks in strictly ascending rank; the per-thread held-rank
//! stack makes violations detectable at the acquisition site instead of as
//! a deadlock minutes later.
//!
//! All acquisitions are bounded: `try_guard` waits up to the lock's
//! timeout and surfaces `LockError::Timeout` as a retriable failure.
//! `guard` additionally trips a debug assertion on an ordering violation,
//! so misordered paths fail loudly in debug builds and fail fast with an
//! error in release builds.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

/// Position of a named lock in the strict hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockRank {
    State = 0,
    Metrics = 1,
    Perf = 2,
    Component = 3,
    Update = 4,
}

impl LockRank {
    pub fn name(self) -> &'static str {
        match self {
            LockRank::State => "state",
            LockRank::Metrics => "metrics",
            LockRank::Perf => "perf",
            LockRank::Component => "component",
            LockRank::Update => "update",
        }
    }
}

/// Default bounded wait for any ranked lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock acquisition failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Bounded wait expired; the operation is retriable
    #[error("timed out acquiring the {0} lock after {1:?}")]
    Timeout(&'static str, Duration),

    /// The calling thread already holds an equal or higher rank
    #[error("lock order violation: acquiring {requested} while holding {held}")]
    OrderViolation {
        requested: &'static str,
        held: &'static str,
    },
}

thread_local! {
    static HELD_RANKS: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

/// Ranks currently held by this thread, in acquisition order
pub fn held_ranks() -> Vec<LockRank> {
    HELD_RANKS.with(|h| h.borrow().clone())
}

/// A mutex bound to a position in the lock hierarchy
pub struct RankedLock<T> {
    rank: LockRank,
    timeout: Duration,
    inner: Mutex<T>,
}

impl<T> RankedLock<T> {
    pub fn new(rank: LockRank, value: T) -> Self {
        Self::with_timeout(rank, value, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_timeout(rank: LockRank, value: T, timeout: Duration) -> Self {
        Self {
            rank,
            timeout,
            inner: Mutex::new(value),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    /// Acquire with ordering check and bounded wait.
    ///
    /// An ordering violation returns immediately without touching the
    /// mutex, so no other thread is ever blocked by a misordered caller.
    pub fn try_guard(&self) -> Result<RankedGuard<'_, T>, LockError> {
        let conflict = HELD_RANKS.with(|h| {
            h.borrow()
                .last()
                .copied()
                .filter(|&top| top >= self.rank)
        });
        if let Some(top) = conflict {
            return Err(LockError::OrderViolation {
                requested: self.rank.name(),
                held: top.name(),
            });
        }

        let guard = self
            .inner
            .try_lock_for(self.timeout)
            .ok_or(LockError::Timeout(self.rank.name(), self.timeout))?;
        HELD_RANKS.with(|h| h.borrow_mut().push(self.rank));
        Ok(RankedGuard {
            guard,
            rank: self.rank,
        })
    }

    /// Like [`try_guard`](Self::try_guard), but an ordering violation also
    /// trips a debug assertion.
    pub fn guard(&self) -> Result<RankedGuard<'_, T>, LockError> {
        let result = self.try_guard();
        if let Err(LockError::OrderViolation { requested, held }) = &result {
            debug_assert!(
                false,
                "lock order violation: acquiring {requested} while holding {held}"
            );
        }
        result
    }
}

/// Guard that pops its rank from the held stack on release
#[derive(Debug)]
pub struct RankedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    rank: LockRank,
}

impl<T> Deref for RankedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedGuard<'_, T> {
    fn drop(&mut self) {
        HELD_RANKS.with(|h| {
            let popped = h.borrow_mut().pop();
            debug_assert_eq!(popped, Some(self.rank), "ranked guards must unwind in order");
        });
    }
}
