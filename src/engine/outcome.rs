//! Partial-failure reporting for batch operations.
//!
//! A batch (agreement over many pairs, export over many entities) either
//! isolates failing units and keeps going, or stops at the first one.

use serde::Serialize;
use tracing::warn;

use super::error::{EngineError, Result};

/// How a batch operation treats a failing unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Record the failure and continue
    #[default]
    Isolate,
    /// Return the first unit error
    FailFast,
}

/// One unit that could not be computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    /// Which unit failed (pair, entity, ...)
    pub unit: String,
    pub reason: String,
}

/// Result of a batch plus the units that failed along the way
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub failures: Vec<UnitFailure>,
}

impl<T> Outcome<T> {
    pub fn new(value: T, failures: Vec<UnitFailure>) -> Self {
        Self { value, failures }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Collects unit failures according to a policy
#[derive(Debug)]
pub(crate) struct FailureLog {
    policy: FailurePolicy,
    failures: Vec<UnitFailure>,
}

impl FailureLog {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            failures: Vec::new(),
        }
    }

    /// Record a failed unit, or hand the error back under FailFast
    pub fn record(&mut self, unit: impl Into<String>, err: EngineError) -> Result<()> {
        if self.policy == FailurePolicy::FailFast {
            return Err(err);
        }

        let unit = unit.into();
        warn!(%unit, error = %err, "Unit failed, continuing");
        self.failures.push(UnitFailure {
            unit,
            reason: err.to_string(),
        });
        Ok(())
    }

    pub fn finish<T>(self, value: T) -> Outcome<T> {
        Outcome::new(value, self.failures)
    }
}
