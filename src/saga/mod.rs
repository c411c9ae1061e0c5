//! Saga Executor
//!
//! Runs an ordered list of steps. When a step fails, every step that already
//! succeeded is rolled back in reverse order. A failing rollback is logged and
//! the remaining rollbacks still run; the outcome then reports that the data
//! needs manual reconciliation.

pub mod steps;

use async_trait::async_trait;

use crate::domain::LedgerError;

pub use steps::{CompareAndSwapStep, ConfirmStep, InsertRowStep, ProvisionalInsertStep};

/// One unit of work paired with its compensating action
#[async_trait]
pub trait SagaStep: Send {
    fn name(&self) -> &str;

    /// The forward action
    async fn execute(&mut self) -> Result<(), LedgerError>;

    /// Undo a successful `execute`
    async fn rollback(&mut self) -> Result<(), LedgerError>;
}

/// A rollback that itself failed
#[derive(Debug)]
pub struct RollbackFailure {
    pub step: String,
    pub error: LedgerError,
}

/// Result of one saga run
#[derive(Debug)]
pub enum SagaOutcome {
    /// Every step succeeded
    Completed { steps: Vec<String> },

    /// A step failed and every earlier step was undone
    RolledBack {
        failed_step: String,
        cause: LedgerError,
        compensated: Vec<String>,
    },

    /// A step failed and at least one rollback failed too
    RollbackFailed {
        failed_step: String,
        cause: LedgerError,
        compensated: Vec<String>,
        failures: Vec<RollbackFailure>,
    },
}

impl SagaOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SagaOutcome::Completed { .. })
    }

    pub fn failed_step(&self) -> Option<&str> {
        match self {
            SagaOutcome::Completed { .. } => None,
            SagaOutcome::RolledBack { failed_step, .. }
            | SagaOutcome::RollbackFailed { failed_step, .. } => Some(failed_step),
        }
    }

    pub fn into_result(self) -> Result<(), LedgerError> {
        match self {
            SagaOutcome::Completed { .. } => Ok(()),
            SagaOutcome::RolledBack {
                failed_step, cause, ..
            } => Err(LedgerError::step_failed(failed_step, cause)),
            SagaOutcome::RollbackFailed {
                failed_step,
                cause,
                failures,
                ..
            } => Err(LedgerError::RollbackFailed {
                step: failed_step,
                cause: cause.to_string(),
                rollback_errors: failures
                    .iter()
                    .map(|f| format!("{}: {}", f.step, f.error))
                    .collect(),
            }),
        }
    }
}

/// An ordered list of steps
pub struct Saga {
    name: String,
    steps: Vec<Box<dyn SagaStep>>,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn step(mut self, step: impl SagaStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn run(self) -> SagaOutcome {
        let saga = self.name;
        let mut completed: Vec<Box<dyn SagaStep>> = Vec::with_capacity(self.steps.len());

        tracing::debug!(saga = %saga, steps = self.steps.len(), "Saga started");

        for mut step in self.steps {
            match step.execute().await {
                Ok(()) => {
                    tracing::debug!(saga = %saga, step = step.name(), "Saga step completed");
                    completed.push(step);
                }
                Err(cause) => {
                    let failed_step = step.name().to_string();
                    tracing::warn!(
                        saga = %saga,
                        step = %failed_step,
                        error = %cause,
                        completed = completed.len(),
                        "Saga step failed; rolling back"
                    );
                    return Self::compensate(&saga, completed, failed_step, cause).await;
                }
            }
        }

        let steps: Vec<String> = completed.iter().map(|s| s.name().to_string()).collect();
        tracing::debug!(saga = %saga, "Saga completed");
        SagaOutcome::Completed { steps }
    }

    /// Roll back completed steps, newest first, attempting every one
    async fn compensate(
        saga: &str,
        mut completed: Vec<Box<dyn SagaStep>>,
        failed_step: String,
        cause: LedgerError,
    ) -> SagaOutcome {
        let mut compensated = Vec::new();
        let mut failures = Vec::new();

        while let Some(mut step) = completed.pop() {
            let name = step.name().to_string();
            match step.rollback().await {
                Ok(()) => {
                    tracing::debug!(saga = %saga, step = %name, "Saga step rolled back");
                    compensated.push(name);
                }
                Err(error) => {
                    tracing::error!(
                        saga = %saga,
                        step = %name,
                        failed_step = %failed_step,
                        cause = %cause,
                        rollback_error = %error,
                        "Saga rollback failed; manual reconciliation required"
                    );
                    failures.push(RollbackFailure { step: name, error });
                }
            }
        }

        if failures.is_empty() {
            SagaOutcome::RolledBack {
                failed_step,
                cause,
                compensated,
            }
        } else {
            SagaOutcome::RollbackFailed {
                failed_step,
                cause,
                compensated,
                failures,
            }
        }
    }
}
