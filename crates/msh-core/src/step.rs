//! Step/Result framework
//!
//! Pipelines are built from [`Step`]s that mutate a [`MessagingContext`].
//! A [`CompositeStep`] runs its children in order and a [`CatchAllStep`]
//! turns errors and panics into a failed outcome with an [`ErrorResult`] on
//! the context. Side effects of steps that already ran are never rolled back.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::context::{MessagingContext, StepResult};
use crate::errors::{ErrorKind, ErrorResult, MshError, MshResult};
use crate::message::ErrorCode;

// ----------------------------------------------------------------------------
// Step Trait
// ----------------------------------------------------------------------------

/// What a step asks the pipeline to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Run the next step
    Continue,
    /// Succeed without running the remaining steps
    Stop,
    /// Abort; the step has recorded an error result on the context
    Fail,
}

/// A single unit of processing
#[async_trait]
pub trait Step: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome>;
}

// ----------------------------------------------------------------------------
// Composite Step
// ----------------------------------------------------------------------------

/// Ordered list of steps sharing one context
pub struct CompositeStep {
    name: &'static str,
    steps: Vec<Arc<dyn Step>>,
}

impl CompositeStep {
    pub fn new(name: &'static str, steps: Vec<Arc<dyn Step>>) -> Self {
        Self { name, steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl Step for CompositeStep {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        for step in &self.steps {
            if context.is_cancelled() {
                warn!(pipeline = self.name, next_step = step.name(), "Invocation cancelled");
                context.fail_with(&MshError::Cancelled);
                return Ok(StepOutcome::Fail);
            }

            debug!(pipeline = self.name, step = step.name(), "Executing step");
            match step.execute(context).await? {
                StepOutcome::Continue => {}
                StepOutcome::Stop => {
                    context.stop_execution = true;
                    return Ok(StepOutcome::Stop);
                }
                StepOutcome::Fail => {
                    if context.error_result.is_none() {
                        context.error_result = Some(ErrorResult::new(
                            ErrorKind::Internal,
                            ErrorCode::Other,
                            format!("Step {} failed without a reason", step.name()),
                        ));
                    }
                    return Ok(StepOutcome::Fail);
                }
            }
        }
        Ok(StepOutcome::Continue)
    }
}

// ----------------------------------------------------------------------------
// Catch-All Step
// ----------------------------------------------------------------------------

/// Converts errors and panics of the wrapped step into a failed outcome
pub struct CatchAllStep {
    inner: Arc<dyn Step>,
}

impl CatchAllStep {
    pub fn new(inner: Arc<dyn Step>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Step for CatchAllStep {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn execute(&self, context: &mut MessagingContext) -> MshResult<StepOutcome> {
        let step_name = self.inner.name();
        let result = AssertUnwindSafe(self.inner.execute(context)).catch_unwind().await;

        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => {
                error!(step = step_name, error = %e, kind = ?e.kind(), "Step failed");
                context.fail_with(&e);
                Ok(StepOutcome::Fail)
            }
            Err(panic_payload) => {
                let panic_msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                error!(step = step_name, panic_message = %panic_msg, "Step panicked");
                context.fail_with(&MshError::pipeline_error(format!("{} panicked", step_name)));
                Ok(StepOutcome::Fail)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

/// Named, panic-safe sequence of steps
pub struct Pipeline {
    name: &'static str,
    root: CatchAllStep,
}

impl Pipeline {
    pub fn new(name: &'static str, steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            name,
            root: CatchAllStep::new(Arc::new(CompositeStep::new(name, steps))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run every step on the context and report the outcome
    #[tracing::instrument(skip_all, fields(pipeline = self.name, mode = ?context.mode))]
    pub async fn run(&self, mut context: MessagingContext) -> StepResult {
        let outcome = match self.root.execute(&mut context).await {
            Ok(outcome) => outcome,
            Err(e) => {
                context.fail_with(&e);
                StepOutcome::Fail
            }
        };

        match outcome {
            StepOutcome::Continue => StepResult::success(context),
            StepOutcome::Stop => StepResult::success_and_stop(context),
            StepOutcome::Fail => {
                debug!(
                    error = ?context.error_result.as_ref().map(|e| e.code.code()),
                    "Pipeline failed"
                );
                StepResult::failed(context)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ReceivedMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>, StepOutcome);

    #[async_trait]
    impl Step for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn execute(&self, _context: &mut MessagingContext) -> MshResult<StepOutcome> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(self.1)
        }
    }

    struct Failing;

    #[async_trait]
    impl Step for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn execute(&self, _context: &mut MessagingContext) -> MshResult<StepOutcome> {
            Err(MshError::protocol_violation(ErrorCode::InvalidHeader, "missing header"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Step for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn execute(&self, _context: &mut MessagingContext) -> MshResult<StepOutcome> {
            panic!("boom");
        }
    }

    fn context() -> MessagingContext {
        MessagingContext::for_receive(ReceivedMessage::new("application/json", b"{}".to_vec()))
    }

    #[tokio::test]
    async fn test_pipeline_aborts_at_first_failure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            "test",
            vec![
                Arc::new(Counting(counter.clone(), StepOutcome::Continue)),
                Arc::new(Failing),
                Arc::new(Counting(counter.clone(), StepOutcome::Continue)),
            ],
        );

        let result = pipeline.run(context()).await;
        assert!(!result.succeeded);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let error = result.context.error_result.unwrap();
        assert_eq!(error.code, ErrorCode::InvalidHeader);
        assert_eq!(error.kind, ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_stop_skips_remaining_steps() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            "test",
            vec![
                Arc::new(Counting(counter.clone(), StepOutcome::Stop)),
                Arc::new(Counting(counter.clone(), StepOutcome::Continue)),
            ],
        );

        let result = pipeline.run(context()).await;
        assert!(result.succeeded);
        assert!(result.stop_execution);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_failure() {
        let pipeline = Pipeline::new("test", vec![Arc::new(Panicking)]);
        let result = pipeline.run(context()).await;
        assert!(!result.succeeded);
        assert_eq!(result.context.error_result.unwrap().kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_cancelled_context_runs_no_steps() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            "test",
            vec![Arc::new(Counting(counter.clone(), StepOutcome::Continue))],
        );

        let ctx = context();
        ctx.cancellation.cancel();
        let result = pipeline.run(ctx).await;
        assert!(!result.succeeded);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
