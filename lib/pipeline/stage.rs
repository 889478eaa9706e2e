use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

use super::ExecutionContext;

/// Structured failure raised by a stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StageFault {
    pub message: String,
}

impl StageFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(format!("stage panicked: {detail}"))
    }
}

/// One processing step applied to an execution context.
pub trait Stage: Send + Sync {
    fn id(&self) -> &str;

    fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>>;
}

impl<T> Stage for Arc<T>
where
    T: Stage + ?Sized,
{
    fn id(&self) -> &str {
        (**self).id()
    }

    fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>> {
        (**self).run(ctx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Faulted { stage_id: String, fault: StageFault },
}

/// Ordered stages built from one pipeline config.
pub struct Pipeline {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, stages: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every stage in order under a single recovery boundary.
    ///
    /// Both an `Err` from a stage and a panic inside one end the execution as
    /// `Faulted`, naming the stage that was running. Later stages are skipped.
    pub async fn execute(&self, ctx: &mut ExecutionContext) -> ExecutionOutcome {
        let mut current: Option<&str> = None;
        let result = AssertUnwindSafe(async {
            for stage in &self.stages {
                current = Some(stage.id());
                stage.run(ctx).await?;
            }
            Ok::<(), StageFault>(())
        })
        .catch_unwind()
        .await;

        let stage_id = current.unwrap_or_default().to_string();
        match result {
            Ok(Ok(())) => ExecutionOutcome::Completed,
            Ok(Err(fault)) => ExecutionOutcome::Faulted { stage_id, fault },
            Err(payload) => ExecutionOutcome::Faulted {
                stage_id,
                fault: StageFault::from_panic(payload),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Tag(&'static str);

    impl Stage for Tag {
        fn id(&self) -> &str {
            self.0
        }

        fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>> {
            Box::pin(async move {
                ctx.set(self.0, json!(true));
                Ok(())
            })
        }
    }

    struct Explode;

    impl Stage for Explode {
        fn id(&self) -> &str {
            "explode"
        }

        fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>> {
            Box::pin(async move {
                let _ = ctx.get("missing").expect("boom");
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn runs_stages_in_order() {
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(Tag("a")), Arc::new(Tag("b"))];
        let pipeline = Pipeline::new("p", stages);
        let mut ctx = ExecutionContext::new(1);

        assert_eq!(pipeline.execute(&mut ctx).await, ExecutionOutcome::Completed);
        assert!(ctx.contains("a") && ctx.contains("b"));
    }

    #[tokio::test]
    async fn panic_is_reported_as_fault_of_running_stage() {
        let stages: Vec<Arc<dyn Stage>> =
            vec![Arc::new(Tag("a")), Arc::new(Explode), Arc::new(Tag("never"))];
        let pipeline = Pipeline::new("p", stages);
        let mut ctx = ExecutionContext::new(2);

        match pipeline.execute(&mut ctx).await {
            ExecutionOutcome::Faulted { stage_id, fault } => {
                assert_eq!(stage_id, "explode");
                assert!(fault.message.contains("boom"), "got {}", fault.message);
            }
            other => panic!("expected fault, got {other:?}"),
        }
        assert!(ctx.contains("a"));
        assert!(!ctx.contains("never"));
    }
}
