//! Stage pipelines run by pools of queue workers.
//!
//! A [`PipeRunner`] owns the workers of one configured pipeline. Each worker
//! pulls raw messages from the pipeline's input queue, decodes them into an
//! [`ExecutionContext`] and runs the ordered stages. A stage fault only
//! discards the message that caused it.

mod builtin;
mod context;
mod registry;
mod runner;
mod stage;

pub use context::ExecutionContext;
pub use registry::{StageConstructor, StageRegistry};
pub use runner::{wait_for_exit, PipeRunner, RunnerRegistry, WorkerHandle, WorkerReport};
pub use stage::{ExecutionOutcome, Pipeline, Stage, StageFault};

use serde::Deserialize;
use thiserror::Error;

use crate::queue::QueueError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline [{pipeline}] received an undecodable message: {source}")]
    Decode {
        pipeline: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid pipeline config: {0}")]
    InvalidConfig(String),

    #[error("Unknown stage kind [{kind}] in pipeline [{pipeline}]")]
    UnknownStage { pipeline: String, kind: String },

    #[error("Invalid params for stage [{stage}]: {reason}")]
    InvalidStageParams { stage: String, reason: String },

    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("Pipeline [{0}] is already started")]
    AlreadyStarted(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Worker join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    1
}

/// One stage entry: `kind` selects the constructor, `params` is passed to it.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipeConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of workers competing for the input queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    pub input_queue: String,
    /// Consumer group name; defaults to the pipeline name.
    #[serde(default)]
    pub consumer_group: Option<String>,
    /// Sleep after each message, in milliseconds. 0 disables the throttle.
    #[serde(default)]
    pub threshold_ms: u64,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl PipeConfig {
    pub fn consumer_group(&self) -> &str {
        self.consumer_group.as_deref().unwrap_or(&self.name)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "pipeline name can't be empty".to_string(),
            ));
        }
        if self.input_queue.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "input queue can't be empty for pipeline [{}]",
                self.name
            )));
        }
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "pipeline [{}] has no stages",
                self.name
            )));
        }
        if self.concurrency == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "pipeline [{}] needs a concurrency of at least 1",
                self.name
            )));
        }
        Ok(())
    }
}
