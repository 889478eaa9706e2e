use futures::future::BoxFuture;
use governor::clock::Clock;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

use super::{AvailabilityError, AvailabilityRegistry};
use crate::pipeline::{ExecutionContext, PipelineError, Stage, StageConfig, StageFault};

/// Holds when every named cluster is available.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ClusterAvailable(Vec<String>);

impl ClusterAvailable {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    /// An unknown cluster name is a configuration error, not a `false`.
    pub fn check<C: Clock + Clone>(
        &self,
        registry: &AvailabilityRegistry<C>,
    ) -> Result<bool, AvailabilityError> {
        for name in &self.0 {
            if !registry.is_cluster_available(name)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for ClusterAvailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster_available: {:?}", self.0)
    }
}

#[derive(Debug, Deserialize)]
struct GateParams {
    clusters: ClusterAvailable,
}

struct ClusterGateStage<C: Clock + Clone> {
    id: String,
    condition: ClusterAvailable,
    registry: Arc<AvailabilityRegistry<C>>,
}

impl<C> Stage for ClusterGateStage<C>
where
    C: Clock + Clone + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(&'a self, _ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>> {
        Box::pin(async move {
            match self.condition.check(&*self.registry) {
                Ok(true) => Ok(()),
                Ok(false) => Err(StageFault::new(format!("{} does not hold", self.condition))),
                Err(err) => Err(StageFault::new(err.to_string())),
            }
        })
    }
}

/// Constructor for the `cluster_available` stage kind: faults the message
/// unless every cluster in `params.clusters` is available.
pub fn cluster_gate_stage<C>(
    registry: Arc<AvailabilityRegistry<C>>,
) -> impl Fn(&StageConfig) -> Result<Arc<dyn Stage>, PipelineError> + Send + Sync + 'static
where
    C: Clock + Clone + Send + Sync + 'static,
{
    move |config: &StageConfig| -> Result<Arc<dyn Stage>, PipelineError> {
        let params: GateParams = serde_json::from_value(config.params.clone()).map_err(|err| {
            PipelineError::InvalidStageParams {
                stage: config.id.clone(),
                reason: err.to_string(),
            }
        })?;
        Ok(Arc::new(ClusterGateStage {
            id: config.id.clone(),
            condition: params.clusters,
            registry: Arc::clone(&registry),
        }) as Arc<dyn Stage>)
    }
}
