use std::collections::HashMap;
use std::sync::Arc;

use super::builtin;
use super::{PipeConfig, Pipeline, PipelineError, Stage, StageConfig};

pub type StageConstructor =
    Arc<dyn Fn(&StageConfig) -> Result<Arc<dyn Stage>, PipelineError> + Send + Sync>;

/// Maps a stage `kind` to the constructor that builds it.
///
/// Owned by the driver and shared by every runner; pipelines are rebuilt from
/// it on each start so an `update` picks up new stage params.
#[derive(Clone, Default)]
pub struct StageRegistry {
    constructors: HashMap<String, StageConstructor>,
}

impl StageRegistry {
    /// Registry with no kinds at all.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("log", builtin::log_stage);
        registry.register("set", builtin::set_stage);
        registry.register("remove", builtin::remove_stage);
        registry.register("require", builtin::require_stage);
        registry.register("fail", builtin::fail_stage);
        registry
    }

    /// Adds or replaces the constructor for `kind`.
    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(&StageConfig) -> Result<Arc<dyn Stage>, PipelineError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(kind.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn build(&self, config: &PipeConfig) -> Result<Pipeline, PipelineError> {
        let stages = config
            .stages
            .iter()
            .map(|stage| {
                let constructor =
                    self.constructors
                        .get(&stage.kind)
                        .ok_or_else(|| PipelineError::UnknownStage {
                            pipeline: config.name.clone(),
                            kind: stage.kind.clone(),
                        })?;
                constructor(stage)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Pipeline::new(config.name.clone(), stages))
    }
}

#[cfg(test)]
mod tests {
    use super::StageRegistry;
    use crate::pipeline::{PipeConfig, PipelineError};

    fn pipe(stages: &str) -> PipeConfig {
        serde_json::from_str(&format!(
            r#"{{"name": "p", "input_queue": "q", "stages": {stages}}}"#
        ))
        .expect("pipe config")
    }

    #[test]
    fn builds_builtin_stages_in_order() {
        let registry = StageRegistry::with_builtins();
        let pipeline = registry
            .build(&pipe(r#"[{"id": "a", "kind": "set", "params": {"x": 1}}, {"id": "b", "kind": "log"}]"#))
            .expect("build");
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.name(), "p");
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        let registry = StageRegistry::with_builtins();
        let err = registry
            .build(&pipe(r#"[{"id": "a", "kind": "translate"}]"#))
            .err()
            .expect("unknown kind must fail");
        assert!(matches!(err, PipelineError::UnknownStage { kind, .. } if kind == "translate"));
    }
}
