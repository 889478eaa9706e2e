//! Generic stages available to every pipeline config.
//!
//! | kind      | params                                   |
//! |-----------|------------------------------------------|
//! | `log`     | `{"level": "info"}`                      |
//! | `set`     | any object; each entry becomes an attribute |
//! | `remove`  | `{"keys": ["a", "b"]}`                   |
//! | `require` | `{"keys": ["a", "b"]}`                   |
//! | `fail`    | `{"message": "..", "when_attribute": "k"}` |

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::{ExecutionContext, PipelineError, Stage, StageConfig, StageFault};

fn parse_params<T: for<'de> Deserialize<'de>>(config: &StageConfig) -> Result<T, PipelineError> {
    let params = if config.params.is_null() {
        Value::Object(Map::new())
    } else {
        config.params.clone()
    };
    serde_json::from_value(params).map_err(|err| PipelineError::InvalidStageParams {
        stage: config.id.clone(),
        reason: err.to_string(),
    })
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
}

#[derive(Debug, Deserialize)]
struct LogParams {
    #[serde(default)]
    level: LogLevel,
}

pub(super) struct LogStage {
    id: String,
    level: LogLevel,
}

pub(super) fn log_stage(config: &StageConfig) -> Result<Arc<dyn Stage>, PipelineError> {
    let params: LogParams = parse_params(config)?;
    Ok(Arc::new(LogStage {
        id: config.id.clone(),
        level: params.level,
    }))
}

impl Stage for LogStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>> {
        Box::pin(async move {
            let snapshot = Value::Object(ctx.attributes.clone());
            match self.level {
                LogLevel::Trace => trace!(event = "pipeline_context", stage = %self.id, sequence_id = ctx.sequence_id, attributes = %snapshot),
                LogLevel::Debug => debug!(event = "pipeline_context", stage = %self.id, sequence_id = ctx.sequence_id, attributes = %snapshot),
                LogLevel::Info => info!(event = "pipeline_context", stage = %self.id, sequence_id = ctx.sequence_id, attributes = %snapshot),
                LogLevel::Warn => warn!(event = "pipeline_context", stage = %self.id, sequence_id = ctx.sequence_id, attributes = %snapshot),
            }
            Ok(())
        })
    }
}

pub(super) struct SetStage {
    id: String,
    values: Map<String, Value>,
}

pub(super) fn set_stage(config: &StageConfig) -> Result<Arc<dyn Stage>, PipelineError> {
    let values: Map<String, Value> = parse_params(config)?;
    Ok(Arc::new(SetStage {
        id: config.id.clone(),
        values,
    }))
}

impl Stage for SetStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>> {
        Box::pin(async move {
            for (key, value) in &self.values {
                ctx.set(key.clone(), value.clone());
            }
            Ok(())
        })
    }
}

#[derive(Debug, Deserialize)]
struct KeysParams {
    keys: Vec<String>,
}

pub(super) struct RemoveStage {
    id: String,
    keys: Vec<String>,
}

pub(super) fn remove_stage(config: &StageConfig) -> Result<Arc<dyn Stage>, PipelineError> {
    let params: KeysParams = parse_params(config)?;
    Ok(Arc::new(RemoveStage {
        id: config.id.clone(),
        keys: params.keys,
    }))
}

impl Stage for RemoveStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>> {
        Box::pin(async move {
            for key in &self.keys {
                ctx.remove(key);
            }
            Ok(())
        })
    }
}

pub(super) struct RequireStage {
    id: String,
    keys: Vec<String>,
}

pub(super) fn require_stage(config: &StageConfig) -> Result<Arc<dyn Stage>, PipelineError> {
    let params: KeysParams = parse_params(config)?;
    Ok(Arc::new(RequireStage {
        id: config.id.clone(),
        keys: params.keys,
    }))
}

impl Stage for RequireStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>> {
        Box::pin(async move {
            let missing: Vec<&str> = self
                .keys
                .iter()
                .filter(|key| !ctx.contains(key))
                .map(String::as_str)
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(StageFault::new(format!(
                    "missing required attributes: {}",
                    missing.join(", ")
                )))
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct FailParams {
    #[serde(default)]
    message: Option<String>,
    /// Only fault when this attribute is present.
    #[serde(default)]
    when_attribute: Option<String>,
}

pub(super) struct FailStage {
    id: String,
    message: String,
    when_attribute: Option<String>,
}

pub(super) fn fail_stage(config: &StageConfig) -> Result<Arc<dyn Stage>, PipelineError> {
    let params: FailParams = parse_params(config)?;
    Ok(Arc::new(FailStage {
        id: config.id.clone(),
        message: params
            .message
            .unwrap_or_else(|| format!("stage [{}] rejected the message", config.id)),
        when_attribute: params.when_attribute,
    }))
}

impl Stage for FailStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>> {
        Box::pin(async move {
            match &self.when_attribute {
                Some(key) if !ctx.contains(key) => Ok(()),
                _ => Err(StageFault::new(self.message.clone())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stage_config(id: &str, kind: &str, params: Value) -> StageConfig {
        StageConfig {
            id: id.to_string(),
            kind: kind.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn set_then_require_then_remove() {
        let set = set_stage(&stage_config("set", "set", json!({"source": "agent", "n": 1})))
            .expect("set");
        let require = require_stage(&stage_config("req", "require", json!({"keys": ["source"]})))
            .expect("require");
        let remove = remove_stage(&stage_config("rm", "remove", json!({"keys": ["n"]})))
            .expect("remove");

        let mut ctx = ExecutionContext::new(1);
        assert!(require.run(&mut ctx).await.is_err());
        set.run(&mut ctx).await.expect("set");
        require.run(&mut ctx).await.expect("require after set");
        remove.run(&mut ctx).await.expect("remove");

        assert_eq!(ctx.get("source"), Some(&json!("agent")));
        assert!(!ctx.contains("n"));
    }

    #[tokio::test]
    async fn fail_stage_can_be_conditional() {
        let fail = fail_stage(&stage_config(
            "poison",
            "fail",
            json!({"when_attribute": "poison", "message": "poisoned"}),
        ))
        .expect("fail");

        let mut clean = ExecutionContext::new(1);
        assert!(fail.run(&mut clean).await.is_ok());

        let mut poisoned = ExecutionContext::new(2);
        poisoned.set("poison", json!(true));
        assert_eq!(
            fail.run(&mut poisoned).await,
            Err(StageFault::new("poisoned"))
        );
    }

    #[test]
    fn bad_params_name_the_stage() {
        let err = require_stage(&stage_config("req", "require", json!({"keys": "not-a-list"})))
            .err()
            .expect("params must be rejected");
        assert!(matches!(err, PipelineError::InvalidStageParams { stage, .. } if stage == "req"));
    }
}
