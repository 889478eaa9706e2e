use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::adapter::ClusterConfig;
use crate::pipeline::PipeConfig;
use crate::queue::QueueConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Failed to read runtime config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse runtime config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid runtime config: {0}")]
    Invalid(String),
}

/// Process-level settings read from the environment.
pub struct Config {
    /// Root directory holding one sub-directory per queue plus file markers.
    pub data_dir: PathBuf,
    /// Path to the JSON runtime file describing queues, pipelines and clusters.
    pub runtime_config_path: PathBuf,
    /// When set, markers (offsets, watermarks) live in Postgres instead of `data_dir`.
    pub database_url: Option<String>,
    pub server_addr: SocketAddr,
    /// Default: 10s
    pub compaction_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let runtime_config_path = env::var("PIPELINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./pipelines.json"));

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        let server_addr = match env::var("SERVER_ADDR") {
            Ok(val) => val.parse::<SocketAddr>().map_err(|_| ConfigError::InvalidValue {
                name: "SERVER_ADDR",
                value: val,
            })?,
            Err(_) => SocketAddr::from(([0, 0, 0, 0], 3000)),
        };

        let compaction_interval = match env::var("COMPACTION_INTERVAL_SECS") {
            Ok(val) => match val.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "COMPACTION_INTERVAL_SECS",
                        value: val,
                    })
                }
            },
            Err(_) => Duration::from_secs(10),
        };

        Ok(Self {
            data_dir,
            runtime_config_path,
            database_url,
            server_addr,
            compaction_interval,
        })
    }
}

/// Everything the driver builds at startup: queues, pipelines and monitored clusters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub pipelines: Vec<PipeConfig>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig =
            serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configs that would start a pipeline against a queue nobody declared.
    fn validate(&self) -> Result<(), ConfigError> {
        for pipe in &self.pipelines {
            if !self.queues.iter().any(|queue| queue.name == pipe.input_queue) {
                return Err(ConfigError::Invalid(format!(
                    "pipeline [{}] reads undeclared queue [{}]",
                    pipe.name, pipe.input_queue
                )));
            }
            pipe.validate()
                .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        }
        let mut names: Vec<&str> = self.queues.iter().map(|q| q.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Invalid(format!(
                "queue [{}] declared twice",
                pair[0]
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, RuntimeConfig};

    const SAMPLE: &str = r#"{
        "queues": [
            {"name": "metrics", "compaction": {"enabled": true, "idle_threshold_segments": 0}}
        ],
        "pipelines": [
            {
                "name": "index_metrics",
                "input_queue": "metrics",
                "concurrency": 4,
                "threshold_ms": 5,
                "stages": [{"id": "tag", "kind": "set", "params": {"source": "agent"}}]
            }
        ],
        "clusters": [
            {"name": "prod", "endpoints": ["http://10.0.0.1:9200/"]}
        ]
    }"#;

    #[test]
    fn parses_runtime_file_with_defaults() {
        let config = RuntimeConfig::from_json_str(SAMPLE).expect("sample should parse");

        let queue = &config.queues[0];
        assert_eq!(queue.max_segment_bytes, 64 * 1024 * 1024);
        assert!(queue.compaction.enabled);
        // Values below 1 fall back to the default threshold.
        assert_eq!(queue.compaction.idle_threshold(), 3);
        assert_eq!(queue.compaction.num_segments_to_prefetch, 0);

        let pipe = &config.pipelines[0];
        assert!(pipe.enabled);
        assert_eq!(pipe.concurrency, 4);
        assert_eq!(pipe.threshold_ms, 5);
        assert_eq!(pipe.stages[0].kind, "set");

        let cluster = &config.clusters[0];
        assert!(cluster.enabled);
        assert_eq!(cluster.version, "auto");
    }

    #[test]
    fn rejects_pipeline_on_undeclared_queue() {
        let raw = r#"{"pipelines": [{"name": "p", "input_queue": "missing", "stages": []}]}"#;
        let err = RuntimeConfig::from_json_str(raw).expect_err("undeclared queue must fail");
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("missing")));
    }

    #[test]
    fn rejects_duplicate_queue_names() {
        let raw = r#"{"queues": [{"name": "a"}, {"name": "a"}]}"#;
        assert!(matches!(
            RuntimeConfig::from_json_str(raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn empty_document_is_valid() {
        let config = RuntimeConfig::from_json_str("{}").expect("empty config is allowed");
        assert!(config.queues.is_empty());
        assert!(config.pipelines.is_empty());
    }
}
