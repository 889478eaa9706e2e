//! Version-dispatched clients for monitored search clusters.
//!
//! A cluster's configured `version` (or the one detected from its root
//! endpoint) picks a client constructor by prefix. Everything above this
//! module talks to the cluster through [`SearchClient`] only.

mod client;
mod probe;

pub use client::{ApiGeneration, HttpSearchClient};
pub use probe::ClusterProbe;

use futures::future::BoxFuture;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::availability::AvailabilityError;

pub const AUTO_VERSION: &str = "auto";

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Unexpected status {status} from {resource}")]
    UnexpectedStatus { resource: String, status: u16 },

    #[error("Unsupported response from {resource}: {detail}")]
    UnsupportedResponse { resource: String, detail: String },

    #[error(transparent)]
    JsonParseError(#[from] serde_json::Error),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    Availability(#[from] AvailabilityError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    AUTO_VERSION.to_string()
}

fn default_probe_interval() -> u64 {
    10
}

/// One monitored cluster from the runtime file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seed hosts, tried in order when picking the active one.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// `"auto"` or empty means: ask the cluster.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

impl ClusterConfig {
    pub fn seed_hosts(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|endpoint| normalize_endpoint(endpoint).to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterHealth {
    pub cluster_name: String,
    pub status: String,
    #[serde(default)]
    pub number_of_nodes: u32,
}

/// What the rest of the process needs from a cluster, whatever its version.
pub trait SearchClient: Send + Sync {
    fn version(&self) -> &str;

    fn endpoint(&self) -> &str;

    fn cluster_health(&self) -> BoxFuture<'_, Result<ClusterHealth, AdapterError>>;

    fn major_version(&self) -> Option<u32> {
        major_version(self.version())
    }
}

impl<T> SearchClient for Arc<T>
where
    T: SearchClient + ?Sized,
{
    fn version(&self) -> &str {
        (**self).version()
    }

    fn endpoint(&self) -> &str {
        (**self).endpoint()
    }

    fn cluster_health(&self) -> BoxFuture<'_, Result<ClusterHealth, AdapterError>> {
        (**self).cluster_health()
    }
}

/// Everything a constructor gets to build a client for one endpoint.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub http: reqwest::Client,
    pub endpoint: String,
    pub version: String,
    pub basic_auth: Option<BasicAuth>,
}

pub type ClientConstructor = Arc<dyn Fn(ClientSettings) -> Arc<dyn SearchClient> + Send + Sync>;

/// Version prefix → client constructor, with a fallback for anything else.
#[derive(Clone)]
pub struct AdapterRegistry {
    http: reqwest::Client,
    prefixes: Vec<(String, ClientConstructor)>,
    fallback: ClientConstructor,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults(reqwest::Client::new())
    }
}

impl AdapterRegistry {
    /// Registry with only a fallback constructor.
    pub fn new(http: reqwest::Client, fallback: ClientConstructor) -> Self {
        Self {
            http,
            prefixes: Vec::new(),
            fallback,
        }
    }

    /// HTTP clients for 8.x, 7.x, 6.x, 5.x and 2.x, plus a fallback for older
    /// or unrecognised versions.
    pub fn with_defaults(http: reqwest::Client) -> Self {
        let mut registry = Self::new(http, generation_constructor(ApiGeneration::Legacy));
        for (prefix, generation) in [
            ("8.", ApiGeneration::V8),
            ("7.", ApiGeneration::V7),
            ("6.", ApiGeneration::V6),
            ("5.", ApiGeneration::V5),
            ("2.", ApiGeneration::V2),
        ] {
            registry.register(prefix, generation_constructor(generation));
        }
        registry
    }

    /// Adds or replaces the constructor for `prefix`. Longer prefixes win.
    pub fn register(&mut self, prefix: &str, constructor: ClientConstructor) {
        self.prefixes.retain(|(existing, _)| existing != prefix);
        self.prefixes.push((prefix.to_string(), constructor));
        self.prefixes
            .sort_by(|(left, _), (right, _)| right.len().cmp(&left.len()));
    }

    pub fn resolve(&self, version: &str) -> &ClientConstructor {
        self.prefixes
            .iter()
            .find(|(prefix, _)| version.starts_with(prefix.as_str()))
            .map(|(_, constructor)| constructor)
            .unwrap_or(&self.fallback)
    }

    pub fn build(
        &self,
        endpoint: &str,
        version: &str,
        basic_auth: Option<BasicAuth>,
    ) -> Arc<dyn SearchClient> {
        let constructor = self.resolve(version);
        constructor(ClientSettings {
            http: self.http.clone(),
            endpoint: normalize_endpoint(endpoint).to_string(),
            version: version.to_string(),
            basic_auth,
        })
    }

    /// Builds a client, detecting the version first when it is `"auto"` or empty.
    pub async fn connect(
        &self,
        endpoint: &str,
        configured_version: &str,
        basic_auth: Option<BasicAuth>,
    ) -> Result<Arc<dyn SearchClient>, AdapterError> {
        let version = if needs_detection(configured_version) {
            let detected = detect_version(&self.http, endpoint, basic_auth.as_ref()).await?;
            debug!(
                event = "cluster_version_detected",
                endpoint = %normalize_endpoint(endpoint),
                version = %detected,
                "Detected cluster version"
            );
            detected
        } else {
            configured_version.to_string()
        };
        Ok(self.build(endpoint, &version, basic_auth))
    }
}

fn generation_constructor(generation: ApiGeneration) -> ClientConstructor {
    Arc::new(move |settings: ClientSettings| -> Arc<dyn SearchClient> {
        Arc::new(HttpSearchClient::new(settings, generation))
    })
}

pub fn needs_detection(version: &str) -> bool {
    let version = version.trim();
    version.is_empty() || version.eq_ignore_ascii_case(AUTO_VERSION)
}

pub fn normalize_endpoint(endpoint: &str) -> &str {
    endpoint.trim_end_matches('/')
}

pub fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

#[derive(Debug, Deserialize)]
struct ClusterInformation {
    version: VersionInfo,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    number: String,
}

/// `GET <endpoint>` and read `version.number` from the body.
pub async fn detect_version(
    http: &reqwest::Client,
    endpoint: &str,
    basic_auth: Option<&BasicAuth>,
) -> Result<String, AdapterError> {
    let url = normalize_endpoint(endpoint);
    let mut request = http.get(url);
    if let Some(auth) = basic_auth {
        request = request.basic_auth(&auth.username, auth.password.as_ref());
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(AdapterError::UnexpectedStatus {
            resource: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let body = response.text().await?;
    let info: ClusterInformation = serde_json::from_str(&body)?;
    if info.version.number.is_empty() {
        return Err(AdapterError::UnsupportedResponse {
            resource: url.to_string(),
            detail: "empty version.number".to_string(),
        });
    }
    Ok(info.version.number)
}
