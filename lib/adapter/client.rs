use futures::future::BoxFuture;

use super::{AdapterError, BasicAuth, ClientSettings, ClusterHealth, SearchClient};

/// Request shape family a client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiGeneration {
    V8,
    V7,
    V6,
    V5,
    V2,
    /// 0.x/1.x and anything unrecognised.
    Legacy,
}

impl ApiGeneration {
    /// Response filtering arrived with 2.x; older clusters get the full body.
    fn supports_filter_path(self) -> bool {
        !matches!(self, ApiGeneration::Legacy)
    }
}

pub struct HttpSearchClient {
    client: reqwest::Client,
    endpoint: String,
    version: String,
    basic_auth: Option<BasicAuth>,
    generation: ApiGeneration,
}

impl HttpSearchClient {
    pub fn new(settings: ClientSettings, generation: ApiGeneration) -> Self {
        Self {
            client: settings.http,
            endpoint: settings.endpoint,
            version: settings.version,
            basic_auth: settings.basic_auth,
            generation,
        }
    }

    pub fn generation(&self) -> ApiGeneration {
        self.generation
    }

    fn health_url(&self) -> String {
        if self.generation.supports_filter_path() {
            format!(
                "{}/_cluster/health?filter_path=cluster_name,status,number_of_nodes",
                self.endpoint
            )
        } else {
            format!("{}/_cluster/health", self.endpoint)
        }
    }

    async fn fetch_health(&self) -> Result<ClusterHealth, AdapterError> {
        let mut request = self.client.get(self.health_url());
        if let Some(auth) = &self.basic_auth {
            request = request.basic_auth(&auth.username, auth.password.as_ref());
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AdapterError::UnexpectedStatus {
                resource: format!("cluster health at {}", self.endpoint),
                status: response.status().as_u16(),
            });
        }

        let body = response.text().await?;
        serde_json::from_str::<ClusterHealth>(&body).map_err(Into::into)
    }
}

impl SearchClient for HttpSearchClient {
    fn version(&self) -> &str {
        &self.version
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn cluster_health(&self) -> BoxFuture<'_, Result<ClusterHealth, AdapterError>> {
        Box::pin(self.fetch_health())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(generation: ApiGeneration) -> HttpSearchClient {
        HttpSearchClient::new(
            ClientSettings {
                http: reqwest::Client::new(),
                endpoint: "http://a:9200".to_string(),
                version: "x".to_string(),
                basic_auth: None,
            },
            generation,
        )
    }

    #[test]
    fn legacy_clusters_skip_response_filtering() {
        assert_eq!(
            client(ApiGeneration::Legacy).health_url(),
            "http://a:9200/_cluster/health"
        );
        assert!(client(ApiGeneration::V7)
            .health_url()
            .ends_with("?filter_path=cluster_name,status,number_of_nodes"));
    }
}
