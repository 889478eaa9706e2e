use governor::clock::{Clock, DefaultClock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AdapterError, AdapterRegistry, ClusterConfig, ClusterHealth, SearchClient};
use crate::availability::{AvailabilityRegistry, AvailabilityVoter};
use crate::logging::format_error_report;

/// Periodic health check of one cluster, feeding its host and cluster voters.
pub struct ClusterProbe<C: Clock + Clone = DefaultClock> {
    config: ClusterConfig,
    seed_hosts: Vec<String>,
    adapters: Arc<AdapterRegistry>,
    availability: Arc<AvailabilityRegistry<C>>,
    /// Clients per host, built once the host's version is known.
    clients: Mutex<HashMap<String, Arc<dyn SearchClient>>>,
}

impl<C> ClusterProbe<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    pub fn new(
        config: ClusterConfig,
        adapters: Arc<AdapterRegistry>,
        availability: Arc<AvailabilityRegistry<C>>,
    ) -> Self {
        Self {
            seed_hosts: config.seed_hosts(),
            config,
            adapters,
            availability,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// One health check against the active host. Any error counts as a
    /// failure vote for both the host and the cluster.
    ///
    /// Seed hosts currently marked down are rechecked as well, feeding only
    /// their own voters, so they can come back while another host is active.
    pub async fn probe_once(&self) -> Result<ClusterHealth, AdapterError> {
        let host = self
            .availability
            .select_active_host(&self.config.name, &self.seed_hosts)?;
        let cluster_voter = self.availability.cluster_voter(&self.config.name)?;
        let host_voter = self.availability.host_voter(&host);

        let result = self.check_active(&host, &host_voter, &cluster_voter).await;
        self.recheck_down_hosts(&host).await;
        result
    }

    async fn check_active(
        &self,
        host: &str,
        host_voter: &AvailabilityVoter<C>,
        cluster_voter: &AvailabilityVoter<C>,
    ) -> Result<ClusterHealth, AdapterError> {
        match self.check(host).await {
            Ok(health) => {
                host_voter.report_success();
                cluster_voter.report_success();
                debug!(
                    event = "cluster_probe_ok",
                    cluster = %self.config.name,
                    host = %host,
                    status = %health.status,
                    nodes = health.number_of_nodes,
                    "Cluster probe succeeded"
                );
                Ok(health)
            }
            Err(err) => {
                host_voter.report_failure();
                cluster_voter.report_failure();
                // Re-detect the version next time; the host may have been upgraded.
                self.clients.lock().await.remove(host);
                Err(err)
            }
        }
    }

    async fn recheck_down_hosts(&self, active: &str) {
        for host in &self.seed_hosts {
            if host == active || self.availability.is_host_available(host) {
                continue;
            }
            let voter = self.availability.host_voter(host);
            match self.check(host).await {
                Ok(_) => {
                    voter.report_success();
                    debug!(
                        event = "host_recheck_ok",
                        cluster = %self.config.name,
                        host = %host,
                        available = voter.is_available(),
                        "Down host answered a health check"
                    );
                }
                Err(err) => {
                    voter.report_failure();
                    self.clients.lock().await.remove(host);
                    debug!(
                        event = "host_recheck_failed",
                        cluster = %self.config.name,
                        host = %host,
                        error = %err,
                        "Down host is still failing"
                    );
                }
            }
        }
    }

    async fn check(&self, host: &str) -> Result<ClusterHealth, AdapterError> {
        let client = self.client_for(host).await?;
        client.cluster_health().await
    }

    async fn client_for(&self, host: &str) -> Result<Arc<dyn SearchClient>, AdapterError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(host) {
            return Ok(Arc::clone(client));
        }
        let client = self
            .adapters
            .connect(host, &self.config.version, self.config.basic_auth.clone())
            .await?;
        clients.insert(host.to_string(), Arc::clone(&client));
        Ok(client)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.probe_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            event = "cluster_probe_started",
            cluster = %self.config.name,
            interval_secs = interval.as_secs(),
            "Cluster probe started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(event = "cluster_probe_stopped", cluster = %self.config.name, "Cluster probe stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.probe_once().await {
                        warn!(
                            event = "cluster_probe_failed",
                            cluster = %self.config.name,
                            error = %err,
                            error_report = %format_error_report(&err),
                            "Cluster probe failed"
                        );
                    }
                }
            }
        }
    }
}
