//! Reachability verdicts for monitored clusters and their nodes.

mod conditions;
mod voter;

pub use conditions::{cluster_gate_stage, ClusterAvailable};
pub use voter::{AvailabilityState, AvailabilityVoter, MAX_SILENCE, TICKET_SILENCE, TICKET_THRESHOLD};

use governor::clock::{Clock, DefaultClock};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::error;

use voter::DirectLimiter;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AvailabilityError {
    #[error("Cluster config [{0}] not found")]
    UnknownCluster(String),

    #[error("Cluster [{0}] has no seed hosts")]
    NoSeedHosts(String),
}

struct ClusterEntry<C: Clock> {
    enabled: bool,
    voter: Arc<AvailabilityVoter<C>>,
    /// Throttles the "no host available" error to one line per 10s.
    no_host_log: DirectLimiter<C>,
}

/// Voters for every cluster and node host this process talks to.
///
/// Clusters are registered from config; node hosts get a voter on first use,
/// starting reachable.
pub struct AvailabilityRegistry<C: Clock + Clone = DefaultClock> {
    clock: C,
    clusters: RwLock<HashMap<String, ClusterEntry<C>>>,
    hosts: RwLock<HashMap<String, Arc<AvailabilityVoter<C>>>>,
}

impl Default for AvailabilityRegistry<DefaultClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityRegistry<DefaultClock> {
    pub fn new() -> Self {
        Self::with_clock(DefaultClock::default())
    }
}

impl<C: Clock + Clone> AvailabilityRegistry<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            clusters: RwLock::new(HashMap::new()),
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Adds (or replaces) a cluster. Its voter starts at `healthy`.
    pub fn register_cluster(&self, name: &str, enabled: bool, healthy: bool) {
        let voter = Arc::new(AvailabilityVoter::with_clock(name, self.clock.clone()));
        voter.init(healthy);
        let entry = ClusterEntry {
            enabled,
            voter,
            no_host_log: RateLimiter::direct_with_clock(
                Quota::per_minute(nonzero!(6u32)).allow_burst(nonzero!(1u32)),
                &self.clock,
            ),
        };
        self.clusters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), entry);
    }

    pub fn cluster_voter(&self, name: &str) -> Result<Arc<AvailabilityVoter<C>>, AvailabilityError> {
        self.clusters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .map(|entry| Arc::clone(&entry.voter))
            .ok_or_else(|| AvailabilityError::UnknownCluster(name.to_string()))
    }

    /// A disabled cluster is never available.
    pub fn is_cluster_available(&self, name: &str) -> Result<bool, AvailabilityError> {
        let clusters = self
            .clusters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = clusters
            .get(name)
            .ok_or_else(|| AvailabilityError::UnknownCluster(name.to_string()))?;
        Ok(entry.enabled && entry.voter.is_available())
    }

    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .clusters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    pub fn host_voter(&self, host: &str) -> Arc<AvailabilityVoter<C>> {
        if let Some(voter) = self
            .hosts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(host)
        {
            return Arc::clone(voter);
        }
        let mut hosts = self
            .hosts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(AvailabilityVoter::with_clock(host, self.clock.clone()))),
        )
    }

    pub fn is_host_available(&self, host: &str) -> bool {
        self.host_voter(host).is_available()
    }

    /// First available seed host. When none is, falls back to the first seed
    /// host and votes a failure against the cluster.
    pub fn select_active_host(
        &self,
        cluster: &str,
        seed_hosts: &[String],
    ) -> Result<String, AvailabilityError> {
        if let Some(host) = seed_hosts.iter().find(|host| self.is_host_available(host)) {
            return Ok(host.clone());
        }
        let first = seed_hosts
            .first()
            .ok_or_else(|| AvailabilityError::NoSeedHosts(cluster.to_string()))?;

        let voter = {
            let clusters = self
                .clusters
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let entry = clusters
                .get(cluster)
                .ok_or_else(|| AvailabilityError::UnknownCluster(cluster.to_string()))?;
            if entry.no_host_log.check().is_ok() {
                error!(
                    event = "no_host_available",
                    cluster = %cluster,
                    fallback = %first,
                    "No host available; choosing the first one"
                );
            }
            Arc::clone(&entry.voter)
        };
        voter.report_failure();
        Ok(first.clone())
    }
}
