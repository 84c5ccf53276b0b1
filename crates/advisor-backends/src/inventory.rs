//! Cluster inventory
//!
//! Resolves the active clusters of an organization. AMS is the primary
//! source. The aggregator-backed inventory knows nothing about display
//! names or managed status, so every cluster is named after its id and
//! treated as unmanaged; it serves as the fallback when AMS fails.

use crate::aggregator::AggregatorApi;
use advisor_core::{ClusterInfo, OrgId, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait ClusterInventory: Send + Sync {
    async fn active_clusters(&self, org: OrgId) -> Result<Vec<ClusterInfo>>;
}

/// Inventory answered from the aggregator's cluster list
pub struct AggregatorInventory {
    aggregator: Arc<dyn AggregatorApi>,
}

impl AggregatorInventory {
    pub fn new(aggregator: Arc<dyn AggregatorApi>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl ClusterInventory for AggregatorInventory {
    async fn active_clusters(&self, org: OrgId) -> Result<Vec<ClusterInfo>> {
        let clusters = self.aggregator.clusters_for_org(org).await?;
        debug!(org_id = %org, clusters = clusters.len(), "active clusters resolved");
        Ok(clusters
            .into_iter()
            .map(|id| ClusterInfo::new(id.as_str(), id.as_str(), false))
            .collect())
    }
}

/// Asks `primary` first and falls back to `secondary` on any error
pub struct FallbackInventory {
    primary: Arc<dyn ClusterInventory>,
    secondary: Arc<dyn ClusterInventory>,
}

impl FallbackInventory {
    pub fn new(primary: Arc<dyn ClusterInventory>, secondary: Arc<dyn ClusterInventory>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl ClusterInventory for FallbackInventory {
    async fn active_clusters(&self, org: OrgId) -> Result<Vec<ClusterInfo>> {
        match self.primary.active_clusters(org).await {
            Ok(clusters) => Ok(clusters),
            Err(err) => {
                warn!(org_id = %org, error = %err, "primary inventory failed, using fallback");
                self.secondary.active_clusters(org).await
            }
        }
    }
}

/// Fixed cluster list, for tests and local runs
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    clusters: Vec<ClusterInfo>,
}

impl StaticInventory {
    pub fn new(clusters: Vec<ClusterInfo>) -> Self {
        Self { clusters }
    }
}

#[async_trait]
impl ClusterInventory for StaticInventory {
    async fn active_clusters(&self, _org: OrgId) -> Result<Vec<ClusterInfo>> {
        Ok(self.clusters.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryAggregator;
    use advisor_core::{AdvisorError, Backend, ClusterReport};

    struct Unreachable;

    #[async_trait]
    impl ClusterInventory for Unreachable {
        async fn active_clusters(&self, _org: OrgId) -> Result<Vec<ClusterInfo>> {
            Err(AdvisorError::ServiceUnavailable(Backend::Ams))
        }
    }

    #[tokio::test]
    async fn test_aggregator_inventory() {
        let agg = InMemoryAggregator::new()
            .with_report("c1", ClusterReport::default())
            .with_report("c2", ClusterReport::default());
        let inventory = AggregatorInventory::new(Arc::new(agg));

        let clusters = inventory.active_clusters(OrgId(1)).await.unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].display_name, "c1");
        assert!(clusters.iter().all(|c| !c.managed));
    }

    #[tokio::test]
    async fn test_fallback_inventory() {
        let managed = StaticInventory::new(vec![ClusterInfo::new("c1", "prod", true)]);
        let agg = InMemoryAggregator::new().with_report("c1", ClusterReport::default());
        let fallback: Arc<dyn ClusterInventory> = Arc::new(AggregatorInventory::new(Arc::new(agg)));

        let healthy = FallbackInventory::new(Arc::new(managed), fallback.clone());
        let clusters = healthy.active_clusters(OrgId(1)).await.unwrap();
        assert_eq!(clusters[0].display_name, "prod");
        assert!(clusters[0].managed);

        let degraded = FallbackInventory::new(Arc::new(Unreachable), fallback);
        let clusters = degraded.active_clusters(OrgId(1)).await.unwrap();
        assert_eq!(clusters[0].display_name, "c1");
        assert!(!clusters[0].managed);
    }
}
