//! Per-cluster disable index builder and override loading

use crate::acks::AckStore;
use crate::aggregator::AggregatorApi;
use advisor_core::{ClusterName, OrgId, Result};
use advisor_engine::{DisabledClusterIndex, Overrides};
use tracing::debug;

/// Fetch per-cluster disables for `clusters` and fold them into an index.
/// A 404 from the aggregator means no disables.
pub async fn build_disabled_cluster_index(
    aggregator: &dyn AggregatorApi,
    org: OrgId,
    clusters: &[ClusterName],
) -> Result<DisabledClusterIndex> {
    if clusters.is_empty() {
        return Ok(DisabledClusterIndex::new());
    }
    match aggregator.disabled_rules_for_clusters(org, clusters).await? {
        Some(records) => {
            let index = DisabledClusterIndex::from_records(&records);
            debug!(
                org_id = %org,
                records = records.len(),
                clusters = index.cluster_count(),
                "per-cluster disables fetched"
            );
            Ok(index)
        }
        None => {
            debug!(org_id = %org, "no per-cluster disables");
            Ok(DisabledClusterIndex::new())
        }
    }
}

/// Both override indices for one request. The two fetches are independent
/// and joined before reconciliation runs.
pub async fn load_overrides(
    acks: &AckStore,
    aggregator: &dyn AggregatorApi,
    org: OrgId,
    clusters: &[ClusterName],
) -> Result<Overrides> {
    let (ack_index, disabled) = tokio::try_join!(
        acks.index(org),
        build_disabled_cluster_index(aggregator, org, clusters)
    )?;
    Ok(Overrides::new(ack_index, disabled))
}
