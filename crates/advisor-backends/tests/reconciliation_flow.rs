//! Integration tests: aggregator records through overrides into views
//!
//! Drives the in-memory aggregator the same way the gateway handlers do:
//! acknowledgements and per-cluster disables are loaded together, then the
//! reconciliation engine filters a report read from a fixture file.

use advisor_backends::{load_overrides, AckStore, AggregatorApi, AggregatorCall, InMemoryAggregator};
use advisor_core::{
    ClusterName, ClusterReport, ClusterRuleDisable, CompositeRuleId, ContentDirectory, OrgId,
    RuleContent, UserId,
};
use advisor_engine::{ReconciliationEngine, ReportOptions};
use std::path::PathBuf;
use std::sync::Arc;

const CLUSTER: &str = "34c3ecc5-624a-49a5-bab8-4fdc5e51a266";
const KUBELET: &str = "ccx_rules_ocp.external.rules.nodes_kubelet_version_check|NODE_KUBELET_VERSION";
const REGISTRY: &str =
    "ccx_rules_ocp.external.rules.image_registry_pv_not_bound|IMAGE_REGISTRY_PV_NOT_BOUND";

fn fixture_report() -> ClusterReport {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("cluster_report.json");
    let raw = std::fs::read_to_string(&path).unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn content() -> Arc<ContentDirectory> {
    Arc::new(ContentDirectory::with_rules(vec![
        RuleContent::new(
            "ccx_rules_ocp.external.rules.nodes_kubelet_version_check",
            "NODE_KUBELET_VERSION",
            2,
        )
        .with_description("Kubelet version differs from the control plane"),
        RuleContent::new(
            "ccx_rules_ocp.external.rules.image_registry_pv_not_bound",
            "IMAGE_REGISTRY_PV_NOT_BOUND",
            3,
        ),
    ]))
}

fn rule(selector: &str) -> CompositeRuleId {
    CompositeRuleId::parse(selector).unwrap()
}

// ============================================================================
// Fixture Parsing
// ============================================================================

#[test]
fn test_fixture_report_parses() {
    let report = fixture_report();
    assert_eq!(report.meta.count, 3);
    assert_eq!(report.meta.cluster_version.as_deref(), Some("4.14.2"));
    assert_eq!(report.hits.len(), 3);
    assert_eq!(report.hits[0].composite_rule_id().unwrap(), rule(KUBELET));
}

// ============================================================================
// Report Reconciliation
// ============================================================================

#[tokio::test]
async fn test_report_without_overrides() {
    let org = OrgId(1);
    let cluster = ClusterName::new(CLUSTER);
    let aggregator = Arc::new(InMemoryAggregator::new().with_report(CLUSTER, fixture_report()));
    let acks = AckStore::new(aggregator.clone());

    let report = aggregator
        .cluster_report(org, &UserId::new("user"), &cluster)
        .await
        .unwrap();
    let overrides = load_overrides(&acks, aggregator.as_ref(), org, &[cluster.clone()])
        .await
        .unwrap();

    let engine = ReconciliationEngine::new(content());
    let view = engine
        .report(&cluster, &report, &overrides, ReportOptions::default())
        .unwrap();

    assert_eq!(view.meta.count, 2);
    assert_eq!(view.meta.no_content, 1);
    assert!(view.data.iter().all(|r| !r.disabled));
}

#[tokio::test]
async fn test_acknowledged_and_disabled_rules_hidden() {
    let org = OrgId(1);
    let cluster = ClusterName::new(CLUSTER);
    let aggregator = Arc::new(
        InMemoryAggregator::new()
            .with_report(CLUSTER, fixture_report())
            .with_cluster_disable(ClusterRuleDisable {
                cluster_id: cluster.clone(),
                rule_id: "ccx_rules_ocp.external.rules.image_registry_pv_not_bound".into(),
                error_key: "IMAGE_REGISTRY_PV_NOT_BOUND".into(),
                justification: Some("known".into()),
                disabled_at: None,
            }),
    );
    let acks = AckStore::new(aggregator.clone());
    acks.acknowledge(org, &UserId::new("user"), KUBELET, "not relevant")
        .await
        .unwrap();

    let report = fixture_report();
    let overrides = load_overrides(&acks, aggregator.as_ref(), org, &[cluster.clone()])
        .await
        .unwrap();
    let engine = ReconciliationEngine::new(content());

    let hidden = engine
        .report(&cluster, &report, &overrides, ReportOptions::default())
        .unwrap();
    assert_eq!(hidden.meta.count, 0);

    let shown = engine
        .report(
            &cluster,
            &report,
            &overrides,
            ReportOptions {
                include_disabled: true,
                managed: false,
            },
        )
        .unwrap();
    assert_eq!(shown.meta.count, 2);
    assert!(shown.data.iter().all(|r| r.disabled));
}

// ============================================================================
// Backend Traffic
// ============================================================================

#[tokio::test]
async fn test_overrides_fetched_once_each() {
    let org = OrgId(7);
    let aggregator = Arc::new(InMemoryAggregator::new());
    let acks = AckStore::new(aggregator.clone());

    load_overrides(&acks, aggregator.as_ref(), org, &[ClusterName::new(CLUSTER)])
        .await
        .unwrap();

    assert_eq!(aggregator.count_calls(|c| *c == AggregatorCall::ListAcks), 1);
    assert_eq!(aggregator.count_calls(|c| *c == AggregatorCall::DisabledRules), 1);
}

#[tokio::test]
async fn test_unavailable_aggregator_fails_overrides() {
    let aggregator = Arc::new(InMemoryAggregator::new());
    aggregator.set_unavailable(true);
    let acks = AckStore::new(aggregator.clone());

    let result = load_overrides(&acks, aggregator.as_ref(), OrgId(1), &[]).await;
    assert!(result.is_err());
    assert!(acks.is_acknowledged(OrgId(1), &rule(REGISTRY)).await.is_err());
}
