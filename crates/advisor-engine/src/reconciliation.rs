//! Reconciliation Engine
//!
//! Merges raw rule hits with override state and static rule content into
//! the customer-facing views. The engine holds no state between calls; the
//! override indices are passed in per request.
//!
//! Missing content for a rule is an ordinary outcome: the hit is counted in
//! `no_content` (reports) or skipped (aggregated views). A content directory
//! timeout aborts the whole view.

use advisor_core::{
    AdvisorError, ClusterInfo, ClusterName, ClusterRecommendations, ClusterReport,
    CompositeRuleId, ContentLookupError, DisabledClusterInfo, HittingCluster, RuleContent,
    RuleContentIndex, RuleHit,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::overrides::Overrides;
use crate::params::{ImpactingFlag, ReportOptions};
use crate::views::{
    ClusterListView, ClustersDetail, OrgOverview, RecommendationContentView,
    RecommendationView, ReportView, ReportViewMeta, RuleView,
};
use crate::visibility::{is_visible, suppression, HitSubject, Suppression};

pub type Result<T> = std::result::Result<T, AdvisorError>;

/// Rule hits per impacting rule, as listed by the aggregator
pub type ImpactedClusters = HashMap<CompositeRuleId, Vec<ClusterName>>;

/// Builds every reconciled view over an injected content index
#[derive(Clone)]
pub struct ReconciliationEngine {
    content: Arc<dyn RuleContentIndex>,
}

impl ReconciliationEngine {
    pub fn new(content: Arc<dyn RuleContentIndex>) -> Self {
        Self { content }
    }

    pub fn content(&self) -> &Arc<dyn RuleContentIndex> {
        &self.content
    }

    /// Content lookup where a miss is `None` and a timeout is fatal
    fn lookup(&self, id: &CompositeRuleId) -> Result<Option<Arc<RuleContent>>> {
        match self.content.get_content(id) {
            Ok(content) => Ok(Some(content)),
            Err(ContentLookupError::NotFound(_)) => Ok(None),
            Err(ContentLookupError::DirectoryTimeout) => {
                error!(rule = %id, "content directory timed out, aborting view");
                Err(AdvisorError::ContentDirectoryTimeout)
            }
        }
    }

    fn hit_rule_id(cluster: &ClusterName, hit: &RuleHit) -> Option<CompositeRuleId> {
        match hit.composite_rule_id() {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(cluster = %cluster, module = %hit.module, error = %err, "skipping hit with malformed rule id");
                None
            }
        }
    }

    // ====================================================================
    // Single cluster
    // ====================================================================

    /// Filtered report of one cluster
    pub fn report(
        &self,
        cluster: &ClusterName,
        report: &ClusterReport,
        overrides: &Overrides,
        options: ReportOptions,
    ) -> Result<ReportView> {
        let mut data = Vec::new();
        let mut no_content = 0;

        for hit in &report.hits {
            let Some(rule) = Self::hit_rule_id(cluster, hit) else {
                no_content += 1;
                continue;
            };
            let Some(content) = self.lookup(&rule)? else {
                debug!(cluster = %cluster, rule = %rule, "rule content missing, hit left out");
                no_content += 1;
                continue;
            };

            let subject = HitSubject {
                cluster,
                managed: options.managed,
                rule: &rule,
                report_disabled: hit.disabled,
            };
            let reason = suppression(subject, Some(&content), overrides);
            if !is_visible(subject, Some(&content), overrides, options.include_disabled) {
                continue;
            }
            data.push(RuleView::from_hit(hit, &content, reason.is_some()));
        }

        if data.is_empty() && no_content > 0 {
            warn!(cluster = %cluster, no_content, "every hit of the report lacks content");
        }

        Ok(ReportView {
            meta: ReportViewMeta {
                last_checked_at: report.meta.last_checked_at.clone(),
                count: data.len(),
                no_content,
                cluster_version: report.meta.cluster_version.clone(),
            },
            data,
        })
    }

    /// One rule hit of a cluster with its content
    pub fn rule_detail(
        &self,
        cluster: &ClusterName,
        managed: bool,
        hit: &RuleHit,
        overrides: &Overrides,
    ) -> Result<RuleView> {
        let rule = hit.composite_rule_id()?;
        let content = self.lookup(&rule)?.ok_or(AdvisorError::RuleNotFound)?;

        let subject = HitSubject {
            cluster,
            managed,
            rule: &rule,
            report_disabled: hit.disabled,
        };
        match suppression(subject, Some(&content), overrides) {
            Some(Suppression::ManagedIneligible) => Err(AdvisorError::RuleNotFound),
            reason => Ok(RuleView::from_hit(hit, &content, reason.is_some())),
        }
    }

    // ====================================================================
    // Organization wide
    // ====================================================================

    /// Recommendation list with impacted cluster counts
    pub fn recommendations(
        &self,
        clusters: &[ClusterInfo],
        impacting: &ImpactedClusters,
        flag: ImpactingFlag,
        overrides: &Overrides,
    ) -> Result<Vec<RecommendationView>> {
        let managed: HashMap<&ClusterName, bool> =
            clusters.iter().map(|c| (&c.id, c.managed)).collect();

        let rule_ids = match flag {
            ImpactingFlag::OnlyImpacting => {
                let mut ids: Vec<CompositeRuleId> = impacting
                    .iter()
                    .filter(|(_, hit)| !hit.is_empty())
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.sort();
                ids
            }
            _ => self.content.external_rule_ids()?,
        };

        let mut list = Vec::with_capacity(rule_ids.len());
        for rule in rule_ids {
            let hit_clusters = impacting.get(&rule).map(Vec::as_slice).unwrap_or(&[]);
            if flag == ImpactingFlag::ExcludingImpacting && !hit_clusters.is_empty() {
                continue;
            }

            let Some(content) = self.lookup(&rule)? else {
                warn!(rule = %rule, "rule content missing, recommendation left out");
                continue;
            };
            if content.internal {
                continue;
            }

            let acknowledged = overrides.acks.contains(&rule);
            let impacted = hit_clusters
                .iter()
                .filter(|&cluster| {
                    let subject = HitSubject {
                        cluster,
                        managed: managed.get(cluster).copied().unwrap_or(false),
                        rule: &rule,
                        report_disabled: false,
                    };
                    suppression(subject, Some(&content), overrides).is_none()
                })
                .count();

            let mut view = RecommendationView::new(rule, &content);
            view.disabled = acknowledged;
            view.impacted_clusters_count = impacted as u32;
            list.push(view);
        }

        debug!(recommendations = list.len(), "recommendation list built");
        Ok(list)
    }

    /// Per-cluster hit counts by total risk
    pub fn cluster_list(
        &self,
        clusters: &[ClusterInfo],
        recommendations: &HashMap<ClusterName, ClusterRecommendations>,
        overrides: &Overrides,
    ) -> Result<Vec<ClusterListView>> {
        let (severities, unique) = self.content.get_severities()?;

        let mut views = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let mut view = ClusterListView {
                cluster_id: cluster.id.clone(),
                cluster_name: cluster.display_name.clone(),
                managed: cluster.managed,
                last_checked_at: String::new(),
                cluster_version: String::new(),
                total_hit_count: 0,
                hits_by_total_risk: unique.iter().map(|s| (*s, 0)).collect(),
            };

            if let Some(hits) = recommendations.get(&cluster.id) {
                view.last_checked_at = hits.created_at.clone();
                view.cluster_version = hits.meta.cluster_version.clone().unwrap_or_default();

                for rule in &hits.recommendations {
                    let Some(severity) = severities.get(rule) else {
                        debug!(cluster = %cluster.id, rule = %rule, "no severity for rule, skipping");
                        continue;
                    };
                    let content = self.lookup(rule)?;
                    let subject = HitSubject {
                        cluster: &cluster.id,
                        managed: cluster.managed,
                        rule,
                        report_disabled: false,
                    };
                    if is_visible(subject, content.as_deref(), overrides, false) {
                        *view.hits_by_total_risk.entry(*severity).or_insert(0) += 1;
                        view.total_hit_count += 1;
                    }
                }
            }
            views.push(view);
        }
        Ok(views)
    }

    /// Counts of clusters hit by severity and by tag.
    ///
    /// A cluster is hit when at least one of its rules stays visible; the
    /// counters grow once per visible rule of each hit cluster.
    pub fn org_overview(
        &self,
        clusters: &[ClusterInfo],
        reports: &HashMap<ClusterName, ClusterReport>,
        overrides: &Overrides,
    ) -> Result<OrgOverview> {
        let mut overview = OrgOverview::default();

        for cluster in clusters {
            let Some(report) = reports.get(&cluster.id) else {
                continue;
            };

            let mut visible = Vec::new();
            for hit in &report.hits {
                let Some(rule) = Self::hit_rule_id(&cluster.id, hit) else {
                    continue;
                };
                let Some(content) = self.lookup(&rule)? else {
                    continue;
                };
                let subject = HitSubject {
                    cluster: &cluster.id,
                    managed: cluster.managed,
                    rule: &rule,
                    report_disabled: hit.disabled,
                };
                if is_visible(subject, Some(&content), overrides, false) {
                    visible.push(content);
                }
            }

            if visible.is_empty() {
                continue;
            }
            overview.clusters_hit += 1;
            for content in visible {
                *overview.hit_by_risk.entry(content.total_risk).or_insert(0) += 1;
                for tag in &content.tags {
                    *overview.hit_by_tag.entry(tag.clone()).or_insert(0) += 1;
                }
            }
        }
        Ok(overview)
    }

    /// Impacted clusters of one rule split into enabled and disabled
    pub fn clusters_detail(
        &self,
        rule: &CompositeRuleId,
        clusters: &[ClusterInfo],
        impacted: Vec<HittingCluster>,
        disabled: Vec<DisabledClusterInfo>,
    ) -> Result<ClustersDetail> {
        let content = self.content.get_content(rule)?;

        let active: HashMap<&ClusterName, &ClusterInfo> = clusters
            .iter()
            .filter(|c| !c.managed || content.managed_cluster_eligible)
            .map(|c| (&c.id, c))
            .collect();

        let mut detail = ClustersDetail::default();
        let mut disabled_ids = HashSet::new();
        for mut entry in disabled {
            if let Some(info) = active.get(&entry.cluster_id) {
                entry.cluster_name = info.display_name.clone();
                disabled_ids.insert(entry.cluster_id.clone());
                detail.disabled.push(entry);
            }
        }

        for mut entry in impacted {
            if disabled_ids.contains(&entry.cluster) {
                continue;
            }
            if let Some(info) = active.get(&entry.cluster) {
                entry.cluster_name = info.display_name.clone();
                detail.enabled.push(entry);
            }
        }
        Ok(detail)
    }

    /// Rule content with the acknowledgement state of the caller's org
    pub fn content_with_user_data(
        &self,
        rule: &CompositeRuleId,
        acknowledged: bool,
    ) -> Result<RecommendationContentView> {
        let content = self.content.get_content(rule)?;
        Ok(RecommendationContentView::new(&content, acknowledged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::{AckIndex, DisabledClusterIndex};
    use advisor_core::{ContentDirectory, ErrorKind, ReportMeta};

    const FOO: &str = "ccx_rules_ocp.external.rules.foo|FOO";
    const BAR: &str = "ccx_rules_ocp.external.rules.bar|BAR";
    const BAZ: &str = "ccx_rules_ocp.external.rules.baz|BAZ";

    fn rule(selector: &str) -> CompositeRuleId {
        CompositeRuleId::parse(selector).unwrap()
    }

    fn content(selector: &str, risk: u8) -> RuleContent {
        let id = rule(selector);
        RuleContent::new(id.rule_id.as_str(), id.error_key.as_str(), risk)
    }

    fn hit(selector: &str) -> RuleHit {
        let id = rule(selector);
        RuleHit::new(format!("{}.report", id.rule_id), id.error_key.as_str())
    }

    fn engine(rules: Vec<RuleContent>) -> ReconciliationEngine {
        ReconciliationEngine::new(Arc::new(ContentDirectory::with_rules(rules)))
    }

    fn report(hits: Vec<RuleHit>) -> ClusterReport {
        ClusterReport {
            meta: ReportMeta {
                last_checked_at: "2024-01-01T00:00:00Z".into(),
                count: hits.len(),
                cluster_version: None,
            },
            hits,
        }
    }

    fn acked(selector: &str) -> Overrides {
        Overrides::new(
            std::iter::once(rule(selector)).collect::<AckIndex>(),
            DisabledClusterIndex::new(),
        )
    }

    #[test]
    fn test_report_without_any_content_counts_zero() {
        let engine = engine(vec![]);
        let cluster = ClusterName::new("c1");
        let view = engine
            .report(
                &cluster,
                &report(vec![hit(FOO), hit(BAR), hit(BAZ)]),
                &Overrides::default(),
                ReportOptions::default(),
            )
            .unwrap();

        assert_eq!(view.meta.count, 0);
        assert_eq!(view.meta.no_content, 3);
        assert!(view.data.is_empty());
    }

    #[test]
    fn test_report_counts_visible_rules_only() {
        let engine = engine(vec![content(FOO, 2)]);
        let cluster = ClusterName::new("c1");
        let view = engine
            .report(
                &cluster,
                &report(vec![hit(FOO), hit(BAR), hit(BAZ)]),
                &Overrides::default(),
                ReportOptions::default(),
            )
            .unwrap();

        assert_eq!(view.meta.count, 1);
        assert_eq!(view.meta.no_content, 2);
        assert_eq!(view.data[0].composite_rule_id(), FOO);
        assert!(!view.data[0].disabled);
    }

    #[test]
    fn test_report_get_disabled_brings_back_overrides() {
        let engine = engine(vec![content(FOO, 2), content(BAR, 3)]);
        let cluster = ClusterName::new("c1");
        let raw = report(vec![hit(FOO), hit(BAR).disabled()]);
        let overrides = acked(FOO);

        let hidden = engine
            .report(&cluster, &raw, &overrides, ReportOptions::default())
            .unwrap();
        assert_eq!(hidden.meta.count, 0);

        let shown = engine
            .report(
                &cluster,
                &raw,
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

    #[test]
    fn test_managed_report_hides_ineligible_rules() {
        let engine = engine(vec![content(FOO, 2), content(BAR, 2).managed_eligible(true)]);
        let cluster = ClusterName::new("c1");
        let raw = report(vec![hit(FOO), hit(BAR)]);

        for include_disabled in [false, true] {
            let view = engine
                .report(
                    &cluster,
                    &raw,
                    &Overrides::default(),
                    ReportOptions {
                        include_disabled,
                        managed: true,
                    },
                )
                .unwrap();
            assert_eq!(view.meta.count, 1);
            assert_eq!(view.data[0].composite_rule_id(), BAR);
        }
    }

    #[test]
    fn test_timeout_aborts_views() {
        let engine = ReconciliationEngine::new(Arc::new(ContentDirectory::new()));
        let cluster = ClusterName::new("c1");

        let err = engine
            .report(
                &cluster,
                &report(vec![hit(FOO)]),
                &Overrides::default(),
                ReportOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);

        let err = engine
            .cluster_list(&[], &HashMap::new(), &Overrides::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    }

    #[test]
    fn test_rule_detail() {
        let engine = engine(vec![content(FOO, 2)]);
        let cluster = ClusterName::new("c1");

        let view = engine
            .rule_detail(&cluster, false, &hit(FOO), &acked(FOO))
            .unwrap();
        assert!(view.disabled);

        let err = engine
            .rule_detail(&cluster, false, &hit(BAR), &Overrides::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "Rule was not found");

        let err = engine
            .rule_detail(&cluster, true, &hit(FOO), &Overrides::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_recommendations_impacted_counts() {
        let engine = engine(vec![
            content(FOO, 2),
            content(BAR, 3).managed_eligible(true),
            content(BAZ, 1),
        ]);
        let clusters = vec![
            ClusterInfo::new("c1", "one", false),
            ClusterInfo::new("c2", "two", true),
            ClusterInfo::new("c3", "three", false),
        ];
        let mut impacting = ImpactedClusters::new();
        impacting.insert(
            rule(FOO),
            vec!["c1".into(), "c2".into(), "c3".into()],
        );
        impacting.insert(rule(BAR), vec!["c1".into(), "c2".into()]);

        let mut disabled = DisabledClusterIndex::new();
        disabled.insert("c3".into(), rule(FOO));
        let overrides = Overrides::new(AckIndex::new(), disabled);

        let all = engine
            .recommendations(&clusters, &impacting, ImpactingFlag::All, &overrides)
            .unwrap();
        let count = |list: &[RecommendationView], selector: &str| {
            list.iter()
                .find(|r| r.rule_id == rule(selector))
                .map(|r| r.impacted_clusters_count)
        };
        assert_eq!(all.len(), 3);
        // c2 is managed and FOO is not eligible, c3 disabled FOO
        assert_eq!(count(&all, FOO), Some(1));
        assert_eq!(count(&all, BAR), Some(2));
        assert_eq!(count(&all, BAZ), Some(0));

        let only = engine
            .recommendations(&clusters, &impacting, ImpactingFlag::OnlyImpacting, &overrides)
            .unwrap();
        assert_eq!(only.len(), 2);

        let none = engine
            .recommendations(
                &clusters,
                &impacting,
                ImpactingFlag::ExcludingImpacting,
                &overrides,
            )
            .unwrap();
        assert_eq!(none.len(), 1);
        assert_eq!(none[0].rule_id, rule(BAZ));
    }

    #[test]
    fn test_acknowledged_recommendation() {
        let engine = engine(vec![content(FOO, 2)]);
        let clusters = vec![ClusterInfo::new("c1", "one", false)];
        let mut impacting = ImpactedClusters::new();
        impacting.insert(rule(FOO), vec!["c1".into()]);

        let list = engine
            .recommendations(&clusters, &impacting, ImpactingFlag::All, &acked(FOO))
            .unwrap();
        assert!(list[0].disabled);
        assert_eq!(list[0].impacted_clusters_count, 0);
    }

    #[test]
    fn test_cluster_list_zero_fills_severities() {
        let engine = engine(vec![content(FOO, 2), content(BAR, 4), content(BAZ, 1)]);
        let clusters = vec![
            ClusterInfo::new("c1", "one", false),
            ClusterInfo::new("c2", "two", false),
        ];
        let mut recommendations = HashMap::new();
        recommendations.insert(
            ClusterName::new("c1"),
            ClusterRecommendations {
                created_at: "2024-01-01T00:00:00Z".into(),
                meta: ReportMeta {
                    cluster_version: Some("4.14".into()),
                    ..ReportMeta::default()
                },
                recommendations: vec![rule(FOO), rule(BAR)],
            },
        );

        let views = engine
            .cluster_list(&clusters, &recommendations, &acked(BAR))
            .unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].total_hit_count, 1);
        assert_eq!(views[0].hits_by_total_risk.get(&2), Some(&1));
        assert_eq!(views[0].hits_by_total_risk.get(&4), Some(&0));
        assert_eq!(views[0].cluster_version, "4.14");
        assert_eq!(views[1].total_hit_count, 0);
        assert_eq!(views[1].hits_by_total_risk.len(), 3);
    }

    #[test]
    fn test_org_overview_counts_pairs() {
        let engine = engine(vec![
            content(FOO, 2).with_tags(&["security"]),
            content(BAR, 2).with_tags(&["security", "performance"]),
        ]);
        let clusters = vec![
            ClusterInfo::new("c1", "one", false),
            ClusterInfo::new("c2", "two", false),
            ClusterInfo::new("c3", "three", false),
        ];
        let mut reports = HashMap::new();
        reports.insert(ClusterName::new("c1"), report(vec![hit(FOO), hit(BAR)]));
        reports.insert(ClusterName::new("c2"), report(vec![hit(FOO).disabled()]));
        reports.insert(ClusterName::new("c3"), report(vec![hit(BAR)]));

        let overview = engine
            .org_overview(&clusters, &reports, &Overrides::default())
            .unwrap();
        assert_eq!(overview.clusters_hit, 2);
        assert_eq!(overview.hit_by_risk.get(&2), Some(&3));
        assert_eq!(overview.hit_by_tag.get("security"), Some(&3));
        assert_eq!(overview.hit_by_tag.get("performance"), Some(&2));
    }

    #[test]
    fn test_clusters_detail_split() {
        let engine = engine(vec![content(FOO, 2)]);
        let clusters = vec![
            ClusterInfo::new("c1", "one", false),
            ClusterInfo::new("c2", "two", false),
            ClusterInfo::new("c3", "managed", true),
        ];
        let impacted = vec![
            HittingCluster::new("c1"),
            HittingCluster::new("c2"),
            HittingCluster::new("c3"),
        ];
        let disabled = vec![DisabledClusterInfo::new("c2"), DisabledClusterInfo::new("gone")];

        let detail = engine
            .clusters_detail(&rule(FOO), &clusters, impacted, disabled)
            .unwrap();
        assert_eq!(detail.enabled.len(), 1);
        assert_eq!(detail.enabled[0].cluster_name, "one");
        assert_eq!(detail.disabled.len(), 1);
        assert_eq!(detail.disabled[0].cluster_name, "two");

        let err = engine
            .clusters_detail(&rule(BAR), &clusters, vec![], vec![])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_content_with_user_data() {
        let engine = engine(vec![content(FOO, 3).with_description("foo happened")]);
        let view = engine.content_with_user_data(&rule(FOO), true).unwrap();
        assert!(view.disabled);
        assert_eq!(view.description, "foo happened");
        assert_eq!(view.total_risk, 3);
    }
}
