//! In-memory aggregator
//!
//! Keeps acknowledgements, disables and hits in process and records every
//! call it receives. Used by tests and for running the gateway without an
//! aggregator.

use crate::aggregator::AggregatorApi;
use advisor_core::{
    AdvisorError, Backend, ClusterName, ClusterRecommendations, ClusterReport,
    ClusterRuleDisable, CompositeRuleId, DisabledClusterInfo, HittingCluster, OrgId, Result,
    SystemWideRuleDisable, UserId,
};
use advisor_engine::ImpactedClusters;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// One recorded aggregator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorCall {
    ListAcks,
    ReadAck(CompositeRuleId),
    CreateAck(CompositeRuleId),
    UpdateAck(CompositeRuleId),
    DeleteAck(CompositeRuleId),
    DisabledRules,
    ClustersForOrg,
    ClusterReport(ClusterName),
    Reports,
    Recommendations,
    ClustersRecommendations,
    ImpactedClusters(CompositeRuleId),
    DisabledClusters(CompositeRuleId),
}

#[derive(Default)]
struct State {
    acks: BTreeMap<(OrgId, CompositeRuleId), SystemWideRuleDisable>,
    cluster_disables: Vec<ClusterRuleDisable>,
    reports: HashMap<ClusterName, ClusterReport>,
    clusters: Vec<ClusterName>,
    calls: Vec<AggregatorCall>,
    unavailable: bool,
}

/// Aggregator backed by process memory
#[derive(Default)]
pub struct InMemoryAggregator {
    state: Mutex<State>,
}

impl InMemoryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an acknowledgement without recording a call
    pub fn with_ack(self, org: OrgId, rule: &CompositeRuleId, justification: &str) -> Self {
        {
            let mut state = self.lock();
            let record = ack_record(org, &UserId::default(), rule, justification);
            state.acks.insert((org, rule.clone()), record);
        }
        self
    }

    pub fn with_cluster_disable(self, disable: ClusterRuleDisable) -> Self {
        self.lock().cluster_disables.push(disable);
        self
    }

    /// Seed a report; the cluster also becomes known to the organization
    pub fn with_report(self, cluster: impl Into<String>, report: ClusterReport) -> Self {
        {
            let mut state = self.lock();
            let cluster = ClusterName::new(cluster);
            if !state.clusters.contains(&cluster) {
                state.clusters.push(cluster.clone());
            }
            state.reports.insert(cluster, report);
        }
        self
    }

    /// Make every subsequent call fail as if the aggregator were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn calls(&self) -> Vec<AggregatorCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls matching the predicate
    pub fn count_calls(&self, predicate: impl Fn(&AggregatorCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: AggregatorCall) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.unavailable {
            return Err(AdvisorError::ServiceUnavailable(Backend::Aggregator));
        }
        Ok(state)
    }
}

fn ack_record(
    org: OrgId,
    user: &UserId,
    rule: &CompositeRuleId,
    justification: &str,
) -> SystemWideRuleDisable {
    let now = Utc::now();
    SystemWideRuleDisable {
        org_id: org,
        user_id: user.to_string(),
        rule_id: rule.rule_id.to_string(),
        error_key: rule.error_key.to_string(),
        justification: justification.to_string(),
        created_at: Some(now),
        updated_at: Some(now),
    }
}

fn rule_of(hit_module: &str, error_key: &str) -> Option<CompositeRuleId> {
    CompositeRuleId::from_parts(hit_module, error_key).ok()
}

#[async_trait]
impl AggregatorApi for InMemoryAggregator {
    async fn list_acks(&self, org: OrgId) -> Result<Vec<SystemWideRuleDisable>> {
        let state = self.record(AggregatorCall::ListAcks)?;
        Ok(state
            .acks
            .iter()
            .filter(|((o, _), _)| *o == org)
            .map(|(_, ack)| ack.clone())
            .collect())
    }

    async fn read_ack(
        &self,
        org: OrgId,
        rule: &CompositeRuleId,
    ) -> Result<Option<SystemWideRuleDisable>> {
        let state = self.record(AggregatorCall::ReadAck(rule.clone()))?;
        Ok(state.acks.get(&(org, rule.clone())).cloned())
    }

    async fn create_ack(
        &self,
        org: OrgId,
        user: &UserId,
        rule: &CompositeRuleId,
        justification: &str,
    ) -> Result<()> {
        let mut state = self.record(AggregatorCall::CreateAck(rule.clone()))?;
        state
            .acks
            .insert((org, rule.clone()), ack_record(org, user, rule, justification));
        Ok(())
    }

    async fn update_ack(
        &self,
        org: OrgId,
        _user: &UserId,
        rule: &CompositeRuleId,
        justification: &str,
    ) -> Result<()> {
        let mut state = self.record(AggregatorCall::UpdateAck(rule.clone()))?;
        match state.acks.get_mut(&(org, rule.clone())) {
            Some(ack) => {
                ack.justification = justification.to_string();
                ack.updated_at = Some(Utc::now());
                Ok(())
            }
            None => Err(AdvisorError::improper_status(Backend::Aggregator, 404)),
        }
    }

    async fn delete_ack(&self, org: OrgId, rule: &CompositeRuleId) -> Result<()> {
        let mut state = self.record(AggregatorCall::DeleteAck(rule.clone()))?;
        state.acks.remove(&(org, rule.clone()));
        Ok(())
    }

    async fn disabled_rules_for_clusters(
        &self,
        _org: OrgId,
        clusters: &[ClusterName],
    ) -> Result<Option<Vec<ClusterRuleDisable>>> {
        let state = self.record(AggregatorCall::DisabledRules)?;
        Ok(Some(
            state
                .cluster_disables
                .iter()
                .filter(|d| clusters.contains(&d.cluster_id))
                .cloned()
                .collect(),
        ))
    }

    async fn clusters_for_org(&self, _org: OrgId) -> Result<Vec<ClusterName>> {
        let state = self.record(AggregatorCall::ClustersForOrg)?;
        Ok(state.clusters.clone())
    }

    async fn cluster_report(
        &self,
        _org: OrgId,
        _user: &UserId,
        cluster: &ClusterName,
    ) -> Result<ClusterReport> {
        let state = self.record(AggregatorCall::ClusterReport(cluster.clone()))?;
        state
            .reports
            .get(cluster)
            .cloned()
            .ok_or_else(|| AdvisorError::NotFound(cluster.to_string()))
    }

    async fn reports_for_clusters(
        &self,
        _org: OrgId,
        clusters: &[ClusterName],
    ) -> Result<HashMap<ClusterName, ClusterReport>> {
        let state = self.record(AggregatorCall::Reports)?;
        Ok(clusters
            .iter()
            .filter_map(|c| state.reports.get(c).map(|r| (c.clone(), r.clone())))
            .collect())
    }

    async fn impacting_recommendations(
        &self,
        _org: OrgId,
        _user: &UserId,
        clusters: &[ClusterName],
    ) -> Result<ImpactedClusters> {
        let state = self.record(AggregatorCall::Recommendations)?;
        let mut impacted = ImpactedClusters::new();
        for cluster in clusters {
            let Some(report) = state.reports.get(cluster) else {
                continue;
            };
            for hit in &report.hits {
                if let Some(rule) = rule_of(&hit.module, &hit.error_key) {
                    impacted.entry(rule).or_default().push(cluster.clone());
                }
            }
        }
        Ok(impacted)
    }

    async fn clusters_recommendations(
        &self,
        _org: OrgId,
        _user: &UserId,
        clusters: &[ClusterName],
    ) -> Result<HashMap<ClusterName, ClusterRecommendations>> {
        let state = self.record(AggregatorCall::ClustersRecommendations)?;
        Ok(clusters
            .iter()
            .filter_map(|cluster| {
                let report = state.reports.get(cluster)?;
                let recommendations = report
                    .hits
                    .iter()
                    .filter_map(|hit| rule_of(&hit.module, &hit.error_key))
                    .collect();
                Some((
                    cluster.clone(),
                    ClusterRecommendations {
                        created_at: report.meta.last_checked_at.clone(),
                        meta: report.meta.clone(),
                        recommendations,
                    },
                ))
            })
            .collect())
    }

    async fn impacted_clusters_for_rule(
        &self,
        _org: OrgId,
        _user: &UserId,
        rule: &CompositeRuleId,
        clusters: &[ClusterName],
    ) -> Result<Vec<HittingCluster>> {
        let state = self.record(AggregatorCall::ImpactedClusters(rule.clone()))?;
        Ok(clusters
            .iter()
            .filter(|cluster| {
                state.reports.get(*cluster).is_some_and(|report| {
                    report
                        .hits
                        .iter()
                        .any(|hit| rule_of(&hit.module, &hit.error_key).as_ref() == Some(rule))
                })
            })
            .map(|cluster| {
                let mut hitting = HittingCluster::new(cluster.as_str());
                if let Some(report) = state.reports.get(cluster) {
                    hitting.last_seen = report.meta.last_checked_at.clone();
                    hitting.meta = report.meta.clone();
                }
                hitting
            })
            .collect())
    }

    async fn disabled_clusters_for_rule(
        &self,
        _org: OrgId,
        rule: &CompositeRuleId,
    ) -> Result<Vec<DisabledClusterInfo>> {
        let state = self.record(AggregatorCall::DisabledClusters(rule.clone()))?;
        Ok(state
            .cluster_disables
            .iter()
            .filter(|d| rule_of(&d.rule_id, &d.error_key).as_ref() == Some(rule))
            .map(|d| {
                let mut info = DisabledClusterInfo::new(d.cluster_id.as_str());
                info.justification = d.justification.clone().unwrap_or_default();
                info.disabled_at = d.disabled_at.clone().unwrap_or_default();
                info
            })
            .collect())
    }
}
