//! Customer-facing views produced by the reconciliation engine

use advisor_core::{
    ClusterName, CompositeRuleId, DisabledClusterInfo, HittingCluster, RuleContent, RuleHit,
    UserVote,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One rule of a cluster report, merged with its content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleView {
    pub rule_id: String,
    pub error_key: String,
    #[serde(default)]
    pub created_at: String,
    pub description: String,
    #[serde(rename = "details")]
    pub generic: String,
    pub reason: String,
    pub resolution: String,
    pub total_risk: u8,
    pub risk_of_change: u8,
    pub disabled: bool,
    pub disable_feedback: String,
    pub disabled_at: String,
    pub internal: bool,
    pub user_vote: UserVote,
    pub extra_data: Value,
    pub tags: Vec<String>,
}

impl RuleView {
    pub fn from_hit(hit: &RuleHit, content: &RuleContent, disabled: bool) -> Self {
        Self {
            rule_id: content.rule_id.to_string(),
            error_key: content.error_key.to_string(),
            created_at: content
                .publish_date
                .map(|d| d.to_rfc3339())
                .unwrap_or_default(),
            description: content.description.clone(),
            generic: content.generic.clone(),
            reason: content.reason.clone(),
            resolution: content.resolution.clone(),
            total_risk: content.total_risk,
            risk_of_change: content.resolution_risk,
            disabled,
            disable_feedback: hit.disable_feedback.clone(),
            disabled_at: hit.disabled_at.clone(),
            internal: content.internal,
            user_vote: hit.user_vote,
            extra_data: hit.template_data.clone(),
            tags: content.tags.clone(),
        }
    }

    pub fn composite_rule_id(&self) -> String {
        format!("{}|{}", self.rule_id, self.error_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReportViewMeta {
    pub last_checked_at: String,
    /// Number of visible rules
    pub count: usize,
    /// Hits left out because their content is unknown
    pub no_content: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_version: Option<String>,
}

/// Filtered report of a single cluster
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReportView {
    pub meta: ReportViewMeta,
    pub data: Vec<RuleView>,
}

/// Entry of the recommendation list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationView {
    pub rule_id: CompositeRuleId,
    pub description: String,
    pub generic: String,
    pub publish_date: Option<String>,
    pub total_risk: u8,
    pub resolution_risk: u8,
    pub impact: u8,
    pub likelihood: u8,
    pub tags: Vec<String>,
    pub disabled: bool,
    pub impacted_clusters_count: u32,
}

impl RecommendationView {
    pub fn new(rule_id: CompositeRuleId, content: &RuleContent) -> Self {
        Self {
            rule_id,
            description: content.description.clone(),
            generic: content.generic.clone(),
            publish_date: content.publish_date.map(|d| d.to_rfc3339()),
            total_risk: content.total_risk,
            resolution_risk: content.resolution_risk,
            impact: content.impact,
            likelihood: content.likelihood,
            tags: content.tags.clone(),
            disabled: false,
            impacted_clusters_count: 0,
        }
    }
}

/// Entry of the cluster list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterListView {
    pub cluster_id: ClusterName,
    pub cluster_name: String,
    pub managed: bool,
    pub last_checked_at: String,
    pub cluster_version: String,
    pub total_hit_count: u32,
    pub hits_by_total_risk: BTreeMap<u8, u32>,
}

/// Org-wide counts of clusters hit
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrgOverview {
    pub clusters_hit: u32,
    pub hit_by_risk: BTreeMap<u8, u32>,
    pub hit_by_tag: BTreeMap<String, u32>,
}

/// Impacted clusters of one rule, split by per-cluster disable state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClustersDetail {
    pub enabled: Vec<HittingCluster>,
    pub disabled: Vec<DisabledClusterInfo>,
}

/// Rule content with the caller's acknowledgement state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationContentView {
    pub rule_id: CompositeRuleId,
    pub description: String,
    pub generic: String,
    pub reason: String,
    pub resolution: String,
    pub more_info: String,
    pub total_risk: u8,
    pub resolution_risk: u8,
    pub impact: u8,
    pub likelihood: u8,
    pub publish_date: Option<String>,
    pub tags: Vec<String>,
    pub internal: bool,
    pub disabled: bool,
}

impl RecommendationContentView {
    pub fn new(content: &RuleContent, disabled: bool) -> Self {
        Self {
            rule_id: content.composite_rule_id(),
            description: content.description.clone(),
            generic: content.generic.clone(),
            reason: content.reason.clone(),
            resolution: content.resolution.clone(),
            more_info: content.more_info.clone(),
            total_risk: content.total_risk,
            resolution_risk: content.resolution_risk,
            impact: content.impact,
            likelihood: content.likelihood,
            publish_date: content.publish_date.map(|d| d.to_rfc3339()),
            tags: content.tags.clone(),
            internal: content.internal,
            disabled,
        }
    }
}
