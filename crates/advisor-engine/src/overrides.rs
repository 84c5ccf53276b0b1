//! Override indices
//!
//! Both indices are rebuilt for every request from records fetched from the
//! aggregator and dropped with the request.

use advisor_core::{ClusterName, ClusterRuleDisable, CompositeRuleId, SystemWideRuleDisable};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Organization-wide acknowledgements, keyed by composite rule id
#[derive(Debug, Clone, Default)]
pub struct AckIndex {
    rules: HashSet<CompositeRuleId>,
}

impl AckIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold acknowledgement records; records with a malformed rule are skipped
    pub fn from_records(records: &[SystemWideRuleDisable]) -> Self {
        let mut index = Self::new();
        for record in records {
            match record.composite_rule_id() {
                Ok(id) => {
                    index.rules.insert(id);
                }
                Err(err) => warn!(
                    rule_id = %record.rule_id,
                    error_key = %record.error_key,
                    error = %err,
                    "skipping acknowledgement with malformed rule id"
                ),
            }
        }
        index
    }

    pub fn insert(&mut self, rule: CompositeRuleId) {
        self.rules.insert(rule);
    }

    pub fn contains(&self, rule: &CompositeRuleId) -> bool {
        self.rules.contains(rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FromIterator<CompositeRuleId> for AckIndex {
    fn from_iter<I: IntoIterator<Item = CompositeRuleId>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

/// Per-cluster rule disables, keyed by cluster
#[derive(Debug, Clone, Default)]
pub struct DisabledClusterIndex {
    by_cluster: HashMap<ClusterName, HashSet<CompositeRuleId>>,
}

impl DisabledClusterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold the flat list returned by the bulk disabled-rules endpoint.
    ///
    /// Rule modules may carry the `.report` suffix; it is stripped before
    /// the composite id is formed.
    pub fn from_records(records: &[ClusterRuleDisable]) -> Self {
        let mut index = Self::new();
        for record in records {
            match CompositeRuleId::from_parts(&record.rule_id, &record.error_key) {
                Ok(id) => index.insert(record.cluster_id.clone(), id),
                Err(err) => warn!(
                    cluster = %record.cluster_id,
                    rule_id = %record.rule_id,
                    error = %err,
                    "skipping cluster disable with malformed rule id"
                ),
            }
        }
        index
    }

    pub fn insert(&mut self, cluster: ClusterName, rule: CompositeRuleId) {
        self.by_cluster.entry(cluster).or_default().insert(rule);
    }

    pub fn is_disabled(&self, cluster: &ClusterName, rule: &CompositeRuleId) -> bool {
        self.by_cluster
            .get(cluster)
            .map(|rules| rules.contains(rule))
            .unwrap_or(false)
    }

    /// Number of clusters with at least one disabled rule
    pub fn cluster_count(&self) -> usize {
        self.by_cluster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cluster.is_empty()
    }
}

/// Both override stores of one organization
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub acks: AckIndex,
    pub disabled: DisabledClusterIndex,
}

impl Overrides {
    pub fn new(acks: AckIndex, disabled: DisabledClusterIndex) -> Self {
        Self { acks, disabled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use advisor_core::OrgId;

    fn rule(selector: &str) -> CompositeRuleId {
        CompositeRuleId::parse(selector).unwrap()
    }

    fn cluster_disable(cluster: &str, module: &str, key: &str) -> ClusterRuleDisable {
        ClusterRuleDisable {
            cluster_id: ClusterName::new(cluster),
            rule_id: module.to_string(),
            error_key: key.to_string(),
            justification: None,
            disabled_at: None,
        }
    }

    #[test]
    fn test_ack_index_from_records() {
        let records = vec![
            SystemWideRuleDisable {
                org_id: OrgId(1),
                user_id: "1".into(),
                rule_id: "ccx_rules_ocp.external.rules.foo".into(),
                error_key: "FOO".into(),
                justification: String::new(),
                created_at: None,
                updated_at: None,
            },
            SystemWideRuleDisable {
                org_id: OrgId(1),
                user_id: "1".into(),
                rule_id: "not a rule".into(),
                error_key: "FOO".into(),
                justification: String::new(),
                created_at: None,
                updated_at: None,
            },
        ];

        let index = AckIndex::from_records(&records);
        assert_eq!(index.len(), 1);
        assert!(index.contains(&rule("ccx_rules_ocp.external.rules.foo|FOO")));
    }

    #[test]
    fn test_disabled_index_strips_report_suffix() {
        let index = DisabledClusterIndex::from_records(&[
            cluster_disable("c1", "ccx_rules_ocp.external.rules.foo.report", "FOO"),
            cluster_disable("c1", "ccx_rules_ocp.external.rules.bar", "BAR"),
            cluster_disable("c2", "ccx_rules_ocp.external.rules.foo", "FOO"),
        ]);

        let foo = rule("ccx_rules_ocp.external.rules.foo|FOO");
        assert!(index.is_disabled(&ClusterName::new("c1"), &foo));
        assert!(index.is_disabled(&ClusterName::new("c2"), &foo));
        assert!(!index.is_disabled(&ClusterName::new("c3"), &foo));
        assert_eq!(index.cluster_count(), 2);
    }
}
