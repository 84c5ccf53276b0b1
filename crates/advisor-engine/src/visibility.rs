//! Visibility predicate
//!
//! Decides whether a rule hit on a cluster is shown. A hit is suppressed
//! when the aggregator marked it disabled, when the organization
//! acknowledged the rule, when it is disabled on that cluster, or when the
//! cluster is managed and the rule is not eligible for managed clusters.

use advisor_core::{ClusterName, CompositeRuleId, RuleContent};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::overrides::Overrides;

/// Why a hit is hidden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suppression {
    /// Disabled on the report by the aggregator
    ReportDisabled,
    /// Acknowledged organization-wide
    Acknowledged,
    /// Disabled on this cluster only
    ClusterDisabled,
    /// Managed cluster and the rule lacks managed eligibility
    ManagedIneligible,
}

impl Suppression {
    /// Whether `get_disabled` may bring the hit back
    pub fn overridable(&self) -> bool {
        !matches!(self, Suppression::ManagedIneligible)
    }
}

impl fmt::Display for Suppression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Suppression::ReportDisabled => "disabled on report",
            Suppression::Acknowledged => "acknowledged",
            Suppression::ClusterDisabled => "disabled for cluster",
            Suppression::ManagedIneligible => "not eligible for managed clusters",
        };
        f.write_str(reason)
    }
}

/// One hit to judge
#[derive(Debug, Clone, Copy)]
pub struct HitSubject<'a> {
    pub cluster: &'a ClusterName,
    pub managed: bool,
    pub rule: &'a CompositeRuleId,
    /// Disabled flag carried on the report itself
    pub report_disabled: bool,
}

/// Suppression reason for a hit, if any.
///
/// Managed ineligibility takes precedence so a caller opting into disabled
/// rules never sees a managed-ineligible one.
pub fn suppression(
    subject: HitSubject<'_>,
    content: Option<&RuleContent>,
    overrides: &Overrides,
) -> Option<Suppression> {
    let eligible = content.map(|c| c.managed_cluster_eligible).unwrap_or(false);
    if subject.managed && !eligible {
        return Some(Suppression::ManagedIneligible);
    }
    if subject.report_disabled {
        return Some(Suppression::ReportDisabled);
    }
    if overrides.acks.contains(subject.rule) {
        return Some(Suppression::Acknowledged);
    }
    if overrides.disabled.is_disabled(subject.cluster, subject.rule) {
        return Some(Suppression::ClusterDisabled);
    }
    None
}

/// Whether a hit is shown, honouring the caller's `get_disabled` opt-in
pub fn is_visible(
    subject: HitSubject<'_>,
    content: Option<&RuleContent>,
    overrides: &Overrides,
    include_disabled: bool,
) -> bool {
    match suppression(subject, content, overrides) {
        None => true,
        Some(reason) => include_disabled && reason.overridable(),
    }
}
