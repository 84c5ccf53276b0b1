//! Data Model: identifiers, overrides and rule hits
//!
//! The aggregator owns every record here; the gateway only reads them per
//! request and never keeps them across requests.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::AdvisorError;

/// Suffix carried by rule modules coming from report-style rule plugins
pub const DOT_REPORT: &str = ".report";

static SELECTOR_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_0-9.]+$").expect("valid selector regex"));

static COMPOSITE_SELECTOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z_0-9.]+\|[a-zA-Z_0-9.]+$").expect("valid composite selector regex")
});

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Dotted module path of a rule (e.g. `ccx_rules_ocp.external.rules.foo`)
    RuleId
);
string_id!(
    /// Failure condition within a rule module
    ErrorKey
);
string_id!(
    /// Cluster identifier (UUID shaped)
    ClusterName
);
string_id!(
    /// User identifier taken from the identity token
    UserId
);

impl RuleId {
    /// Build a rule id from a raw module, stripping the `.report` suffix
    pub fn from_module(module: &str) -> Self {
        Self(module.strip_suffix(DOT_REPORT).unwrap_or(module).to_string())
    }

    /// Internal rules have an `internal` segment in their module path
    pub fn is_internal(&self) -> bool {
        self.0.split('.').any(|part| part == "internal")
    }
}

impl Default for UserId {
    /// Tokens without a user id are treated as user `"0"`
    fn default() -> Self {
        Self("0".to_string())
    }
}

/// Tenant identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(pub u32);

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `RuleID|ErrorKey`, the externally visible rule selector
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeRuleId {
    pub rule_id: RuleId,
    pub error_key: ErrorKey,
}

impl CompositeRuleId {
    pub fn new(rule_id: RuleId, error_key: ErrorKey) -> Self {
        Self { rule_id, error_key }
    }

    /// Compose from a raw module (possibly `.report` suffixed) and error key
    pub fn from_parts(module: &str, error_key: &str) -> Result<Self, AdvisorError> {
        let rule_id = RuleId::from_module(module);
        if !SELECTOR_PART.is_match(rule_id.as_str()) || !SELECTOR_PART.is_match(error_key) {
            return Err(AdvisorError::parsing(
                "rule_id",
                format!("{}|{}", module, error_key),
                "rule module and error key must match ^[a-zA-Z_0-9.]+$",
            ));
        }
        Ok(Self::new(rule_id, ErrorKey::new(error_key)))
    }

    /// Parse a `rule.module|ERROR_KEY` selector
    pub fn parse(selector: &str) -> Result<Self, AdvisorError> {
        if !COMPOSITE_SELECTOR.is_match(selector) {
            return Err(AdvisorError::parsing(
                "rule_id",
                selector,
                "invalid composite rule ID. Must be in the format 'rule.plugin.module|ERROR_KEY'",
            ));
        }
        // the regex guarantees exactly one separator
        let (rule_id, error_key) = selector
            .split_once('|')
            .ok_or_else(|| AdvisorError::parsing("rule_id", selector, "missing '|'"))?;
        Ok(Self::new(RuleId::new(rule_id), ErrorKey::new(error_key)))
    }
}

impl fmt::Display for CompositeRuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.rule_id, self.error_key)
    }
}

impl FromStr for CompositeRuleId {
    type Err = AdvisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for CompositeRuleId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CompositeRuleId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Organization-wide rule disable as returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub rule: String,
    pub justification: String,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Organization-wide disable record as stored by the aggregator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemWideRuleDisable {
    pub org_id: OrgId,
    #[serde(default)]
    pub user_id: String,
    pub rule_id: String,
    pub error_key: String,
    #[serde(default)]
    pub justification: String,
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SystemWideRuleDisable {
    /// Composite id of the disabled rule
    pub fn composite_rule_id(&self) -> Result<CompositeRuleId, AdvisorError> {
        CompositeRuleId::from_parts(&self.rule_id, &self.error_key)
    }
}

impl From<SystemWideRuleDisable> for Acknowledgement {
    fn from(record: SystemWideRuleDisable) -> Self {
        let format = |t: Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                .unwrap_or_default()
        };
        Self {
            rule: format!("{}|{}", record.rule_id, record.error_key),
            justification: record.justification,
            created_by: record.user_id,
            created_at: format(record.created_at),
            updated_at: format(record.updated_at),
        }
    }
}

/// Per-cluster rule disable record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRuleDisable {
    pub cluster_id: ClusterName,
    pub rule_id: String,
    pub error_key: String,
    #[serde(default)]
    pub justification: Option<String>,
    #[serde(default)]
    pub disabled_at: Option<String>,
}

/// Cluster as known to the account inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    #[serde(rename = "cluster_id")]
    pub id: ClusterName,
    #[serde(rename = "display_name")]
    pub display_name: String,
    #[serde(default)]
    pub managed: bool,
}

impl ClusterInfo {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, managed: bool) -> Self {
        Self {
            id: ClusterName::new(id),
            display_name: display_name.into(),
            managed,
        }
    }
}

/// User vote on a rule hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i8", into = "i8")]
pub enum UserVote {
    Dislike,
    #[default]
    None,
    Like,
}

impl From<i8> for UserVote {
    fn from(value: i8) -> Self {
        match value {
            v if v < 0 => UserVote::Dislike,
            0 => UserVote::None,
            _ => UserVote::Like,
        }
    }
}

impl From<UserVote> for i8 {
    fn from(value: UserVote) -> Self {
        match value {
            UserVote::Dislike => -1,
            UserVote::None => 0,
            UserVote::Like => 1,
        }
    }
}

/// A single rule hit on a cluster report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleHit {
    /// Raw rule module, possibly `.report` suffixed
    #[serde(rename = "component")]
    pub module: String,
    #[serde(rename = "key")]
    pub error_key: String,
    /// Set by the aggregator for single-cluster disables
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, rename = "details")]
    pub template_data: Value,
    #[serde(default)]
    pub user_vote: UserVote,
    #[serde(default)]
    pub disable_feedback: String,
    #[serde(default)]
    pub disabled_at: String,
}

impl RuleHit {
    pub fn new(module: impl Into<String>, error_key: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            error_key: error_key.into(),
            disabled: false,
            template_data: Value::Null,
            user_vote: UserVote::None,
            disable_feedback: String::new(),
            disabled_at: String::new(),
        }
    }

    /// Mark the hit as disabled on the report
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn rule_id(&self) -> RuleId {
        RuleId::from_module(&self.module)
    }

    pub fn composite_rule_id(&self) -> Result<CompositeRuleId, AdvisorError> {
        CompositeRuleId::from_parts(&self.module, &self.error_key)
    }
}

/// Report metadata as sent by the aggregator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReportMeta {
    #[serde(default)]
    pub last_checked_at: String,
    #[serde(default)]
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_version: Option<String>,
}

/// Raw report of one cluster
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterReport {
    #[serde(default)]
    pub meta: ReportMeta,
    #[serde(default, rename = "reports")]
    pub hits: Vec<RuleHit>,
}

/// Rule hits of one cluster as listed by the aggregator recommendations endpoint
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterRecommendations {
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub meta: ReportMeta,
    #[serde(default)]
    pub recommendations: Vec<CompositeRuleId>,
}

/// Cluster hit by a given rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HittingCluster {
    pub cluster: ClusterName,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub last_seen: String,
    #[serde(default)]
    pub impacted: String,
    #[serde(default)]
    pub meta: ReportMeta,
}

impl HittingCluster {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: ClusterName::new(cluster),
            cluster_name: String::new(),
            last_seen: String::new(),
            impacted: String::new(),
            meta: ReportMeta::default(),
        }
    }
}

/// Cluster on which a given rule was disabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisabledClusterInfo {
    pub cluster_id: ClusterName,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub disabled_at: String,
    #[serde(default)]
    pub justification: String,
}

impl DisabledClusterInfo {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: ClusterName::new(cluster_id),
            cluster_name: String::new(),
            disabled_at: String::new(),
            justification: String::new(),
        }
    }
}
