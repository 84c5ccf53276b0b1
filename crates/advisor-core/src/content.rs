//! Rule content index
//!
//! Static rule metadata (severity, tags, managed-cluster eligibility) is
//! consumed read-only through the `RuleContentIndex` trait. The
//! `ContentDirectory` implementation holds the latest snapshot pulled from
//! the content service and is swapped atomically on refresh.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::data_model::{CompositeRuleId, ErrorKey, RuleId};
use crate::error::AdvisorError;

/// Tag marking rules that may be shown on managed clusters
pub const OSD_CUSTOMER_TAG: &str = "osd_customer";

/// Static content of one rule error key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleContent {
    /// Rule module without the `.report` suffix
    pub rule_id: RuleId,
    pub error_key: ErrorKey,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub generic: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub more_info: String,
    /// 1 (low) to 4 (critical)
    #[serde(default)]
    pub total_risk: u8,
    #[serde(default)]
    pub impact: u8,
    #[serde(default)]
    pub likelihood: u8,
    #[serde(default)]
    pub resolution_risk: u8,
    #[serde(default)]
    pub publish_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, alias = "osd_customer")]
    pub managed_cluster_eligible: bool,
    #[serde(default)]
    pub internal: bool,
}

impl RuleContent {
    pub fn new(rule_id: impl Into<String>, error_key: impl Into<String>, total_risk: u8) -> Self {
        Self {
            rule_id: RuleId::from_module(&rule_id.into()),
            error_key: ErrorKey::new(error_key),
            description: String::new(),
            generic: String::new(),
            reason: String::new(),
            resolution: String::new(),
            more_info: String::new(),
            total_risk,
            impact: total_risk,
            likelihood: total_risk,
            resolution_risk: 0,
            publish_date: None,
            tags: Vec::new(),
            managed_cluster_eligible: false,
            internal: false,
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn managed_eligible(mut self, eligible: bool) -> Self {
        self.managed_cluster_eligible = eligible;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn composite_rule_id(&self) -> CompositeRuleId {
        CompositeRuleId::new(self.rule_id.clone(), self.error_key.clone())
    }

    /// Fill derived fields the content service leaves implicit
    fn normalize(mut self) -> Self {
        if self.total_risk == 0 && (self.impact > 0 || self.likelihood > 0) {
            let mean = (u16::from(self.impact) + u16::from(self.likelihood)) / 2;
            self.total_risk = u8::try_from(mean).unwrap_or(u8::MAX);
        }
        if self.tags.iter().any(|t| t == OSD_CUSTOMER_TAG) {
            self.managed_cluster_eligible = true;
        }
        self.internal = self.internal || self.rule_id.is_internal();
        self
    }
}

/// Lookup failures of the content index
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentLookupError {
    /// Ordinary miss; callers count it instead of failing
    #[error("rule content not found for {0}")]
    NotFound(CompositeRuleId),

    /// The directory is not available; fatal for the whole request
    #[error("content directory timed out")]
    DirectoryTimeout,
}

impl From<ContentLookupError> for AdvisorError {
    fn from(err: ContentLookupError) -> Self {
        match err {
            ContentLookupError::NotFound(id) => AdvisorError::NotFound(id.to_string()),
            ContentLookupError::DirectoryTimeout => AdvisorError::ContentDirectoryTimeout,
        }
    }
}

/// Severity of every external rule, plus the distinct severities seen
pub type Severities = (HashMap<CompositeRuleId, u8>, BTreeSet<u8>);

/// Read-only view on static rule content
pub trait RuleContentIndex: Send + Sync {
    /// Content for one `rule|ERROR_KEY`
    fn get_content(&self, id: &CompositeRuleId) -> Result<Arc<RuleContent>, ContentLookupError>;

    /// Total risk of every external rule
    fn get_severities(&self) -> Result<Severities, ContentLookupError>;

    /// Whether a rule is restricted to allow-listed organizations
    fn is_internal(&self, rule_id: &RuleId) -> bool;

    /// Every external rule known to the index, sorted
    fn external_rule_ids(&self) -> Result<Vec<CompositeRuleId>, ContentLookupError>;
}

#[derive(Debug, Default)]
struct ContentSnapshot {
    rules: BTreeMap<CompositeRuleId, Arc<RuleContent>>,
}

/// In-process content index refreshed from the content service
#[derive(Debug, Default)]
pub struct ContentDirectory {
    snapshot: RwLock<Option<Arc<ContentSnapshot>>>,
}

impl ContentDirectory {
    /// Empty directory; every lookup times out until the first load
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory preloaded with the given rules
    pub fn with_rules(rules: Vec<RuleContent>) -> Self {
        let directory = Self::new();
        directory.load(rules);
        directory
    }

    /// Replace the current snapshot
    pub fn load(&self, rules: Vec<RuleContent>) {
        let mut snapshot = ContentSnapshot::default();
        for rule in rules {
            let rule = rule.normalize();
            if !(1..=4).contains(&rule.total_risk) {
                warn!(rule = %rule.composite_rule_id(), total_risk = rule.total_risk, "rule content has out of range total risk");
            }
            snapshot.rules.insert(rule.composite_rule_id(), Arc::new(rule));
        }
        info!(rules = snapshot.rules.len(), "rule content directory loaded");

        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Arc::new(snapshot));
    }

    pub fn is_ready(&self) -> bool {
        self.current().is_some()
    }

    pub fn len(&self) -> usize {
        self.current().map(|s| s.rules.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rules of the current snapshot
    pub fn all_content(&self) -> Result<Vec<Arc<RuleContent>>, ContentLookupError> {
        let snapshot = self.ready_snapshot()?;
        Ok(snapshot.rules.values().cloned().collect())
    }

    fn current(&self) -> Option<Arc<ContentSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn ready_snapshot(&self) -> Result<Arc<ContentSnapshot>, ContentLookupError> {
        self.current().ok_or_else(|| {
            debug!("rule content requested before the directory was loaded");
            ContentLookupError::DirectoryTimeout
        })
    }
}

impl RuleContentIndex for ContentDirectory {
    fn get_content(&self, id: &CompositeRuleId) -> Result<Arc<RuleContent>, ContentLookupError> {
        self.ready_snapshot()?
            .rules
            .get(id)
            .cloned()
            .ok_or_else(|| ContentLookupError::NotFound(id.clone()))
    }

    fn get_severities(&self) -> Result<Severities, ContentLookupError> {
        let snapshot = self.ready_snapshot()?;
        let mut severities = HashMap::new();
        let mut unique = BTreeSet::new();
        for (id, rule) in snapshot.rules.iter().filter(|(_, r)| !r.internal) {
            severities.insert(id.clone(), rule.total_risk);
            unique.insert(rule.total_risk);
        }
        Ok((severities, unique))
    }

    fn is_internal(&self, rule_id: &RuleId) -> bool {
        rule_id.is_internal()
    }

    fn external_rule_ids(&self) -> Result<Vec<CompositeRuleId>, ContentLookupError> {
        let snapshot = self.ready_snapshot()?;
        Ok(snapshot
            .rules
            .iter()
            .filter(|(_, r)| !r.internal)
            .map(|(id, _)| id.clone())
            .collect())
    }
}
