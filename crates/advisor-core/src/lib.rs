//! Advisor Core: entity vocabulary, error taxonomy and rule content
//!
//! Shared by every other crate of the gateway. Nothing here talks to the
//! network; backends live in `advisor-backends`.

pub mod content;
pub mod context;
pub mod data_model;
pub mod error;

pub use content::{
    ContentDirectory, ContentLookupError, RuleContent, RuleContentIndex, Severities,
    OSD_CUSTOMER_TAG,
};
pub use context::{Identity, RequestContext};
pub use data_model::{
    Acknowledgement, ClusterInfo, ClusterName, ClusterRecommendations, ClusterReport,
    ClusterRuleDisable, CompositeRuleId, DisabledClusterInfo, ErrorKey, HittingCluster, OrgId,
    ReportMeta, RuleHit, RuleId, SystemWideRuleDisable, UserId, UserVote, DOT_REPORT,
};
pub use error::{AdvisorError, Backend, ErrorKind, Result};

/// Gateway version reported by the info endpoint
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");
