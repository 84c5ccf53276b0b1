//! Advisor Engine: reconciliation of rule hits with overrides and content
//!
//! ```text
//! rule hits ─┐
//! acks ──────┼─→ visibility predicate ─→ report / recommendations /
//! disables ──┤                            cluster list / org overview
//! content ───┘
//! ```

pub mod overrides;
pub mod params;
pub mod reconciliation;
pub mod views;
pub mod visibility;

pub use overrides::{AckIndex, DisabledClusterIndex, Overrides};
pub use params::{parse_bool_param, ImpactingFlag, ReportOptions};
pub use reconciliation::{ImpactedClusters, ReconciliationEngine};
pub use views::{
    ClusterListView, ClustersDetail, OrgOverview, RecommendationContentView,
    RecommendationView, ReportView, ReportViewMeta, RuleView,
};
pub use visibility::{is_visible, suppression, HitSubject, Suppression};
