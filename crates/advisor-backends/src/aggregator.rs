//! Aggregator client
//!
//! The aggregator is the system of record for rule hits, acknowledgements
//! and per-cluster disables. Every call is a single round trip without
//! retries; failures are mapped here onto `AdvisorError`.

use advisor_core::{
    AdvisorError, Backend, ClusterName, ClusterRecommendations, ClusterReport,
    ClusterRuleDisable, CompositeRuleId, DisabledClusterInfo, HittingCluster, OrgId, Result,
    SystemWideRuleDisable, UserId, DOT_REPORT,
};
use advisor_engine::ImpactedClusters;
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Operations the gateway needs from the aggregator
#[async_trait]
pub trait AggregatorApi: Send + Sync {
    /// Every acknowledgement of the organization
    async fn list_acks(&self, org: OrgId) -> Result<Vec<SystemWideRuleDisable>>;

    /// One acknowledgement; `None` when the rule is not acknowledged
    async fn read_ack(
        &self,
        org: OrgId,
        rule: &CompositeRuleId,
    ) -> Result<Option<SystemWideRuleDisable>>;

    async fn create_ack(
        &self,
        org: OrgId,
        user: &UserId,
        rule: &CompositeRuleId,
        justification: &str,
    ) -> Result<()>;

    async fn update_ack(
        &self,
        org: OrgId,
        user: &UserId,
        rule: &CompositeRuleId,
        justification: &str,
    ) -> Result<()>;

    async fn delete_ack(&self, org: OrgId, rule: &CompositeRuleId) -> Result<()>;

    /// Per-cluster disables for the given clusters; `None` on 404
    async fn disabled_rules_for_clusters(
        &self,
        org: OrgId,
        clusters: &[ClusterName],
    ) -> Result<Option<Vec<ClusterRuleDisable>>>;

    async fn clusters_for_org(&self, org: OrgId) -> Result<Vec<ClusterName>>;

    async fn cluster_report(
        &self,
        org: OrgId,
        user: &UserId,
        cluster: &ClusterName,
    ) -> Result<ClusterReport>;

    async fn reports_for_clusters(
        &self,
        org: OrgId,
        clusters: &[ClusterName],
    ) -> Result<HashMap<ClusterName, ClusterReport>>;

    /// Impacted clusters per rule for the given clusters
    async fn impacting_recommendations(
        &self,
        org: OrgId,
        user: &UserId,
        clusters: &[ClusterName],
    ) -> Result<ImpactedClusters>;

    /// Hitting rules per cluster for the given clusters
    async fn clusters_recommendations(
        &self,
        org: OrgId,
        user: &UserId,
        clusters: &[ClusterName],
    ) -> Result<HashMap<ClusterName, ClusterRecommendations>>;

    /// Clusters hit by one rule
    async fn impacted_clusters_for_rule(
        &self,
        org: OrgId,
        user: &UserId,
        rule: &CompositeRuleId,
        clusters: &[ClusterName],
    ) -> Result<Vec<HittingCluster>>;

    /// Clusters on which one rule is disabled
    async fn disabled_clusters_for_rule(
        &self,
        org: OrgId,
        rule: &CompositeRuleId,
    ) -> Result<Vec<DisabledClusterInfo>>;
}

// ============================================================================
// Wire payloads
// ============================================================================

#[derive(Debug, Serialize)]
struct JustificationBody<'a> {
    justification: &'a str,
}

#[derive(Debug, Serialize)]
struct ClusterListBody<'a> {
    clusters: &'a [ClusterName],
}

#[derive(Debug, Deserialize)]
struct ReadAckResponse {
    #[serde(rename = "disabledRule")]
    disabled_rule: SystemWideRuleDisable,
}

#[derive(Debug, Deserialize)]
struct ListAcksResponse {
    #[serde(default, rename = "disabledRules")]
    disabled_rules: Vec<SystemWideRuleDisable>,
}

#[derive(Debug, Deserialize)]
struct DisabledRulesResponse {
    #[serde(default)]
    rules: Vec<ClusterRuleDisable>,
}

#[derive(Debug, Deserialize)]
struct ClusterListResponse<T> {
    #[serde(default = "Vec::new")]
    clusters: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    report: ClusterReport,
}

#[derive(Debug, Deserialize)]
struct ReportsResponse {
    #[serde(default)]
    reports: HashMap<ClusterName, ClusterReport>,
}

#[derive(Debug, Deserialize)]
struct RecommendationsResponse {
    #[serde(default)]
    recommendations: ImpactedClusters,
}

#[derive(Debug, Deserialize)]
struct ClustersRecommendationsResponse {
    #[serde(default)]
    clusters: HashMap<ClusterName, ClusterRecommendations>,
}

// ============================================================================
// HTTP client
// ============================================================================

/// Aggregator reached over its REST API
pub struct HttpAggregator {
    client: reqwest::Client,
    base: Url,
}

impl HttpAggregator {
    pub fn new(base_endpoint: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_endpoint).map_err(|e| {
            AdvisorError::Internal(format!("invalid aggregator endpoint {}: {}", base_endpoint, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdvisorError::Internal(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Base url extended with percent-encoded path segments
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AdvisorError::Internal("aggregator endpoint cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        debug!(method = %method, url = %url, "calling aggregator");
        let mut request = self.client.request(method, url.clone());
        if let Some(body) = body {
            request = request.json(&body);
        }
        request.send().await.map_err(|e| {
            error!(url = %url, error = %e, "aggregator is unreachable");
            AdvisorError::ServiceUnavailable(Backend::Aggregator)
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| AdvisorError::decode(Backend::Aggregator, e))
    }

    /// Send and require 200
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let response = self.send(method, url, body).await?;
        expect_ok(response.status())?;
        Self::decode(response).await
    }

    /// Send and require 200, ignoring the body
    async fn call_empty(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        let response = self.send(method, url, body).await?;
        expect_ok(response.status())
    }

    /// Send, mapping 404 to `None`
    async fn call_optional<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<Option<T>> {
        let response = self.send(method, url, body).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        expect_ok(response.status())?;
        Self::decode(response).await.map(Some)
    }

    fn rule_path<'a>(rule: &'a CompositeRuleId, org: &'a str) -> [&'a str; 6] {
        [
            "rules",
            rule.rule_id.as_str(),
            "error_key",
            rule.error_key.as_str(),
            "organizations",
            org,
        ]
    }
}

fn expect_ok(status: StatusCode) -> Result<()> {
    if status == StatusCode::OK {
        Ok(())
    } else {
        warn!(status = status.as_u16(), "aggregator responded with improper HTTP code");
        Err(AdvisorError::improper_status(Backend::Aggregator, status.as_u16()))
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| AdvisorError::Internal(e.to_string()))
}

#[async_trait]
impl AggregatorApi for HttpAggregator {
    async fn list_acks(&self, org: OrgId) -> Result<Vec<SystemWideRuleDisable>> {
        let org = org.to_string();
        let url = self.endpoint(&["rules", "organizations", &org, "disabled_system_wide"])?;
        let response: ListAcksResponse = self.call(Method::GET, url, None).await?;
        Ok(response.disabled_rules)
    }

    async fn read_ack(
        &self,
        org: OrgId,
        rule: &CompositeRuleId,
    ) -> Result<Option<SystemWideRuleDisable>> {
        let org = org.to_string();
        let mut segments = Self::rule_path(rule, &org).to_vec();
        segments.push("read_system_wide");
        let url = self.endpoint(&segments)?;
        let response: Option<ReadAckResponse> = self.call_optional(Method::GET, url, None).await?;
        Ok(response.map(|r| r.disabled_rule))
    }

    async fn create_ack(
        &self,
        org: OrgId,
        user: &UserId,
        rule: &CompositeRuleId,
        justification: &str,
    ) -> Result<()> {
        let org = org.to_string();
        let mut segments = Self::rule_path(rule, &org).to_vec();
        segments.extend(["users", user.as_str(), "disable_system_wide"]);
        let url = self.endpoint(&segments)?;
        let body = to_json(&JustificationBody { justification })?;
        self.call_empty(Method::PUT, url, Some(body)).await
    }

    async fn update_ack(
        &self,
        org: OrgId,
        user: &UserId,
        rule: &CompositeRuleId,
        justification: &str,
    ) -> Result<()> {
        let org = org.to_string();
        let mut segments = Self::rule_path(rule, &org).to_vec();
        segments.extend(["users", user.as_str(), "update_system_wide"]);
        let url = self.endpoint(&segments)?;
        let body = to_json(&JustificationBody { justification })?;
        self.call_empty(Method::POST, url, Some(body)).await
    }

    async fn delete_ack(&self, org: OrgId, rule: &CompositeRuleId) -> Result<()> {
        let org = org.to_string();
        let mut segments = Self::rule_path(rule, &org).to_vec();
        segments.push("enable_system_wide");
        let url = self.endpoint(&segments)?;
        self.call_empty(Method::PUT, url, None).await
    }

    async fn disabled_rules_for_clusters(
        &self,
        org: OrgId,
        clusters: &[ClusterName],
    ) -> Result<Option<Vec<ClusterRuleDisable>>> {
        let org = org.to_string();
        let url = self.endpoint(&["rules", "organizations", &org, "disabled", "clusters"])?;
        let body = to_json(&clusters)?;
        let response: Option<DisabledRulesResponse> =
            self.call_optional(Method::POST, url, Some(body)).await?;
        Ok(response.map(|r| r.rules))
    }

    async fn clusters_for_org(&self, org: OrgId) -> Result<Vec<ClusterName>> {
        let org = org.to_string();
        let url = self.endpoint(&["organizations", &org, "clusters"])?;
        let response: ClusterListResponse<ClusterName> = self.call(Method::GET, url, None).await?;
        Ok(response.clusters)
    }

    async fn cluster_report(
        &self,
        org: OrgId,
        user: &UserId,
        cluster: &ClusterName,
    ) -> Result<ClusterReport> {
        let org = org.to_string();
        let url = self.endpoint(&[
            "organizations",
            &org,
            "clusters",
            cluster.as_str(),
            "users",
            user.as_str(),
            "report",
        ])?;
        match self.call_optional::<ReportResponse>(Method::GET, url, None).await? {
            Some(response) => Ok(response.report),
            None => Err(AdvisorError::NotFound(cluster.to_string())),
        }
    }

    async fn reports_for_clusters(
        &self,
        org: OrgId,
        clusters: &[ClusterName],
    ) -> Result<HashMap<ClusterName, ClusterReport>> {
        let org = org.to_string();
        let url = self.endpoint(&["organizations", &org, "clusters", "reports"])?;
        let body = to_json(&ClusterListBody { clusters })?;
        let response: ReportsResponse = self.call(Method::POST, url, Some(body)).await?;
        Ok(response.reports)
    }

    async fn impacting_recommendations(
        &self,
        org: OrgId,
        user: &UserId,
        clusters: &[ClusterName],
    ) -> Result<ImpactedClusters> {
        let org = org.to_string();
        let url = self.endpoint(&[
            "organizations",
            &org,
            "users",
            user.as_str(),
            "recommendations",
            "list",
        ])?;
        let body = to_json(&clusters)?;
        let response: RecommendationsResponse = self.call(Method::POST, url, Some(body)).await?;
        Ok(response.recommendations)
    }

    async fn clusters_recommendations(
        &self,
        org: OrgId,
        user: &UserId,
        clusters: &[ClusterName],
    ) -> Result<HashMap<ClusterName, ClusterRecommendations>> {
        let org = org.to_string();
        let url = self.endpoint(&[
            "organizations",
            &org,
            "users",
            user.as_str(),
            "clusters",
            "recommendations",
        ])?;
        let body = to_json(&clusters)?;
        let response: ClustersRecommendationsResponse =
            self.call(Method::POST, url, Some(body)).await?;
        Ok(response.clusters)
    }

    async fn impacted_clusters_for_rule(
        &self,
        org: OrgId,
        user: &UserId,
        rule: &CompositeRuleId,
        clusters: &[ClusterName],
    ) -> Result<Vec<HittingCluster>> {
        let org = org.to_string();
        let selector = rule.to_string();
        let url = self.endpoint(&[
            "rules",
            &selector,
            "organizations",
            &org,
            "users",
            user.as_str(),
            "clusters_detail",
        ])?;
        let body = to_json(&ClusterListBody { clusters })?;
        let response = self.send(Method::POST, url, Some(body)).await?;
        if response.status() != StatusCode::OK {
            // no hits for the rule
            debug!(rule = %rule, status = response.status().as_u16(), "no impacted clusters");
            return Ok(Vec::new());
        }
        let response: ClusterListResponse<HittingCluster> = Self::decode(response).await?;
        Ok(response.clusters)
    }

    async fn disabled_clusters_for_rule(
        &self,
        org: OrgId,
        rule: &CompositeRuleId,
    ) -> Result<Vec<DisabledClusterInfo>> {
        let org = org.to_string();
        // rules disabled per cluster are stored with the `.report` module
        let module = format!("{}{}", rule.rule_id, DOT_REPORT);
        let url = self.endpoint(&[
            "rules",
            &module,
            "error_key",
            rule.error_key.as_str(),
            "organizations",
            &org,
            "disabled_clusters",
        ])?;
        let response: Option<ClusterListResponse<DisabledClusterInfo>> =
            self.call_optional(Method::GET, url, None).await?;
        Ok(response.map(|r| r.clusters).unwrap_or_default())
    }
}
