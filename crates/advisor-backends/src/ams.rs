//! Account management (AMS) inventory
//!
//! AMS knows the display name and managed flag of every cluster. An
//! organization's external id is first resolved to its internal ids, then
//! the subscriptions of those ids are paged through.

use crate::inventory::ClusterInventory;
use advisor_core::{AdvisorError, Backend, ClusterInfo, OrgId, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Subscription states that never count as active clusters
pub const INACTIVE_STATUSES: [&str; 3] = ["Archived", "Deprovisioned", "Reserved"];

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default)]
    size: usize,
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Organization {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    id: Option<String>,
    external_cluster_id: Option<String>,
    display_name: Option<String>,
    managed: Option<bool>,
}

/// Search expression selecting the active subscriptions of `org_ids`
fn subscription_search(org_ids: &[String]) -> String {
    format!(
        "organization_id in ('{}') and cluster_id != '' and status not in ('{}')",
        org_ids.join("','"),
        INACTIVE_STATUSES.join("','")
    )
}

pub struct AmsInventory {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    page_size: usize,
}

impl AmsInventory {
    pub fn new(base_endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_endpoint).map_err(|e| {
            AdvisorError::Internal(format!("invalid AMS endpoint {}: {}", base_endpoint, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdvisorError::Internal(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base,
            token: token.filter(|t| !t.is_empty()),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn endpoint(&self, collection: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AdvisorError::Internal("AMS endpoint cannot be a base".into()))?
            .pop_if_empty()
            .extend(["api", "accounts_mgmt", "v1", collection]);
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!(url = %url, "calling AMS");
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| {
            error!(url = %url, error = %e, "AMS API is unreachable");
            AdvisorError::ServiceUnavailable(Backend::Ams)
        })?;
        let status = response.status();
        if status != StatusCode::OK {
            warn!(status = status.as_u16(), "AMS responded with improper HTTP code");
            return Err(AdvisorError::improper_status(Backend::Ams, status.as_u16()));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| AdvisorError::decode(Backend::Ams, e))
    }

    /// Internal organization ids behind an external one
    pub async fn internal_org_ids(&self, org: OrgId) -> Result<Vec<String>> {
        let search = format!("external_id = {}", org);
        let url = self.endpoint(
            "organizations",
            &[("search", search.as_str()), ("fields", "id,external_id")],
        )?;
        let list: ItemList<Organization> = self.get(url).await?;

        let ids: Vec<String> = list.items.into_iter().filter_map(|o| o.id).collect();
        if ids.is_empty() {
            error!(org_id = %org, "organization doesn't have proper internal ID");
            return Err(AdvisorError::NotFound(org.to_string()));
        }
        if ids.len() > 1 {
            debug!(org_id = %org, internal = ids.len(), "more than one internal organization");
        }
        Ok(ids)
    }

    /// Active clusters of the organization, one entry per external cluster id
    pub async fn clusters_for_organization(&self, org: OrgId) -> Result<Vec<ClusterInfo>> {
        let org_ids = self.internal_org_ids(org).await?;
        let search = subscription_search(&org_ids);
        let size = self.page_size.to_string();

        let mut seen = HashSet::new();
        let mut clusters = Vec::new();
        for page in 1usize.. {
            let page_number = page.to_string();
            let url = self.endpoint(
                "subscriptions",
                &[
                    ("page", page_number.as_str()),
                    ("size", size.as_str()),
                    ("fields", "external_cluster_id,display_name,cluster_id,managed,status"),
                    ("search", search.as_str()),
                ],
            )?;
            let list: ItemList<Subscription> = self.get(url).await?;
            if list.size == 0 || list.items.is_empty() {
                break;
            }
            let last_page = list.items.len() < self.page_size;

            for item in list.items {
                let Some(id) = item.external_cluster_id.filter(|id| !id.is_empty()) else {
                    warn!(internal_id = ?item.id, "cluster has no external ID");
                    continue;
                };
                if uuid::Uuid::parse_str(&id).is_err() {
                    warn!(cluster = %id, "invalid cluster UUID");
                    continue;
                }
                if !seen.insert(id.clone()) {
                    continue;
                }
                let managed = item.managed.unwrap_or_else(|| {
                    warn!(cluster = %id, "cluster has no managed attribute");
                    false
                });
                let name = item.display_name.unwrap_or_else(|| id.clone());
                clusters.push(ClusterInfo::new(id, name, managed));
            }

            if last_page {
                break;
            }
        }

        info!(org_id = %org, clusters = clusters.len(), "active clusters read from AMS");
        Ok(clusters)
    }
}

#[async_trait]
impl ClusterInventory for AmsInventory {
    async fn active_clusters(&self, org: OrgId) -> Result<Vec<ClusterInfo>> {
        self.clusters_for_organization(org).await
    }
}
