//! RBAC permission aggregation
//!
//! Walks the paginated access feed of the authorization service and folds
//! it into a `PermissionIndex`. Every failure while walking the feed
//! degrades to "not authorized".

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::token::IDENTITY_HEADER;

/// Application whose permissions are folded
pub const APPLICATION: &str = "ocp-advisor";
/// Wildcard resource type / verb
pub const WILDCARD: &str = "*";
/// Page size requested from the access endpoint
pub const PAGE_LIMIT: u32 = 100;
/// Default bound on pages walked per check
pub const DEFAULT_MAX_PAGES: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RbacError {
    #[error("invalid RBAC url: {0}")]
    InvalidUrl(String),

    #[error("failed to call RBAC API: {0}")]
    Transport(String),

    #[error("RBAC API returned non-200 status: {0}")]
    Status(u16),

    #[error("unable to decode RBAC response: {0}")]
    Decode(String),

    #[error("RBAC feed exceeded {0} pages")]
    TooManyPages(usize),
}

// ============================================================================
// Wire format
// ============================================================================

/// Resource definition filter value: a single name or a list of names
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Scalar(String),
    List(Vec<String>),
}

impl Filter {
    fn into_vec(self) -> Vec<String> {
        match self {
            Filter::Scalar(s) => vec![s],
            Filter::List(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttributeFilter {
    #[serde(default)]
    pub key: String,
    pub value: Filter,
    #[serde(default)]
    pub operation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceDefinition {
    #[serde(rename = "attributeFilter")]
    pub attribute_filter: AttributeFilter,
}

/// One access control entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Acl {
    #[serde(default)]
    pub permission: String,
    #[serde(default, rename = "resourceDefinitions")]
    pub resource_definitions: Vec<ResourceDefinition>,
}

impl Acl {
    pub fn new(permission: impl Into<String>) -> Self {
        Self {
            permission: permission.into(),
            resource_definitions: Vec::new(),
        }
    }

    pub fn with_filter(mut self, key: &str, value: Filter) -> Self {
        self.resource_definitions.push(ResourceDefinition {
            attribute_filter: AttributeFilter {
                key: key.to_string(),
                value,
                operation: "equal".to_string(),
            },
        });
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageLinks {
    #[serde(default)]
    pub next: Option<String>,
}

/// One page of the access feed
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessPage {
    #[serde(default)]
    pub meta: PageMeta,
    #[serde(default)]
    pub links: PageLinks,
    #[serde(default)]
    pub data: Vec<Acl>,
}

impl AccessPage {
    fn next_link(&self) -> Option<&str> {
        self.links.next.as_deref().filter(|n| !n.is_empty())
    }
}

// ============================================================================
// Permission index
// ============================================================================

/// Resources a grant applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceScope {
    All,
    Named(BTreeSet<String>),
}

/// Verbs and resource scope granted for one resource type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub verbs: Vec<String>,
    pub scope: ResourceScope,
}

impl Default for Grant {
    fn default() -> Self {
        Self {
            verbs: Vec::new(),
            scope: ResourceScope::Named(BTreeSet::new()),
        }
    }
}

/// Permissions of one caller keyed by resource type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionIndex {
    grants: BTreeMap<String, Grant>,
}

impl PermissionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold access entries into the index.
    ///
    /// Entries with fewer than two `:` segments are skipped. Only entries of
    /// the advisor application whose resource type names recommendation
    /// results or an openshift resource, or is the wildcard, are kept.
    pub fn fold<I: IntoIterator<Item = Acl>>(&mut self, acls: I) {
        for acl in acls {
            let segments: Vec<&str> = acl.permission.split(':').collect();
            if segments.len() < 2 {
                warn!(acl = %acl.permission, "unexpected RBAC response");
                continue;
            }
            if segments[0] != APPLICATION {
                continue;
            }

            let resource_type = segments[1];
            if resource_type == WILDCARD {
                self.grants.insert(
                    WILDCARD.to_string(),
                    Grant {
                        verbs: Vec::new(),
                        scope: ResourceScope::All,
                    },
                );
                continue;
            }
            if !resource_type.contains("recommendation-results")
                && !resource_type.contains("openshift")
            {
                continue;
            }

            let grant = self.grants.entry(resource_type.to_string()).or_default();
            if let Some(verb) = segments.get(2).copied().filter(|v| !v.is_empty()) {
                if !grant.verbs.iter().any(|v| v.as_str() == verb) {
                    grant.verbs.push(verb.to_string());
                }
            }

            if acl.resource_definitions.is_empty() {
                grant.scope = ResourceScope::All;
            } else if let ResourceScope::Named(names) = &mut grant.scope {
                for definition in acl.resource_definitions {
                    names.extend(definition.attribute_filter.value.into_vec());
                }
            }
        }
    }

    pub fn from_acls<I: IntoIterator<Item = Acl>>(acls: I) -> Self {
        let mut index = Self::new();
        index.fold(acls);
        index
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn grant(&self, resource_type: &str) -> Option<&Grant> {
        self.grants.get(resource_type)
    }

    /// Verbs per resource type
    pub fn verbs(&self) -> BTreeMap<String, Vec<String>> {
        self.grants
            .iter()
            .map(|(k, g)| (k.clone(), g.verbs.clone()))
            .collect()
    }
}

// ============================================================================
// Feed and client
// ============================================================================

/// Source of access pages
#[async_trait]
pub trait PermissionFeed: Send + Sync {
    /// Fetch one page, forwarding the identity token verbatim
    async fn fetch_page(&self, url: &str, identity_token: &str) -> Result<AccessPage, RbacError>;
}

/// Access feed served by the authorization service over HTTP
pub struct HttpPermissionFeed {
    client: reqwest::Client,
}

impl HttpPermissionFeed {
    pub fn new(timeout: Duration) -> Result<Self, RbacError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RbacError::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PermissionFeed for HttpPermissionFeed {
    async fn fetch_page(&self, url: &str, identity_token: &str) -> Result<AccessPage, RbacError> {
        let response = self
            .client
            .get(url)
            .header(IDENTITY_HEADER, identity_token)
            .send()
            .await
            .map_err(|e| RbacError::Transport(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(RbacError::Status(status.as_u16()));
        }

        response
            .json::<AccessPage>()
            .await
            .map_err(|e| RbacError::Decode(e.to_string()))
    }
}

/// Split the configured service url into the first access page url and the
/// origin that relative `next` links are resolved against
pub fn access_urls(base: &str) -> Result<(String, String), RbacError> {
    let base = if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("https://{}", base)
    };
    let mut url = reqwest::Url::parse(&base).map_err(|e| RbacError::InvalidUrl(e.to_string()))?;

    let path = format!("{}/access/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("application", APPLICATION)
        .append_pair("limit", &PAGE_LIMIT.to_string());

    let origin = url.origin().ascii_serialization();
    Ok((url.to_string(), origin))
}

/// Authorization decisions for service accounts
#[derive(Clone)]
pub struct RbacClient {
    feed: Arc<dyn PermissionFeed>,
    access_url: String,
    origin: String,
    enforce: bool,
    max_pages: usize,
}

impl RbacClient {
    pub fn new(feed: Arc<dyn PermissionFeed>, base_url: &str, enforce: bool) -> Result<Self, RbacError> {
        let (access_url, origin) = access_urls(base_url)?;
        info!(url = %access_url, "RBAC access url");
        Ok(Self {
            feed,
            access_url,
            origin,
            enforce,
            max_pages: DEFAULT_MAX_PAGES,
        })
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Override the origin `next` links are resolved against
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into().trim_end_matches('/').to_string();
        self
    }

    pub fn is_enforcing(&self) -> bool {
        self.enforce
    }

    pub fn access_url(&self) -> &str {
        &self.access_url
    }

    /// Walk the feed and fold every page
    pub async fn permissions(&self, identity_token: &str) -> Result<PermissionIndex, RbacError> {
        let mut index = PermissionIndex::new();
        let mut url = self.access_url.clone();

        for page_number in 0..self.max_pages {
            let page = self.feed.fetch_page(&url, identity_token).await?;
            if page.meta.count == 0 {
                debug!(page = page_number, "no RBAC data for this user");
                return Ok(index);
            }

            let next = page.next_link().map(|n| format!("{}{}", self.origin, n));
            index.fold(page.data);

            match next {
                Some(next) => url = next,
                None => return Ok(index),
            }
        }

        Err(RbacError::TooManyPages(self.max_pages))
    }

    /// Whether the caller holds any advisor permission; failures deny
    pub async fn is_authorized(&self, identity_token: &str) -> bool {
        match self.permissions(identity_token).await {
            Ok(index) if !index.is_empty() => {
                info!(permissions = ?index.verbs(), "RBAC openshift permissions");
                true
            }
            Ok(_) => {
                debug!("account has no advisor permissions");
                false
            }
            Err(err) => {
                error!(error = %err, "RBAC permission check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned pages keyed by url and records every request
    #[derive(Default)]
    struct FakeFeed {
        pages: HashMap<String, Result<AccessPage, RbacError>>,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl FakeFeed {
        fn with_page(mut self, url: &str, page: Result<AccessPage, RbacError>) -> Self {
            self.pages.insert(url.to_string(), page);
            self
        }

        fn requests(&self) -> Vec<(String, String)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PermissionFeed for FakeFeed {
        async fn fetch_page(&self, url: &str, token: &str) -> Result<AccessPage, RbacError> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), token.to_string()));
            self.pages
                .get(url)
                .cloned()
                .unwrap_or(Err(RbacError::Status(404)))
        }
    }

    fn page(permissions: &[&str], next: Option<&str>) -> AccessPage {
        AccessPage {
            meta: PageMeta {
                count: permissions.len() as u64,
            },
            links: PageLinks {
                next: next.map(str::to_string),
            },
            data: permissions.iter().map(|p| Acl::new(*p)).collect(),
        }
    }

    const FIRST: &str = "http://rbac.local/api/rbac/v1/access/?application=ocp-advisor&limit=100";

    fn client(feed: Arc<FakeFeed>) -> RbacClient {
        RbacClient::new(feed, "http://rbac.local/api/rbac/v1", true).unwrap()
    }

    #[test]
    fn test_access_urls() {
        let (url, origin) = access_urls("rbac.local/api/rbac/v1").unwrap();
        assert_eq!(
            url,
            "https://rbac.local/api/rbac/v1/access/?application=ocp-advisor&limit=100"
        );
        assert_eq!(origin, "https://rbac.local");
    }

    #[test]
    fn test_fold_recommendation_results() {
        let index = PermissionIndex::from_acls(vec![Acl::new(
            "ocp-advisor:recommendation-results:read",
        )]);
        let mut expected = BTreeMap::new();
        expected.insert("recommendation-results".to_string(), vec!["read".to_string()]);
        assert_eq!(index.verbs(), expected);
        assert_eq!(
            index.grant("recommendation-results").unwrap().scope,
            ResourceScope::All
        );
    }

    #[test]
    fn test_fold_wildcard() {
        let index = PermissionIndex::from_acls(vec![Acl::new("ocp-advisor:*:*")]);
        let mut expected = BTreeMap::new();
        expected.insert("*".to_string(), Vec::<String>::new());
        assert_eq!(index.verbs(), expected);
    }

    #[test]
    fn test_fold_ignores_other_applications() {
        let index = PermissionIndex::from_acls(vec![
            Acl::new("inventory:hosts:read"),
            Acl::new("ocp-advisor:unrelated:read"),
        ]);
        assert!(index.is_empty());
    }

    #[test]
    fn test_bad_rbac_response_is_skipped() {
        let index = PermissionIndex::from_acls(vec![
            Acl::new("malformed"),
            Acl::new("ocp-advisor:recommendation-results:read"),
        ]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_fold_resource_filters() {
        let index = PermissionIndex::from_acls(vec![
            Acl::new("ocp-advisor:openshift.cluster:read")
                .with_filter("cluster.id", Filter::Scalar("c1".into())),
            Acl::new("ocp-advisor:openshift.cluster:write")
                .with_filter("cluster.id", Filter::List(vec!["c2".into(), "c3".into()])),
        ]);

        let grant = index.grant("openshift.cluster").unwrap();
        assert_eq!(grant.verbs, vec!["read".to_string(), "write".to_string()]);
        let ResourceScope::Named(names) = &grant.scope else {
            panic!("expected named scope");
        };
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_filter_decodes_scalar_and_list() {
        let acl: Acl = serde_json::from_value(serde_json::json!({
            "permission": "ocp-advisor:openshift.cluster:read",
            "resourceDefinitions": [
                {"attributeFilter": {"key": "id", "operation": "equal", "value": "c1"}},
                {"attributeFilter": {"key": "id", "operation": "in", "value": ["c2", "c3"]}}
            ]
        }))
        .unwrap();
        assert_eq!(acl.resource_definitions[0].attribute_filter.value, Filter::Scalar("c1".into()));
        assert_eq!(
            acl.resource_definitions[1].attribute_filter.value,
            Filter::List(vec!["c2".into(), "c3".into()])
        );
    }

    #[tokio::test]
    async fn test_pagination_follows_next_links() {
        let feed = Arc::new(
            FakeFeed::default()
                .with_page(
                    FIRST,
                    Ok(page(
                        &["ocp-advisor:recommendation-results:read"],
                        Some("/api/rbac/v1/access/?page=2"),
                    )),
                )
                .with_page(
                    "http://rbac.local/api/rbac/v1/access/?page=2",
                    Ok(page(&["ocp-advisor:openshift.cluster:read"], Some(""))),
                ),
        );
        let rbac = client(feed.clone());

        let index = rbac.permissions("token").await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(feed.requests().len(), 2);
        assert!(feed.requests().iter().all(|(_, token)| token == "token"));
        assert!(rbac.is_authorized("token").await);
    }

    #[tokio::test]
    async fn test_server_error_on_any_page_denies() {
        let feed = Arc::new(
            FakeFeed::default()
                .with_page(
                    FIRST,
                    Ok(page(
                        &["ocp-advisor:recommendation-results:read"],
                        Some("/api/rbac/v1/access/?page=2"),
                    )),
                )
                .with_page(
                    "http://rbac.local/api/rbac/v1/access/?page=2",
                    Err(RbacError::Status(500)),
                ),
        );
        let rbac = client(feed);

        assert_eq!(rbac.permissions("token").await, Err(RbacError::Status(500)));
        assert!(!rbac.is_authorized("token").await);
    }

    #[tokio::test]
    async fn test_empty_feed_denies() {
        let feed = Arc::new(FakeFeed::default().with_page(FIRST, Ok(page(&[], None))));
        let rbac = client(feed);
        assert!(!rbac.is_authorized("token").await);
        assert!(rbac.is_enforcing());
    }

    #[tokio::test]
    async fn test_looping_feed_is_bounded() {
        let feed = Arc::new(FakeFeed::default().with_page(
            FIRST,
            Ok(page(
                &["ocp-advisor:recommendation-results:read"],
                Some("/api/rbac/v1/access/?application=ocp-advisor&limit=100"),
            )),
        ));
        let rbac = client(feed.clone()).with_max_pages(5);

        assert_eq!(
            rbac.permissions("token").await,
            Err(RbacError::TooManyPages(5))
        );
        assert_eq!(feed.requests().len(), 5);
        assert!(!rbac.is_authorized("token").await);
    }
}
