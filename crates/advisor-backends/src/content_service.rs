//! Content service fetcher
//!
//! Pulls the full rule content list and swaps it into the shared
//! `ContentDirectory`. The refresh loop keeps the previous snapshot when a
//! fetch fails.

use advisor_core::{AdvisorError, Backend, ContentDirectory, Result, RuleContent};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Source of static rule content
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<RuleContent>>;
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    #[serde(default)]
    content: Vec<RuleContent>,
}

/// Content service reached over HTTP
pub struct ContentServiceClient {
    client: reqwest::Client,
    url: Url,
}

impl ContentServiceClient {
    pub fn new(base_endpoint: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(base_endpoint)
            .and_then(|base| base.join("content"))
            .map_err(|e| {
                AdvisorError::Internal(format!(
                    "invalid content service endpoint {}: {}",
                    base_endpoint, e
                ))
            })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdvisorError::Internal(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ContentSource for ContentServiceClient {
    async fn fetch_all(&self) -> Result<Vec<RuleContent>> {
        debug!(url = %self.url, "fetching rule content");
        let response = self.client.get(self.url.clone()).send().await.map_err(|e| {
            error!(url = %self.url, error = %e, "content service is unreachable");
            AdvisorError::ServiceUnavailable(Backend::ContentService)
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(AdvisorError::improper_status(
                Backend::ContentService,
                status.as_u16(),
            ));
        }

        let body: ContentResponse = response
            .json()
            .await
            .map_err(|e| AdvisorError::decode(Backend::ContentService, e))?;
        Ok(body.content)
    }
}

/// One refresh cycle; on failure the directory is left untouched
pub async fn refresh_once(source: &dyn ContentSource, directory: &ContentDirectory) -> Result<usize> {
    let rules = source.fetch_all().await?;
    let count = rules.len();
    directory.load(rules);
    Ok(count)
}

/// Refresh the directory now and then every `interval`
pub fn spawn_refresh_loop(
    source: Arc<dyn ContentSource>,
    directory: Arc<ContentDirectory>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match refresh_once(source.as_ref(), &directory).await {
                Ok(count) => info!(rules = count, "rule content refreshed"),
                Err(e) => error!(error = %e, "rule content refresh failed, keeping previous snapshot"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use advisor_core::{CompositeRuleId, ContentLookupError, RuleContentIndex};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakySource {
        fail: AtomicBool,
        rules: Vec<RuleContent>,
    }

    #[async_trait]
    impl ContentSource for FlakySource {
        async fn fetch_all(&self) -> Result<Vec<RuleContent>> {
            if self.fail.load(Ordering::SeqCst) {
                Err(AdvisorError::ServiceUnavailable(Backend::ContentService))
            } else {
                Ok(self.rules.clone())
            }
        }
    }

    #[test]
    fn test_content_url() {
        let client =
            ContentServiceClient::new("http://content:8082/api/v1/", Duration::from_secs(1))
                .unwrap();
        assert_eq!(client.url().as_str(), "http://content:8082/api/v1/content");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let source = FlakySource {
            fail: AtomicBool::new(false),
            rules: vec![RuleContent::new("a.b", "KEY", 2)],
        };
        let directory = ContentDirectory::new();
        let rule = CompositeRuleId::parse("a.b|KEY").unwrap();

        assert!(matches!(
            directory.get_content(&rule),
            Err(ContentLookupError::DirectoryTimeout)
        ));

        assert_eq!(refresh_once(&source, &directory).await.unwrap(), 1);
        assert!(directory.get_content(&rule).is_ok());

        source.fail.store(true, Ordering::SeqCst);
        assert!(refresh_once(&source, &directory).await.is_err());
        assert!(directory.get_content(&rule).is_ok());
    }

    #[tokio::test]
    async fn test_refresh_loop_loads_directory() {
        let source: Arc<dyn ContentSource> = Arc::new(FlakySource {
            fail: AtomicBool::new(false),
            rules: vec![RuleContent::new("a.b", "KEY", 2)],
        });
        let directory = Arc::new(ContentDirectory::new());

        let handle = spawn_refresh_loop(source, directory.clone(), Duration::from_secs(3600));
        for _ in 0..50 {
            if directory.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(directory.len(), 1);
    }
}
