//! Proxy dispatcher
//!
//! Requests matching the route table are forwarded to the aggregator after
//! the route's request modifiers ran; anything else is answered with 404.
//! Response modifiers run on every upstream response.

use crate::error::{ApiError, Result, MAX_PROXY_BODY};
use crate::AppState;
use advisor_core::{
    AdvisorError, Backend, CompositeRuleId, ContentLookupError, RequestContext, RuleContentIndex,
};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, Method, Request, StatusCode};
use axum::response::Response;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Request on its way to the upstream. `path` has the api prefix stripped
/// and no leading slash.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Named captures of the matched route
    pub params: HashMap<String, String>,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into().trim_start_matches('/').to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Vec::new(),
            params: HashMap::new(),
        }
    }

    pub fn param(&self, name: &str) -> Result<&str> {
        self.params.get(name).map(String::as_str).ok_or_else(|| {
            ApiError::from(AdvisorError::parsing(name, "", "missing path parameter"))
        })
    }

    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// What request modifiers may consult
pub struct ProxyContext<'a> {
    pub caller: Option<&'a RequestContext>,
    pub content: &'a dyn RuleContentIndex,
}

pub trait RequestModifier: Send + Sync {
    fn apply(&self, request: &mut ProxyRequest, ctx: &ProxyContext<'_>) -> Result<()>;
}

pub trait ResponseModifier: Send + Sync {
    fn apply(&self, response: &mut ProxyResponse) -> Result<()>;
}

/// Where forwarded requests end up
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, request: ProxyRequest) -> std::result::Result<ProxyResponse, AdvisorError>;
}

// ============================================================================
// Modifiers
// ============================================================================

/// Rejects requests whose `rule_id`/`error_key` parameters have no content
pub struct CheckRuleContent;

impl RequestModifier for CheckRuleContent {
    fn apply(&self, request: &mut ProxyRequest, ctx: &ProxyContext<'_>) -> Result<()> {
        let rule_id = request.param("rule_id")?;
        let error_key = request.param("error_key")?;
        let rule = CompositeRuleId::from_parts(rule_id, error_key)?;

        match ctx.content.get_content(&rule) {
            Ok(_) => Ok(()),
            Err(ContentLookupError::NotFound(_)) => Err(AdvisorError::NotFound(format!(
                "{}/{}",
                rule.rule_id, rule.error_key
            ))
            .into()),
            Err(err) => Err(AdvisorError::from(err).into()),
        }
    }
}

/// Rewrites the path from a template. `{org_id}` and `{user_id}` come from
/// the caller's identity, every other placeholder from the route params.
pub struct RewritePath {
    template: &'static str,
}

impl RewritePath {
    pub fn new(template: &'static str) -> Self {
        Self { template }
    }
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)\}").expect("valid placeholder regex"));

impl RequestModifier for RewritePath {
    fn apply(&self, request: &mut ProxyRequest, ctx: &ProxyContext<'_>) -> Result<()> {
        let caller = ctx.caller.ok_or_else(|| {
            ApiError::from(AdvisorError::Authentication("Missing auth token".into()))
        })?;

        let mut missing = None;
        let path = PLACEHOLDER.replace_all(self.template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match name {
                "org_id" => caller.identity.org_id.to_string(),
                "user_id" => caller.identity.user_id.to_string(),
                other => match request.params.get(other) {
                    Some(value) => value.clone(),
                    None => {
                        missing = Some(other.to_string());
                        String::new()
                    }
                },
            }
        });
        if let Some(name) = missing {
            return Err(AdvisorError::parsing(name, "", "missing path parameter").into());
        }

        debug!(from = %request.path, to = %path, "rewriting proxied path");
        request.path = path.into_owned();
        Ok(())
    }
}

/// Drops headers that do not survive re-buffering of the body
pub struct StripHopHeaders;

impl ResponseModifier for StripHopHeaders {
    fn apply(&self, response: &mut ProxyResponse) -> Result<()> {
        let hop: [HeaderName; 3] = [
            header::CONNECTION,
            header::TRANSFER_ENCODING,
            header::CONTENT_LENGTH,
        ];
        for name in hop.iter() {
            response.headers.remove(name);
        }
        Ok(())
    }
}

// ============================================================================
// Route table
// ============================================================================

pub struct ProxyRoute {
    pattern: Regex,
    methods: Vec<Method>,
    modifiers: Vec<Arc<dyn RequestModifier>>,
}

impl ProxyRoute {
    /// `pattern` is matched against the prefix-stripped path; named groups
    /// become request params
    pub fn new(pattern: &str, methods: &[Method]) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            methods: methods.to_vec(),
            modifiers: Vec::new(),
        })
    }

    pub fn with_modifier(mut self, modifier: impl RequestModifier + 'static) -> Self {
        self.modifiers.push(Arc::new(modifier));
        self
    }

    fn captures(&self, method: &Method, path: &str) -> Option<HashMap<String, String>> {
        if !self.methods.is_empty() && !self.methods.contains(method) {
            return None;
        }
        let caps = self.pattern.captures(path)?;
        Some(
            self.pattern
                .capture_names()
                .flatten()
                .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
                .collect(),
        )
    }
}

pub struct ProxyDispatcher {
    upstream: Arc<dyn Upstream>,
    routes: Vec<ProxyRoute>,
    response_modifiers: Vec<Arc<dyn ResponseModifier>>,
}

impl ProxyDispatcher {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            upstream,
            routes: Vec::new(),
            response_modifiers: Vec::new(),
        }
    }

    pub fn with_route(mut self, route: ProxyRoute) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_response_modifier(mut self, modifier: impl ResponseModifier + 'static) -> Self {
        self.response_modifiers.push(Arc::new(modifier));
        self
    }

    /// Dispatcher with the rule feedback routes of the aggregator
    pub fn with_default_routes(upstream: Arc<dyn Upstream>) -> std::result::Result<Self, regex::Error> {
        let vote = ProxyRoute::new(
            r"^clusters/(?P<cluster>[^/]+)/rules/(?P<rule_id>[^/]+)/error_key/(?P<error_key>[^/]+)/(?P<action>like|dislike|reset_vote|get_vote)$",
            &[Method::GET, Method::PUT],
        )?
        .with_modifier(CheckRuleContent)
        .with_modifier(RewritePath::new(
            "clusters/{cluster}/rules/{rule_id}/error_key/{error_key}/users/{user_id}/{action}",
        ));

        let toggle = ProxyRoute::new(
            r"^clusters/(?P<cluster>[^/]+)/rules/(?P<rule_id>[^/]+)/error_key/(?P<error_key>[^/]+)/(?P<action>disable|enable|disable_feedback)$",
            &[Method::PUT, Method::POST],
        )?
        .with_modifier(CheckRuleContent)
        .with_modifier(RewritePath::new(
            "clusters/{cluster}/rules/{rule_id}/error_key/{error_key}/organizations/{org_id}/users/{user_id}/{action}",
        ));

        Ok(Self::new(upstream)
            .with_route(vote)
            .with_route(toggle)
            .with_response_modifier(StripHopHeaders))
    }

    /// Run the matching route's request modifiers, forward, then run the
    /// response modifiers. Requests outside the route table never reach
    /// the upstream.
    pub async fn dispatch(
        &self,
        mut request: ProxyRequest,
        ctx: &ProxyContext<'_>,
    ) -> Result<ProxyResponse> {
        let Some((route, params)) = self
            .routes
            .iter()
            .find_map(|r| r.captures(&request.method, &request.path).map(|p| (r, p)))
        else {
            debug!(method = %request.method, path = %request.path, "no proxy route");
            return Err(ApiError::UnknownEndpoint(request.path));
        };

        request.params = params;
        for modifier in &route.modifiers {
            modifier.apply(&mut request, ctx)?;
        }

        info!(method = %request.method, path = %request.path, "handling request as a proxy");
        let mut response = self.upstream.forward(request).await?;
        for modifier in &self.response_modifiers {
            modifier.apply(&mut response)?;
        }
        Ok(response)
    }
}

// ============================================================================
// HTTP upstream
// ============================================================================

/// Aggregator reached over HTTP
pub struct HttpUpstream {
    client: reqwest::Client,
    base: String,
}

impl HttpUpstream {
    pub fn new(base_endpoint: &str, timeout: Duration) -> std::result::Result<Self, AdvisorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdvisorError::Internal(format!("failed to create HTTP client: {}", e)))?;
        let base = if base_endpoint.ends_with('/') {
            base_endpoint.to_string()
        } else {
            format!("{}/", base_endpoint)
        };
        Ok(Self { client, base })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, request: ProxyRequest) -> std::result::Result<ProxyResponse, AdvisorError> {
        let url = format!("{}{}", self.base, request.path_and_query());
        let mut headers = request.headers;
        headers.remove(header::HOST);

        let mut builder = self.client.request(request.method, &url).headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| {
            error!(url = %url, error = %e, "proxied request failed");
            AdvisorError::ServiceUnavailable(Backend::Aggregator)
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|_| AdvisorError::ServiceUnavailable(Backend::Aggregator))?;

        Ok(ProxyResponse {
            status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            headers,
            body: body.to_vec(),
        })
    }
}

// ============================================================================
// Fallback handler
// ============================================================================

pub async fn proxy_handler(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Result<Response> {
    let caller = request.extensions().get::<RequestContext>().cloned();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let path = strip_prefix(uri.path(), &state.config.server.api_prefix);

    let mut proxied = ProxyRequest::new(method, path);
    proxied.query = uri.query().map(str::to_string);
    proxied.headers = request.headers().clone();

    let declared = proxied
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > MAX_PROXY_BODY) {
        return Err(ApiError::PayloadTooLarge(MAX_PROXY_BODY));
    }
    proxied.body = axum::body::to_bytes(request.into_body(), MAX_PROXY_BODY)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read request body: {}", e)))?
        .to_vec();

    let ctx = ProxyContext {
        caller: caller.as_ref(),
        content: state.engine.content().as_ref(),
    };
    let response = state.proxy.dispatch(proxied, &ctx).await?;

    let mut builder = Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(response.headers);
    }
    builder
        .body(Body::from(response.body))
        .map_err(|e| AdvisorError::Internal(format!("failed to build response: {}", e)).into())
}

/// Path relative to the api prefix; nested routers already strip it
fn strip_prefix<'a>(path: &'a str, api_prefix: &str) -> &'a str {
    path.strip_prefix(api_prefix.trim_end_matches('/'))
        .unwrap_or(path)
        .trim_start_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use advisor_core::{ContentDirectory, Identity, OrgId, RuleContent, UserId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ProxyRequest>>,
    }

    #[async_trait]
    impl Upstream for Recorder {
        async fn forward(
            &self,
            request: ProxyRequest,
        ) -> std::result::Result<ProxyResponse, AdvisorError> {
            self.seen.lock().unwrap().push(request);
            let mut headers = HeaderMap::new();
            headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
            Ok(ProxyResponse {
                status: StatusCode::OK,
                headers,
                body: b"{}".to_vec(),
            })
        }
    }

    fn caller() -> RequestContext {
        RequestContext::new(Identity::new(OrgId(7), UserId::new("42")), "token")
    }

    fn content() -> ContentDirectory {
        ContentDirectory::with_rules(vec![RuleContent::new("a.b", "KEY", 2)])
    }

    #[tokio::test]
    async fn test_vote_is_rewritten_with_user() {
        let upstream = Arc::new(Recorder::default());
        let dispatcher = ProxyDispatcher::with_default_routes(upstream.clone()).unwrap();
        let caller = caller();
        let content = content();
        let ctx = ProxyContext {
            caller: Some(&caller),
            content: &content,
        };

        let response = dispatcher
            .dispatch(
                ProxyRequest::new(Method::PUT, "/clusters/c1/rules/a.b/error_key/KEY/like"),
                &ctx,
            )
            .await
            .unwrap();

        assert!(response.headers.get(header::CONNECTION).is_none());
        let seen = upstream.seen.lock().unwrap();
        assert_eq!(
            seen[0].path,
            "clusters/c1/rules/a.b/error_key/KEY/users/42/like"
        );
    }

    #[tokio::test]
    async fn test_disable_injects_org() {
        let upstream = Arc::new(Recorder::default());
        let dispatcher = ProxyDispatcher::with_default_routes(upstream.clone()).unwrap();
        let caller = caller();
        let content = content();
        let ctx = ProxyContext {
            caller: Some(&caller),
            content: &content,
        };

        dispatcher
            .dispatch(
                ProxyRequest::new(Method::PUT, "clusters/c1/rules/a.b/error_key/KEY/disable"),
                &ctx,
            )
            .await
            .unwrap();

        let seen = upstream.seen.lock().unwrap();
        assert_eq!(
            seen[0].path,
            "clusters/c1/rules/a.b/error_key/KEY/organizations/7/users/42/disable"
        );
    }

    #[tokio::test]
    async fn test_unknown_rule_is_not_forwarded() {
        let upstream = Arc::new(Recorder::default());
        let dispatcher = ProxyDispatcher::with_default_routes(upstream.clone()).unwrap();
        let caller = caller();
        let content = content();
        let ctx = ProxyContext {
            caller: Some(&caller),
            content: &content,
        };

        let err = dispatcher
            .dispatch(
                ProxyRequest::new(Method::PUT, "clusters/c1/rules/x.y/error_key/NOPE/like"),
                &ctx,
            )
            .await
            .unwrap_err();

        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrouted_path_is_rejected() {
        let upstream = Arc::new(Recorder::default());
        let dispatcher = ProxyDispatcher::with_default_routes(upstream.clone()).unwrap();
        let caller = caller();
        let content = content();
        let ctx = ProxyContext {
            caller: Some(&caller),
            content: &content,
        };

        let mut request = ProxyRequest::new(Method::GET, "organizations/2/clusters");
        request.query = Some("limit=5".into());
        let err = dispatcher.dispatch(request, &ctx).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = dispatcher
            .dispatch(
                ProxyRequest::new(Method::DELETE, "clusters/c1/rules/a.b/error_key/KEY/like"),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix("/api/v2/organizations", "/api/v2/"), "organizations");
        assert_eq!(strip_prefix("/organizations", "/api/v2/"), "organizations");
    }
}
