//! Request middleware: identity, RBAC and request accounting
use crate::error::{ApiError, FORBIDDEN_RBAC};
use crate::AppState;
use advisor_auth::IDENTITY_HEADER;
use advisor_core::{AdvisorError, RequestContext};
use axum::body::Body;
use axum::extract::{FromRequestParts, MatchedPath, State};
use axum::http::request::Parts;
use axum::http::{Method, Request};
use axum::middleware::Next;
use axum::response::Response;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

/// Paths served without an identity
pub const NO_AUTH_PATHS: [&str; 3] = ["info", "metrics", "openapi.json"];

pub fn cors() -> CorsLayer {
    CorsLayer::permissive()
}

/// Caller identity placed in the request extensions by `authenticate`
#[derive(Debug, Clone)]
pub struct Caller(pub RequestContext);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .map(Caller)
            .ok_or_else(|| AdvisorError::Authentication("Missing auth token".into()).into())
    }
}

fn is_public(path: &str, api_prefix: &str) -> bool {
    let relative = path
        .strip_prefix(api_prefix.trim_end_matches('/'))
        .unwrap_or(path)
        .trim_matches('/');
    NO_AUTH_PATHS.contains(&relative)
}

/// Decode the identity header and, for service accounts, check RBAC
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if request.method() == Method::OPTIONS
        || is_public(request.uri().path(), &state.config.server.api_prefix)
    {
        return Ok(next.run(request).await);
    }

    let raw = request
        .headers()
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let identity = match state.decoder.decode(raw.as_deref()) {
        Ok(identity) => identity,
        Err(err) if state.config.server.auth => return Err(AdvisorError::from(err).into()),
        Err(err) => {
            // auth disabled: handlers needing an identity reject on their own
            debug!(error = %err, "no usable identity, authentication disabled");
            return Ok(next.run(request).await);
        }
    };

    if let Some(rbac) = &state.rbac {
        state.metrics.observe_identity_type(&identity.account_type);
        if identity.is_service_account() {
            let token = raw.as_deref().unwrap_or_default();
            if !rbac.is_authorized(token).await {
                state.metrics.observe_rejected_service_account();
                warn!(
                    org_id = %identity.org_id,
                    enforce = rbac.is_enforcing(),
                    "service account without advisor permissions"
                );
                if rbac.is_enforcing() {
                    return Err(ApiError::Forbidden(FORBIDDEN_RBAC.to_string()));
                }
            }
        }
    }

    let ctx = RequestContext::new(identity, raw.unwrap_or_default());
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

/// Count requests per matched route; unmatched requests are proxied
pub async fn track_requests(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "proxy".to_string());
    state.metrics.observe_request(&endpoint);
    next.run(request).await
}
