//! Advisor Gateway API: REST endpoints under the configured api prefix
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod proxy;

use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::proxy::{HttpUpstream, ProxyDispatcher, Upstream};
use advisor_auth::{AuthTokenDecoder, HttpPermissionFeed, RbacClient};
use advisor_backends::{
    spawn_refresh_loop, AckStore, AggregatorApi, AggregatorInventory, AmsInventory,
    ClusterInventory, ContentServiceClient, FallbackInventory, HttpAggregator,
};
use advisor_core::{AdvisorError, ContentDirectory, RuleContentIndex};
use advisor_engine::ReconciliationEngine;
use axum::{
    middleware::from_fn_with_state,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Backend handles the server is assembled from
pub struct Backends {
    pub aggregator: Arc<dyn AggregatorApi>,
    pub inventory: Arc<dyn ClusterInventory>,
    pub content: Arc<dyn RuleContentIndex>,
    pub upstream: Arc<dyn Upstream>,
    pub rbac: Option<RbacClient>,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub decoder: AuthTokenDecoder,
    pub rbac: Option<RbacClient>,
    pub aggregator: Arc<dyn AggregatorApi>,
    pub acks: AckStore,
    pub inventory: Arc<dyn ClusterInventory>,
    pub engine: ReconciliationEngine,
    pub proxy: Arc<ProxyDispatcher>,
    pub metrics: Arc<GatewayMetrics>,
}

impl AppState {
    pub fn new(config: GatewayConfig, backends: Backends) -> Result<Self, AdvisorError> {
        let decoder = AuthTokenDecoder::from_config(
            &config.server.auth_type,
            config.server.log_auth_token,
        )?;
        let metrics = GatewayMetrics::new().map_err(|e| AdvisorError::Internal(e.to_string()))?;
        let proxy = ProxyDispatcher::with_default_routes(backends.upstream)
            .map_err(|e| AdvisorError::Internal(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            decoder,
            rbac: backends.rbac,
            acks: AckStore::new(backends.aggregator.clone()),
            aggregator: backends.aggregator,
            inventory: backends.inventory,
            engine: ReconciliationEngine::new(backends.content),
            proxy: Arc::new(proxy),
            metrics: Arc::new(metrics),
        })
    }
}

pub fn create_app(state: AppState) -> Router {
    let api = Router::new()
        .route("/info", get(handlers::info))
        .route("/metrics", get(handlers::metrics))
        .route("/clusters", get(handlers::cluster_list))
        .route("/clusters/{cluster}/reports", get(handlers::cluster_report))
        .route(
            "/clusters/{cluster}/rules/{rule_selector}/report",
            get(handlers::cluster_rule_report),
        )
        .route("/rule", get(handlers::recommendations))
        .route("/rule/{rule_selector}/content", get(handlers::rule_content))
        .route(
            "/rule/{rule_selector}/clusters_detail",
            get(handlers::clusters_detail),
        )
        .route("/org_overview", get(handlers::org_overview))
        .route("/ack", get(handlers::ack_list).post(handlers::ack_create))
        .route(
            "/ack/{rule_selector}",
            get(handlers::ack_get)
                .put(handlers::ack_update)
                .delete(handlers::ack_delete),
        )
        .fallback(proxy::proxy_handler)
        .layer(from_fn_with_state(state.clone(), middleware::authenticate))
        .layer(from_fn_with_state(state.clone(), middleware::track_requests));

    let prefix = state.config.route_prefix().to_string();
    let cors = state.config.server.cors;
    let app = if prefix.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(&prefix, api)
    };
    let app = app.with_state(state).layer(TraceLayer::new_for_http());

    if cors {
        app.layer(middleware::cors())
    } else {
        app
    }
}

/// Wire the HTTP backends from configuration and start the content refresh loop
pub async fn build_state(config: GatewayConfig) -> Result<AppState, AdvisorError> {
    let timeout = config.services.request_timeout();

    let aggregator: Arc<dyn AggregatorApi> = Arc::new(HttpAggregator::new(
        &config.services.aggregator_base_endpoint,
        timeout,
    )?);
    let directory = Arc::new(ContentDirectory::new());
    let source = Arc::new(ContentServiceClient::new(
        &config.services.content_base_endpoint,
        timeout,
    )?);
    spawn_refresh_loop(
        source,
        directory.clone(),
        config.services.content_refresh_interval(),
    );

    let rbac = if config.server.use_rbac {
        let feed = Arc::new(
            HttpPermissionFeed::new(timeout).map_err(|e| AdvisorError::Internal(e.to_string()))?,
        );
        let mut client = RbacClient::new(feed, &config.rbac.url, config.rbac.enforce)
            .map_err(|e| AdvisorError::Internal(e.to_string()))?
            .with_max_pages(config.rbac.max_pages);
        if !config.rbac.host.is_empty() {
            client = client.with_origin(config.rbac.host.clone());
        }
        Some(client)
    } else {
        None
    };

    let aggregator_inventory: Arc<dyn ClusterInventory> =
        Arc::new(AggregatorInventory::new(aggregator.clone()));
    let inventory: Arc<dyn ClusterInventory> = if config.ams.is_enabled() {
        let ams = AmsInventory::new(&config.ams.url, Some(config.ams.token.clone()), timeout)?
            .with_page_size(config.ams.page_size);
        Arc::new(FallbackInventory::new(Arc::new(ams), aggregator_inventory))
    } else {
        tracing::warn!("AMS is not configured, clusters are treated as unmanaged");
        aggregator_inventory
    };

    let backends = Backends {
        inventory,
        upstream: Arc::new(HttpUpstream::new(
            &config.services.aggregator_base_endpoint,
            timeout,
        )?),
        aggregator,
        content: directory,
        rbac,
    };
    AppState::new(config, backends)
}

pub async fn run(config: GatewayConfig) -> std::io::Result<()> {
    let addr = config.server.address.clone();
    let state = build_state(config)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Advisor gateway listening on {}", addr);
    axum::serve(listener, app).await
}
