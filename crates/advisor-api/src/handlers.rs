//! API Handlers
//!
//! Each handler fetches raw data from the backends, loads the override
//! indices, and hands everything to the `ReconciliationEngine`.

use crate::error::{ApiError, Result, FORBIDDEN_INTERNAL_RULE};
use crate::middleware::Caller;
use crate::AppState;
use advisor_backends::load_overrides;
use advisor_core::{
    AdvisorError, ClusterInfo, ClusterName, CompositeRuleId, RequestContext, GATEWAY_VERSION,
};
use advisor_engine::{parse_bool_param, ImpactingFlag, ReportOptions};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info};

type QueryParams = Query<HashMap<String, String>>;

fn query<'a>(params: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    params.get(name).map(String::as_str)
}

/// Cluster names are UUIDs
fn validate_cluster(raw: &str) -> Result<ClusterName> {
    uuid::Uuid::parse_str(raw)
        .map_err(|e| AdvisorError::parsing("cluster", raw, e.to_string()))?;
    Ok(ClusterName::new(raw))
}

fn cluster_names(clusters: &[ClusterInfo]) -> Vec<ClusterName> {
    clusters.iter().map(|c| c.id.clone()).collect()
}

/// Internal rules are only served to allow-listed organizations
fn ensure_rule_access(state: &AppState, caller: &RequestContext, rule: &CompositeRuleId) -> Result<()> {
    let server = &state.config.server;
    if !(server.auth && server.enable_internal_rules_organizations) {
        return Ok(());
    }
    if state.engine.content().is_internal(&rule.rule_id)
        && !state.config.is_internal_rules_org(caller.org_id())
    {
        info!(org_id = %caller.org_id(), rule = %rule, "internal rule requested by foreign organization");
        return Err(ApiError::Forbidden(FORBIDDEN_INTERNAL_RULE.to_string()));
    }
    Ok(())
}

// ============================================================================
// Service endpoints
// ============================================================================

pub async fn info(State(state): State<AppState>) -> Json<Value> {
    let content_ready = state.engine.content().external_rule_ids().is_ok();
    Json(json!({
        "info": {
            "GatewayVersion": GATEWAY_VERSION,
            "ContentDirectoryReady": content_ready,
        },
        "status": "ok"
    }))
}

pub async fn metrics(State(state): State<AppState>) -> Result<Response> {
    let body = state
        .metrics
        .encode()
        .map_err(|e| AdvisorError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

// ============================================================================
// Reports
// ============================================================================

pub async fn cluster_report(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(cluster): Path<String>,
    Query(params): QueryParams,
) -> Result<Json<Value>> {
    let cluster = validate_cluster(&cluster)?;
    let options = ReportOptions {
        include_disabled: parse_bool_param("get_disabled", query(&params, "get_disabled"))?,
        managed: parse_bool_param("osd_eligible", query(&params, "osd_eligible"))?,
    };
    let org = caller.org_id();

    let report = state
        .aggregator
        .cluster_report(org, &caller.identity.user_id, &cluster)
        .await?;
    let overrides = load_overrides(
        &state.acks,
        state.aggregator.as_ref(),
        org,
        std::slice::from_ref(&cluster),
    )
    .await?;

    let view = state.engine.report(&cluster, &report, &overrides, options)?;
    debug!(org_id = %org, cluster = %cluster, count = view.meta.count, "report served");
    Ok(Json(json!({ "report": view, "status": "ok" })))
}

pub async fn cluster_rule_report(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((cluster, selector)): Path<(String, String)>,
    Query(params): QueryParams,
) -> Result<Json<Value>> {
    let cluster = validate_cluster(&cluster)?;
    let rule = CompositeRuleId::parse(&selector)?;
    let managed = parse_bool_param("osd_eligible", query(&params, "osd_eligible"))?;
    ensure_rule_access(&state, &caller, &rule)?;
    let org = caller.org_id();

    let report = state
        .aggregator
        .cluster_report(org, &caller.identity.user_id, &cluster)
        .await?;
    let hit = report
        .hits
        .iter()
        .find(|hit| hit.composite_rule_id().ok().as_ref() == Some(&rule))
        .ok_or(AdvisorError::RuleNotFound)?;

    let overrides = load_overrides(
        &state.acks,
        state.aggregator.as_ref(),
        org,
        std::slice::from_ref(&cluster),
    )
    .await?;

    let view = state.engine.rule_detail(&cluster, managed, hit, &overrides)?;
    Ok(Json(json!({ "report": view, "status": "ok" })))
}

// ============================================================================
// Recommendations
// ============================================================================

pub async fn recommendations(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(params): QueryParams,
) -> Result<Json<Value>> {
    let flag = ImpactingFlag::from_query(query(&params, "impacting"))?;
    let org = caller.org_id();

    let clusters = state.inventory.active_clusters(org).await?;
    let names = cluster_names(&clusters);
    let impacted = if names.is_empty() {
        HashMap::new()
    } else {
        state
            .aggregator
            .impacting_recommendations(org, &caller.identity.user_id, &names)
            .await?
    };
    let overrides = load_overrides(&state.acks, state.aggregator.as_ref(), org, &names).await?;

    let views = state
        .engine
        .recommendations(&clusters, &impacted, flag, &overrides)?;
    debug!(org_id = %org, rules = views.len(), "recommendation list served");
    Ok(Json(json!({ "recommendations": views, "status": "ok" })))
}

pub async fn rule_content(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(selector): Path<String>,
) -> Result<Json<Value>> {
    let rule = CompositeRuleId::parse(&selector)?;
    ensure_rule_access(&state, &caller, &rule)?;

    let acknowledged = state.acks.is_acknowledged(caller.org_id(), &rule).await?;
    let view = state.engine.content_with_user_data(&rule, acknowledged)?;
    Ok(Json(json!({ "content": view, "status": "ok" })))
}

pub async fn clusters_detail(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(selector): Path<String>,
) -> Result<Json<Value>> {
    let rule = CompositeRuleId::parse(&selector)?;
    ensure_rule_access(&state, &caller, &rule)?;
    let org = caller.org_id();

    let clusters = state.inventory.active_clusters(org).await?;
    let names = cluster_names(&clusters);
    let (impacted, disabled) = tokio::try_join!(
        state
            .aggregator
            .impacted_clusters_for_rule(org, &caller.identity.user_id, &rule, &names),
        state.aggregator.disabled_clusters_for_rule(org, &rule),
    )?;

    let detail = state
        .engine
        .clusters_detail(&rule, &clusters, impacted, disabled)?;
    Ok(Json(json!({
        "meta": { "rule_id": rule },
        "data": detail,
        "status": "ok"
    })))
}

// ============================================================================
// Cluster views
// ============================================================================

pub async fn cluster_list(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<Value>> {
    let org = caller.org_id();
    let clusters = state.inventory.active_clusters(org).await?;
    let names = cluster_names(&clusters);

    let recommendations = if names.is_empty() {
        HashMap::new()
    } else {
        state
            .aggregator
            .clusters_recommendations(org, &caller.identity.user_id, &names)
            .await?
    };
    let overrides = load_overrides(&state.acks, state.aggregator.as_ref(), org, &names).await?;

    let views = state
        .engine
        .cluster_list(&clusters, &recommendations, &overrides)?;
    Ok(Json(json!({
        "meta": { "count": views.len() },
        "data": views,
        "status": "ok"
    })))
}

pub async fn org_overview(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<Value>> {
    let org = caller.org_id();
    let clusters = state.inventory.active_clusters(org).await?;
    let names = cluster_names(&clusters);

    let reports = if names.is_empty() {
        HashMap::new()
    } else {
        state.aggregator.reports_for_clusters(org, &names).await?
    };
    let overrides = load_overrides(&state.acks, state.aggregator.as_ref(), org, &names).await?;

    let overview = state.engine.org_overview(&clusters, &reports, &overrides)?;
    Ok(Json(json!({
        "clusters_hit": overview.clusters_hit,
        "hit_by_risk": overview.hit_by_risk,
        "hit_by_tag": overview.hit_by_tag,
        "status": "ok"
    })))
}

// ============================================================================
// Acknowledgements
// ============================================================================

#[derive(Debug, Deserialize)]
struct AckCreateBody {
    rule_id: String,
    #[serde(default)]
    justification: String,
}

#[derive(Debug, Deserialize)]
struct AckUpdateBody {
    justification: String,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("client didn't provide valid request body: {}", e)))
}

pub async fn ack_list(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<Value>> {
    let acks = state.acks.list(caller.org_id()).await?;
    Ok(Json(json!({
        "meta": { "count": acks.len() },
        "data": acks
    })))
}

pub async fn ack_get(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(selector): Path<String>,
) -> Result<Json<Value>> {
    let ack = state.acks.get(caller.org_id(), &selector).await?;
    Ok(Json(json!(ack)))
}

pub async fn ack_create(
    State(state): State<AppState>,
    Caller(caller): Caller,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    let body: AckCreateBody = parse_body(&body)?;
    let outcome = state
        .acks
        .acknowledge(
            caller.org_id(),
            &caller.identity.user_id,
            &body.rule_id,
            &body.justification,
        )
        .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!(outcome.ack))))
}

pub async fn ack_update(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(selector): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    // selector errors win over body errors
    CompositeRuleId::parse(&selector)?;
    let body: AckUpdateBody = parse_body(&body)?;
    let ack = state
        .acks
        .update(
            caller.org_id(),
            &caller.identity.user_id,
            &selector,
            &body.justification,
        )
        .await?;
    Ok(Json(json!(ack)))
}

pub async fn ack_delete(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(selector): Path<String>,
) -> Result<StatusCode> {
    state.acks.delete(caller.org_id(), &selector).await?;
    Ok(StatusCode::NO_CONTENT)
}
