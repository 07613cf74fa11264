//! Operational endpoints: liveness, registry reloads, usage-window maintenance and routing
//! diagnostics.
//!
//! None of these sit on the dispatch path. The diagnostic ones run the same probes dispatch does
//! (health, resources, ranking) and report what they find without forwarding anything.
use crate::AppState;
use crate::client::HttpClient;
use crate::errors::DispatchError;
use crate::health::HealthProbeResult;
use crate::ranking::Ranking;
use crate::registry::{ServerRecord, ServerType};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};
use url::Url;

const SERVICE_NAME: &str = "spillway";

pub fn router<T: HttpClient + Clone + Send + Sync + 'static>() -> Router<AppState<T>> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/config/reload", post(reload_config))
        .route("/config/refresh-cache", post(refresh_cache))
        .route("/admin/model-usage/stats", get(usage_stats))
        .route("/admin/model-usage/clear", post(clear_usage))
        .route("/admin/resource-monitor/config", get(monitor_config))
        .route("/admin/resource-monitor/memory", get(monitor_memory))
        .route("/admin/model-type/check/{model}", get(model_type_check))
        .route("/admin/model-type/overview", get(model_type_overview))
        .route("/admin/server-priority/check/{model}", get(server_priority_check))
        .route("/admin/server-priority/overview", get(server_priority_overview))
        .route("/admin/select/{model}", get(select))
}

fn success(data: Value) -> Json<Value> {
    Json(json!({
        "status": "success",
        "timestamp": Utc::now(),
        "data": data,
    }))
}

/// What a caller sees of a record in diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub id: u64,
    pub server_url: String,
    pub actual_model_name: String,
    #[serde(rename = "type")]
    pub server_type: ServerType,
    pub performance: f64,
    pub priority: u32,
    pub weight: u32,
    pub skip_resource_check: bool,
}

impl From<&ServerRecord> for ServerSummary {
    fn from(record: &ServerRecord) -> Self {
        Self {
            id: record.id,
            server_url: record.server_url.to_string(),
            actual_model_name: record.actual_model_name.clone(),
            server_type: record.server_type,
            performance: record.performance_gb,
            priority: record.priority,
            weight: record.weight,
            skip_resource_check: record.skip_resource_check,
        }
    }
}

/// Human label for a priority tier.
pub fn tier_label(priority: u32) -> String {
    match priority {
        1 => "primary".to_owned(),
        2 => "fallback".to_owned(),
        n => format!("priority {n}"),
    }
}

#[instrument(skip(state))]
async fn health<T: HttpClient + Clone + Send + Sync>(State(state): State<AppState<T>>) -> Response {
    match state.dispatcher.registry().stats().await {
        Ok(stats) => Json(json!({
            "status": "healthy",
            "timestamp": Utc::now(),
            "version": env!("CARGO_PKG_VERSION"),
            "servers_count": stats.total_servers,
        }))
        .into_response(),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unhealthy", "error": e.to_string()})),
            )
                .into_response()
        }
    }
}

fn format_uptime(secs: u64) -> String {
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[instrument(skip(state))]
async fn status<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
) -> Result<Json<Value>, DispatchError> {
    let stats = state.dispatcher.registry().stats().await?;
    let uptime = state.started_at.elapsed().as_secs();
    Ok(Json(json!({
        "service_name": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": format_uptime(uptime),
        "uptime_seconds": uptime,
        "active_servers": stats.enabled_servers,
        "total_servers": stats.total_servers,
        "virtual_models": stats.virtual_models,
    })))
}

#[instrument(skip(state))]
async fn reload_config<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
) -> Result<Json<Value>, DispatchError> {
    info!("Registry reload requested");
    let registry = state.dispatcher.registry();
    let records = registry.reload().await?;
    let models = registry.virtual_models().await?.len();
    Ok(Json(json!({
        "status": "success",
        "message": "registry reloaded",
        "timestamp": Utc::now(),
        "records": records,
        "servers_loaded": models,
    })))
}

#[instrument(skip(state))]
async fn refresh_cache<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
) -> Result<Json<Value>, DispatchError> {
    let stats = state.dispatcher.registry().stats().await?;
    Ok(Json(json!({
        "status": "success",
        "message": "registry is read on every request, nothing to refresh",
        "timestamp": Utc::now(),
        "total_servers": stats.total_servers,
        "enabled_servers": stats.enabled_servers,
        "disabled_servers": stats.disabled_servers,
        "virtual_models": stats.virtual_models,
    })))
}

async fn usage_stats<T: HttpClient + Clone + Send + Sync>(State(state): State<AppState<T>>) -> Json<Value> {
    success(json!(state.dispatcher.gate().stats()))
}

#[instrument(skip(state))]
async fn clear_usage<T: HttpClient + Clone + Send + Sync>(State(state): State<AppState<T>>) -> Json<Value> {
    state.dispatcher.gate().clear();
    Json(json!({
        "status": "success",
        "message": "model usage history cleared",
        "timestamp": Utc::now(),
    }))
}

async fn monitor_config<T: HttpClient + Clone + Send + Sync>(State(state): State<AppState<T>>) -> Json<Value> {
    success(json!(state.dispatcher.gate().config()))
}

#[derive(Debug, Deserialize)]
struct MemoryQuery {
    server_url: Url,
    #[serde(rename = "type", default)]
    server_type: ServerType,
}

#[instrument(skip(state))]
async fn monitor_memory<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
    Query(query): Query<MemoryQuery>,
) -> Response {
    let gate = state.dispatcher.gate();
    let data = match query.server_type {
        ServerType::Cpu => gate
            .memory_info(&query.server_url, ServerType::Cpu)
            .await
            .map(|info| json!(info)),
        ServerType::Gpu => gate
            .gpu_memory_info(&query.server_url)
            .await
            .map(|info| json!(info)),
    };
    match data {
        Some(data) => success(data).into_response(),
        None => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "status": "error",
                "message": format!("resource monitor for {} did not answer", query.server_url),
                "timestamp": Utc::now(),
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ProbedServer {
    #[serde(flatten)]
    server: ServerSummary,
    is_healthy: bool,
    health_check_time: f64,
}

#[derive(Debug, Default, Serialize)]
struct TypeGroup {
    count: usize,
    healthy_count: usize,
    servers: Vec<ProbedServer>,
}

#[derive(Debug, Serialize)]
struct TypeRecommendation {
    recommended_type: ServerType,
    reason: String,
    best_server: Option<ServerSummary>,
}

fn no_servers(model: &str) -> Json<Value> {
    Json(json!({
        "status": "error",
        "message": format!("virtual model {model} has no active servers configured"),
        "timestamp": Utc::now(),
        "model_name": model,
    }))
}

/// Probe every server of `model` and recommend the type of the best healthy one.
#[instrument(skip(state))]
async fn model_type_check<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
    Path(model): Path<String>,
) -> Result<Json<Value>, DispatchError> {
    let servers = state.dispatcher.registry().active_servers(Some(model.as_str())).await?;
    if servers.is_empty() {
        return Ok(no_servers(&model));
    }

    let prober = state.dispatcher.prober();
    let probes: Vec<HealthProbeResult> = join_all(
        servers
            .iter()
            .map(|s| prober.probe(&s.server_url, &s.actual_model_name)),
    )
    .await;

    let mut groups: BTreeMap<ServerType, TypeGroup> = BTreeMap::new();
    let mut best: Option<&ServerRecord> = None;
    let mut healthy = 0;
    for (server, probe) in servers.iter().zip(probes) {
        let group = groups.entry(server.server_type).or_default();
        group.count += 1;
        if probe.healthy {
            group.healthy_count += 1;
            healthy += 1;
            let rank = |s: &ServerRecord| (s.priority, Reverse(s.weight));
            if best.is_none_or(|b| rank(server) < rank(b)) {
                best = Some(server);
            }
        }
        group.servers.push(ProbedServer {
            server: server.into(),
            is_healthy: probe.healthy,
            health_check_time: probe.latency_seconds,
        });
    }

    let recommendation = match best {
        Some(best) => Some(TypeRecommendation {
            recommended_type: best.server_type,
            reason: format!(
                "best healthy server by priority ({}) and weight ({})",
                best.priority, best.weight
            ),
            best_server: Some(best.into()),
        }),
        // Ties go to the type listed first.
        None => groups
            .iter()
            .rev()
            .max_by_key(|(_, group)| group.count)
            .map(|(server_type, group)| TypeRecommendation {
                recommended_type: *server_type,
                reason: format!(
                    "no healthy server, recommending the most configured type ({} servers)",
                    group.count
                ),
                best_server: None,
            }),
    };

    Ok(Json(json!({
        "status": "success",
        "timestamp": Utc::now(),
        "model_name": model,
        "total_servers": servers.len(),
        "healthy_servers": healthy,
        "server_types": groups,
        "recommendation": recommendation,
    })))
}

/// Group active servers by virtual model, keeping the registry's model order.
async fn servers_by_model<T: HttpClient + Clone + Send + Sync>(
    state: &AppState<T>,
) -> Result<Vec<(String, Vec<ServerRecord>)>, DispatchError> {
    let registry = state.dispatcher.registry();
    let servers = registry.active_servers(None).await?;
    Ok(registry
        .virtual_models()
        .await?
        .into_iter()
        .map(|model| {
            let members = servers
                .iter()
                .filter(|s| s.virtual_model_name == model)
                .cloned()
                .collect();
            (model, members)
        })
        .collect())
}

#[instrument(skip(state))]
async fn model_type_overview<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
) -> Result<Json<Value>, DispatchError> {
    let by_model = servers_by_model(&state).await?;

    let mut summary: BTreeMap<ServerType, (usize, usize)> =
        [(ServerType::Cpu, (0, 0)), (ServerType::Gpu, (0, 0))].into_iter().collect();
    let mut models = serde_json::Map::new();
    for (model, servers) in &by_model {
        let mut types: BTreeMap<ServerType, usize> = BTreeMap::new();
        for server in servers {
            *types.entry(server.server_type).or_default() += 1;
        }
        let primary = types.iter().rev().max_by_key(|(_, count)| **count).map(|(t, c)| (*t, *c));
        if let Some((primary_type, count)) = primary
            && let Some((model_count, server_count)) = summary.get_mut(&primary_type)
        {
            *model_count += 1;
            *server_count += count;
        }
        models.insert(
            model.clone(),
            json!({
                "total_servers": servers.len(),
                "types": types,
                "primary_type": primary.map(|(t, _)| t),
            }),
        );
    }

    let type_summary: BTreeMap<ServerType, Value> = summary
        .into_iter()
        .map(|(t, (models, servers))| (t, json!({"models": models, "servers": servers})))
        .collect();
    Ok(success(json!({
        "total_models": by_model.len(),
        "models": models,
        "type_summary": type_summary,
    })))
}

fn priority_analysis(ranking: &Ranking) -> Value {
    let counts: BTreeMap<String, usize> = ranking
        .tiers()
        .iter()
        .map(|tier| (tier.priority.to_string(), tier.len()))
        .collect();
    json!({
        "total_priorities": ranking.tiers().len(),
        "available_priorities": ranking.tiers().iter().map(|t| t.priority).collect::<Vec<_>>(),
        "servers_per_priority": counts,
    })
}

/// Walk the retry order with the same gating dispatch applies and report where a request for
/// `model` would land right now.
#[instrument(skip(state))]
async fn server_priority_check<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
    Path(model): Path<String>,
) -> Result<Json<Value>, DispatchError> {
    let servers = state.dispatcher.registry().active_servers(Some(model.as_str())).await?;
    if servers.is_empty() {
        return Ok(no_servers(&model));
    }
    let ranking = Ranking::new(servers);

    let mut selected = None;
    for server in ranking.full_order() {
        match state.dispatcher.admit(&server, &model).await {
            Ok(()) => {
                selected = Some(server);
                break;
            }
            Err(reason) => info!("Priority check passed over {}: {}", server.server_url, reason),
        }
    }

    Ok(Json(match selected {
        Some(server) => json!({
            "status": "success",
            "timestamp": Utc::now(),
            "model_name": model,
            "current_priority": server.priority,
            "server_type": tier_label(server.priority),
            "selected_server": ServerSummary::from(&server),
            "priority_analysis": priority_analysis(&ranking),
        }),
        None => json!({
            "status": "warning",
            "message": format!("no server of {model} is currently available"),
            "timestamp": Utc::now(),
            "model_name": model,
            "current_priority": null,
            "server_type": null,
            "selected_server": null,
            "priority_analysis": priority_analysis(&ranking),
        }),
    }))
}

#[instrument(skip(state))]
async fn server_priority_overview<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
) -> Result<Json<Value>, DispatchError> {
    let by_model = servers_by_model(&state).await?;

    let (mut primary, mut fallback, mut other) = (0, 0, 0);
    let mut models = serde_json::Map::new();
    for (model, servers) in &by_model {
        let mut distribution: BTreeMap<String, usize> = BTreeMap::new();
        for server in servers {
            *distribution.entry(server.priority.to_string()).or_default() += 1;
        }
        let current = servers.iter().map(|s| s.priority).min();
        match current {
            Some(1) => primary += 1,
            Some(2) => fallback += 1,
            Some(_) => other += 1,
            None => {}
        }
        models.insert(
            model.clone(),
            json!({
                "total_servers": servers.len(),
                "priority_distribution": distribution,
                "current_priority": current,
                "server_type": current.map(tier_label),
            }),
        );
    }

    Ok(success(json!({
        "total_models": by_model.len(),
        "priority_summary": {
            "1": {"models": primary, "description": tier_label(1)},
            "2": {"models": fallback, "description": tier_label(2)},
            "other": {"models": other, "description": "other priorities"},
        },
        "models": models,
    })))
}

/// Single-pick selection: the healthy server a weighted draw over the best live tier lands on.
#[instrument(skip(state))]
async fn select<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
    Path(model): Path<String>,
) -> Result<Response, DispatchError> {
    let servers = state.dispatcher.registry().active_servers(Some(model.as_str())).await?;
    if servers.is_empty() {
        return Err(DispatchError::NoServersConfigured { model });
    }

    let selection = Ranking::new(servers).pick_one(state.dispatcher.prober()).await;
    Ok(match selection {
        Some(selection) => success(json!({
            "model_name": model,
            "tier": tier_label(selection.server.priority),
            "server": ServerSummary::from(&selection.server),
            "health": selection.health,
        }))
        .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "message": format!("no healthy server available for {model}"),
                "timestamp": Utc::now(),
                "model_name": model,
            })),
        )
            .into_response(),
    })
}
