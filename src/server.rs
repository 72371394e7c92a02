//! HTTP control surface for the running agent: status, task management,
//! capability toggles, and goals. Everything sits behind bearer-token auth
//! unless auth is explicitly disabled.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::agent::actions::ActionEntry;
use crate::agent::goals::Goal;
use crate::agent::tasks::{Capability, ResetReport, TaskSnapshot};
use crate::agent::{AgentStatus, AutonomousAgent};
use crate::config::CompanionConfig;

#[derive(Clone)]
pub struct ServerState {
    pub agent: Arc<AutonomousAgent>,
    pub auth: ApiAuthConfig,
}

#[derive(Debug, Clone)]
pub struct ApiAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ListActionsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SetCapabilityRequest {
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct SetCapabilityResponse {
    capability: String,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct CreateGoalRequest {
    description: String,
    category: Option<String>,
    priority: Option<u8>,
}

#[derive(Debug, Serialize)]
struct CreateGoalResponse {
    goal_id: String,
}

#[derive(Debug, Deserialize)]
struct CompleteGoalRequest {
    outcome: String,
}

#[derive(Debug, Serialize)]
struct RemoveTaskResponse {
    removed: bool,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopped: bool,
}

#[derive(Debug, Serialize)]
struct OptimizeResponse {
    adjustments: Vec<IntervalAdjustment>,
}

#[derive(Debug, Serialize)]
struct IntervalAdjustment {
    task_id: String,
    old_interval_secs: u64,
    new_interval_secs: u64,
}

pub async fn serve_api(config: &CompanionConfig, agent: Arc<AutonomousAgent>) -> Result<()> {
    let bind_addr = config
        .api_bind
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid api_bind '{}' (expected host:port)", config.api_bind))?;

    let auth = load_auth_config()?;
    let state = Arc::new(ServerState { agent, auth });

    let protected = Router::new()
        .route("/health", get(health))
        .route("/agent/status", get(get_status))
        .route("/agent/stop", post(stop_agent))
        .route("/tasks", get(list_tasks))
        .route("/tasks/reset", post(reset_all_failures))
        .route("/tasks/:id", delete(remove_task))
        .route("/tasks/:id/reset", post(reset_task_failures))
        .route("/tasks/optimize", post(optimize_intervals))
        .route("/capabilities/:name", put(set_capability))
        .route("/goals", get(list_goals).post(create_goal))
        .route("/goals/:id/complete", post(complete_goal))
        .route("/actions", get(list_actions))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let app = Router::new().nest("/v1", protected);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind control API to {}", bind_addr))?;
    tracing::info!("Control API listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Control API server failed")?;
    Ok(())
}

fn load_auth_config() -> Result<ApiAuthConfig> {
    let mode = parse_auth_mode(std::env::var("SOLACE_API_AUTH_MODE").ok())?;
    let token = std::env::var("SOLACE_API_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "SOLACE_API_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("API auth mode is disabled; all control routes are unauthenticated");
    }

    Ok(ApiAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid SOLACE_API_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &ApiAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_status(State(state): State<Arc<ServerState>>) -> Json<AgentStatus> {
    Json(state.agent.status().await)
}

async fn stop_agent(State(state): State<Arc<ServerState>>) -> Json<StopResponse> {
    state.agent.stop(true).await;
    Json(StopResponse { stopped: true })
}

async fn list_tasks(State(state): State<Arc<ServerState>>) -> Json<Vec<TaskSnapshot>> {
    Json(state.agent.task_snapshots().await)
}

async fn remove_task(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<String>,
) -> Result<Json<RemoveTaskResponse>, (StatusCode, String)> {
    if state.agent.remove_task(&task_id).await {
        Ok(Json(RemoveTaskResponse { removed: true }))
    } else {
        Err(not_found(format!("task '{}' not found", task_id)))
    }
}

async fn reset_task_failures(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<String>,
) -> Json<ResetReport> {
    Json(state.agent.reset_failures(Some(&task_id)).await)
}

async fn reset_all_failures(State(state): State<Arc<ServerState>>) -> Json<ResetReport> {
    Json(state.agent.reset_failures(None).await)
}

async fn optimize_intervals(State(state): State<Arc<ServerState>>) -> Json<OptimizeResponse> {
    let adjustments = state
        .agent
        .optimize_task_intervals()
        .await
        .into_iter()
        .map(|(task_id, old, new)| IntervalAdjustment {
            task_id,
            old_interval_secs: old,
            new_interval_secs: new,
        })
        .collect();
    Json(OptimizeResponse { adjustments })
}

async fn set_capability(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(body): Json<SetCapabilityRequest>,
) -> Result<Json<SetCapabilityResponse>, (StatusCode, String)> {
    let capability = Capability::from_str(&name)
        .map_err(|error| (StatusCode::BAD_REQUEST, error.to_string()))?;
    state.agent.set_capability(capability, body.enabled).await;
    Ok(Json(SetCapabilityResponse {
        capability: name,
        enabled: body.enabled,
    }))
}

async fn list_goals(State(state): State<Arc<ServerState>>) -> Json<Vec<Goal>> {
    Json(state.agent.active_goals().await)
}

async fn create_goal(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateGoalRequest>,
) -> Result<Json<CreateGoalResponse>, (StatusCode, String)> {
    let description = body.description.trim();
    if description.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "description cannot be empty".to_string(),
        ));
    }
    let category = body.category.as_deref().unwrap_or("manual");
    let priority = body.priority.unwrap_or(5);

    match state.agent.create_goal(description, category, priority).await {
        Some(goal_id) => Ok(Json(CreateGoalResponse { goal_id })),
        None => Err((
            StatusCode::CONFLICT,
            "maximum number of active goals reached".to_string(),
        )),
    }
}

async fn complete_goal(
    State(state): State<Arc<ServerState>>,
    Path(goal_id): Path<String>,
    Json(body): Json<CompleteGoalRequest>,
) -> Result<Json<Goal>, (StatusCode, String)> {
    match state.agent.complete_goal(&goal_id, &body.outcome).await {
        Some(goal) => Ok(Json(goal)),
        None => Err(not_found(format!("active goal '{}' not found", goal_id))),
    }
}

async fn list_actions(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListActionsQuery>,
) -> Json<Vec<ActionEntry>> {
    let limit = clamp_limit(query.limit, 20, 1, 100);
    Json(state.agent.recent_actions(limit).await)
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn required_auth(token: &str) -> ApiAuthConfig {
        ApiAuthConfig {
            mode: AuthMode::Required,
            token: Some(token.to_string()),
        }
    }

    fn bearer(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn matching_bearer_token_is_accepted() {
        let auth = required_auth("token-123");
        assert!(authorize(&bearer("Bearer token-123"), &auth).is_ok());
    }

    #[test]
    fn missing_or_wrong_token_is_rejected() {
        let auth = required_auth("token-123");
        assert!(authorize(&HeaderMap::new(), &auth).is_err());
        assert!(authorize(&bearer("Bearer wrong"), &auth).is_err());
        assert!(authorize(&bearer("token-123"), &auth).is_err());
    }

    #[test]
    fn disabled_mode_skips_the_check() {
        let auth = ApiAuthConfig {
            mode: AuthMode::Disabled,
            token: None,
        };
        assert!(authorize(&HeaderMap::new(), &auth).is_ok());
    }

    #[test]
    fn auth_mode_parsing_defaults_to_required() {
        assert_eq!(parse_auth_mode(None).unwrap(), AuthMode::Required);
        assert_eq!(
            parse_auth_mode(Some("enabled".to_string())).unwrap(),
            AuthMode::Required
        );
        assert_eq!(
            parse_auth_mode(Some("off".to_string())).unwrap(),
            AuthMode::Disabled
        );
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }
}
