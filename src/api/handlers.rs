use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::engine::dispatch::{TickMode, TickResponse};
use crate::types::{Agent, AgentId, Event, Finding, Message, Mission, MissionId};

const DEFAULT_FINDINGS_LIMIT: usize = 50;
const MAX_FINDINGS_LIMIT: usize = 200;

#[derive(Deserialize)]
pub struct CreateMissionRequest {
    pub objective: String,
}

#[derive(Deserialize, Default)]
pub struct TickRequest {
    #[serde(default)]
    pub mode: TickMode,
}

#[derive(Deserialize)]
pub struct InputRequest {
    pub response: String,
}

#[derive(Deserialize)]
pub struct FindingsQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct MissionResponse {
    #[serde(flatten)]
    pub mission: Mission,
    pub agent_count: usize,
    pub terminal_agents: usize,
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn create_mission(
    State(state): State<AppState>,
    Json(request): Json<CreateMissionRequest>,
) -> Result<Json<Mission>, ApiError> {
    let mission = state.dispatcher.launch_mission(&request.objective).await?;
    Ok(Json(mission))
}

pub async fn list_missions(State(state): State<AppState>) -> Result<Json<Vec<Mission>>, ApiError> {
    Ok(Json(state.storage.list_missions(None).await?))
}

pub async fn get_mission(
    State(state): State<AppState>,
    Path(id): Path<MissionId>,
) -> Result<Json<MissionResponse>, ApiError> {
    let mission = state
        .storage
        .get_mission(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("mission {} not found", id)))?;
    let agents = state.storage.get_mission_agents(id).await?;

    Ok(Json(MissionResponse {
        mission,
        agent_count: agents.len(),
        terminal_agents: agents.iter().filter(|a| a.is_terminal()).count(),
    }))
}

async fn require_mission(state: &AppState, id: MissionId) -> Result<(), ApiError> {
    match state.storage.get_mission(id).await? {
        Some(_) => Ok(()),
        None => Err(ApiError::NotFound(format!("mission {} not found", id))),
    }
}

pub async fn get_mission_agents(
    State(state): State<AppState>,
    Path(id): Path<MissionId>,
) -> Result<Json<Vec<Agent>>, ApiError> {
    require_mission(&state, id).await?;
    Ok(Json(state.storage.get_mission_agents(id).await?))
}

pub async fn get_mission_findings(
    State(state): State<AppState>,
    Path(id): Path<MissionId>,
    Query(query): Query<FindingsQuery>,
) -> Result<Json<Vec<Finding>>, ApiError> {
    require_mission(&state, id).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_FINDINGS_LIMIT)
        .min(MAX_FINDINGS_LIMIT);
    Ok(Json(state.storage.get_findings(id, limit).await?))
}

pub async fn get_mission_events(
    State(state): State<AppState>,
    Path(id): Path<MissionId>,
) -> Result<Json<Vec<Event>>, ApiError> {
    require_mission(&state, id).await?;
    Ok(Json(state.storage.get_events(id).await?))
}

pub async fn tick_mission(
    State(state): State<AppState>,
    Path(id): Path<MissionId>,
    headers: HeaderMap,
    request: Option<Json<TickRequest>>,
) -> Result<Json<TickResponse>, ApiError> {
    let caller = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous");
    if !state.rate_limiter.check(caller) {
        return Err(ApiError::RateLimited);
    }

    let mode = request.map(|Json(r)| r.mode).unwrap_or_default();
    Ok(Json(state.dispatcher.run_tick(id, mode).await?))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> Result<Json<Agent>, ApiError> {
    state
        .storage
        .get_agent(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("agent {} not found", id)))
}

pub async fn get_agent_messages(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> Result<Json<Vec<Message>>, ApiError> {
    if state.storage.get_agent(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("agent {} not found", id)));
    }
    Ok(Json(state.storage.get_messages(id).await?))
}

pub async fn respond_to_agent(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
    Json(request): Json<InputRequest>,
) -> Result<Json<Agent>, ApiError> {
    if request.response.trim().is_empty() {
        return Err(ApiError::BadRequest("response must not be empty".to_string()));
    }
    Ok(Json(
        state
            .dispatcher
            .respond_to_input(id, &request.response)
            .await?,
    ))
}

pub async fn pause_agent(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.dispatcher.pause_agent(id).await?))
}

pub async fn resume_agent(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.dispatcher.resume_agent(id).await?))
}
