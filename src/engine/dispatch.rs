use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use crate::billing::Billing;
use crate::config::SchedulerConfig;
use crate::engine::completion::{CompletionTrigger, SynthesisOutcome, Synthesizer};
use crate::engine::generation::WorkGenerator;
use crate::engine::iteration::IterationEngine;
use crate::engine::reaper::StaleMissionReaper;
use crate::engine::scheduler::ClaimScheduler;
use crate::lifecycle::{AgentStateMachine, LifecycleEvent, Transition};
use crate::providers::search::SearchProvider;
use crate::providers::LLMProvider;
use crate::storage::Storage;
use crate::text::sanitize;
use crate::tools::runtime::{ToolConfig, ToolRuntime};
use crate::types::{
    Agent, AgentId, AgentStatus, Event, EventKind, Message, Mission, MissionId, MissionStatus,
};

const MISSION_OBJECTIVE_MAX_CHARS: usize = 2000;
const INPUT_MAX_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickMode {
    #[default]
    Iterate,
    Synthesize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    NoAgentAvailable,
    Iterated,
    /// The claimed agent finished, or the mission already is.
    Completed,
    WaitingForInput,
    InsufficientCredits,
    Synthesized,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickResponse {
    pub status: TickStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

impl TickResponse {
    fn bare(status: TickStatus) -> Self {
        Self {
            status,
            agent_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionTick {
    pub mission_id: MissionId,
    pub status: TickStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub reaped: Vec<MissionId>,
    pub ticks: Vec<MissionTick>,
    pub synthesized: Vec<MissionId>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("mission {0} not found")]
    MissionNotFound(MissionId),
    #[error("agent {0} not found")]
    AgentNotFound(AgentId),
    #[error("agent {0} is not waiting for input")]
    NotWaiting(AgentId),
    #[error("agent {agent_id} cannot be {action} while {status}")]
    InvalidTransition {
        agent_id: AgentId,
        action: &'static str,
        status: &'static str,
    },
    #[error("agent {0} is mid-iteration; retry once its tick finishes")]
    Claimed(AgentId),
    #[error("objective must not be empty")]
    EmptyObjective,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Single entry point for ticks and operator actions on missions.
pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    billing: Arc<dyn Billing>,
    scheduler: ClaimScheduler,
    engine: IterationEngine,
    trigger: CompletionTrigger,
    synthesizer: Synthesizer,
    reaper: StaleMissionReaper,
    claim_lease: chrono::Duration,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        llm_provider: Arc<dyn LLMProvider>,
        search_provider: Option<Arc<dyn SearchProvider>>,
        billing: Arc<dyn Billing>,
        config: SchedulerConfig,
    ) -> Self {
        let tool_runtime = Arc::new(ToolRuntime::new(ToolConfig { search_provider }));
        let generator = WorkGenerator::new(llm_provider.clone(), tool_runtime);

        Self {
            scheduler: ClaimScheduler::new(storage.clone(), config.claim_lease()),
            trigger: CompletionTrigger::new(storage.clone()),
            synthesizer: Synthesizer::new(
                storage.clone(),
                llm_provider.clone(),
                billing.clone(),
                config.claim_lease(),
            ),
            reaper: StaleMissionReaper::new(storage.clone(), config.mission_time_limit()),
            claim_lease: config.claim_lease(),
            engine: IterationEngine::new(
                storage.clone(),
                llm_provider,
                generator,
                billing.clone(),
                config,
            ),
            storage,
            billing,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub async fn launch_mission(&self, objective: &str) -> Result<Mission, DispatchError> {
        let objective = sanitize(objective, MISSION_OBJECTIVE_MAX_CHARS);
        if objective.is_empty() {
            return Err(DispatchError::EmptyObjective);
        }

        let mission = Mission::new(objective);
        let root = Agent::root(mission.id, mission.objective.clone());
        self.storage.create_mission(&mission).await?;
        self.storage.create_agent(&root).await?;
        self.storage
            .record_event(
                &Event::new(mission.id, Some(root.id), EventKind::MissionLaunched)
                    .with_detail(json!({ "objective": mission.objective })),
            )
            .await?;

        log::info!("Launched mission {} with root agent {}", mission.id, root.id);
        Ok(mission)
    }

    /// Runs one tick for a single mission.
    pub async fn run_tick(
        &self,
        mission_id: MissionId,
        mode: TickMode,
    ) -> Result<TickResponse, DispatchError> {
        let mission = self
            .storage
            .get_mission(mission_id)
            .await?
            .ok_or(DispatchError::MissionNotFound(mission_id))?;

        match mode {
            TickMode::Synthesize => self.synthesize(&mission).await,
            TickMode::Iterate => self.iterate(&mission).await,
        }
    }

    async fn synthesize(&self, mission: &Mission) -> Result<TickResponse, DispatchError> {
        let status = match self.synthesizer.synthesize(mission.id).await? {
            SynthesisOutcome::Synthesized { .. } => TickStatus::Synthesized,
            SynthesisOutcome::AlreadyCompleted => TickStatus::Completed,
            SynthesisOutcome::NotReady | SynthesisOutcome::InProgress => {
                TickStatus::NoAgentAvailable
            }
        };
        Ok(TickResponse::bare(status))
    }

    async fn iterate(&self, mission: &Mission) -> Result<TickResponse, DispatchError> {
        match mission.status {
            MissionStatus::Completed => return Ok(TickResponse::bare(TickStatus::Completed)),
            MissionStatus::Synthesizing => {
                return Ok(TickResponse::bare(TickStatus::NoAgentAvailable))
            }
            MissionStatus::Active => {}
        }

        match self.billing.has_credits(mission.id).await {
            Ok(true) => {}
            Ok(false) => {
                log::info!("Mission {} is out of credits; skipping tick", mission.id);
                return Ok(TickResponse::bare(TickStatus::InsufficientCredits));
            }
            Err(e) => {
                log::warn!("Credit check failed for mission {}: {}", mission.id, e);
                return Ok(TickResponse::bare(TickStatus::NoAgentAvailable));
            }
        }

        let Some(agent) = self.scheduler.claim_next_agent(mission.id).await else {
            // Waits can end outside a tick, so convergence is rechecked here too
            if let Err(e) = self.trigger.check(mission.id).await {
                log::warn!("Completion check failed for mission {}: {}", mission.id, e);
            }
            return Ok(TickResponse::bare(TickStatus::NoAgentAvailable));
        };
        let agent_id = agent.id;

        let outcome = match self.engine.process(agent).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Iteration failed for agent {}: {}", agent_id, e);
                self.contain_failure(mission.id, agent_id, &e).await;
                return Ok(TickResponse::bare(TickStatus::NoAgentAvailable));
            }
        };

        let status = match outcome.transition {
            _ if !outcome.applied => TickStatus::NoAgentAvailable,
            Transition::Complete { .. } => {
                if let Err(e) = self.trigger.check(mission.id).await {
                    log::warn!("Completion check failed for mission {}: {}", mission.id, e);
                }
                TickStatus::Completed
            }
            Transition::WaitingForInput { .. } => TickStatus::WaitingForInput,
            Transition::Continue => TickStatus::Iterated,
        };

        Ok(TickResponse {
            status,
            agent_id: Some(agent_id),
        })
    }

    async fn contain_failure(&self, mission_id: MissionId, agent_id: AgentId, error: &anyhow::Error) {
        if let Err(e) = self.storage.release_claim(agent_id).await {
            log::warn!("Failed to release claim on agent {}: {}", agent_id, e);
        }
        let event = Event::new(mission_id, Some(agent_id), EventKind::IterationFailed)
            .with_detail(json!({ "error": error.to_string() }));
        if let Err(e) = self.storage.record_event(&event).await {
            log::warn!("Failed to record failure for agent {}: {}", agent_id, e);
        }
    }

    /// Reaps stale missions, iterates every active mission concurrently, then
    /// synthesizes whatever is ready.
    pub async fn run_global_tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        match self.reaper.reap(Utc::now()).await {
            Ok(reaped) => report.reaped = reaped,
            Err(e) => log::warn!("Reaper pass failed: {}", e),
        }

        let active = self
            .storage
            .list_missions(Some(MissionStatus::Active))
            .await?;
        let ticks = join_all(active.iter().map(|m| self.iterate(m))).await;
        for (mission, tick) in active.iter().zip(ticks) {
            match tick {
                Ok(response) => report.ticks.push(MissionTick {
                    mission_id: mission.id,
                    status: response.status,
                    agent_id: response.agent_id,
                }),
                Err(e) => log::warn!("Tick failed for mission {}: {}", mission.id, e),
            }
        }

        let ready = self
            .storage
            .list_missions(Some(MissionStatus::Synthesizing))
            .await?;
        let outcomes = join_all(ready.iter().map(|m| self.synthesizer.synthesize(m.id))).await;
        for (mission, outcome) in ready.iter().zip(outcomes) {
            match outcome {
                Ok(SynthesisOutcome::Synthesized { .. }) => report.synthesized.push(mission.id),
                Ok(_) => {}
                Err(e) => log::warn!("Synthesis failed for mission {}: {}", mission.id, e),
            }
        }

        Ok(report)
    }

    async fn load_agent(&self, agent_id: AgentId) -> Result<Agent, DispatchError> {
        self.storage
            .get_agent(agent_id)
            .await?
            .ok_or(DispatchError::AgentNotFound(agent_id))
    }

    /// Answers a waiting agent's question and returns it to work.
    pub async fn respond_to_input(
        &self,
        agent_id: AgentId,
        response: &str,
    ) -> Result<Agent, DispatchError> {
        let mut agent = self.load_agent(agent_id).await?;
        if agent.status != AgentStatus::Waiting {
            return Err(DispatchError::NotWaiting(agent_id));
        }

        let question = agent.pending_input.take().unwrap_or_default();
        AgentStateMachine::transition(&mut agent, LifecycleEvent::InputReceived)?;

        let response = sanitize(response, INPUT_MAX_CHARS);
        self.storage
            .append_messages(
                agent_id,
                &[Message::user(format!(
                    "Answer to your question \"{}\": {}",
                    question, response
                ))],
            )
            .await?;
        self.storage.update_agent(&agent).await?;
        self.storage
            .record_event(&Event::new(agent.mission_id, Some(agent_id), EventKind::InputReceived))
            .await?;
        Ok(agent)
    }

    pub async fn pause_agent(&self, agent_id: AgentId) -> Result<Agent, DispatchError> {
        self.operator_transition(agent_id, LifecycleEvent::Paused, "paused")
            .await
    }

    pub async fn resume_agent(&self, agent_id: AgentId) -> Result<Agent, DispatchError> {
        self.operator_transition(agent_id, LifecycleEvent::Resumed, "resumed")
            .await
    }

    async fn operator_transition(
        &self,
        agent_id: AgentId,
        event: LifecycleEvent,
        action: &'static str,
    ) -> Result<Agent, DispatchError> {
        let mut agent = self.load_agent(agent_id).await?;
        if agent
            .claimed_at
            .is_some_and(|claimed| claimed > Utc::now() - self.claim_lease)
        {
            return Err(DispatchError::Claimed(agent_id));
        }
        let status = agent.status;
        if AgentStateMachine::transition(&mut agent, event).is_err() {
            return Err(DispatchError::InvalidTransition {
                agent_id,
                action,
                status: status.as_str(),
            });
        }
        self.storage.update_agent(&agent).await?;
        Ok(agent)
    }
}
