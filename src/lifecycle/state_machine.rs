use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::engine::parser::IterationResult;
use crate::text::truncate_chars;
use crate::types::{Agent, AgentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Activated,
    InputRequested,
    InputReceived,
    Paused,
    Resumed,
    Finished,
}

/// What an iteration did to the agent's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    WaitingForInput { request: String },
    Complete { forced: bool },
    Continue,
}

impl Transition {
    pub fn is_complete(&self) -> bool {
        matches!(self, Transition::Complete { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IterationPolicy {
    pub max_iterations: u32,
    pub progress_cap: u8,
    pub output_max_chars: usize,
}

impl From<&SchedulerConfig> for IterationPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            progress_cap: config.working_progress_cap,
            output_max_chars: config.output_max_chars,
        }
    }
}

impl Default for IterationPolicy {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

pub struct AgentStateMachine;

impl AgentStateMachine {
    pub fn transition(agent: &mut Agent, event: LifecycleEvent) -> Result<AgentStatus> {
        let new_status = match (agent.status, event) {
            (AgentStatus::Spawning, LifecycleEvent::Activated) => AgentStatus::Working,
            (AgentStatus::Working, LifecycleEvent::InputRequested) => AgentStatus::Waiting,
            (AgentStatus::Waiting, LifecycleEvent::InputReceived) => AgentStatus::Working,
            (AgentStatus::Working, LifecycleEvent::Paused) => AgentStatus::Paused,
            (AgentStatus::Paused, LifecycleEvent::Resumed) => AgentStatus::Working,
            (AgentStatus::Working, LifecycleEvent::Finished) => AgentStatus::Completed,

            _ => {
                return Err(anyhow!(
                    "Invalid status transition from {:?} with event {:?}",
                    agent.status,
                    event
                ));
            }
        };

        agent.status = new_status;
        if new_status.is_terminal() {
            agent.completed_at = Some(Utc::now());
        }
        Ok(new_status)
    }

    /// Applies one iteration's result to a working agent.
    ///
    /// Bumps the iteration counter, then picks the outcome: the ceiling wins
    /// over everything, a completion flag beats an input request.
    pub fn apply(
        agent: &mut Agent,
        result: &IterationResult,
        policy: &IterationPolicy,
    ) -> Result<Transition> {
        agent.iteration += 1;
        if !result.activity.is_empty() {
            agent.current_activity = Some(result.activity.clone());
        }

        let ceiling_reached = agent.iteration >= policy.max_iterations;

        if result.complete || ceiling_reached {
            Self::transition(agent, LifecycleEvent::Finished)?;
            agent.progress = 100;
            agent.pending_input = None;
            agent.output = Some(Self::completion_output(agent, result, policy));
            return Ok(Transition::Complete {
                forced: !result.complete,
            });
        }

        agent.progress = agent
            .progress
            .saturating_add(result.progress_delta)
            .min(policy.progress_cap);

        if let Some(request) = result.input_request.as_ref().filter(|r| !r.trim().is_empty()) {
            Self::transition(agent, LifecycleEvent::InputRequested)?;
            agent.pending_input = Some(request.clone());
            return Ok(Transition::WaitingForInput {
                request: request.clone(),
            });
        }

        Ok(Transition::Continue)
    }

    fn completion_output(agent: &Agent, result: &IterationResult, policy: &IterationPolicy) -> String {
        let text = [result.output.trim(), result.thinking.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Finished without a written result: {}", agent.objective));
        truncate_chars(&text, policy.output_max_chars)
    }
}
