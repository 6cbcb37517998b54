use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::storage::traits::{CommitReceipt, IterationWrites, MessageWrite, Storage};
use crate::types::{
    Agent, AgentId, AgentStatus, Event, Finding, Message, Mission, MissionId, MissionStatus,
    ReportSection,
};

#[derive(Default)]
struct MemoryState {
    missions: HashMap<MissionId, Mission>,
    agents: HashMap<AgentId, Agent>,
    messages: HashMap<AgentId, Vec<Message>>,
    findings: Vec<Finding>,
    report_sections: Vec<ReportSection>,
    events: Vec<Event>,
}

impl MemoryState {
    fn mission_agents(&self, mission_id: MissionId) -> impl Iterator<Item = &Agent> {
        self.agents
            .values()
            .filter(move |a| a.mission_id == mission_id)
    }
}

/// Process-local store. All writes go through one lock, which makes the claim
/// check-and-set and iteration commits atomic.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail, standing in for a database outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("in-memory store unavailable"));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.check_available()?;
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.check_available()?;
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn newest_first<T>(mut items: Vec<T>, created_at: impl Fn(&T) -> DateTime<Utc>, limit: usize) -> Vec<T> {
    items.sort_by_key(|item| std::cmp::Reverse(created_at(item)));
    items.truncate(limit);
    items
}

#[async_trait]
impl Storage for InMemoryStore {
    async fn create_mission(&self, mission: &Mission) -> Result<()> {
        let mut state = self.write()?;
        state.missions.insert(mission.id, mission.clone());
        Ok(())
    }

    async fn get_mission(&self, id: MissionId) -> Result<Option<Mission>> {
        Ok(self.read()?.missions.get(&id).cloned())
    }

    async fn list_missions(&self, status: Option<MissionStatus>) -> Result<Vec<Mission>> {
        let state = self.read()?;
        let mut missions: Vec<Mission> = state
            .missions
            .values()
            .filter(|m| status.map_or(true, |s| m.status == s))
            .cloned()
            .collect();
        missions.sort_by_key(|m| std::cmp::Reverse(m.started_at));
        Ok(missions)
    }

    async fn transition_mission(
        &self,
        id: MissionId,
        from: MissionStatus,
        to: MissionStatus,
    ) -> Result<bool> {
        if !from.can_advance_to(to) {
            return Ok(false);
        }
        let mut state = self.write()?;
        match state.missions.get_mut(&id) {
            Some(mission) if mission.status == from => {
                mission.status = to;
                if to == MissionStatus::Completed {
                    mission.completed_at = Some(Utc::now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_synthesis(&self, id: MissionId, lease: Duration) -> Result<bool> {
        let mut state = self.write()?;
        let now = Utc::now();
        match state.missions.get_mut(&id) {
            Some(mission) if mission.status == MissionStatus::Synthesizing => {
                let free = mission
                    .synthesis_claimed_at
                    .map_or(true, |at| at < now - lease);
                if free {
                    mission.synthesis_claimed_at = Some(now);
                }
                Ok(free)
            }
            _ => Ok(false),
        }
    }

    async fn complete_mission(&self, id: MissionId, synthesis: &str) -> Result<bool> {
        let mut state = self.write()?;
        match state.missions.get_mut(&id) {
            Some(mission) if mission.status == MissionStatus::Synthesizing => {
                mission.status = MissionStatus::Completed;
                mission.synthesis = Some(synthesis.to_string());
                mission.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_agent(&self, agent: &Agent) -> Result<()> {
        let mut state = self.write()?;
        state.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        Ok(self.read()?.agents.get(&id).cloned())
    }

    async fn update_agent(&self, agent: &Agent) -> Result<()> {
        let mut state = self.write()?;
        let mut stored = agent.clone();
        stored.claimed_at = None;
        stored.updated_at = Utc::now();
        state.agents.insert(stored.id, stored);
        Ok(())
    }

    async fn get_mission_agents(&self, mission_id: MissionId) -> Result<Vec<Agent>> {
        let state = self.read()?;
        let mut agents: Vec<Agent> = state.mission_agents(mission_id).cloned().collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn get_children(&self, parent_id: AgentId) -> Result<Vec<Agent>> {
        let state = self.read()?;
        let mut children: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| a.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|a| a.created_at);
        Ok(children)
    }

    async fn get_terminal_children_since(
        &self,
        parent_id: AgentId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Agent>> {
        let state = self.read()?;
        let mut children: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| a.parent_id == Some(parent_id) && a.is_terminal())
            .filter(|a| match (a.completed_at, since) {
                (Some(done), Some(since)) => done > since,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .cloned()
            .collect();
        children.sort_by_key(|a| a.completed_at);
        Ok(children)
    }

    async fn activate_spawning_agents(&self, mission_id: MissionId) -> Result<usize> {
        let mut state = self.write()?;
        let mut activated = 0;
        // updated_at is left alone so new agents keep their place in claim order
        for agent in state.agents.values_mut() {
            if agent.mission_id == mission_id && agent.status == AgentStatus::Spawning {
                agent.status = AgentStatus::Working;
                activated += 1;
            }
        }
        Ok(activated)
    }

    async fn claim_one_working_agent(
        &self,
        mission_id: MissionId,
        lease: Duration,
    ) -> Result<Option<Agent>> {
        let mut state = self.write()?;
        let now = Utc::now();
        let candidate = state
            .mission_agents(mission_id)
            .filter(|a| a.status == AgentStatus::Working)
            .filter(|a| a.claimed_at.map_or(true, |at| at < now - lease))
            .min_by_key(|a| (a.updated_at, a.created_at))
            .map(|a| a.id);

        Ok(candidate.and_then(|id| {
            state.agents.get_mut(&id).map(|agent| {
                agent.claimed_at = Some(now);
                agent.clone()
            })
        }))
    }

    async fn release_claim(&self, agent_id: AgentId) -> Result<()> {
        let mut state = self.write()?;
        if let Some(agent) = state.agents.get_mut(&agent_id) {
            agent.claimed_at = None;
            agent.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn all_agents_terminal(&self, mission_id: MissionId) -> Result<bool> {
        let state = self.read()?;
        let mut agents = state.mission_agents(mission_id).peekable();
        if agents.peek().is_none() {
            return Ok(false);
        }
        Ok(agents.all(|a| a.is_terminal()))
    }

    async fn force_complete_agents(&self, mission_id: MissionId, output: &str) -> Result<usize> {
        let mut state = self.write()?;
        let now = Utc::now();
        let mut drained = 0;
        for agent in state.agents.values_mut() {
            if agent.mission_id == mission_id
                && matches!(agent.status, AgentStatus::Working | AgentStatus::Spawning)
            {
                agent.status = AgentStatus::Completed;
                agent.output = Some(output.to_string());
                agent.progress = 100;
                agent.claimed_at = None;
                agent.completed_at = Some(now);
                agent.updated_at = now;
                drained += 1;
            }
        }
        Ok(drained)
    }

    async fn get_messages(&self, agent_id: AgentId) -> Result<Vec<Message>> {
        Ok(self
            .read()?
            .messages
            .get(&agent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_messages(&self, agent_id: AgentId, messages: &[Message]) -> Result<()> {
        let mut state = self.write()?;
        state
            .messages
            .entry(agent_id)
            .or_default()
            .extend_from_slice(messages);
        Ok(())
    }

    async fn get_findings(&self, mission_id: MissionId, limit: usize) -> Result<Vec<Finding>> {
        let state = self.read()?;
        let findings = state
            .findings
            .iter()
            .filter(|f| f.mission_id == mission_id)
            .cloned()
            .collect();
        Ok(newest_first(findings, |f| f.created_at, limit))
    }

    async fn get_sibling_findings(
        &self,
        parent_id: AgentId,
        exclude: AgentId,
        limit: usize,
    ) -> Result<Vec<Finding>> {
        let state = self.read()?;
        let findings = state
            .findings
            .iter()
            .filter(|f| f.agent_id != exclude)
            .filter(|f| {
                state
                    .agents
                    .get(&f.agent_id)
                    .is_some_and(|a| a.parent_id == Some(parent_id))
            })
            .cloned()
            .collect();
        Ok(newest_first(findings, |f| f.created_at, limit))
    }

    async fn get_report_sections(&self, mission_id: MissionId) -> Result<Vec<ReportSection>> {
        let state = self.read()?;
        Ok(state
            .report_sections
            .iter()
            .filter(|s| s.mission_id == mission_id)
            .cloned()
            .collect())
    }

    async fn record_event(&self, event: &Event) -> Result<()> {
        self.write()?.events.push(event.clone());
        Ok(())
    }

    async fn get_events(&self, mission_id: MissionId) -> Result<Vec<Event>> {
        let state = self.read()?;
        Ok(state
            .events
            .iter()
            .filter(|e| e.mission_id == mission_id)
            .cloned()
            .collect())
    }

    async fn commit_iteration(&self, writes: &IterationWrites) -> Result<CommitReceipt> {
        let mut state = self.write()?;
        let agent_id = writes.agent.id;
        let mission_id = writes.agent.mission_id;
        let now = Utc::now();

        let live = state.agents.get(&agent_id).is_some_and(|stored| {
            stored.status == AgentStatus::Working && stored.claimed_at == writes.agent.claimed_at
        });

        let mut receipt = CommitReceipt {
            applied: live,
            children: Vec::new(),
        };
        if live {
            let mut agent = writes.agent.clone();
            agent.claimed_at = None;
            agent.updated_at = now;
            state.agents.insert(agent_id, agent);

            let room = match writes.child_limits {
                Some(limits) => {
                    let total = state.mission_agents(mission_id).count();
                    let children = state
                        .agents
                        .values()
                        .filter(|a| a.parent_id == Some(agent_id))
                        .count();
                    limits
                        .max_total_agents
                        .saturating_sub(total)
                        .min(limits.max_children.saturating_sub(children))
                }
                None => writes.children.len(),
            };
            for child in writes.children.iter().take(room) {
                state.agents.insert(child.id, child.clone());
                receipt.children.push(child.id);
            }

            match &writes.messages {
                MessageWrite::Append(messages) => state
                    .messages
                    .entry(agent_id)
                    .or_default()
                    .extend_from_slice(messages),
                MessageWrite::Replace(messages) => {
                    state.messages.insert(agent_id, messages.clone());
                }
            }
        }

        state.findings.extend_from_slice(&writes.findings);
        state
            .report_sections
            .extend_from_slice(&writes.report_sections);
        state.events.extend_from_slice(&writes.events);

        if writes.searches_used > 0 {
            if let Some(mission) = state.missions.get_mut(&writes.agent.mission_id) {
                mission.searches_used += writes.searches_used;
            }
        }

        Ok(receipt)
    }
}
