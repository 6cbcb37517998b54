use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::types::{
    Agent, AgentId, Event, Finding, Message, Mission, MissionId, MissionStatus, ReportSection,
};

#[derive(Debug, Clone)]
pub enum MessageWrite {
    Append(Vec<Message>),
    /// Compression rewrote the history; store it wholesale.
    Replace(Vec<Message>),
}

impl MessageWrite {
    pub fn messages(&self) -> &[Message] {
        match self {
            MessageWrite::Append(messages) | MessageWrite::Replace(messages) => messages,
        }
    }
}

/// Spawn caps re-checked at insert time, against the tree as it is then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLimits {
    pub max_total_agents: usize,
    pub max_children: usize,
}

/// What `commit_iteration` actually applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// False when the stored agent no longer held the claim.
    pub applied: bool,
    /// Children inserted, in request order.
    pub children: Vec<AgentId>,
}

/// Everything one iteration wants persisted, applied as a unit.
///
/// `agent.claimed_at` must still carry the claim the iteration started under.
#[derive(Debug, Clone)]
pub struct IterationWrites {
    pub agent: Agent,
    pub messages: MessageWrite,
    pub children: Vec<Agent>,
    pub child_limits: Option<ChildLimits>,
    pub findings: Vec<Finding>,
    pub report_sections: Vec<ReportSection>,
    pub events: Vec<Event>,
    pub searches_used: u32,
}

impl IterationWrites {
    pub fn new(agent: Agent, messages: MessageWrite) -> Self {
        Self {
            agent,
            messages,
            children: Vec::new(),
            child_limits: None,
            findings: Vec::new(),
            report_sections: Vec::new(),
            events: Vec::new(),
            searches_used: 0,
        }
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    // Mission operations
    async fn create_mission(&self, mission: &Mission) -> Result<()>;
    async fn get_mission(&self, id: MissionId) -> Result<Option<Mission>>;
    async fn list_missions(&self, status: Option<MissionStatus>) -> Result<Vec<Mission>>;
    /// Moves `id` from `from` to `to`; false when the mission was not in `from`.
    async fn transition_mission(
        &self,
        id: MissionId,
        from: MissionStatus,
        to: MissionStatus,
    ) -> Result<bool>;
    /// Takes the synthesis slot unless another caller holds an unexpired one.
    async fn claim_synthesis(&self, id: MissionId, lease: Duration) -> Result<bool>;
    /// Records the artifact and moves synthesizing -> completed.
    async fn complete_mission(&self, id: MissionId, synthesis: &str) -> Result<bool>;

    // Agent operations
    async fn create_agent(&self, agent: &Agent) -> Result<()>;
    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>>;
    /// Writes the row back and releases any claim on it.
    async fn update_agent(&self, agent: &Agent) -> Result<()>;
    async fn get_mission_agents(&self, mission_id: MissionId) -> Result<Vec<Agent>>;
    async fn get_children(&self, parent_id: AgentId) -> Result<Vec<Agent>>;
    async fn get_terminal_children_since(
        &self,
        parent_id: AgentId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Agent>>;
    async fn activate_spawning_agents(&self, mission_id: MissionId) -> Result<usize>;
    /// Atomically claims the least recently updated unclaimed working agent.
    async fn claim_one_working_agent(
        &self,
        mission_id: MissionId,
        lease: Duration,
    ) -> Result<Option<Agent>>;
    async fn release_claim(&self, agent_id: AgentId) -> Result<()>;
    async fn all_agents_terminal(&self, mission_id: MissionId) -> Result<bool>;
    /// Stamps every working/spawning agent completed with `output`.
    async fn force_complete_agents(&self, mission_id: MissionId, output: &str) -> Result<usize>;

    // Message operations
    async fn get_messages(&self, agent_id: AgentId) -> Result<Vec<Message>>;
    async fn append_messages(&self, agent_id: AgentId, messages: &[Message]) -> Result<()>;

    // Findings and report sections
    async fn get_findings(&self, mission_id: MissionId, limit: usize) -> Result<Vec<Finding>>;
    async fn get_sibling_findings(
        &self,
        parent_id: AgentId,
        exclude: AgentId,
        limit: usize,
    ) -> Result<Vec<Finding>>;
    async fn get_report_sections(&self, mission_id: MissionId) -> Result<Vec<ReportSection>>;

    // Events
    async fn record_event(&self, event: &Event) -> Result<()>;
    async fn get_events(&self, mission_id: MissionId) -> Result<Vec<Event>>;

    /// Applies one iteration's writes.
    ///
    /// The agent row, its messages and new children land only while the
    /// stored agent is still `working` under the same claim. Children beyond
    /// `child_limits`, counted at commit time, are dropped. Findings, report
    /// sections, events and search usage are recorded either way.
    async fn commit_iteration(&self, writes: &IterationWrites) -> Result<CommitReceipt>;
}
