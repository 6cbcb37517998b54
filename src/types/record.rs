use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{AgentId, MissionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Note,
    Result,
    Search,
}

impl FindingKind {
    pub fn as_str(&self) -> &str {
        match self {
            FindingKind::Note => "note",
            FindingKind::Result => "result",
            FindingKind::Search => "search",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "result" => FindingKind::Result,
            "search" => FindingKind::Search,
            _ => FindingKind::Note,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub mission_id: MissionId,
    pub agent_id: AgentId,
    pub kind: FindingKind,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Finding {
    pub fn new(
        mission_id: MissionId,
        agent_id: AgentId,
        kind: FindingKind,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mission_id,
            agent_id,
            kind,
            title: title.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
    pub id: Uuid,
    pub mission_id: MissionId,
    pub agent_id: AgentId,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ReportSection {
    pub fn new(
        mission_id: MissionId,
        agent_id: AgentId,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mission_id,
            agent_id,
            title: title.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MissionLaunched,
    Iterated,
    Compressed,
    Spawned,
    SpawnDenied,
    SearchPerformed,
    WaitingForInput,
    InputReceived,
    AgentCompleted,
    IterationFailed,
    MissionReaped,
    MissionSynthesizing,
    MissionCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::MissionLaunched => "mission_launched",
            EventKind::Iterated => "iterated",
            EventKind::Compressed => "compressed",
            EventKind::Spawned => "spawned",
            EventKind::SpawnDenied => "spawn_denied",
            EventKind::SearchPerformed => "search_performed",
            EventKind::WaitingForInput => "waiting_for_input",
            EventKind::InputReceived => "input_received",
            EventKind::AgentCompleted => "agent_completed",
            EventKind::IterationFailed => "iteration_failed",
            EventKind::MissionReaped => "mission_reaped",
            EventKind::MissionSynthesizing => "mission_synthesizing",
            EventKind::MissionCompleted => "mission_completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "mission_launched" => EventKind::MissionLaunched,
            "iterated" => EventKind::Iterated,
            "compressed" => EventKind::Compressed,
            "spawned" => EventKind::Spawned,
            "spawn_denied" => EventKind::SpawnDenied,
            "search_performed" => EventKind::SearchPerformed,
            "waiting_for_input" => EventKind::WaitingForInput,
            "input_received" => EventKind::InputReceived,
            "agent_completed" => EventKind::AgentCompleted,
            "iteration_failed" => EventKind::IterationFailed,
            "mission_reaped" => EventKind::MissionReaped,
            "mission_synthesizing" => EventKind::MissionSynthesizing,
            "mission_completed" => EventKind::MissionCompleted,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub mission_id: MissionId,
    pub agent_id: Option<AgentId>,
    pub kind: EventKind,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(mission_id: MissionId, agent_id: Option<AgentId>, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            mission_id,
            agent_id,
            kind,
            detail: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}
