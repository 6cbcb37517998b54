pub mod agent;
pub mod mission;
pub mod record;

pub use agent::Agent;
pub use mission::Mission;
pub use record::{Event, EventKind, Finding, FindingKind, Message, ReportSection};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AgentId = Uuid;
pub type MissionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Active,       // Agents iterating
    Synthesizing, // Every agent terminal, consolidation pending
    Completed,    // Terminal
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionStatus::Active => "active",
            MissionStatus::Synthesizing => "synthesizing",
            MissionStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MissionStatus::Active),
            "synthesizing" => Some(MissionStatus::Synthesizing),
            "completed" => Some(MissionStatus::Completed),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MissionStatus::Active => 0,
            MissionStatus::Synthesizing => 1,
            MissionStatus::Completed => 2,
        }
    }

    /// Mission status only ever moves forward.
    pub fn can_advance_to(&self, next: MissionStatus) -> bool {
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawning,  // Created, not yet activated
    Working,   // Eligible for claiming
    Waiting,   // Blocked on human input
    Completed, // Terminal
    Failed,    // Terminal
    Paused,    // Held by an operator
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Spawning => "spawning",
            AgentStatus::Working => "working",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spawning" => Some(AgentStatus::Spawning),
            "working" => Some(AgentStatus::Working),
            "waiting" => Some(AgentStatus::Waiting),
            "completed" => Some(AgentStatus::Completed),
            "failed" => Some(AgentStatus::Failed),
            "paused" => Some(AgentStatus::Paused),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coordinator,
    Researcher,
    Executor,
    Validator,
    Synthesizer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => "coordinator",
            AgentRole::Researcher => "researcher",
            AgentRole::Executor => "executor",
            AgentRole::Validator => "validator",
            AgentRole::Synthesizer => "synthesizer",
        }
    }

    /// Unknown or missing roles become executors.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "coordinator" => AgentRole::Coordinator,
            "researcher" => AgentRole::Researcher,
            "validator" => AgentRole::Validator,
            "synthesizer" => AgentRole::Synthesizer,
            _ => AgentRole::Executor,
        }
    }

    /// Roles allowed to call the search tool.
    pub fn is_search_eligible(&self) -> bool {
        matches!(
            self,
            AgentRole::Coordinator | AgentRole::Researcher | AgentRole::Validator
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_role_defaults_to_executor() {
        assert_eq!(AgentRole::from_str_lossy("Researcher"), AgentRole::Researcher);
        assert_eq!(AgentRole::from_str_lossy("wizard"), AgentRole::Executor);
        assert_eq!(AgentRole::from_str_lossy(""), AgentRole::Executor);
    }

    #[test]
    fn test_mission_status_is_monotonic() {
        assert!(MissionStatus::Active.can_advance_to(MissionStatus::Synthesizing));
        assert!(MissionStatus::Active.can_advance_to(MissionStatus::Completed));
        assert!(!MissionStatus::Completed.can_advance_to(MissionStatus::Synthesizing));
        assert!(!MissionStatus::Synthesizing.can_advance_to(MissionStatus::Synthesizing));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            AgentStatus::Spawning,
            AgentStatus::Working,
            AgentStatus::Waiting,
            AgentStatus::Completed,
            AgentStatus::Failed,
            AgentStatus::Paused,
        ] {
            assert_eq!(AgentStatus::parse(status.as_str()), Some(status));
        }
        assert!(AgentStatus::Failed.is_terminal());
        assert!(!AgentStatus::Waiting.is_terminal());
    }
}
