use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AgentId, AgentRole, AgentStatus, MissionId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub mission_id: MissionId,
    pub parent_id: Option<AgentId>,
    pub role: AgentRole,
    pub objective: String,
    pub status: AgentStatus,
    pub depth: u32,
    pub iteration: u32,
    pub progress: u8,
    pub pending_input: Option<String>,
    pub output: Option<String>,
    pub current_activity: Option<String>,
    pub context: Value,
    pub last_completion_check: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Agent {
    fn new(
        mission_id: MissionId,
        parent_id: Option<AgentId>,
        role: AgentRole,
        objective: String,
        depth: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new_v4(),
            mission_id,
            parent_id,
            role,
            objective,
            status: AgentStatus::Spawning,
            depth,
            iteration: 0,
            progress: 0,
            pending_input: None,
            output: None,
            current_activity: None,
            context: Value::Object(Default::default()),
            last_completion_check: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// The mission's root coordinator, created at launch.
    pub fn root(mission_id: MissionId, objective: String) -> Self {
        Self::new(mission_id, None, AgentRole::Coordinator, objective, 0)
    }

    pub fn child_of(parent: &Agent, role: AgentRole, objective: String) -> Self {
        Self::new(
            parent.mission_id,
            Some(parent.id),
            role,
            objective,
            parent.depth + 1,
        )
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_depth_follows_parent() {
        let root = Agent::root(MissionId::new_v4(), "map the field".to_string());
        let child = Agent::child_of(&root, AgentRole::Researcher, "survey".to_string());
        let grandchild = Agent::child_of(&child, AgentRole::Executor, "dig".to_string());

        assert!(root.is_root());
        assert_eq!(root.depth, 0);
        assert_eq!(child.depth, 1);
        assert_eq!(grandchild.depth, 2);
        assert_eq!(grandchild.parent_id, Some(child.id));
        assert_eq!(grandchild.mission_id, root.mission_id);
        assert_eq!(child.status, AgentStatus::Spawning);
    }
}
