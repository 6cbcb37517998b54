use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::engine::parser::SpawnRequest;
use crate::text::sanitize;
use crate::types::{Agent, AgentId, AgentRole};

const OBJECTIVE_MAX_CHARS: usize = 500;
const CONTEXT_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnBudget {
    pub max_total_agents: usize,
    pub max_depth: u32,
    pub max_spawns_per_agent: usize,
    pub soft_cap: usize,
    pub max_searches_per_mission: u32,
}

impl Default for SpawnBudget {
    fn default() -> Self {
        Self {
            max_total_agents: 25,
            max_depth: 4,
            max_spawns_per_agent: 3,
            soft_cap: 15,
            max_searches_per_mission: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnCheck {
    pub allowed: bool,
    pub remaining: usize,
    pub depth: u32,
    pub near_soft_cap: bool,
    pub reason: Option<String>,
}

impl SpawnCheck {
    fn denied(depth: u32, near_soft_cap: bool, reason: &str) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            depth,
            near_soft_cap,
            reason: Some(reason.to_string()),
        }
    }
}

/// A mission's agents indexed by id, with child counts, for ancestor walks.
pub struct AgentForest<'a> {
    agents: HashMap<AgentId, &'a Agent>,
    child_counts: HashMap<AgentId, usize>,
}

impl<'a> AgentForest<'a> {
    pub fn new(agents: &'a [Agent]) -> Self {
        let mut child_counts = HashMap::new();
        for agent in agents {
            if let Some(parent_id) = agent.parent_id {
                *child_counts.entry(parent_id).or_insert(0) += 1;
            }
        }
        Self {
            agents: agents.iter().map(|a| (a.id, a)).collect(),
            child_counts,
        }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, id: &AgentId) -> Option<&'a Agent> {
        self.agents.get(id).copied()
    }

    pub fn child_count(&self, id: &AgentId) -> usize {
        self.child_counts.get(id).copied().unwrap_or(0)
    }

    /// Counts hops from `id` to its root, giving up after `max_hops`.
    ///
    /// Returns the depth and whether the walk was cut short. A cut walk means
    /// the parent links are cyclic or deeper than the budget ever allows.
    pub fn depth_of(&self, id: &AgentId, max_hops: u32) -> (u32, bool) {
        let mut depth = 0;
        let mut current = self.get(id);
        while let Some(agent) = current {
            let Some(parent_id) = agent.parent_id else {
                return (depth, false);
            };
            if depth >= max_hops {
                return (depth, true);
            }
            depth += 1;
            current = self.get(&parent_id);
        }
        (depth, false)
    }
}

/// Decides whether `parent_id` may spawn more children and how many.
pub fn can_spawn(forest: &AgentForest<'_>, parent_id: &AgentId, budget: &SpawnBudget) -> SpawnCheck {
    let total = forest.len();
    let near_soft_cap = total >= budget.soft_cap;

    if total >= budget.max_total_agents {
        return SpawnCheck::denied(0, near_soft_cap, "Maximum total agents reached");
    }

    if forest.get(parent_id).is_none() {
        return SpawnCheck::denied(0, near_soft_cap, "Parent agent not found");
    }

    let (depth, capped) = forest.depth_of(parent_id, budget.max_depth + 1);
    if capped {
        log::warn!(
            "Ancestor walk for agent {} exceeded {} hops; parent links may be corrupt",
            parent_id,
            budget.max_depth + 1
        );
    }
    if depth >= budget.max_depth {
        return SpawnCheck::denied(depth, near_soft_cap, "Maximum depth reached");
    }

    let children = forest.child_count(parent_id);
    if children >= budget.max_spawns_per_agent {
        return SpawnCheck::denied(depth, near_soft_cap, "Maximum children per agent reached");
    }

    let global_left = budget.max_total_agents - total;
    let parent_left = budget.max_spawns_per_agent - children;

    SpawnCheck {
        allowed: true,
        remaining: global_left.min(parent_left),
        depth,
        near_soft_cap,
        reason: None,
    }
}

/// Turns accepted spawn requests into fresh `spawning` children.
///
/// Blank objectives are skipped; valid requests past `check.remaining` are
/// dropped in caller order.
pub fn admit_spawn_requests(
    parent: &Agent,
    requests: &[SpawnRequest],
    check: &SpawnCheck,
) -> Vec<Agent> {
    if !check.allowed {
        return Vec::new();
    }

    requests
        .iter()
        .filter_map(|request| {
            let objective = sanitize(&request.objective, OBJECTIVE_MAX_CHARS);
            if objective.is_empty() {
                return None;
            }
            let role = AgentRole::from_str_lossy(request.role.as_deref().unwrap_or_default());
            let mut child = Agent::child_of(parent, role, objective);
            if let Some(context) = request.context.as_deref() {
                child.context = serde_json::json!({
                    "brief": sanitize(context, CONTEXT_MAX_CHARS),
                });
            }
            Some(child)
        })
        .take(check.remaining)
        .collect()
}
