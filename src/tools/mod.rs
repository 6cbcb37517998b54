pub mod runtime;
pub mod web_search;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::engine::parser::SearchRecord;
use crate::types::{AgentId, MissionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    WebSearch,
}

impl ToolType {
    pub fn as_str(&self) -> &str {
        match self {
            ToolType::WebSearch => "web_search",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "web_search" | "search" => Some(ToolType::WebSearch),
            _ => None,
        }
    }
}

/// Search calls left for one iteration.
///
/// Seeded from the mission-wide remainder at iteration start; the per-call
/// check is atomic so concurrent tool calls cannot overrun it.
#[derive(Debug)]
pub struct SearchAllowance {
    used: AtomicU32,
    limit: u32,
}

impl SearchAllowance {
    pub fn new(per_iteration: u32, mission_remaining: u32) -> Self {
        Self {
            used: AtomicU32::new(0),
            limit: per_iteration.min(mission_remaining),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used() >= self.limit
    }
}

pub struct ToolContext {
    pub agent_id: AgentId,
    pub mission_id: MissionId,
    pub search_allowance: Arc<SearchAllowance>,
}

#[derive(Debug)]
pub struct ToolResult {
    pub success: bool,
    pub output: Value,
    pub side_effects: Vec<SideEffect>,
}

#[derive(Debug, Clone)]
pub enum SideEffect {
    SearchPerformed(SearchRecord),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn tool_type(&self) -> ToolType;
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value, context: &ToolContext) -> Result<ToolResult>;
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool_type: ToolType,
    pub params: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowance_respects_mission_remainder() {
        let allowance = SearchAllowance::new(5, 2);
        assert!(allowance.try_acquire());
        assert!(allowance.try_acquire());
        assert!(!allowance.try_acquire());
        assert_eq!(allowance.used(), 2);
        assert!(allowance.is_exhausted());
    }

    #[test]
    fn test_allowance_per_iteration_cap() {
        let allowance = SearchAllowance::new(5, 100);
        let granted = (0..8).filter(|_| allowance.try_acquire()).count();
        assert_eq!(granted, 5);
    }
}
