use chrono::Duration;
use std::sync::Arc;

use crate::storage::Storage;
use crate::types::{Agent, MissionId};

/// Hands out at most one agent per call for exclusive processing.
pub struct ClaimScheduler {
    storage: Arc<dyn Storage>,
    lease: Duration,
}

impl ClaimScheduler {
    pub fn new(storage: Arc<dyn Storage>, lease: Duration) -> Self {
        Self { storage, lease }
    }

    /// Promotes spawning agents, then claims the least recently updated
    /// working one. Store errors yield `None`; the next tick retries.
    pub async fn claim_next_agent(&self, mission_id: MissionId) -> Option<Agent> {
        match self.storage.activate_spawning_agents(mission_id).await {
            Ok(0) => {}
            Ok(n) => log::debug!("Activated {} agent(s) in mission {}", n, mission_id),
            Err(e) => {
                log::warn!("Activation pass failed for mission {}: {}", mission_id, e);
                return None;
            }
        }

        match self
            .storage
            .claim_one_working_agent(mission_id, self.lease)
            .await
        {
            Ok(agent) => agent,
            Err(e) => {
                log::warn!("Claim failed for mission {}: {}", mission_id, e);
                None
            }
        }
    }
}
